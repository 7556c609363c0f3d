use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A named identity unit, e.g. `user:alice` or `role:operators`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Principal {
    kind: String,
    name: String,
}

impl Principal {
    pub const USER: &'static str = "user";
    pub const ROLE: &'static str = "role";

    /// Builds `kind:name`. Both parts must be non-empty and free of
    /// whitespace, and `kind` must not contain `:`.
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Result<Self, PrincipalParseError> {
        let (kind, name) = (kind.into(), name.into());
        let blank = |part: &str| part.is_empty() || part.chars().any(char::is_whitespace);
        if blank(&kind) || blank(&name) || kind.contains(':') {
            return Err(PrincipalParseError(format!("{kind}:{name}")));
        }
        Ok(Self { kind, name })
    }

    /// `user:<name>`. `name` must be a valid principal name; use
    /// [`Principal::new`] for untrusted input.
    pub fn user(name: impl Into<String>) -> Self {
        Self::fixed(Self::USER, name.into())
    }

    /// `role:<name>`, with the same contract as [`Principal::user`].
    pub fn role(name: impl Into<String>) -> Self {
        Self::fixed(Self::ROLE, name.into())
    }

    fn fixed(kind: &str, name: String) -> Self {
        debug_assert!(!name.is_empty(), "empty {kind} principal name");
        Self {
            kind: kind.to_string(),
            name,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid principal '{0}': expected [kind:]name")]
pub struct PrincipalParseError(pub String);

impl FromStr for Principal {
    type Err = PrincipalParseError;

    /// Parses `kind:name`; a bare `name` is a user principal.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, name) = match s.split_once(':') {
            Some((kind, name)) => (kind.trim(), name.trim()),
            None => (Self::USER, s.trim()),
        };
        Self::new(kind, name).map_err(|_| PrincipalParseError(s.to_string()))
    }
}

impl TryFrom<String> for Principal {
    type Error = PrincipalParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Principal> for String {
    fn from(value: Principal) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("a subject needs at least one principal")]
pub struct EmptySubject;

/// One authenticated (or delegated) identity: a non-empty set of principals.
///
/// Do not implement `Default`; construct with [`Subject::new`] or
/// [`Subject::single`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Principal>", into = "Vec<Principal>")]
pub struct Subject {
    principals: BTreeSet<Principal>,
    primary: Principal,
}

impl Subject {
    pub fn new(principals: impl IntoIterator<Item = Principal>) -> Result<Self, EmptySubject> {
        let principals: BTreeSet<Principal> = principals.into_iter().collect();
        let primary = principals
            .iter()
            .find(|p| p.kind() == Principal::USER)
            .or_else(|| principals.first())
            .cloned()
            .ok_or(EmptySubject)?;
        Ok(Self { principals, primary })
    }

    pub fn single(principal: Principal) -> Self {
        Self {
            principals: BTreeSet::from([principal.clone()]),
            primary: principal,
        }
    }

    pub fn principals(&self) -> impl Iterator<Item = &Principal> {
        self.principals.iter()
    }

    pub fn contains(&self, principal: &Principal) -> bool {
        self.principals.contains(principal)
    }

    pub fn len(&self) -> usize {
        self.principals.len()
    }

    /// The first user principal, used as the display name of a session.
    pub fn primary(&self) -> &Principal {
        &self.primary
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.principals.iter().map(ToString::to_string).collect();
        write!(f, "{{{}}}", names.join(", "))
    }
}

impl TryFrom<Vec<Principal>> for Subject {
    type Error = EmptySubject;

    fn try_from(value: Vec<Principal>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Subject> for Vec<Principal> {
    fn from(value: Subject) -> Self {
        value.principals.into_iter().collect()
    }
}

/// Identifier and secret presented once, at connection time.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    pub identifier: String,
    secret: String,
}

impl Credential {
    pub fn new(identifier: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            secret: secret.into(),
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("identifier", &self.identifier)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("authentication failed")]
pub struct AuthenticationFailed;

/// Turns a presented credential into an authenticated subject.
///
/// Implementations must fail uniformly: callers cannot tell an unknown
/// identifier from a wrong secret.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, credential: &Credential) -> Result<Subject, AuthenticationFailed>;
}

/// Session token claims.
///
/// A token carries no expiry: it is valid exactly as long as the session
/// named by `sid` is open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // Subject (primary principal)
    pub sid: String, // Session id
    pub principals: Vec<Principal>,
    pub iat: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn principal_parses_kind_and_name() {
        let p: Principal = "role:operators".parse().unwrap();
        assert_eq!(p.kind(), "role");
        assert_eq!(p.name(), "operators");

        let bare: Principal = "alice".parse().unwrap();
        assert_eq!(bare, Principal::user("alice"));
    }

    #[test]
    fn principal_rejects_empty_parts() {
        assert!("".parse::<Principal>().is_err());
        assert!("role:".parse::<Principal>().is_err());
        assert!(":alice".parse::<Principal>().is_err());
    }

    #[test]
    fn constructor_validates_like_parsing() {
        assert!(Principal::new("", "alice").is_err());
        assert!(Principal::new("user", "").is_err());
        assert!(Principal::new("us:er", "alice").is_err());
        assert!(Principal::new("user", "al ice").is_err());
        assert!("user:al ice".parse::<Principal>().is_err());

        let built = Principal::new("group", "ops:eu").unwrap();
        assert_eq!(built.to_string().parse::<Principal>().unwrap(), built);
    }

    #[test]
    fn principal_equality_uses_kind_and_name() {
        assert_ne!(Principal::user("admin"), Principal::role("admin"));
        assert_eq!(Principal::role("admin"), Principal::new("role", "admin").unwrap());
    }

    #[test]
    fn subject_must_not_be_empty() {
        assert_eq!(Subject::new(Vec::new()), Err(EmptySubject));
        let parsed: Result<Subject, _> = serde_json::from_str("[]");
        assert!(parsed.is_err());
    }

    #[test]
    fn subject_deduplicates_and_reports_primary_user() {
        let subject = Subject::new([
            Principal::role("operators"),
            Principal::user("alice"),
            Principal::user("alice"),
        ])
        .unwrap();
        assert_eq!(subject.len(), 2);
        assert_eq!(subject.primary(), &Principal::user("alice"));
    }

    #[test]
    fn subject_wire_form_is_a_list_of_strings() {
        let subject = Subject::single(Principal::role("monitor"));
        let json = serde_json::to_string(&subject).unwrap();
        assert_eq!(json, r#"["role:monitor"]"#);
    }

    #[test]
    fn credential_debug_hides_secret() {
        let credential = Credential::new("alice", "hunter2");
        let shown = format!("{credential:?}");
        assert!(shown.contains("alice"));
        assert!(!shown.contains("hunter2"));
    }
}
