//! Grant-based access policy.
//!
//! A [`PolicyEngine`] is loaded once from a grant file and never changes
//! afterwards; restart the server to apply a new policy.
//!
//! # Grant file
//!
//! ```text
//! # principal          [origin=scope]   permission...
//! role:monitor                          read-attribute subscribe query
//! user:admin           origin=console   *  delegate:role:*
//! user:deployer                         register:apps:* unregister:apps:*
//! ```
//!
//! A permission token is `action` (any target), `action:target` (exact) or
//! `action:prefix*`. `*` alone grants every action except `delegate`.
//!
//! # Evaluation
//!
//! ```text
//! no delegation:   allow ⇔ ∃ grant(p ∈ session, origin ok) ∋ permission
//! delegation to D: allow ⇔ ∀ d ∈ D: session holds delegate:d
//!                        ∧ ∃ grant(p ∈ D, origin ok) ∋ permission
//! ```
//!
//! Absence of a matching grant is a denial, never an error.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::auth::{Principal, Subject};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    ReadAttribute,
    WriteAttribute,
    Invoke,
    Subscribe,
    Register,
    Unregister,
    Query,
    /// Meta-permission: act as another principal.
    Delegate,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::ReadAttribute => "read-attribute",
            Action::WriteAttribute => "write-attribute",
            Action::Invoke => "invoke",
            Action::Subscribe => "subscribe",
            Action::Register => "register",
            Action::Unregister => "unregister",
            Action::Query => "query",
            Action::Delegate => "delegate",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read-attribute" => Ok(Action::ReadAttribute),
            "write-attribute" => Ok(Action::WriteAttribute),
            "invoke" => Ok(Action::Invoke),
            "subscribe" => Ok(Action::Subscribe),
            "register" => Ok(Action::Register),
            "unregister" => Ok(Action::Unregister),
            "query" => Ok(Action::Query),
            "delegate" => Ok(Action::Delegate),
            other => Err(format!("unknown action '{other}'")),
        }
    }
}

/// A requested permission: an action on a named target.
///
/// The target is an object name, or a principal in `kind:name` form for
/// [`Action::Delegate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permission {
    pub action: Action,
    pub target: String,
}

impl Permission {
    pub fn new(action: Action, target: impl Into<String>) -> Self {
        Self {
            action,
            target: target.into(),
        }
    }

    pub fn delegate(principal: &Principal) -> Self {
        Self::new(Action::Delegate, principal.to_string())
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.action, self.target)
    }
}

/// Name matcher used for permission targets and origin scopes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    Any,
    Exact(String),
    Prefix(String),
}

impl Pattern {
    pub fn parse(text: &str) -> Self {
        if text == "*" {
            Pattern::Any
        } else if let Some(prefix) = text.strip_suffix('*') {
            Pattern::Prefix(prefix.to_string())
        } else {
            Pattern::Exact(text.to_string())
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::Exact(exact) => exact == value,
            Pattern::Prefix(prefix) => value.starts_with(prefix.as_str()),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Any => f.write_str("*"),
            Pattern::Exact(exact) => f.write_str(exact),
            Pattern::Prefix(prefix) => write!(f, "{prefix}*"),
        }
    }
}

/// One entry of a grant's permission set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionPattern {
    /// `None` covers every action except `delegate`.
    pub action: Option<Action>,
    pub target: Pattern,
}

impl PermissionPattern {
    pub fn new(action: Action, target: Pattern) -> Self {
        Self {
            action: Some(action),
            target,
        }
    }

    pub fn all() -> Self {
        Self {
            action: None,
            target: Pattern::Any,
        }
    }

    pub fn covers(&self, permission: &Permission) -> bool {
        let action_ok = match self.action {
            Some(action) => action == permission.action,
            None => permission.action != Action::Delegate,
        };
        action_ok && self.target.matches(&permission.target)
    }
}

impl FromStr for PermissionPattern {
    type Err = String;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        if token == "*" {
            return Ok(Self::all());
        }
        let (action, target) = match token.split_once(':') {
            Some((action, target)) if !target.is_empty() => (action, Pattern::parse(target)),
            Some(_) => return Err(format!("empty target in '{token}'")),
            None => (token, Pattern::Any),
        };
        Ok(Self::new(action.parse()?, target))
    }
}

impl fmt::Display for PermissionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.action, &self.target) {
            (None, _) => f.write_str("*"),
            (Some(action), Pattern::Any) => write!(f, "{action}"),
            (Some(action), target) => write!(f, "{action}:{target}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("line {line}: {reason}")]
    Syntax { line: usize, reason: String },

    #[error("grant for {0} has no permissions")]
    EmptyGrant(String),

    #[error("failed to read policy file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// `(principal, origin-scope?, permission-set)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyGrant {
    pub principal: Principal,
    pub origin: Option<Pattern>,
    pub permissions: Vec<PermissionPattern>,
}

impl PolicyGrant {
    pub fn new(
        principal: Principal,
        permissions: Vec<PermissionPattern>,
    ) -> Result<Self, PolicyError> {
        if permissions.is_empty() {
            return Err(PolicyError::EmptyGrant(principal.to_string()));
        }
        Ok(Self {
            principal,
            origin: None,
            permissions,
        })
    }

    pub fn scoped_to(mut self, origin: Pattern) -> Self {
        self.origin = Some(origin);
        self
    }

    /// A scoped grant never applies to a request without an origin.
    pub fn permits(&self, permission: &Permission, origin: Option<&str>) -> bool {
        let origin_ok = match (&self.origin, origin) {
            (None, _) => true,
            (Some(scope), Some(origin)) => scope.matches(origin),
            (Some(_), None) => false,
        };
        origin_ok && self.permissions.iter().any(|p| p.covers(permission))
    }
}

/// Input of one authorization query.
#[derive(Debug, Clone, Copy)]
pub struct AccessRequest<'a> {
    pub subject: &'a Subject,
    pub delegated: Option<&'a Subject>,
    pub origin: Option<&'a str>,
    pub permission: &'a Permission,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Pluggable authorization: side-effect free and callable concurrently.
pub trait AccessPolicy: Send + Sync {
    fn authorize(&self, request: &AccessRequest<'_>) -> Decision;
}

/// Immutable grant table.
#[derive(Debug, Default)]
pub struct PolicyEngine {
    grants: HashMap<Principal, Vec<PolicyGrant>>,
}

impl PolicyEngine {
    pub fn new(grants: impl IntoIterator<Item = PolicyGrant>) -> Self {
        let mut table: HashMap<Principal, Vec<PolicyGrant>> = HashMap::new();
        for grant in grants {
            table.entry(grant.principal.clone()).or_default().push(grant);
        }
        Self { grants: table }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| PolicyError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, PolicyError> {
        let mut grants = Vec::new();
        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let content = raw.trim();
            if content.is_empty() || content.starts_with('#') {
                continue;
            }
            let syntax = |reason: String| PolicyError::Syntax { line, reason };

            let mut tokens = content.split_whitespace();
            let principal: Principal = tokens
                .next()
                .unwrap_or_default()
                .parse()
                .map_err(|e: crate::auth::PrincipalParseError| syntax(e.to_string()))?;

            let mut origin = None;
            let mut permissions = Vec::new();
            for token in tokens {
                if let Some(scope) = token.strip_prefix("origin=") {
                    if scope.is_empty() || origin.is_some() || !permissions.is_empty() {
                        return Err(syntax(format!("misplaced origin scope '{token}'")));
                    }
                    origin = Some(Pattern::parse(scope));
                } else {
                    permissions.push(token.parse::<PermissionPattern>().map_err(syntax)?);
                }
            }

            let grant = PolicyGrant::new(principal, permissions)
                .map_err(|e| syntax(e.to_string()))?;
            grants.push(match origin {
                Some(scope) => grant.scoped_to(scope),
                None => grant,
            });
        }
        Ok(Self::new(grants))
    }

    pub fn grants_for(&self, principal: &Principal) -> &[PolicyGrant] {
        self.grants.get(principal).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn grant_count(&self) -> usize {
        self.grants.values().map(Vec::len).sum()
    }

    fn holds(&self, subject: &Subject, permission: &Permission, origin: Option<&str>) -> bool {
        subject.principals().any(|principal| {
            self.grants_for(principal)
                .iter()
                .any(|grant| grant.permits(permission, origin))
        })
    }
}

impl AccessPolicy for PolicyEngine {
    fn authorize(&self, request: &AccessRequest<'_>) -> Decision {
        let allowed = match request.delegated {
            Some(delegated) => {
                let may_delegate = delegated.principals().all(|target| {
                    self.holds(request.subject, &Permission::delegate(target), request.origin)
                });
                if !may_delegate {
                    debug!(
                        subject = %request.subject,
                        delegated = %delegated,
                        "delegation refused: missing delegate permission"
                    );
                }
                may_delegate && self.holds(delegated, request.permission, request.origin)
            }
            None => self.holds(request.subject, request.permission, request.origin),
        };
        if allowed { Decision::Allow } else { Decision::Deny }
    }
}
