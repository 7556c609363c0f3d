use std::collections::HashMap;
use std::path::Path;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::debug;

use crate::auth::{AuthenticationFailed, Authenticator, Credential, Principal, Subject};

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("line {line}: expected 'identifier secret [role...]'")]
    Syntax { line: usize },

    #[error("duplicate identifier {0}")]
    Duplicate(String),

    #[error("failed to read password file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

struct Entry {
    digest: [u8; 32],
    roles: Vec<String>,
}

/// Identifier → secret table, read-only once loaded.
///
/// Secrets are kept only as SHA-256 digests.
pub struct CredentialStore {
    entries: HashMap<String, Entry>,
    decoy: [u8; 32],
}

fn digest(secret: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(secret.as_bytes()));
    out
}

impl CredentialStore {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            decoy: digest(&uuid::Uuid::new_v4().to_string()),
        }
    }

    pub fn insert(
        &mut self,
        identifier: impl Into<String>,
        secret: &str,
        roles: Vec<String>,
    ) -> Result<(), CredentialError> {
        let identifier = identifier.into();
        if self.entries.contains_key(&identifier) {
            return Err(CredentialError::Duplicate(identifier));
        }
        self.entries.insert(
            identifier,
            Entry {
                digest: digest(secret),
                roles,
            },
        );
        Ok(())
    }

    /// Parses `identifier secret [role...]` lines. A line whose first
    /// non-blank character is `#` is a comment; elsewhere `#` is ordinary text.
    pub fn parse(text: &str) -> Result<Self, CredentialError> {
        let mut store = Self::new();
        for (index, raw) in text.lines().enumerate() {
            let content = raw.trim();
            if content.is_empty() || content.starts_with('#') {
                continue;
            }
            let mut tokens = content.split_whitespace();
            let (Some(identifier), Some(secret)) = (tokens.next(), tokens.next()) else {
                return Err(CredentialError::Syntax { line: index + 1 });
            };
            store.insert(identifier, secret, tokens.map(str::to_string).collect())?;
        }
        Ok(store)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CredentialError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| CredentialError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.entries.contains_key(identifier)
    }

    /// Same amount of work for unknown identifiers and wrong secrets.
    fn verify(&self, credential: &Credential) -> Option<&Entry> {
        let presented = digest(credential.secret());
        let entry = self.entries.get(&credential.identifier);
        let expected = entry.map_or(&self.decoy, |e| &e.digest);
        let matches: bool = presented[..].ct_eq(&expected[..]).into();
        entry.filter(|_| matches)
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

/// [`Authenticator`] backed by a [`CredentialStore`].
///
/// A successful login yields `user:<identifier>` plus one `role:<name>`
/// principal per mapped role.
pub struct PasswordFileAuthenticator {
    store: CredentialStore,
}

impl PasswordFileAuthenticator {
    pub fn new(store: CredentialStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }
}

impl Authenticator for PasswordFileAuthenticator {
    fn authenticate(&self, credential: &Credential) -> Result<Subject, AuthenticationFailed> {
        let Some(entry) = self.store.verify(credential) else {
            debug!("credential rejected");
            return Err(AuthenticationFailed);
        };
        let principals = std::iter::once(Principal::user(credential.identifier.as_str()))
            .chain(entry.roles.iter().map(|r| Principal::role(r.as_str())));
        Subject::new(principals).map_err(|_| AuthenticationFailed)
    }
}
