use std::collections::HashMap;
use std::sync::Arc;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use parking_lot::RwLock;
use tracing::{debug, info};
use uuid::Uuid;
use vigil_core::time::now_secs;
use vigil_core::{Claims, Subject, VigilError};

use crate::notify::SubscriptionTable;

/// An authenticated connection: one subject for its whole lifetime.
#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub subject: Subject,
    pub origin: Option<String>,
    pub token: String,
    pub opened_at: u64,
}

/// Signs and checks session tokens (HS256).
///
/// Tokens do not expire on their own. A token is accepted while its session
/// is in the session table, and a session ends only on close or disconnect.
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenIssuer {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn issue(&self, session: Uuid, subject: &Subject) -> Result<String, VigilError> {
        let claims = Claims {
            sub: subject.primary().to_string(),
            sid: session.to_string(),
            principals: subject.principals().cloned().collect(),
            iat: now_secs() as usize,
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| VigilError::ExecutionFailed(format!("token signing failed: {e}")))
    }

    /// Accepts `token` only if its signature is valid and it is bound to
    /// `session`.
    pub fn verify(&self, token: &str, session: &Session) -> Result<Claims, VigilError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| {
                debug!(session = %session.id, error = %e, "rejected session token");
                VigilError::AuthenticationFailed
            })?;
        if data.claims.sid != session.id.to_string() {
            debug!(session = %session.id, "token belongs to another session");
            return Err(VigilError::AuthenticationFailed);
        }
        Ok(data.claims)
    }
}

#[derive(Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.sessions.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.sessions.write().clear();
    }

    fn insert(&self, session: Arc<Session>) {
        self.sessions.write().insert(session.id, session);
    }

    fn remove(&self, id: &Uuid) -> Option<Arc<Session>> {
        self.sessions.write().remove(id)
    }
}

/// Owns a live session; dropping it closes the session and cancels its
/// subscriptions.
pub struct SessionGuard {
    session: Arc<Session>,
    table: Arc<SessionTable>,
    subscriptions: Arc<SubscriptionTable>,
}

impl SessionGuard {
    pub(crate) fn open(
        session: Session,
        table: Arc<SessionTable>,
        subscriptions: Arc<SubscriptionTable>,
    ) -> Self {
        let session = Arc::new(session);
        table.insert(session.clone());
        metrics::counter!("vigil_sessions_opened_total").increment(1);
        metrics::gauge!("vigil_sessions_active").increment(1.0);
        info!(
            session = %session.id,
            subject = %session.subject,
            origin = session.origin.as_deref().unwrap_or("-"),
            "session opened"
        );
        Self {
            session,
            table,
            subscriptions,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn id(&self) -> Uuid {
        self.session.id
    }

    pub fn token(&self) -> &str {
        &self.session.token
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.table.remove(&self.session.id);
        let cancelled = self.subscriptions.remove_session(self.session.id);
        metrics::gauge!("vigil_sessions_active").decrement(1.0);
        info!(session = %self.session.id, cancelled, "session closed");
    }
}
