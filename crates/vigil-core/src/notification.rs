use serde::{Deserialize, Serialize};
use std::fmt;

use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// An event emitted by a managed object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Name of the emitting object.
    pub source: String,
    /// Dotted notification type, e.g. `vigil.state.reset`.
    pub kind: String,
    pub message: String,
    /// Per-object, strictly increasing.
    pub sequence: u64,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<Value>,
}

/// Notification types a subscription is interested in, by prefix.
///
/// An empty filter accepts everything.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NotificationFilter {
    #[serde(default)]
    enabled: Vec<String>,
}

impl NotificationFilter {
    pub fn accept_all() -> Self {
        Self::default()
    }

    pub fn enable(mut self, prefix: impl Into<String>) -> Self {
        self.enabled.push(prefix.into());
        self
    }

    pub fn accepts(&self, notification: &Notification) -> bool {
        self.enabled.is_empty()
            || self
                .enabled
                .iter()
                .any(|prefix| notification.kind.starts_with(prefix.as_str()))
    }
}
