use std::future::Future;

use crate::endpoint::{Endpoint, ServiceBinding};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("service {0} not found")]
    NotFound(String),
    #[error("service {0} is already bound")]
    DuplicateName(String),
    #[error("no free port in range {start}-{end}")]
    Exhausted { start: u16, end: u16 },
    #[error("invalid port range '{0}'")]
    InvalidRange(String),
    #[error("registry unreachable: {0}")]
    Unreachable(String),
    #[error("registry store error: {0}")]
    Store(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Name → endpoint bookkeeping behind the registry.
pub trait RegistryStore: Send + Sync {
    /// Records `binding` and returns an id that is never handed out again.
    fn insert_binding(&self, binding: &ServiceBinding) -> Result<u64, RegistryError>;
    fn remove_binding(&self, name: &str) -> Result<ServiceBinding, RegistryError>;
    /// Removes `name` only if it is still the binding recorded under `id`.
    fn release_binding(&self, name: &str, id: u64) -> Result<bool, RegistryError>;
    fn get_binding(&self, name: &str) -> Result<ServiceBinding, RegistryError>;
    fn all_bindings(&self) -> Result<Vec<ServiceBinding>, RegistryError>;
}

/// Anything a client can resolve a service name against.
pub trait Resolver: Send + Sync {
    fn resolve(&self, name: &str) -> impl Future<Output = Result<Endpoint, RegistryError>> + Send;
}
