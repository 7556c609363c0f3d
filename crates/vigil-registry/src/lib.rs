pub mod range;
pub mod sqlite;

use std::fmt;
use std::future::{Future, ready};
use std::io::ErrorKind;
use std::net::TcpListener;
use std::sync::Arc;

use tracing::{debug, info, warn};
use vigil_core::time::now_millis;
use vigil_core::{Endpoint, RegistryError, RegistryStore, Resolver, ServiceBinding};

pub use range::PortRange;
pub use sqlite::DbRegistry;

/// Address allocation and lookup for logical service names.
pub struct Registry {
    host: String,
    range: PortRange,
    store: Arc<dyn RegistryStore>,
}

impl Registry {
    pub fn new(host: impl Into<String>, range: PortRange, store: Arc<dyn RegistryStore>) -> Self {
        Self {
            host: host.into(),
            range,
            store,
        }
    }

    pub fn in_memory(host: impl Into<String>, range: PortRange) -> Result<Self, RegistryError> {
        Ok(Self::new(host, range, Arc::new(DbRegistry::in_memory()?)))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Binds `name` to the first free port of the range.
    ///
    /// Ports already in use are skipped; only running out of candidates is an
    /// error. The returned guard owns the listening socket and unbinds the
    /// name when dropped.
    pub fn bind(&self, name: &str) -> Result<Binding, RegistryError> {
        match self.store.get_binding(name) {
            Ok(_) => return Err(RegistryError::DuplicateName(name.to_string())),
            Err(RegistryError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        for port in self.range.ports() {
            let listener = match TcpListener::bind((self.host.as_str(), port)) {
                Ok(listener) => listener,
                Err(e) if matches!(e.kind(), ErrorKind::AddrInUse | ErrorKind::PermissionDenied) => {
                    debug!(port, error = %e, "port unavailable, trying next");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let endpoint = Endpoint::new(self.host.clone(), port);
            let id = self
                .store
                .insert_binding(&ServiceBinding::new(name, &endpoint, now_millis()))?;
            info!(service = name, %endpoint, "service bound");
            return Ok(Binding {
                id,
                name: name.to_string(),
                endpoint,
                listener: Some(listener),
                store: self.store.clone(),
            });
        }

        warn!(service = name, range = %self.range, "no free port left in range");
        Err(RegistryError::Exhausted {
            start: self.range.start(),
            end: self.range.end(),
        })
    }

    pub fn resolve(&self, name: &str) -> Result<Endpoint, RegistryError> {
        self.lookup(name).map(|b| b.endpoint())
    }

    pub fn lookup(&self, name: &str) -> Result<ServiceBinding, RegistryError> {
        self.store.get_binding(name)
    }

    /// Removes a binding without closing its socket. The guard's drop then
    /// leaves the name alone, even if it has been bound again since.
    pub fn unbind(&self, name: &str) -> Result<(), RegistryError> {
        self.store.remove_binding(name).map(|_| ())
    }

    pub fn list(&self) -> Result<Vec<ServiceBinding>, RegistryError> {
        self.store.all_bindings()
    }
}

impl Resolver for Registry {
    fn resolve(&self, name: &str) -> impl Future<Output = Result<Endpoint, RegistryError>> + Send {
        ready(Registry::resolve(self, name))
    }
}

/// A live name binding; dropping it releases the name.
pub struct Binding {
    id: u64,
    name: String,
    endpoint: Endpoint,
    listener: Option<TcpListener>,
    store: Arc<dyn RegistryStore>,
}

impl Binding {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Hands the bound socket to the service that will accept on it.
    pub fn take_listener(&mut self) -> Option<TcpListener> {
        self.listener.take()
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        match self.store.release_binding(&self.name, self.id) {
            Ok(true) => info!(service = %self.name, endpoint = %self.endpoint, "service unbound"),
            Ok(false) => debug!(service = %self.name, "binding already released"),
            Err(e) => warn!(service = %self.name, error = %e, "failed to unbind service"),
        }
    }
}
