use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use utoipa::ToSchema;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct Endpoint {
    #[schema(example = "127.0.0.1")]
    pub host: String,
    #[schema(example = 5802)]
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A registry entry: logical service name bound to an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ServiceBinding {
    #[schema(example = "vigil")]
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Milliseconds since the Unix epoch.
    pub bound_at: u64,
}

impl ServiceBinding {
    pub fn new(name: impl Into<String>, endpoint: &Endpoint, bound_at: u64) -> Self {
        Self {
            name: name.into(),
            host: endpoint.host.clone(),
            port: endpoint.port,
            bound_at,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }
}
