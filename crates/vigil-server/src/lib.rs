pub mod config;
pub mod connector;
pub mod demo;
pub mod http;
pub mod notify;
pub mod objects;
pub mod session;

pub use config::{ConfigError, ServerConfig};
pub use connector::{ConnectorConfig, ConnectorServer, ServerState};
pub use http::HttpState;
pub use objects::{Emitter, ManagedObject, ObjectError, ObjectFactory, ObjectRegistry};
pub use session::{Session, SessionGuard};

/// Registry name under which the registry's own HTTP surface is bound.
pub const REGISTRY_SERVICE: &str = "registry";
