//! Client side of the connector protocol.
//!
//! ```no_run
//! # async fn demo() -> Result<(), vigil_core::VigilError> {
//! use vigil_client::{ClientSession, HttpResolver};
//! use vigil_core::{Credential, Value};
//!
//! let resolver = HttpResolver::new("http://127.0.0.1:5801");
//! let session =
//!     ClientSession::connect(&resolver, "vigil", Credential::new("monitorRole", "QED"), None).await?;
//! session
//!     .set_attribute("MBeans:type=SimpleStandard", "State", Value::from("changed state"))
//!     .await?;
//! session.close().await
//! # }
//! ```

pub mod resolver;
pub mod session;

pub use resolver::HttpResolver;
pub use session::ClientSession;
