pub mod auth;
pub mod credentials;
pub mod endpoint;
pub mod errors;
pub mod notification;
pub mod policy;
pub mod protocol;
pub mod registry;
pub mod time;
pub mod value;

pub use auth::{AuthenticationFailed, Authenticator, Claims, Credential, Principal, Subject};
pub use credentials::{CredentialError, CredentialStore, PasswordFileAuthenticator};
pub use endpoint::{Endpoint, ServiceBinding};
pub use errors::{ErrorKind, VigilError, WireError};
pub use notification::{Notification, NotificationFilter, SubscriptionId};
pub use policy::{
    AccessPolicy, AccessRequest, Action, Decision, Permission, PolicyEngine, PolicyError,
    PolicyGrant,
};
pub use protocol::{Call, ClientFrame, Operation, ReplyBody, ServerFrame};
pub use registry::{RegistryError, RegistryStore, Resolver};
pub use value::Value;
