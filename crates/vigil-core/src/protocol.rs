//! Newline-delimited JSON frames exchanged over a connector connection.
//!
//! ```text
//! client                                server
//!   hello { credential, origin? }  ──▶
//!                                  ◀──  welcome { session, token } | rejected
//!   call { id, token, object, operation, delegate? }  ──▶
//!                                  ◀──  reply { id, outcome }
//!                                  ◀──  notification { subscription, notification }
//!   close                          ──▶
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::{Credential, Subject};
use crate::errors::WireError;
use crate::notification::{Notification, NotificationFilter, SubscriptionId};
use crate::policy::Action;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    GetAttribute {
        attribute: String,
    },
    SetAttribute {
        attribute: String,
        value: Value,
    },
    Invoke {
        operation: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    Subscribe {
        #[serde(default)]
        filter: NotificationFilter,
    },
    Unsubscribe {
        subscription: SubscriptionId,
    },
    /// Create an object from a server-side factory.
    Register {
        kind: String,
    },
    Unregister,
    /// List object names; the call's object field is a name pattern.
    ListObjects,
}

impl Operation {
    /// The permission action this operation requires.
    pub fn action(&self) -> Action {
        match self {
            Operation::GetAttribute { .. } => Action::ReadAttribute,
            Operation::SetAttribute { .. } => Action::WriteAttribute,
            Operation::Invoke { .. } => Action::Invoke,
            Operation::Subscribe { .. } | Operation::Unsubscribe { .. } => Action::Subscribe,
            Operation::Register { .. } => Action::Register,
            Operation::Unregister => Action::Unregister,
            Operation::ListObjects => Action::Query,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::GetAttribute { .. } => "get_attribute",
            Operation::SetAttribute { .. } => "set_attribute",
            Operation::Invoke { .. } => "invoke",
            Operation::Subscribe { .. } => "subscribe",
            Operation::Unsubscribe { .. } => "unsubscribe",
            Operation::Register { .. } => "register",
            Operation::Unregister => "unregister",
            Operation::ListObjects => "list_objects",
        }
    }
}

/// The remote operation envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub id: u64,
    pub token: String,
    pub object: String,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegate: Option<Subject>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum ClientFrame {
    Hello {
        credential: Credential,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<String>,
    },
    Call(Call),
    Close,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplyBody {
    Unit,
    Value { value: Value },
    Subscribed { subscription: SubscriptionId },
    Names { names: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum ServerFrame {
    Welcome {
        session: Uuid,
        token: String,
    },
    /// Uniform handshake refusal; the connection closes right after.
    Rejected {
        error: WireError,
    },
    Reply {
        id: u64,
        outcome: Result<ReplyBody, WireError>,
    },
    Notification {
        subscription: SubscriptionId,
        notification: Notification,
    },
    /// The server dropped the subscription (unsubscribed, or its object went
    /// away). No further notifications follow for it.
    SubscriptionEnded {
        subscription: SubscriptionId,
    },
}

/// Serializes a frame as one line, terminator included.
pub fn encode_frame<T: Serialize>(frame: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_frame<T: DeserializeOwned>(line: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(line.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Principal;
    use crate::errors::ErrorKind;

    #[test]
    fn call_frame_layout() {
        let frame = ClientFrame::Call(Call {
            id: 7,
            token: "t".into(),
            object: "MBeans:type=Simple".into(),
            operation: Operation::SetAttribute {
                attribute: "State".into(),
                value: Value::from("changed"),
            },
            delegate: Some(Subject::single(Principal::user("monitorRole"))),
        });
        let line = encode_frame(&frame).unwrap();
        assert!(line.ends_with('\n'));
        let json: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(json["frame"], "call");
        assert_eq!(json["operation"]["op"], "set_attribute");
        assert_eq!(json["delegate"][0], "user:monitorRole");
    }

    #[test]
    fn decodes_handwritten_frames() {
        let hello: ClientFrame = decode_frame(
            r#"{"frame":"hello","credential":{"identifier":"a","secret":"b"}}"#,
        )
        .unwrap();
        assert!(matches!(hello, ClientFrame::Hello { origin: None, .. }));

        let call: ClientFrame = decode_frame(
            r#"{"frame":"call","id":1,"token":"t","object":"*","operation":{"op":"list_objects"}}"#,
        )
        .unwrap();
        match call {
            ClientFrame::Call(call) => {
                assert_eq!(call.operation, Operation::ListObjects);
                assert!(call.delegate.is_none());
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn reply_carries_error_kind() {
        let frame = ServerFrame::Reply {
            id: 3,
            outcome: Err(WireError {
                kind: ErrorKind::NotAuthorized,
                detail: "write-attribute on x".into(),
            }),
        };
        let line = encode_frame(&frame).unwrap();
        let back: ServerFrame = decode_frame(&line).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn subscribe_defaults_to_empty_filter() {
        let op: Operation = serde_json::from_str(r#"{"op":"subscribe"}"#).unwrap();
        assert_eq!(
            op,
            Operation::Subscribe {
                filter: NotificationFilter::default()
            }
        );
        assert_eq!(op.action(), Action::Subscribe);
    }
}
