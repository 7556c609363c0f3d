use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vigil_core::protocol::{decode_frame, encode_frame};
use vigil_core::{
    Call, ClientFrame, Credential, Endpoint, Notification, NotificationFilter, Operation,
    ReplyBody, Resolver, ServerFrame, Subject, SubscriptionId, Value, VigilError, WireError,
};

type PendingReply = oneshot::Sender<Result<ReplyBody, WireError>>;

/// Most notifications held back for subscriptions whose reply is still due.
const MAX_EARLY: usize = 1024;

/// Routes incoming frames to waiting calls and subscription listeners.
#[derive(Default)]
struct Inbox {
    pending: Mutex<HashMap<u64, PendingReply>>,
    listeners: Mutex<Listeners>,
    closed: AtomicBool,
}

#[derive(Default)]
struct Listeners {
    routes: HashMap<SubscriptionId, mpsc::UnboundedSender<Notification>>,
    // Frames that beat their subscribe reply, kept only while a subscribe
    // call is in flight.
    early: HashMap<SubscriptionId, Early>,
    early_len: usize,
    subscribing: usize,
}

#[derive(Default)]
struct Early {
    notifications: Vec<Notification>,
    ended: bool,
}

impl Inbox {
    fn route(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::Reply { id, outcome } => match self.pending.lock().remove(&id) {
                Some(waiter) => {
                    let _ = waiter.send(outcome);
                }
                None => debug!(id, "reply for unknown call"),
            },
            ServerFrame::Notification {
                subscription,
                notification,
            } => {
                let mut listeners = self.listeners.lock();
                if let Some(route) = listeners.routes.get(&subscription) {
                    let _ = route.send(notification);
                } else if listeners.subscribing == 0 {
                    debug!(%subscription, "notification for unknown subscription");
                } else if listeners.early_len >= MAX_EARLY {
                    warn!(%subscription, "too many notifications ahead of their subscription, dropping");
                } else {
                    listeners.early_len += 1;
                    listeners
                        .early
                        .entry(subscription)
                        .or_default()
                        .notifications
                        .push(notification);
                }
            }
            ServerFrame::SubscriptionEnded { subscription } => {
                let mut listeners = self.listeners.lock();
                if listeners.routes.remove(&subscription).is_some() {
                    debug!(%subscription, "subscription ended by server");
                } else if listeners.subscribing > 0 {
                    listeners.early.entry(subscription).or_default().ended = true;
                }
            }
            other => warn!(frame = ?other, "unexpected frame on open session"),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending.lock().clear();
        let mut listeners = self.listeners.lock();
        listeners.routes.clear();
        listeners.early.clear();
        listeners.early_len = 0;
    }
}

/// Marks a subscribe call in flight. When the last one finishes, anything
/// still held back belongs to no listener and is discarded.
struct Subscribing<'a>(&'a Inbox);

impl<'a> Subscribing<'a> {
    fn enter(inbox: &'a Inbox) -> Self {
        inbox.listeners.lock().subscribing += 1;
        Self(inbox)
    }
}

impl Drop for Subscribing<'_> {
    fn drop(&mut self) {
        let mut listeners = self.0.listeners.lock();
        listeners.subscribing = listeners.subscribing.saturating_sub(1);
        if listeners.subscribing == 0 {
            listeners.early.clear();
            listeners.early_len = 0;
        }
    }
}

/// Withdraws a call's reply slot if the caller stops waiting.
struct PendingCall<'a> {
    inbox: &'a Inbox,
    id: u64,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.inbox.pending.lock().remove(&self.id);
    }
}

struct Connection {
    session: Uuid,
    token: String,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    inbox: Arc<Inbox>,
    next_id: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

/// An authenticated connection to a connector server.
///
/// Cheap to clone; clones (and delegate views) share the connection.
#[derive(Clone)]
pub struct ClientSession {
    connection: Arc<Connection>,
    delegate: Option<Subject>,
}

impl ClientSession {
    /// Resolves `service` and opens an authenticated session on it.
    pub async fn connect<R: Resolver>(
        resolver: &R,
        service: &str,
        credential: Credential,
        origin: Option<String>,
    ) -> Result<Self, VigilError> {
        let endpoint = resolver.resolve(service).await?;
        Self::connect_endpoint(&endpoint, credential, origin).await
    }

    pub async fn connect_endpoint(
        endpoint: &Endpoint,
        credential: Credential,
        origin: Option<String>,
    ) -> Result<Self, VigilError> {
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let hello = encode_frame(&ClientFrame::Hello { credential, origin })
            .map_err(|e| VigilError::Protocol(e.to_string()))?;
        write_half.write_all(hello.as_bytes()).await?;

        let (session, token) = match lines.next_line().await? {
            Some(line) => match decode_frame::<ServerFrame>(&line) {
                Ok(ServerFrame::Welcome { session, token }) => (session, token),
                Ok(ServerFrame::Rejected { error }) => return Err(error.into()),
                Ok(other) => {
                    return Err(VigilError::Protocol(format!(
                        "expected welcome, got {other:?}"
                    )));
                }
                Err(e) => return Err(VigilError::Protocol(e.to_string())),
            },
            // The server hangs up without a word only on a refused handshake.
            None => return Err(VigilError::AuthenticationFailed),
        };
        info!(%session, %endpoint, "session established");

        let inbox = Arc::new(Inbox::default());
        let reader = tokio::spawn(read_frames(lines, inbox.clone()));
        Ok(Self {
            connection: Arc::new(Connection {
                session,
                token,
                writer: tokio::sync::Mutex::new(write_half),
                inbox,
                next_id: AtomicU64::new(1),
                reader: Mutex::new(Some(reader)),
            }),
            delegate: None,
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.connection.session
    }

    pub fn delegate(&self) -> Option<&Subject> {
        self.delegate.as_ref()
    }

    /// A view of this session that acts on behalf of `subject` on every call.
    pub fn with_delegate(&self, subject: Subject) -> ClientSession {
        ClientSession {
            connection: self.connection.clone(),
            delegate: Some(subject),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.connection.inbox.closed.load(Ordering::SeqCst)
    }

    pub async fn get_attribute(&self, object: &str, attribute: &str) -> Result<Value, VigilError> {
        let operation = Operation::GetAttribute {
            attribute: attribute.to_string(),
        };
        expect_value(self.call(object, operation).await?)
    }

    pub async fn set_attribute(
        &self,
        object: &str,
        attribute: &str,
        value: Value,
    ) -> Result<(), VigilError> {
        let operation = Operation::SetAttribute {
            attribute: attribute.to_string(),
            value,
        };
        expect_unit(self.call(object, operation).await?)
    }

    pub async fn invoke(
        &self,
        object: &str,
        operation: &str,
        args: Vec<Value>,
    ) -> Result<Value, VigilError> {
        let operation = Operation::Invoke {
            operation: operation.to_string(),
            args,
        };
        expect_value(self.call(object, operation).await?)
    }

    /// Subscribes to notifications of `object`. `listener` runs on its own
    /// task, in emission order, until the subscription ends.
    pub async fn subscribe<F>(
        &self,
        object: &str,
        filter: NotificationFilter,
        mut listener: F,
    ) -> Result<SubscriptionId, VigilError>
    where
        F: FnMut(Notification) + Send + 'static,
    {
        let _subscribing = Subscribing::enter(&self.connection.inbox);
        let subscription = match self.call(object, Operation::Subscribe { filter }).await? {
            ReplyBody::Subscribed { subscription } => subscription,
            other => return Err(unexpected(other)),
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
        tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                listener(notification);
            }
        });

        let mut listeners = self.connection.inbox.listeners.lock();
        let early = listeners.early.remove(&subscription).unwrap_or_default();
        listeners.early_len = listeners.early_len.saturating_sub(early.notifications.len());
        for notification in early.notifications {
            let _ = tx.send(notification);
        }
        if !early.ended {
            listeners.routes.insert(subscription, tx);
        }
        Ok(subscription)
    }

    pub async fn unsubscribe(
        &self,
        object: &str,
        subscription: SubscriptionId,
    ) -> Result<(), VigilError> {
        expect_unit(
            self.call(object, Operation::Unsubscribe { subscription })
                .await?,
        )?;
        // Every notification for it was routed before the reply arrived.
        self.connection
            .inbox
            .listeners
            .lock()
            .routes
            .remove(&subscription);
        Ok(())
    }

    /// Creates `name` on the server from the factory registered for `kind`.
    pub async fn register(&self, name: &str, kind: &str) -> Result<(), VigilError> {
        let operation = Operation::Register {
            kind: kind.to_string(),
        };
        expect_unit(self.call(name, operation).await?)
    }

    pub async fn unregister(&self, name: &str) -> Result<(), VigilError> {
        expect_unit(self.call(name, Operation::Unregister).await?)
    }

    /// Lists object names matching `pattern` (`*`, exact, or `prefix*`).
    pub async fn list_objects(&self, pattern: &str) -> Result<Vec<String>, VigilError> {
        match self.call(pattern, Operation::ListObjects).await? {
            ReplyBody::Names { names } => Ok(names),
            other => Err(unexpected(other)),
        }
    }

    /// Ends the session; pending calls fail with `Unavailable`.
    pub async fn close(&self) -> Result<(), VigilError> {
        if self.connection.inbox.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let line = encode_frame(&ClientFrame::Close).map_err(|e| VigilError::Protocol(e.to_string()))?;
        {
            let mut writer = self.connection.writer.lock().await;
            let _ = writer.write_all(line.as_bytes()).await;
            let _ = writer.shutdown().await;
        }
        let reader = self.connection.reader.lock().take();
        if let Some(reader) = reader {
            if tokio::time::timeout(Duration::from_secs(5), reader).await.is_err() {
                debug!(session = %self.connection.session, "server did not hang up in time");
            }
        }
        self.connection.inbox.close();
        info!(session = %self.connection.session, "session closed");
        Ok(())
    }

    async fn call(&self, object: &str, operation: Operation) -> Result<ReplyBody, VigilError> {
        let connection = &self.connection;
        if connection.inbox.closed.load(Ordering::SeqCst) {
            return Err(VigilError::Unavailable("session is closed".to_string()));
        }
        let id = connection.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = ClientFrame::Call(Call {
            id,
            token: connection.token.clone(),
            object: object.to_string(),
            operation,
            delegate: self.delegate.clone(),
        });
        let line = encode_frame(&frame).map_err(|e| VigilError::Protocol(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        connection.inbox.pending.lock().insert(id, tx);
        let _pending = PendingCall {
            inbox: &connection.inbox,
            id,
        };
        if connection.inbox.closed.load(Ordering::SeqCst) {
            return Err(VigilError::Unavailable("session is closed".to_string()));
        }
        {
            let mut writer = connection.writer.lock().await;
            writer.write_all(line.as_bytes()).await?;
        }

        match rx.await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(error)) => Err(error.into()),
            Err(_) => Err(VigilError::Unavailable("connection closed".to_string())),
        }
    }
}

async fn read_frames(mut lines: Lines<BufReader<OwnedReadHalf>>, inbox: Arc<Inbox>) {
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match decode_frame::<ServerFrame>(&line) {
                Ok(frame) => inbox.route(frame),
                Err(e) => warn!(error = %e, "malformed server frame"),
            },
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "connection read failed");
                break;
            }
        }
    }
    inbox.close();
}

fn unexpected(body: ReplyBody) -> VigilError {
    VigilError::Protocol(format!("unexpected reply {body:?}"))
}

fn expect_value(body: ReplyBody) -> Result<Value, VigilError> {
    match body {
        ReplyBody::Value { value } => Ok(value),
        other => Err(unexpected(other)),
    }
}

fn expect_unit(body: ReplyBody) -> Result<(), VigilError> {
    match body {
        ReplyBody::Unit => Ok(()),
        other => Err(unexpected(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use vigil_core::{ErrorKind, Principal};

    async fn write_frame(writer: &mut OwnedWriteHalf, frame: &ServerFrame) {
        writer
            .write_all(encode_frame(frame).unwrap().as_bytes())
            .await
            .unwrap();
    }

    /// Accepts one connection and hands its halves to `script`.
    async fn fake_server<F, Fut>(script: F) -> Endpoint
    where
        F: FnOnce(Lines<BufReader<OwnedReadHalf>>, OwnedWriteHalf) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::from(listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, write_half) = stream.into_split();
            script(BufReader::new(read_half).lines(), write_half).await;
        });
        endpoint
    }

    fn credential() -> Credential {
        Credential::new("monitorRole", "QED")
    }

    #[tokio::test]
    async fn rejected_handshake_is_authentication_failure() {
        let endpoint = fake_server(|mut lines, mut writer| async move {
            lines.next_line().await.unwrap();
            let error = WireError {
                kind: ErrorKind::AuthenticationFailed,
                detail: String::new(),
            };
            write_frame(&mut writer, &ServerFrame::Rejected { error }).await;
        })
        .await;

        let result = ClientSession::connect_endpoint(&endpoint, credential(), None).await;
        assert!(matches!(result, Err(VigilError::AuthenticationFailed)));
    }

    #[tokio::test]
    async fn silent_hangup_is_authentication_failure() {
        let endpoint = fake_server(|mut lines, _writer| async move {
            lines.next_line().await.unwrap();
        })
        .await;

        let result = ClientSession::connect_endpoint(&endpoint, credential(), None).await;
        assert!(matches!(result, Err(VigilError::AuthenticationFailed)));
    }

    #[tokio::test]
    async fn call_carries_token_and_delegate() {
        let endpoint = fake_server(|mut lines, mut writer| async move {
            lines.next_line().await.unwrap();
            let welcome = ServerFrame::Welcome {
                session: Uuid::new_v4(),
                token: "tok".into(),
            };
            write_frame(&mut writer, &welcome).await;

            let line = lines.next_line().await.unwrap().unwrap();
            let ClientFrame::Call(call) = decode_frame::<ClientFrame>(&line).unwrap() else {
                panic!("expected call");
            };
            assert_eq!(call.token, "tok");
            assert!(call.delegate.is_some());
            let reply = ServerFrame::Reply {
                id: call.id,
                outcome: Ok(ReplyBody::Value {
                    value: Value::from("changed state"),
                }),
            };
            write_frame(&mut writer, &reply).await;
        })
        .await;

        let session = ClientSession::connect_endpoint(&endpoint, credential(), None)
            .await
            .unwrap();
        let delegated = session.with_delegate(Subject::single(Principal::user("monitorRole")));
        let value = delegated.get_attribute("obj", "State").await.unwrap();
        assert_eq!(value, Value::from("changed state"));
    }

    #[tokio::test]
    async fn error_replies_keep_their_kind() {
        let endpoint = fake_server(|mut lines, mut writer| async move {
            lines.next_line().await.unwrap();
            let welcome = ServerFrame::Welcome {
                session: Uuid::new_v4(),
                token: "tok".into(),
            };
            write_frame(&mut writer, &welcome).await;
            let line = lines.next_line().await.unwrap().unwrap();
            let ClientFrame::Call(call) = decode_frame::<ClientFrame>(&line).unwrap() else {
                panic!("expected call");
            };
            let reply = ServerFrame::Reply {
                id: call.id,
                outcome: Err(WireError {
                    kind: ErrorKind::NotAuthorized,
                    detail: "write-attribute on obj".into(),
                }),
            };
            write_frame(&mut writer, &reply).await;
        })
        .await;

        let session = ClientSession::connect_endpoint(&endpoint, credential(), None)
            .await
            .unwrap();
        let result = session.set_attribute("obj", "State", Value::from("x")).await;
        assert!(matches!(result, Err(VigilError::NotAuthorized(_))));
    }

    #[tokio::test]
    async fn notifications_arriving_before_subscribe_reply_are_kept() {
        let endpoint = fake_server(|mut lines, mut writer| async move {
            lines.next_line().await.unwrap();
            let welcome = ServerFrame::Welcome {
                session: Uuid::new_v4(),
                token: "tok".into(),
            };
            write_frame(&mut writer, &welcome).await;
            let line = lines.next_line().await.unwrap().unwrap();
            let ClientFrame::Call(call) = decode_frame::<ClientFrame>(&line).unwrap() else {
                panic!("expected call");
            };
            let subscription = SubscriptionId(9);
            let notification = Notification {
                source: "obj".into(),
                kind: "vigil.state.reset".into(),
                message: String::new(),
                sequence: 1,
                timestamp: 0,
                user_data: None,
            };
            write_frame(
                &mut writer,
                &ServerFrame::Notification {
                    subscription,
                    notification,
                },
            )
            .await;
            let reply = ServerFrame::Reply {
                id: call.id,
                outcome: Ok(ReplyBody::Subscribed { subscription }),
            };
            write_frame(&mut writer, &reply).await;
            // Keep the connection open until the client hangs up.
            while let Ok(Some(_)) = lines.next_line().await {}
        })
        .await;

        let session = ClientSession::connect_endpoint(&endpoint, credential(), None)
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = session
            .subscribe("obj", NotificationFilter::accept_all(), move |n| {
                let _ = tx.send(n);
            })
            .await
            .unwrap();
        assert_eq!(id, SubscriptionId(9));

        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.sequence, 1);
        session.close().await.unwrap();
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn calls_after_close_are_unavailable() {
        let endpoint = fake_server(|mut lines, mut writer| async move {
            lines.next_line().await.unwrap();
            let welcome = ServerFrame::Welcome {
                session: Uuid::new_v4(),
                token: "tok".into(),
            };
            write_frame(&mut writer, &welcome).await;
            while let Ok(Some(_)) = lines.next_line().await {}
        })
        .await;

        let session = ClientSession::connect_endpoint(&endpoint, credential(), None)
            .await
            .unwrap();
        session.close().await.unwrap();
        assert!(matches!(
            session.list_objects("*").await,
            Err(VigilError::Unavailable(_))
        ));
    }

    fn reset(sequence: u64) -> Notification {
        Notification {
            source: "obj".into(),
            kind: "vigil.state.reset".into(),
            message: String::new(),
            sequence,
            timestamp: 0,
            user_data: None,
        }
    }

    async fn welcome(lines: &mut Lines<BufReader<OwnedReadHalf>>, writer: &mut OwnedWriteHalf) {
        lines.next_line().await.unwrap();
        let welcome = ServerFrame::Welcome {
            session: Uuid::new_v4(),
            token: "tok".into(),
        };
        write_frame(writer, &welcome).await;
    }

    async fn next_call(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> Call {
        let line = lines.next_line().await.unwrap().unwrap();
        let ClientFrame::Call(call) = decode_frame::<ClientFrame>(&line).unwrap() else {
            panic!("expected call");
        };
        call
    }

    #[tokio::test]
    async fn stray_notifications_are_not_kept() {
        let endpoint = fake_server(|mut lines, mut writer| async move {
            welcome(&mut lines, &mut writer).await;
            let call = next_call(&mut lines).await;
            for sequence in 1..=50 {
                let frame = ServerFrame::Notification {
                    subscription: SubscriptionId(77),
                    notification: reset(sequence),
                };
                write_frame(&mut writer, &frame).await;
            }
            let reply = ServerFrame::Reply {
                id: call.id,
                outcome: Ok(ReplyBody::Names { names: vec![] }),
            };
            write_frame(&mut writer, &reply).await;
            while let Ok(Some(_)) = lines.next_line().await {}
        })
        .await;

        let session = ClientSession::connect_endpoint(&endpoint, credential(), None)
            .await
            .unwrap();
        assert!(session.list_objects("*").await.unwrap().is_empty());
        let listeners = session.connection.inbox.listeners.lock();
        assert!(listeners.early.is_empty());
        assert_eq!(listeners.early_len, 0);
    }

    #[tokio::test]
    async fn abandoned_subscribe_releases_its_state() {
        let endpoint = fake_server(|mut lines, mut writer| async move {
            welcome(&mut lines, &mut writer).await;
            let subscribe = next_call(&mut lines).await;
            for sequence in 1..=5 {
                let frame = ServerFrame::Notification {
                    subscription: SubscriptionId(5),
                    notification: reset(sequence),
                };
                write_frame(&mut writer, &frame).await;
            }
            // The subscribe reply only comes after the client gave up.
            let list = next_call(&mut lines).await;
            let late = ServerFrame::Reply {
                id: subscribe.id,
                outcome: Ok(ReplyBody::Subscribed {
                    subscription: SubscriptionId(5),
                }),
            };
            write_frame(&mut writer, &late).await;
            let reply = ServerFrame::Reply {
                id: list.id,
                outcome: Ok(ReplyBody::Names {
                    names: vec!["obj".into()],
                }),
            };
            write_frame(&mut writer, &reply).await;
            while let Ok(Some(_)) = lines.next_line().await {}
        })
        .await;

        let session = ClientSession::connect_endpoint(&endpoint, credential(), None)
            .await
            .unwrap();
        let abandoned = tokio::time::timeout(
            Duration::from_millis(200),
            session.subscribe("obj", NotificationFilter::accept_all(), |_| {}),
        )
        .await;
        assert!(abandoned.is_err());

        assert_eq!(session.list_objects("*").await.unwrap(), ["obj"]);
        assert!(session.connection.inbox.pending.lock().is_empty());
        let listeners = session.connection.inbox.listeners.lock();
        assert!(listeners.early.is_empty());
        assert!(listeners.routes.is_empty());
        assert_eq!(listeners.subscribing, 0);
    }

    #[tokio::test]
    async fn server_ended_subscription_stops_its_listener() {
        let endpoint = fake_server(|mut lines, mut writer| async move {
            welcome(&mut lines, &mut writer).await;
            let subscribe = next_call(&mut lines).await;
            let subscription = SubscriptionId(3);
            let reply = ServerFrame::Reply {
                id: subscribe.id,
                outcome: Ok(ReplyBody::Subscribed { subscription }),
            };
            write_frame(&mut writer, &reply).await;
            let unregister = next_call(&mut lines).await;
            write_frame(
                &mut writer,
                &ServerFrame::SubscriptionEnded { subscription },
            )
            .await;
            let reply = ServerFrame::Reply {
                id: unregister.id,
                outcome: Ok(ReplyBody::Unit),
            };
            write_frame(&mut writer, &reply).await;
            while let Ok(Some(_)) = lines.next_line().await {}
        })
        .await;

        let session = ClientSession::connect_endpoint(&endpoint, credential(), None)
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
        session
            .subscribe("obj", NotificationFilter::accept_all(), move |n| {
                let _ = tx.send(n);
            })
            .await
            .unwrap();
        session.unregister("obj").await.unwrap();

        assert!(session.connection.inbox.listeners.lock().routes.is_empty());
        let closed = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert!(closed.is_none());
    }
}
