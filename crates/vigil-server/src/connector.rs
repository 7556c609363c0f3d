//! The connector server: accepts connections, authenticates them once, then
//! authorizes and executes every remote operation.
//!
//! ```text
//! Stopped ──start()──▶ Starting ──bound──▶ Listening ──stop()──▶ Closing ──▶ Stopped
//!                         │
//!                         └── bind failed ──▶ Stopped
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vigil_core::policy::Pattern;
use vigil_core::protocol::{decode_frame, encode_frame};
use vigil_core::time::now_millis;
use vigil_core::{
    AccessPolicy, AccessRequest, Authenticator, Call, ClientFrame, Credential, Endpoint,
    Operation, Permission, ReplyBody, ServerFrame, VigilError,
};
use vigil_registry::{Binding, Registry};

use crate::objects::ObjectRegistry;
use crate::session::{Session, SessionGuard, SessionTable, TokenIssuer};

/// Longest frame accepted from a client, newline excluded.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// How long a closing connection may take to flush its remaining frames.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Name the server binds in the registry.
    pub service_name: String,
    pub handshake_timeout: Duration,
    pub token_secret: String,
    /// Frames a connection may have waiting for its socket. Notifications
    /// beyond this are dropped; replies wait for room.
    pub outbound_queue: usize,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            service_name: "vigil".to_string(),
            handshake_timeout: Duration::from_secs(10),
            token_secret: Uuid::new_v4().to_string(),
            outbound_queue: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Listening,
    Closing,
}

struct Running {
    binding: Binding,
    endpoint: Endpoint,
    shutdown: watch::Sender<bool>,
    accept: JoinHandle<()>,
}

struct Inner {
    config: ConnectorConfig,
    registry: Arc<Registry>,
    authenticator: Arc<dyn Authenticator>,
    policy: Arc<dyn AccessPolicy>,
    objects: Arc<ObjectRegistry>,
    sessions: Arc<SessionTable>,
    tokens: TokenIssuer,
    state: RwLock<ServerState>,
    stopping: AtomicBool,
}

pub struct ConnectorServer {
    inner: Arc<Inner>,
    control: Mutex<Option<Running>>,
}

impl ConnectorServer {
    pub fn new(
        config: ConnectorConfig,
        registry: Arc<Registry>,
        authenticator: Arc<dyn Authenticator>,
        policy: Arc<dyn AccessPolicy>,
        objects: Arc<ObjectRegistry>,
    ) -> Self {
        let tokens = TokenIssuer::new(&config.token_secret);
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                authenticator,
                policy,
                objects,
                sessions: Arc::new(SessionTable::new()),
                tokens,
                state: RwLock::new(ServerState::Stopped),
                stopping: AtomicBool::new(false),
            }),
            control: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ServerState {
        *self.inner.state.read()
    }

    pub fn objects(&self) -> &Arc<ObjectRegistry> {
        &self.inner.objects
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Binds the service name and starts accepting connections.
    ///
    /// Returns the existing endpoint when already listening, and
    /// `AlreadyRunning` while a start or stop is in progress.
    pub async fn start(&self) -> Result<Endpoint, VigilError> {
        let Ok(mut control) = self.control.try_lock() else {
            return Err(VigilError::AlreadyRunning);
        };
        if let Some(running) = control.as_ref() {
            return Ok(running.endpoint.clone());
        }

        self.inner.set_state(ServerState::Starting);
        self.inner.stopping.store(false, Ordering::SeqCst);
        let running = match self.launch() {
            Ok(running) => running,
            Err(e) => {
                self.inner.set_state(ServerState::Stopped);
                warn!(service = %self.inner.config.service_name, error = %e, "connector failed to start");
                return Err(e);
            }
        };
        let endpoint = running.endpoint.clone();
        *control = Some(running);
        self.inner.set_state(ServerState::Listening);
        info!(service = %self.inner.config.service_name, %endpoint, "connector listening");
        Ok(endpoint)
    }

    fn launch(&self) -> Result<Running, VigilError> {
        let mut binding = self.inner.registry.bind(&self.inner.config.service_name)?;
        let listener = binding
            .take_listener()
            .ok_or_else(|| VigilError::Unavailable("binding has no listener".to_string()))?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept = tokio::spawn(accept_loop(self.inner.clone(), listener, shutdown_rx));
        Ok(Running {
            endpoint: binding.endpoint().clone(),
            binding,
            shutdown,
            accept,
        })
    }

    /// Closes every session, cancels their subscriptions and unbinds the
    /// service name. Stopping a stopped server is a no-op.
    pub async fn stop(&self) {
        let mut control = self.control.lock().await;
        let Some(running) = control.take() else {
            return;
        };
        self.inner.set_state(ServerState::Closing);
        self.inner.stopping.store(true, Ordering::SeqCst);
        info!(service = %self.inner.config.service_name, "connector stopping");

        let _ = running.shutdown.send(true);
        if let Err(e) = running.accept.await {
            warn!(error = %e, "accept loop ended abnormally");
        }
        let cancelled = self.inner.objects.subscriptions().clear();
        self.inner.sessions.clear();
        drop(running.binding);

        self.inner.set_state(ServerState::Stopped);
        info!(service = %self.inner.config.service_name, cancelled, "connector stopped");
    }

    /// Authenticates `credential` and opens a session for it.
    pub fn open_session(
        &self,
        credential: &Credential,
        origin: Option<String>,
    ) -> Result<SessionGuard, VigilError> {
        self.inner.open_session(credential, origin)
    }

    /// Authorizes and executes one call on behalf of `session`.
    ///
    /// Notifications for subscriptions created by this call go to `sink`.
    pub fn dispatch(
        &self,
        session: &Session,
        call: Call,
        sink: &mpsc::Sender<ServerFrame>,
    ) -> Result<ReplyBody, VigilError> {
        self.inner.dispatch(session, call, sink)
    }
}

impl Drop for ConnectorServer {
    fn drop(&mut self) {
        if let Ok(control) = self.control.try_lock() {
            if let Some(running) = control.as_ref() {
                let _ = running.shutdown.send(true);
            }
        }
    }
}

impl Inner {
    fn set_state(&self, state: ServerState) {
        *self.state.write() = state;
    }

    fn open_session(
        &self,
        credential: &Credential,
        origin: Option<String>,
    ) -> Result<SessionGuard, VigilError> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(VigilError::ServerStopping);
        }
        let subject = self.authenticator.authenticate(credential).map_err(|e| {
            metrics::counter!("vigil_auth_failures_total").increment(1);
            warn!(
                identifier = %credential.identifier,
                origin = origin.as_deref().unwrap_or("-"),
                "authentication failed"
            );
            VigilError::from(e)
        })?;
        let id = Uuid::new_v4();
        let token = self.tokens.issue(id, &subject)?;
        Ok(SessionGuard::open(
            Session {
                id,
                subject,
                origin,
                token,
                opened_at: now_millis(),
            },
            self.sessions.clone(),
            self.objects.subscriptions().clone(),
        ))
    }

    fn dispatch(
        &self,
        session: &Session,
        call: Call,
        sink: &mpsc::Sender<ServerFrame>,
    ) -> Result<ReplyBody, VigilError> {
        let operation = call.operation.name();
        let result = self.execute_call(session, call, sink);
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind().as_str(),
        };
        metrics::counter!("vigil_dispatch_total", "operation" => operation, "outcome" => outcome)
            .increment(1);
        result
    }

    fn execute_call(
        &self,
        session: &Session,
        call: Call,
        sink: &mpsc::Sender<ServerFrame>,
    ) -> Result<ReplyBody, VigilError> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(VigilError::ServerStopping);
        }
        if !self.sessions.contains(&session.id) {
            // stop() clears the table after raising the flag.
            if self.stopping.load(Ordering::SeqCst) {
                return Err(VigilError::ServerStopping);
            }
            return Err(VigilError::AuthenticationFailed);
        }
        self.tokens.verify(&call.token, session)?;

        // Authorization comes before the object lookup so a denied caller
        // cannot learn which names exist.
        let permission = Permission::new(call.operation.action(), call.object.as_str());
        let request = AccessRequest {
            subject: &session.subject,
            delegated: call.delegate.as_ref(),
            origin: session.origin.as_deref(),
            permission: &permission,
        };
        if !self.policy.authorize(&request).is_allowed() {
            warn!(
                session = %session.id,
                subject = %session.subject,
                delegated = ?call.delegate.as_ref().map(ToString::to_string),
                %permission,
                "access denied"
            );
            return Err(VigilError::NotAuthorized(permission.to_string()));
        }
        debug!(session = %session.id, %permission, "access granted");

        let object = call.object;
        match call.operation {
            Operation::GetAttribute { attribute } => self
                .objects
                .get(&object)?
                .execute(&self.stopping, |o, _| o.get_attribute(&attribute))
                .map(|value| ReplyBody::Value { value }),
            Operation::SetAttribute { attribute, value } => self
                .objects
                .get(&object)?
                .execute(&self.stopping, |o, events| {
                    o.set_attribute(&attribute, value, events)
                })
                .map(|()| ReplyBody::Unit),
            Operation::Invoke { operation, args } => self
                .objects
                .get(&object)?
                .execute(&self.stopping, |o, events| o.invoke(&operation, args, events))
                .map(|value| ReplyBody::Value { value }),
            Operation::Subscribe { filter } => self
                .objects
                .subscribe(&object, session.id, filter, sink.clone())
                .map(|subscription| ReplyBody::Subscribed { subscription }),
            Operation::Unsubscribe { subscription } => self
                .objects
                .subscriptions()
                .unsubscribe(subscription, session.id)
                .map(|()| ReplyBody::Unit),
            Operation::Register { kind } => self
                .objects
                .create(&object, &kind)
                .map(|()| ReplyBody::Unit),
            Operation::Unregister => self.objects.unregister(&object).map(|()| ReplyBody::Unit),
            Operation::ListObjects => {
                let pattern = Pattern::parse(&object);
                let names = self
                    .objects
                    .names()
                    .into_iter()
                    .filter(|name| pattern.matches(name))
                    .collect();
                Ok(ReplyBody::Names { names })
            }
        }
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "connection accepted");
                    let inner = inner.clone();
                    let shutdown = shutdown.clone();
                    connections.spawn(async move {
                        if let Err(e) = serve_connection(inner, stream, peer, shutdown).await {
                            debug!(%peer, error = %e, "connection closed with error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    drop(listener);
    while connections.join_next().await.is_some() {}
}

async fn reject(writer: &mut OwnedWriteHalf, error: VigilError) {
    let frame = ServerFrame::Rejected {
        error: error.to_wire(),
    };
    if let Ok(line) = encode_frame(&frame) {
        let _ = writer.write_all(line.as_bytes()).await;
    }
    let _ = writer.shutdown().await;
}

/// Reads one newline-terminated frame of at most `MAX_FRAME_LEN` bytes.
/// `None` on a clean end of stream.
async fn read_frame<R>(reader: &mut R) -> Result<Option<String>, VigilError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let read = (&mut *reader)
        .take(MAX_FRAME_LEN as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;
    if read == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if buf.len() > MAX_FRAME_LEN {
        return Err(VigilError::Protocol(format!(
            "frame longer than {MAX_FRAME_LEN} bytes"
        )));
    }
    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| VigilError::Protocol("frame is not valid UTF-8".to_string()))
}

async fn serve_connection(
    inner: Arc<Inner>,
    stream: TcpStream,
    peer: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), VigilError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let hello = tokio::select! {
        _ = shutdown.changed() => return Ok(()),
        read = timeout(inner.config.handshake_timeout, read_frame(&mut reader)) => read,
    };
    let line = match hello {
        Ok(Ok(Some(line))) => line,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(VigilError::Protocol(detail))) => {
            reject(&mut write_half, VigilError::Protocol(detail.clone())).await;
            return Err(VigilError::Protocol(format!("{peer}: {detail}")));
        }
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            debug!(%peer, "handshake timed out");
            reject(&mut write_half, VigilError::Protocol("handshake timed out".into())).await;
            return Ok(());
        }
    };
    let (credential, origin) = match decode_frame::<ClientFrame>(&line) {
        Ok(ClientFrame::Hello { credential, origin }) => (credential, origin),
        Ok(_) | Err(_) => {
            reject(&mut write_half, VigilError::Protocol("expected hello frame".into())).await;
            return Err(VigilError::Protocol(format!("{peer} sent no hello")));
        }
    };
    let guard = match inner.open_session(&credential, origin) {
        Ok(guard) => guard,
        Err(e) => {
            reject(&mut write_half, e).await;
            return Ok(());
        }
    };
    drop(credential);

    let (tx, mut rx) = mpsc::channel::<ServerFrame>(inner.config.outbound_queue.max(1));
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let line = match encode_frame(&frame) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "failed to encode frame");
                    continue;
                }
            };
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let welcome = ServerFrame::Welcome {
        session: guard.id(),
        token: guard.token().to_string(),
    };
    let mut open = send(&tx, welcome, &mut shutdown).await;

    while open {
        let read = tokio::select! {
            _ = shutdown.changed() => break,
            read = read_frame(&mut reader) => read,
        };
        let line = match read {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(session = %guard.id(), error = %e, "closing connection");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match decode_frame::<ClientFrame>(&line) {
            Ok(ClientFrame::Call(call)) => {
                let id = call.id;
                let outcome = inner
                    .dispatch(guard.session(), call, &tx)
                    .map_err(|e| e.to_wire());
                open = send(&tx, ServerFrame::Reply { id, outcome }, &mut shutdown).await;
            }
            Ok(ClientFrame::Close) => {
                debug!(session = %guard.id(), "client closed session");
                break;
            }
            Ok(ClientFrame::Hello { .. }) => {
                warn!(session = %guard.id(), "unexpected hello on an open session");
                break;
            }
            Err(e) => {
                // Answer the call if its id is still readable, otherwise give up.
                let id = serde_json::from_str::<serde_json::Value>(&line)
                    .ok()
                    .and_then(|v| v.get("id").and_then(serde_json::Value::as_u64));
                warn!(session = %guard.id(), error = %e, "malformed frame");
                let Some(id) = id else { break };
                let error = VigilError::Protocol(e.to_string()).to_wire();
                let reply = ServerFrame::Reply {
                    id,
                    outcome: Err(error),
                };
                open = send(&tx, reply, &mut shutdown).await;
            }
        }
    }

    drop(guard);
    drop(tx);
    if timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
        debug!(%peer, "peer not reading, abandoning unsent frames");
        writer.abort();
    }
    Ok(())
}

/// Queues `frame` for the writer, waiting for room unless the server stops.
/// `false` once the connection should close.
async fn send(
    tx: &mpsc::Sender<ServerFrame>,
    frame: ServerFrame,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    tokio::select! {
        _ = shutdown.changed() => false,
        sent = tx.send(frame) => sent.is_ok(),
    }
}
