//! Connection lifecycle.
//!
//! [`IpConnection`] ties the transport, correlator and dispatcher together
//! and runs a supervisor task per connection:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> PendingReconnect -> Connecting -> ...
//!      ^              |             |               |
//!      +--------------+-------------+---------------+
//! ```
//!
//! While connected, the supervisor watches the read loop and writes a
//! disconnect probe whenever the link was idle for the probe interval. When
//! the link drops it fails all pending requests, emits a disconnected
//! event and, if enabled, reconnects on a fixed interval. Reconnects redo
//! authentication and re-enumerate. Too many disconnects inside the
//! rolling window disable reconnecting.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use brickwire_protocol::{BROADCAST_UID, EnumerateEvent, Packet, function};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth;
use crate::config::{ClientConfig, ReconnectPolicy};
use crate::correlator::{Correlator, Request, Routed};
use crate::dispatcher::{CallbackEvent, CallbackKey, Dispatcher};
use crate::error::{ClientError, ClientResult};
use crate::transport::{PacketSink, ReadLoopExit, Transport};

/// Lifecycle state of an [`IpConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Link lost, waiting to reconnect.
    PendingReconnect,
}

/// Why a connection was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectReason {
    /// Explicit [`IpConnection::connect`].
    Request,
    /// Automatic reconnect after a lost link.
    AutoReconnect,
}

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// Explicit [`IpConnection::disconnect`].
    Request,
    /// Socket error or failed probe.
    Error,
    /// The peer closed the connection.
    Shutdown,
}

/// Snapshot of the connection, published on every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Successful automatic reconnects so far.
    pub auto_reconnects: u32,
    pub connected_since: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            auto_reconnects: 0,
            connected_since: None,
            last_error: None,
        }
    }
}

/// Rolling record of disconnect times.
#[derive(Debug)]
struct DisconnectHistory {
    times: VecDeque<Instant>,
    max_disconnects: usize,
    window: Duration,
}

impl DisconnectHistory {
    fn new(policy: &ReconnectPolicy) -> Self {
        Self {
            times: VecDeque::new(),
            max_disconnects: policy.max_disconnects,
            window: policy.window(),
        }
    }

    /// Records a disconnect. Returns true once the threshold is reached.
    fn record(&mut self, now: Instant) -> bool {
        self.times.push_back(now);
        while let Some(&first) = self.times.front()
            && now.duration_since(first) > self.window
        {
            self.times.pop_front();
        }
        self.max_disconnects > 0 && self.times.len() >= self.max_disconnects
    }
}

#[derive(Debug)]
enum Command {
    Disconnect { reply: oneshot::Sender<()> },
}

struct Supervisor {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

#[derive(Debug, Clone)]
struct Target {
    host: String,
    port: u16,
}

/// How a connected phase ended.
enum LinkEnd {
    Requested(Option<oneshot::Sender<()>>),
    Lost(DisconnectReason, String),
}

struct Inner {
    correlator: Correlator,
    dispatcher: Dispatcher,
    transport: RwLock<Option<Arc<Transport>>>,
    status: watch::Sender<ConnectionStatus>,
    timeout_ms: AtomicU64,
    auto_reconnect: AtomicBool,
    auto_reconnects: AtomicU32,
    secret: Mutex<Option<String>>,
    reconnect: ReconnectPolicy,
    probe_interval: Option<Duration>,
    supervisor: Mutex<Option<Supervisor>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl PacketSink for Inner {
    fn deliver(&self, packet: Packet) {
        let Routed::Callback(packet) = self.correlator.route(packet) else {
            return;
        };

        if packet.function_id() == function::CALLBACK_ENUMERATE {
            match EnumerateEvent::from_payload(&packet.payload) {
                Ok(event) => self.dispatcher.dispatch(CallbackEvent::Enumerate(event)),
                Err(e) => warn!(error = %e, "dropping malformed enumerate callback"),
            }
        } else {
            self.dispatcher.dispatch(CallbackEvent::Device(packet));
        }
    }
}

impl Inner {
    fn transport(&self) -> Option<Arc<Transport>> {
        self.transport
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn replace_transport(&self, transport: Option<Arc<Transport>>) -> Option<Arc<Transport>> {
        let mut slot = self
            .transport
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *slot, transport)
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    fn secret(&self) -> Option<String> {
        self.secret
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    fn set_state(&self, state: ConnectionState, last_error: Option<String>) {
        let auto_reconnects = self.auto_reconnects.load(Ordering::Relaxed);
        self.status.send_modify(|status| {
            if status.state != state {
                info!(from = ?status.state, to = ?state, "connection state changed");
            }
            status.state = state;
            status.auto_reconnects = auto_reconnects;
            match state {
                ConnectionState::Connected => {
                    status.connected_since = Some(Utc::now());
                    status.last_error = None;
                }
                _ => {
                    status.connected_since = None;
                    if last_error.is_some() {
                        status.last_error = last_error;
                    }
                }
            }
        });
    }

    /// Opens the transport, authenticates and announces the connection.
    async fn establish(
        self: &Arc<Self>,
        target: &Target,
        reason: ConnectReason,
    ) -> ClientResult<JoinHandle<ReadLoopExit>> {
        let (transport, reader) =
            Transport::connect(&target.host, target.port, self.timeout(), Arc::clone(self)).await?;
        let transport = Arc::new(transport);

        // published only after the handshake; calls while connecting fail
        // with NotConnected
        if let Some(secret) = self.secret()
            && let Err(e) =
                auth::authenticate(&self.correlator, &*transport, &secret, self.timeout()).await
        {
            transport.disconnect().await;
            self.correlator.fail_all();
            if matches!(e, ClientError::AuthenticationFailed(_)) {
                self.auto_reconnect.store(false, Ordering::Relaxed);
            }
            return Err(e);
        }

        self.replace_transport(Some(transport.clone()));
        self.set_state(ConnectionState::Connected, None);
        info!(
            host = %target.host,
            port = target.port,
            reason = ?reason,
            peer = %transport.peer(),
            "connected"
        );
        self.dispatcher.dispatch(CallbackEvent::Connected(reason));

        let enumerate = Request::new(BROADCAST_UID, function::ENUMERATE).with_response_expected(false);
        if let Err(e) = self
            .correlator
            .call(&*transport, enumerate, self.timeout())
            .await
        {
            warn!(error = %e, "enumerate broadcast failed");
        }

        Ok(reader)
    }

    /// Closes the transport and fails everything that depended on it.
    async fn teardown(&self, reason: DisconnectReason) {
        if let Some(transport) = self.replace_transport(None) {
            transport.disconnect().await;
        }
        self.correlator.fail_all();
        self.dispatcher.dispatch(CallbackEvent::Disconnected(reason));
        info!(reason = ?reason, "disconnected");
    }

    /// Watches a connected link until it drops or a disconnect is requested.
    async fn watch_link(
        &self,
        reader: &mut JoinHandle<ReadLoopExit>,
        commands: &mut mpsc::Receiver<Command>,
    ) -> LinkEnd {
        loop {
            let Some(transport) = self.transport() else {
                return LinkEnd::Lost(DisconnectReason::Error, "transport gone".into());
            };
            let next_probe = self
                .probe_interval
                .map(|interval| interval.saturating_sub(transport.idle_for()));
            drop(transport);

            tokio::select! {
                command = commands.recv() => {
                    return LinkEnd::Requested(command.map(|Command::Disconnect { reply }| reply));
                }
                exit = &mut *reader => {
                    return match exit {
                        Ok(ReadLoopExit::Eof) => LinkEnd::Lost(
                            DisconnectReason::Shutdown,
                            "connection closed by peer".to_string(),
                        ),
                        Ok(ReadLoopExit::Error(e)) => LinkEnd::Lost(DisconnectReason::Error, e.to_string()),
                        Ok(ReadLoopExit::Shutdown) => LinkEnd::Lost(
                            DisconnectReason::Error,
                            "transport closed".to_string(),
                        ),
                        Err(e) => LinkEnd::Lost(DisconnectReason::Error, format!("read task failed: {e}")),
                    };
                }
                _ = sleep_or_forever(next_probe) => {
                    if let Err(e) = self.probe_if_idle().await {
                        return LinkEnd::Lost(DisconnectReason::Error, format!("disconnect probe failed: {e}"));
                    }
                }
            }
        }
    }

    /// Writes a probe if nothing was sent for a whole interval. A probe
    /// that cannot be written within the response timeout counts as a
    /// dead link.
    async fn probe_if_idle(&self) -> ClientResult<()> {
        let transport = self.transport().ok_or(ClientError::NotConnected)?;
        let Some(interval) = self.probe_interval else {
            return Ok(());
        };
        if transport.idle_for() < interval {
            return Ok(());
        }

        debug!("sending disconnect probe");
        let probe = Packet::new(BROADCAST_UID, function::DISCONNECT_PROBE, 0, false, Bytes::new())?;
        tokio::time::timeout(self.timeout(), transport.send(&probe))
            .await
            .map_err(|_| ClientError::timeout(BROADCAST_UID, function::DISCONNECT_PROBE))?
    }
}

async fn sleep_or_forever(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

async fn supervise(
    inner: Arc<Inner>,
    target: Target,
    mut reader: JoinHandle<ReadLoopExit>,
    mut commands: mpsc::Receiver<Command>,
) {
    let mut history = DisconnectHistory::new(&inner.reconnect);

    loop {
        let (reason, message) = match inner.watch_link(&mut reader, &mut commands).await {
            LinkEnd::Requested(reply) => {
                inner.teardown(DisconnectReason::Request).await;
                inner.set_state(ConnectionState::Disconnected, None);
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
                return;
            }
            LinkEnd::Lost(reason, message) => (reason, message),
        };

        warn!(reason = ?reason, error = %message, "connection lost");
        inner.teardown(reason).await;

        if !inner.auto_reconnect.load(Ordering::Relaxed) {
            inner.set_state(ConnectionState::Disconnected, Some(message));
            return;
        }

        if history.record(Instant::now()) {
            let abandoned = ClientError::ReconnectAbandoned {
                disconnects: history.times.len(),
                window: history.window,
            };
            warn!(error = %abandoned, "giving up on reconnect");
            inner.set_state(ConnectionState::Disconnected, Some(abandoned.to_string()));
            return;
        }

        inner.set_state(ConnectionState::PendingReconnect, Some(message));

        reader = loop {
            tokio::select! {
                command = commands.recv() => {
                    inner.set_state(ConnectionState::Disconnected, None);
                    if let Some(Command::Disconnect { reply }) = command {
                        let _ = reply.send(());
                    }
                    return;
                }
                _ = tokio::time::sleep(inner.reconnect.interval()) => {}
            }

            if !inner.auto_reconnect.load(Ordering::Relaxed) {
                inner.set_state(ConnectionState::Disconnected, None);
                return;
            }

            inner.set_state(ConnectionState::Connecting, None);
            match inner.establish(&target, ConnectReason::AutoReconnect).await {
                Ok(reader) => {
                    inner.auto_reconnects.fetch_add(1, Ordering::Relaxed);
                    inner.set_state(ConnectionState::Connected, None);
                    break reader;
                }
                Err(e @ ClientError::AuthenticationFailed(_)) => {
                    inner.set_state(ConnectionState::Disconnected, Some(e.to_string()));
                    return;
                }
                Err(e) => {
                    debug!(error = %e, "reconnect attempt failed");
                    inner.set_state(ConnectionState::PendingReconnect, Some(e.to_string()));
                }
            }
        };
    }
}

/// A connection to a Brick Daemon.
///
/// Cheap to clone; clones share the connection. A connected
/// `IpConnection` keeps running in the background until
/// [`IpConnection::disconnect`] is called.
#[derive(Clone)]
pub struct IpConnection {
    inner: Arc<Inner>,
}

impl IpConnection {
    /// Creates a disconnected connection with default settings.
    pub fn new() -> ClientResult<Self> {
        Self::with_config(&ClientConfig::default())
    }

    /// Creates a disconnected connection.
    ///
    /// The secret, if configured, is resolved now and used on every
    /// (re)connect.
    pub fn with_config(config: &ClientConfig) -> ClientResult<Self> {
        let (status, _) = watch::channel(ConnectionStatus::default());

        Ok(Self {
            inner: Arc::new(Inner {
                correlator: Correlator::new(),
                dispatcher: Dispatcher::new()?,
                transport: RwLock::new(None),
                status,
                timeout_ms: AtomicU64::new(config.connection.timeout_ms),
                auto_reconnect: AtomicBool::new(config.reconnect.enabled),
                auto_reconnects: AtomicU32::new(0),
                secret: Mutex::new(config.resolve_secret()?),
                reconnect: config.reconnect.clone(),
                probe_interval: config.keepalive.interval(),
                supervisor: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Connects to `host:port`.
    ///
    /// On success the connected callback fires and an enumeration broadcast
    /// is sent.
    pub async fn connect(&self, host: &str, port: u16) -> ClientResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        if self.inner.state() != ConnectionState::Disconnected {
            return Err(ClientError::AlreadyConnected);
        }

        self.inner.auto_reconnects.store(0, Ordering::Relaxed);
        self.inner.set_state(ConnectionState::Connecting, None);
        let target = Target {
            host: host.to_string(),
            port,
        };

        let reader = match self.inner.establish(&target, ConnectReason::Request).await {
            Ok(reader) => reader,
            Err(e) => {
                self.inner
                    .set_state(ConnectionState::Disconnected, Some(e.to_string()));
                return Err(e);
            }
        };

        let (commands, command_rx) = mpsc::channel(4);
        let task = tokio::spawn(supervise(self.inner.clone(), target, reader, command_rx));
        *self
            .inner
            .supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Supervisor { commands, task });

        Ok(())
    }

    /// Closes the connection and stops any pending reconnect.
    ///
    /// Every outstanding call fails with [`ClientError::ConnectionLost`].
    pub async fn disconnect(&self) -> ClientResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        let supervisor = self
            .inner
            .supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(supervisor) = supervisor else {
            return Err(ClientError::NotConnected);
        };

        let (reply, done) = oneshot::channel();
        if supervisor
            .commands
            .send(Command::Disconnect { reply })
            .await
            .is_err()
        {
            // supervisor already gave up on its own
            return Err(ClientError::NotConnected);
        }

        let acknowledged = done.await.is_ok();
        let _ = supervisor.task.await;
        if acknowledged {
            Ok(())
        } else {
            Err(ClientError::NotConnected)
        }
    }

    /// Sends a request and returns the response payload.
    pub async fn call(&self, request: Request) -> ClientResult<Bytes> {
        let transport = self.inner.transport().ok_or(ClientError::NotConnected)?;
        self.inner
            .correlator
            .call(&*transport, request, self.inner.timeout())
            .await
    }

    /// Asks every device to announce itself through the enumerate callback.
    pub async fn enumerate(&self) -> ClientResult<()> {
        let request = Request::new(BROADCAST_UID, function::ENUMERATE).with_response_expected(false);
        self.call(request).await.map(|_| ())
    }

    /// Authenticates the current connection and remembers the secret for
    /// reconnects.
    ///
    /// A rejected secret disables auto-reconnect and closes the connection.
    pub async fn authenticate(&self, secret: &str) -> ClientResult<()> {
        let transport = self.inner.transport().ok_or(ClientError::NotConnected)?;

        match auth::authenticate(&self.inner.correlator, &*transport, secret, self.inner.timeout())
            .await
        {
            Ok(()) => {
                self.set_secret(Some(secret.to_string()));
                Ok(())
            }
            Err(e @ ClientError::AuthenticationFailed(_)) => {
                self.set_auto_reconnect(false);
                let _ = self.disconnect().await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Registers a callback handler.
    pub fn register_callback<F>(&self, key: CallbackKey, handler: F)
    where
        F: Fn(&CallbackEvent) + Send + Sync + 'static,
    {
        self.inner.dispatcher.register(key, handler);
    }

    /// Removes a callback handler. Returns whether one was registered.
    pub fn unregister_callback(&self, key: CallbackKey) -> bool {
        self.inner.dispatcher.unregister(key)
    }

    /// Waits until all callbacks queued so far were handled.
    pub async fn flush_callbacks(&self) {
        self.inner.dispatcher.flush().await;
    }

    /// Current status snapshot.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.borrow().clone()
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Receiver notified on every status change.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Number of requests waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout()
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.inner
            .timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn auto_reconnect(&self) -> bool {
        self.inner.auto_reconnect.load(Ordering::Relaxed)
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.inner.auto_reconnect.store(enabled, Ordering::Relaxed);
    }

    /// Sets the secret used on the next (re)connect.
    pub fn set_secret(&self, secret: Option<String>) {
        *self
            .inner
            .secret
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = secret;
    }
}
