//! The gateway client: connection supervisor, request multiplexer and the
//! glue to the event dispatcher and health monitor.
//!
//! A [`GatewayClient`] owns exactly one logical connection. [`start`] spawns
//! the reconnect loop, which dials the gateway, answers the
//! `connect.challenge`, and then runs the read loop until the socket fails.
//! Callers issue [`request`]s concurrently; responses are matched by id.
//!
//! Locking: connection state and the pending map share one `std` mutex,
//! health counters have their own, and the socket writer sits behind a
//! `tokio` mutex. No `std` guard is held across an `.await`.
//!
//! [`start`]: GatewayClient::start
//! [`request`]: GatewayClient::request

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use gatewatch_core::prelude::*;

use crate::config::ClientConfig;
use crate::connection::{Backoff, Connection, ConnectionState};
use crate::events::EventDispatcher;
use crate::handshake::build_connect_params;
use crate::health::{
    self, HealthNotice, HealthState, HealthStatus, NotifyCallback, ProbeMethod, RestartCallback,
};
use crate::identity::DeviceIdentity;
use crate::pending::PendingRequests;
use crate::protocol::{
    parse_frame, EventFrame, Frame, RequestFrame, EVENT_CONNECT_CHALLENGE, METHOD_CONNECT,
};
use crate::ws::{self, WsMessage, WsReader};

/// Upper bound from starting the dial to the terminal `connect` response.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Request path of the gateway WebSocket endpoint.
const GATEWAY_PATH: &str = "/";

/// Stand-in deadline for timeouts too large to add to `Instant::now()`.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct ConnShared {
    state: ConnectionState,
    current: Option<Arc<Connection>>,
    pending: PendingRequests,
    backoff: Backoff,
    next_generation: u64,
}

impl ConnShared {
    fn is_current(&self, generation: u64) -> bool {
        self.current
            .as_ref()
            .is_some_and(|c| c.generation() == generation)
    }
}

#[derive(Default)]
struct Hooks {
    restart: Option<RestartCallback>,
    notify: Option<NotifyCallback>,
}

/// A background task plus the channel that tells it to exit.
struct TaskHandle {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    fn spawn<F, Fut>(f: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(f(stop_rx));
        Self { stop_tx, handle }
    }

    fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    fn signal(&self) {
        let _ = self.stop_tx.send(true);
    }
}

#[derive(Default)]
struct Tasks {
    supervisor: Option<TaskHandle>,
    health: Option<TaskHandle>,
}

struct Inner {
    config: RwLock<ClientConfig>,
    conn: Mutex<ConnShared>,
    health: Mutex<HealthState>,
    events: EventDispatcher,
    hooks: RwLock<Hooks>,
    reconnects: AtomicU64,
    tasks: Mutex<Tasks>,
    state_tx: watch::Sender<ConnectionState>,
    identity: Mutex<Option<(PathBuf, Arc<DeviceIdentity>)>>,
}

/// Signals every background task to stop when the last client clone drops.
struct DropGuard {
    inner: Arc<Inner>,
}

impl Drop for DropGuard {
    fn drop(&mut self) {
        let tasks = std::mem::take(&mut *self.inner.lock_tasks());
        for task in [tasks.supervisor, tasks.health].into_iter().flatten() {
            task.signal();
        }
        self.inner.lock_conn().pending.drain();
    }
}

// ---------------------------------------------------------------------------
// GatewayClient
// ---------------------------------------------------------------------------

/// Persistent, authenticated RPC connection to a gateway.
///
/// Cheap to clone; all clones share one connection. Background tasks are
/// stopped when the last clone is dropped. Methods that spawn tasks
/// ([`start`](Self::start), [`set_health_check_enabled`](Self::set_health_check_enabled))
/// must be called from within a Tokio runtime.
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<Inner>,
    _guard: Arc<DropGuard>,
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("url", &self.inner.config_snapshot().ws_url())
            .field("state", &self.connection_state())
            .finish_non_exhaustive()
    }
}

impl GatewayClient {
    /// Create an idle client. Nothing is dialed until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// [`Error::ConfigInvalid`] when `config` fails [`ClientConfig::validate`].
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let inner = Arc::new(Inner {
            conn: Mutex::new(ConnShared {
                state: ConnectionState::Disconnected,
                current: None,
                pending: PendingRequests::new(),
                backoff: Backoff::from_config(&config.backoff),
                next_generation: 1,
            }),
            health: Mutex::new(HealthState::from_config(&config.health)),
            config: RwLock::new(config),
            events: EventDispatcher::new(),
            hooks: RwLock::new(Hooks::default()),
            reconnects: AtomicU64::new(0),
            tasks: Mutex::new(Tasks::default()),
            state_tx,
            identity: Mutex::new(None),
        });
        Ok(Self {
            _guard: Arc::new(DropGuard {
                inner: inner.clone(),
            }),
            inner,
        })
    }

    // -- Lifecycle ----------------------------------------------------------

    /// Spawn the reconnect loop. No-op if it is already running.
    pub fn start(&self) {
        let mut tasks = self.inner.lock_tasks();
        if tasks.supervisor.as_ref().is_some_and(TaskHandle::is_running) {
            debug!("Gateway supervisor already running");
            return;
        }
        info!(
            "Starting gateway supervisor for {}",
            self.inner.config_snapshot().ws_url()
        );
        let inner = self.inner.clone();
        tasks.supervisor = Some(TaskHandle::spawn(move |stop_rx| {
            run_supervisor(inner, stop_rx)
        }));
    }

    /// Stop the reconnect loop and the health monitor, fail every pending
    /// request and close the socket. Idempotent.
    pub async fn stop(&self) {
        let health = self.inner.lock_tasks().health.take();
        if let Some(task) = health {
            task.signal();
            let _ = task.handle.await;
        }
        self.inner.lock_health().enabled = false;
        self.inner.stop_supervisor().await;
    }

    /// Replace the configuration and restart the connection with it.
    ///
    /// Pending requests fail with [`Error::ConnectionClosed`], the backoff
    /// returns to its floor and the health monitor keeps running with the
    /// new thresholds.
    pub async fn reconnect(&self, config: ClientConfig) -> Result<()> {
        config.validate()?;
        self.inner.stop_supervisor().await;

        info!("Reconnecting gateway client to {}", config.ws_url());
        {
            let mut shared = self.inner.lock_conn();
            shared.backoff = Backoff::from_config(&config.backoff);
            shared.pending.drain();
        }
        self.inner.lock_health().apply_config(&config.health);
        *self
            .inner
            .config
            .write()
            .unwrap_or_else(|e| e.into_inner()) = config;

        self.start();
        Ok(())
    }

    // -- Status -------------------------------------------------------------

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.lock_conn().state
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state().is_connected()
    }

    /// Number of reconnect attempts since the client was created.
    pub fn reconnect_count(&self) -> u64 {
        self.inner.reconnects.load(Ordering::SeqCst)
    }

    /// Watch connection state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Snapshot of the active configuration.
    pub fn config(&self) -> ClientConfig {
        self.inner.config_snapshot()
    }

    // -- Requests -----------------------------------------------------------

    /// Issue a request with the configured default timeout.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let timeout = self.inner.config_snapshot().request_timeout();
        self.request_with_timeout(method, params, timeout).await
    }

    /// Issue a request and wait up to `timeout` for its terminal response.
    ///
    /// The deadline covers writing the request as well as waiting for the
    /// answer. A write that misses it leaves a partial frame on the socket,
    /// so the connection is shut down and the supervisor reconnects.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] immediately unless the client is connected
    /// - [`Error::Rpc`] when the gateway answers `ok: false`
    /// - [`Error::Timeout`] when no terminal response arrives in time
    /// - [`Error::ConnectionClosed`] when the connection is torn down first
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let conn = {
            let shared = self.inner.lock_conn();
            if !shared.state.is_connected() {
                return Err(Error::NotConnected);
            }
            shared.current.clone().ok_or(Error::NotConnected)?
        };
        let frame = RequestFrame::new(method, params);
        self.inner.send_and_wait(&conn, frame, timeout).await
    }

    // -- Events -------------------------------------------------------------

    /// Register the handler for server-pushed events, replacing any other.
    ///
    /// The handler runs on the read loop, so it should return quickly.
    pub fn set_event_handler<F>(&self, handler: F)
    where
        F: Fn(EventFrame) + Send + Sync + 'static,
    {
        self.inner.events.set_handler(Arc::new(handler));
    }

    pub fn clear_event_handler(&self) {
        self.inner.events.clear_handler();
    }

    // -- Health -------------------------------------------------------------

    /// Set the action run after `max_fails` consecutive failed probes.
    pub fn set_restart_callback<F, Fut>(&self, restart: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let restart: RestartCallback = Arc::new(move || restart().boxed());
        self.inner.lock_hooks_mut().restart = Some(restart);
    }

    /// Set the callback told about every restart attempt.
    pub fn set_notify_callback<F>(&self, notify: F)
    where
        F: Fn(HealthNotice) + Send + Sync + 'static,
    {
        self.inner.lock_hooks_mut().notify = Some(Arc::new(notify));
    }

    /// Start or stop the periodic health monitor.
    pub fn set_health_check_enabled(&self, enabled: bool) {
        let mut tasks = self.inner.lock_tasks();
        self.inner.lock_health().enabled = enabled;

        if enabled {
            if tasks.health.as_ref().is_some_and(TaskHandle::is_running) {
                return;
            }
            info!("Health monitor enabled");
            let inner = self.inner.clone();
            tasks.health = Some(TaskHandle::spawn(move |stop_rx| {
                run_health_loop(inner, stop_rx)
            }));
        } else if let Some(task) = tasks.health.take() {
            info!("Health monitor disabled");
            task.signal();
        }
    }

    pub fn health_status(&self) -> HealthStatus {
        self.inner.lock_health().status()
    }

    /// Run one probe now, escalating if it crosses the failure threshold.
    ///
    /// Returns the notice produced by an escalation, if one happened.
    pub async fn check_health(&self) -> Option<HealthNotice> {
        self.inner.probe_and_escalate().await
    }
}

// ---------------------------------------------------------------------------
// Inner helpers
// ---------------------------------------------------------------------------

impl Inner {
    fn lock_conn(&self) -> MutexGuard<'_, ConnShared> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_health(&self) -> MutexGuard<'_, HealthState> {
        self.health.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_hooks_mut(&self) -> std::sync::RwLockWriteGuard<'_, Hooks> {
        self.hooks.write().unwrap_or_else(|e| e.into_inner())
    }

    fn config_snapshot(&self) -> ClientConfig {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_state(&self, shared: &mut ConnShared, state: ConnectionState) {
        if shared.state != state {
            debug!("Gateway connection: {} -> {}", shared.state, state);
            shared.state = state;
            self.state_tx.send_replace(state);
        }
    }

    /// Transition only if `generation` is still the current connection.
    fn set_state_if_current(&self, generation: u64, state: ConnectionState) -> bool {
        let mut shared = self.lock_conn();
        if !shared.is_current(generation) {
            return false;
        }
        self.set_state(&mut shared, state);
        true
    }

    fn install_connection(&self, writer: crate::connection::BoxedWriter) -> Arc<Connection> {
        let mut shared = self.lock_conn();
        let generation = shared.next_generation;
        shared.next_generation += 1;
        let conn = Arc::new(Connection::new(generation, writer));
        shared.current = Some(conn.clone());
        self.set_state(&mut shared, ConnectionState::AwaitingChallenge);
        conn
    }

    fn mark_connected(&self, generation: u64) {
        let mut shared = self.lock_conn();
        if !shared.is_current(generation) {
            return;
        }
        shared.backoff.reset();
        self.set_state(&mut shared, ConnectionState::Connected);
        info!("Gateway connection authenticated");
    }

    /// Retire connection `generation`: fail its pending requests, mark the
    /// client disconnected and close the socket. Stale generations are
    /// ignored.
    async fn teardown(&self, generation: u64, reason: &str) {
        let (conn, failed) = {
            let mut shared = self.lock_conn();
            if !shared.is_current(generation) {
                return;
            }
            let conn = shared.current.take();
            let failed = shared.pending.drain();
            self.set_state(&mut shared, ConnectionState::Disconnected);
            (conn, failed)
        };
        warn!(
            "Gateway connection closed: {} ({} pending requests failed)",
            reason, failed
        );
        if let Some(conn) = conn {
            conn.close().await;
        }
    }

    /// Drop whatever connection is current, regardless of generation.
    async fn teardown_current(&self) {
        let conn = {
            let mut shared = self.lock_conn();
            let conn = shared.current.take();
            shared.pending.drain();
            self.set_state(&mut shared, ConnectionState::Disconnected);
            conn
        };
        if let Some(conn) = conn {
            conn.close().await;
        }
    }

    async fn stop_supervisor(&self) {
        let task = self.lock_tasks().supervisor.take();
        let Some(task) = task else {
            self.teardown_current().await;
            return;
        };
        info!("Stopping gateway supervisor");
        task.signal();
        // Unblock waiters before joining the loop.
        self.lock_conn().pending.drain();
        let _ = task.handle.await;
        self.teardown_current().await;
    }

    fn next_backoff(&self) -> Duration {
        self.lock_conn().backoff.next_delay()
    }

    /// Register, write and wait for the terminal response to `frame`.
    async fn send_and_wait(
        &self,
        conn: &Arc<Connection>,
        frame: RequestFrame,
        timeout: Duration,
    ) -> Result<Value> {
        let deadline = deadline_after(timeout);
        let text = frame.to_json()?;
        let mut rx = {
            let mut shared = self.lock_conn();
            if !shared.is_current(conn.generation()) {
                return Err(Error::ConnectionClosed);
            }
            shared.pending.register(&frame.id, &frame.method)?
        };

        // Teardown drains the pending map, which also aborts a stuck write.
        let write = tokio::select! {
            write = tokio::time::timeout_at(deadline, conn.send_text(&text)) => write,
            None = rx.recv() => return Err(Error::ConnectionClosed),
        };
        match write {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.lock_conn().pending.remove(&frame.id);
                conn.shutdown();
                return Err(Error::transport(format!("write {}: {}", frame.method, e)));
            }
            Err(_) => {
                self.lock_conn().pending.remove(&frame.id);
                warn!(
                    "Request {} ({}) not written within {:?}, dropping connection",
                    frame.id, frame.method, timeout
                );
                conn.shutdown();
                return Err(Error::timeout(frame.method, timeout));
            }
        }

        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(response)) if response.is_interim() => {
                    debug!("Request {} ({}) accepted", frame.id, frame.method);
                }
                Ok(Some(response)) => return response.into_result(),
                Ok(None) => return Err(Error::ConnectionClosed),
                Err(_) => {
                    self.lock_conn().pending.remove(&frame.id);
                    return Err(Error::timeout(frame.method, timeout));
                }
            }
        }
    }

    async fn handle_text(self: &Arc<Self>, conn: &Arc<Connection>, text: &str) {
        match parse_frame(text) {
            Frame::Response(response) => {
                let tx = {
                    let mut shared = self.lock_conn();
                    if !shared.is_current(conn.generation()) {
                        return;
                    }
                    shared.pending.route(&response)
                };
                match tx {
                    Some(tx) => {
                        let _ = tx.send(response).await;
                    }
                    None => debug!("Dropping response for unknown request {}", response.id),
                }
            }
            Frame::Event(event) => {
                if let Some(nonce) = event.challenge_nonce() {
                    if conn.begin_handshake() {
                        tokio::spawn(run_handshake(
                            self.clone(),
                            conn.clone(),
                            nonce.to_string(),
                        ));
                    } else {
                        debug!("Ignoring repeated connect.challenge");
                    }
                } else if event.event == EVENT_CONNECT_CHALLENGE {
                    warn!("Gateway sent connect.challenge without a nonce");
                } else {
                    self.events.dispatch(event);
                }
            }
            Frame::Request(request) => {
                debug!("Ignoring request frame from gateway: {}", request.method);
            }
            Frame::Unknown(raw) => {
                debug!("Dropping unrecognized frame: {:.200}", raw);
            }
        }
    }

    /// Load (or create) the device identity, cached per path.
    async fn device_identity(&self, config: &ClientConfig) -> Option<Arc<DeviceIdentity>> {
        let path = config.identity_path();
        {
            let cached = self.identity.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((cached_path, identity)) = cached.as_ref() {
                if *cached_path == path {
                    return Some(identity.clone());
                }
            }
        }

        let load_path = path.clone();
        match tokio::task::spawn_blocking(move || DeviceIdentity::load_or_create(&load_path)).await
        {
            Ok(Ok(identity)) => {
                let identity = Arc::new(identity);
                *self.identity.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some((path, identity.clone()));
                Some(identity)
            }
            Ok(Err(e)) => {
                warn!(
                    "Device identity unavailable, connecting with token only: {}",
                    e
                );
                None
            }
            Err(e) => {
                warn!("Device identity task failed: {}", e);
                None
            }
        }
    }

    async fn probe(&self, timeout: Duration) -> (ProbeMethod, Result<()>) {
        let conn = {
            let shared = self.lock_conn();
            if shared.state.is_connected() {
                shared.current.clone()
            } else {
                None
            }
        };
        if let Some(conn) = conn {
            match conn.ping(timeout).await {
                Ok(()) => return (ProbeMethod::Ping, Ok(())),
                Err(e) => debug!("Health ping failed ({}), falling back to TCP probe", e),
            }
        }
        let config = self.config_snapshot();
        let outcome = health::tcp_probe(&config.host, config.port, timeout).await;
        (ProbeMethod::Tcp, outcome)
    }

    async fn probe_and_escalate(&self) -> Option<HealthNotice> {
        let timeout = self.lock_health().probe_timeout;
        let (method, outcome) = self.probe(timeout).await;

        let failures = {
            let mut health = self.lock_health();
            health.last_probe = Some(method);
            match outcome {
                Ok(()) => {
                    health.record_success();
                    None
                }
                Err(e) => {
                    debug!(
                        "Health probe failed ({}/{}): {}",
                        health.fail_count + 1,
                        health.max_fails,
                        e
                    );
                    health.record_failure()
                }
            }
        }?;

        let (restart, notify) = {
            let hooks = self.hooks.read().unwrap_or_else(|e| e.into_inner());
            (hooks.restart.clone(), hooks.notify.clone())
        };
        let notice = health::escalate(failures, restart).await;
        if let Some(notify) = notify {
            notify(notice.clone());
        }
        Some(notice)
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

async fn run_supervisor(inner: Arc<Inner>, mut stop_rx: watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow() {
            break;
        }
        let config = inner.config_snapshot();
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        {
            let mut shared = inner.lock_conn();
            inner.set_state(&mut shared, ConnectionState::Connecting);
        }
        debug!("Dialing gateway at {}", config.ws_url());

        let dial = tokio::select! {
            dial = tokio::time::timeout_at(
                deadline,
                ws::connect(&config.host, config.port, GATEWAY_PATH),
            ) => dial,
            _ = stop_rx.changed() => break,
        };

        match dial {
            Ok(Ok((reader, writer))) => {
                let conn = inner.install_connection(writer.boxed());
                let reason = run_connection(&inner, &conn, reader, &mut stop_rx, deadline).await;
                inner.teardown(conn.generation(), &reason).await;
            }
            Ok(Err(e)) => {
                warn!("Gateway dial to {} failed: {}", config.ws_url(), e);
                let mut shared = inner.lock_conn();
                inner.set_state(&mut shared, ConnectionState::Disconnected);
            }
            Err(_) => {
                warn!("Gateway dial to {} timed out", config.ws_url());
                let mut shared = inner.lock_conn();
                inner.set_state(&mut shared, ConnectionState::Disconnected);
            }
        }

        if *stop_rx.borrow() {
            break;
        }
        let delay = inner.next_backoff();
        let attempt = inner.reconnects.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(
            "Reconnecting to gateway in {:?} (attempt {})",
            delay, attempt
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop_rx.changed() => break,
        }
    }
    debug!("Gateway supervisor exited");
}

/// Drive one connection until it fails, is shut down, misses the handshake
/// deadline or the client stops. Returns the reason, for logging.
async fn run_connection<R>(
    inner: &Arc<Inner>,
    conn: &Arc<Connection>,
    mut reader: WsReader<R>,
    stop_rx: &mut watch::Receiver<bool>,
    handshake_deadline: Instant,
) -> String
where
    R: AsyncRead + Unpin,
{
    tokio::select! {
        result = read_loop(inner, conn, &mut reader) => match result {
            Ok(()) => "closed by gateway".to_string(),
            Err(e) => e.to_string(),
        },
        _ = stop_rx.changed() => "client stopped".to_string(),
        _ = conn.closed() => "connection shut down".to_string(),
        _ = handshake_watchdog(inner, conn.generation(), handshake_deadline) => {
            "handshake timed out".to_string()
        }
    }
}

/// Resolves if the connection is not authenticated by `deadline`.
async fn handshake_watchdog(inner: &Inner, generation: u64, deadline: Instant) {
    tokio::time::sleep_until(deadline).await;
    let authenticated = {
        let shared = inner.lock_conn();
        shared.is_current(generation) && shared.state.is_connected()
    };
    if authenticated {
        std::future::pending::<()>().await;
    }
}

async fn read_loop<R>(
    inner: &Arc<Inner>,
    conn: &Arc<Connection>,
    reader: &mut WsReader<R>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        match reader.next_message().await? {
            WsMessage::Text(text) => inner.handle_text(conn, &text).await,
            WsMessage::Ping(payload) => conn.send_pong(&payload).await?,
            WsMessage::Pong(_) => conn.complete_ping(),
            WsMessage::Close => return Ok(()),
            WsMessage::InvalidText(len) => {
                debug!("Dropping {}-byte text frame that is not UTF-8", len)
            }
            WsMessage::Other(opcode) => debug!("Ignoring frame with opcode {:#x}", opcode),
        }
    }
}

/// Answer the challenge with a `connect` request and wait for the verdict.
async fn run_handshake(inner: Arc<Inner>, conn: Arc<Connection>, nonce: String) {
    if !inner.set_state_if_current(conn.generation(), ConnectionState::Authenticating) {
        return;
    }

    let config = inner.config_snapshot();
    let token = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || config.resolve_token())
            .await
            .unwrap_or_default()
    };
    let identity = inner.device_identity(&config).await;
    let signed_at_ms = Utc::now().timestamp_millis();

    let params = match build_connect_params(
        &config,
        token.as_deref(),
        identity.as_deref(),
        &nonce,
        signed_at_ms,
    ) {
        Ok(params) => params,
        Err(e) => {
            error!("Failed to build connect request: {}", e);
            conn.shutdown();
            return;
        }
    };

    let request = RequestFrame::new(METHOD_CONNECT, params);
    match inner.send_and_wait(&conn, request, HANDSHAKE_TIMEOUT).await {
        Ok(_) => inner.mark_connected(conn.generation()),
        Err(e) => {
            error!("Gateway rejected connect: {}", e);
            conn.shutdown();
        }
    }
}

async fn run_health_loop(inner: Arc<Inner>, mut stop_rx: watch::Receiver<bool>) {
    loop {
        let interval = inner.lock_health().interval;
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stop_rx.changed() => break,
        }
        if *stop_rx.borrow() {
            break;
        }
        tokio::select! {
            notice = inner.probe_and_escalate() => {
                if let Some(notice) = notice {
                    info!("Health escalation: {}", notice);
                }
            }
            _ = stop_rx.changed() => break,
        }
    }
    debug!("Health monitor exited");
}

/// `now + timeout`, saturating at [`FAR_FUTURE`] for huge timeouts.
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or(now + FAR_FUTURE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    async fn closed_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn test_config(port: u16) -> ClientConfig {
        let mut config = ClientConfig::new("127.0.0.1", port);
        config.token = Some("test-token".to_string());
        config.backoff.initial_ms = 10;
        config.backoff.max_ms = 40;
        config
    }

    #[tokio::test]
    async fn test_request_fails_immediately_when_not_connected() {
        let client = GatewayClient::new(test_config(closed_port().await)).unwrap();
        let started = std::time::Instant::now();
        let err = client
            .request("sessions.list", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = test_config(18789);
        config.backoff.initial_ms = 0;
        assert!(matches!(
            GatewayClient::new(config),
            Err(Error::ConfigInvalid { .. })
        ));

        let mut config = test_config(18789);
        config.health.interval_secs = 0;
        assert!(GatewayClient::new(config).is_err());
    }

    #[test]
    fn test_deadline_after_saturates() {
        let before = Instant::now();
        assert!(deadline_after(Duration::MAX) > before + Duration::from_secs(60 * 60 * 24 * 365));
        let near = deadline_after(Duration::from_millis(50));
        assert!(near >= before + Duration::from_millis(50));
        assert!(near < before + Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_supervisor_retries_with_backoff() {
        let client = GatewayClient::new(test_config(closed_port().await)).unwrap();
        client.start();
        client.start();

        tokio::time::timeout(Duration::from_secs(5), async {
            while client.reconnect_count() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("supervisor keeps retrying");

        client.stop().await;
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        let count = client.reconnect_count();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.reconnect_count(), count);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let client = GatewayClient::new(test_config(closed_port().await)).unwrap();
        client.stop().await;
        client.start();
        client.stop().await;
        client.stop().await;
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_reconnect_rejects_invalid_config() {
        let client = GatewayClient::new(test_config(closed_port().await)).unwrap();
        let mut bad = client.config();
        bad.port = 0;
        assert!(client.reconnect(bad).await.is_err());
    }

    #[tokio::test]
    async fn test_reconnect_swaps_config() {
        let client = GatewayClient::new(test_config(closed_port().await)).unwrap();
        client.start();
        let new_port = closed_port().await;
        let mut config = test_config(new_port);
        config.health.max_fails = 5;
        client.reconnect(config).await.unwrap();
        assert_eq!(client.config().port, new_port);
        assert_eq!(client.health_status().max_fails, 5);
        client.stop().await;
    }

    #[tokio::test]
    async fn test_three_failed_probes_restart_once() {
        let client = GatewayClient::new(test_config(closed_port().await)).unwrap();

        let restarts = Arc::new(AtomicU32::new(0));
        let counter = restarts.clone();
        client.set_restart_callback(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let notices = Arc::new(Mutex::new(Vec::new()));
        let sink = notices.clone();
        client.set_notify_callback(move |notice| sink.lock().unwrap().push(notice));

        assert!(client.check_health().await.is_none());
        assert!(client.check_health().await.is_none());
        assert_eq!(client.health_status().fail_count, 2);
        let notice = client.check_health().await;

        assert_eq!(notice, Some(HealthNotice::RestartSucceeded { failures: 3 }));
        assert_eq!(restarts.load(Ordering::SeqCst), 1);
        assert_eq!(client.health_status().fail_count, 0);
        assert_eq!(
            *notices.lock().unwrap(),
            vec![HealthNotice::RestartSucceeded { failures: 3 }]
        );
    }

    #[tokio::test]
    async fn test_successful_probe_records_success() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = GatewayClient::new(test_config(port)).unwrap();

        assert!(client.check_health().await.is_none());
        let status = client.health_status();
        assert_eq!(status.fail_count, 0);
        assert!(status.last_success_at.is_some());
        assert_eq!(status.last_probe, Some(ProbeMethod::Tcp));
    }

    #[tokio::test]
    async fn test_health_toggle() {
        let client = GatewayClient::new(test_config(closed_port().await)).unwrap();
        assert!(!client.health_status().enabled);
        client.set_health_check_enabled(true);
        assert!(client.health_status().enabled);
        client.set_health_check_enabled(false);
        assert!(!client.health_status().enabled);
    }

    #[tokio::test]
    async fn test_state_subscription_observes_connecting() {
        // A listener that never answers the upgrade keeps the dial pending.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = GatewayClient::new(test_config(port)).unwrap();
        let mut states = client.subscribe_state();
        client.start();

        tokio::time::timeout(
            Duration::from_secs(2),
            states.wait_for(|s| *s == ConnectionState::Connecting),
        )
        .await
        .expect("state watcher sees Connecting")
        .unwrap();
        client.stop().await;
        assert_eq!(*states.borrow(), ConnectionState::Disconnected);
    }
}
