//! Connection lifecycle for one account
//!
//! The manager keeps at most one [`Transport`] alive, replaces it after
//! every drop (with jittered exponential backoff), and answers or records
//! keepalive frames itself. Every other inbound frame is forwarded to the
//! owner as a [`ConnectionEvent`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use sg_core::config::AccountConfig;
use sg_core::time::current_time_millis;
use sg_core::traits::StreamSink;
use sg_core::{AccountId, Clock, ConnectionError, ConnectionStatus, SystemClock};
use sg_protocol::{Frame, FrameCodec, MessageId, ProtocolError, StructuredEvent};

use super::liveness::{Liveness, LivenessMonitor};
use super::reconnect::ReconnectPolicy;
use super::transport::{Transport, TransportEvent};

/// Close code sent when the operator stops the connection
const NORMAL_CLOSE_CODE: u16 = 1000;

/// Events delivered to the owner of a connection
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A socket opened and authenticated
    Connected,
    /// A non-keepalive frame arrived
    Frame(Frame),
    /// The socket went away; nothing queued on it will be answered
    Disconnected { code: Option<u16>, reason: String },
}

/// How a socket ended
#[derive(Debug, Clone, PartialEq, Eq)]
struct CloseOutcome {
    code: Option<u16>,
    reason: String,
}

impl CloseOutcome {
    fn new(code: Option<u16>, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// Keeps one account connected, eventually, over an unreliable link
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: AccountConfig,
    credential: String,
    codec: FrameCodec,
    clock: Arc<dyn Clock>,
    events: mpsc::Sender<ConnectionEvent>,
    /// Operator asked for shutdown (or the remote side superseded us)
    stopped: AtomicBool,
    /// Bumped for every connect loop; a loop only touches shared state while current
    generation: AtomicU64,
    runner: Mutex<Option<Runner>>,
    transport: Mutex<Option<Arc<Transport>>>,
    status: Mutex<ConnectionStatus>,
    connected_at: Mutex<Option<Instant>>,
}

/// The current connect loop
struct Runner {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Runner {
    fn is_live(&self) -> bool {
        !self.cancel.is_cancelled() && !self.task.is_finished()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl ConnectionManager {
    /// Create a manager. Nothing connects until [`connect`](Self::connect).
    pub fn new(
        config: AccountConfig,
        credential: String,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Self {
        Self::with_clock(config, credential, events, Arc::new(SystemClock))
    }

    /// Create a manager with a custom clock for liveness bookkeeping
    pub fn with_clock(
        config: AccountConfig,
        credential: String,
        events: mpsc::Sender<ConnectionEvent>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let codec = FrameCodec::with_max_frame_bytes(config.stream.max_frame_bytes);
        Self {
            inner: Arc::new(Inner {
                config,
                credential,
                codec,
                clock,
                events,
                stopped: AtomicBool::new(true),
                generation: AtomicU64::new(0),
                runner: Mutex::new(None),
                transport: Mutex::new(None),
                status: Mutex::new(ConnectionStatus::Disconnected),
                connected_at: Mutex::new(None),
            }),
        }
    }

    /// Account this connection belongs to
    pub fn account_id(&self) -> &AccountId {
        &self.inner.config.account_id
    }

    /// Current status
    pub fn status(&self) -> ConnectionStatus {
        *lock(&self.inner.status)
    }

    /// Whether a socket is currently open
    pub fn is_connected(&self) -> bool {
        lock(&self.inner.transport).is_some()
    }

    /// Age of the current socket
    pub fn connection_age(&self) -> Option<Duration> {
        let opened_at = (*lock(&self.inner.connected_at))?;
        Some(self.inner.clock.now().saturating_duration_since(opened_at))
    }

    /// Start connecting. Idempotent: a no-op while the connect loop already runs.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) {
        let mut runner = lock(&self.inner.runner);
        self.inner.stopped.store(false, Ordering::SeqCst);
        if runner.as_ref().is_some_and(Runner::is_live) {
            tracing::debug!("Account {}: connect loop already running", self.account_id());
            return;
        }

        // A cancelled loop may still be winding down; it notices the new
        // generation and leaves shared state alone.
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let manager = self.clone();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { manager.run(generation, cancel).await }
        });
        *runner = Some(Runner { cancel, task });
    }

    /// Stop for good: cancel timers, close the socket, never reconnect
    pub fn disconnect(&self) {
        {
            let mut status = lock(&self.inner.status);
            self.inner.stopped.store(true, Ordering::SeqCst);
            *status = ConnectionStatus::Disconnected;
        }
        if let Some(runner) = lock(&self.inner.runner).as_ref() {
            runner.cancel.cancel();
        }
        if let Some(transport) = lock(&self.inner.transport).take() {
            transport.close("client shutdown");
        }
        *lock(&self.inner.connected_at) = None;
        tracing::info!("Account {}: disconnected by operator", self.account_id());
    }

    /// Hand a frame to the transport. Returns false when not connected.
    pub fn send(&self, frame: &Frame) -> bool {
        let text = match self.inner.codec.encode(frame) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(
                    "Account {}: cannot encode {} frame: {}",
                    self.account_id(),
                    frame.frame_type().as_str(),
                    e
                );
                return false;
            }
        };

        match lock(&self.inner.transport).as_ref() {
            Some(transport) => transport.send_text(text),
            None => {
                tracing::trace!(
                    "Account {}: dropping {} frame, not connected",
                    self.account_id(),
                    frame.frame_type().as_str()
                );
                false
            }
        }
    }

    /// Post an unsolicited message into a conversation
    pub fn send_proactive(&self, conversation_id: &str, text: &str) -> bool {
        self.send(&Frame::ProactiveSend {
            conversation_id: conversation_id.to_string(),
            text: text.to_string(),
        })
    }

    fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.generation.load(Ordering::SeqCst) == generation
    }

    /// Set `status` for loop `generation`. Returns false once that loop
    /// should stop: the operator stopped us or a newer loop took over.
    ///
    /// Checked under the status lock so a concurrent `disconnect` always
    /// has the last word.
    fn advance_status(&self, generation: u64, status: ConnectionStatus) -> bool {
        let mut current = lock(&self.inner.status);
        if self.is_stopped() || !self.is_current(generation) {
            return false;
        }
        *current = status;
        true
    }

    /// The remote side replaced this connection: stop unless a newer loop exists
    fn stop_superseded(&self, generation: u64, cancel: &CancellationToken) {
        let _runner = lock(&self.inner.runner);
        if self.is_current(generation) {
            cancel.cancel();
            self.inner.stopped.store(true, Ordering::SeqCst);
        }
    }

    async fn emit(&self, event: ConnectionEvent) {
        if self.inner.events.send(event).await.is_err() {
            tracing::debug!("Account {}: event receiver dropped", self.account_id());
        }
    }

    /// Connect, serve, back off, repeat, until stopped or superseded
    async fn run(&self, generation: u64, cancel: CancellationToken) {
        let config = &self.inner.config;
        let mut policy = ReconnectPolicy::new(&config.backoff);
        if !self.advance_status(generation, ConnectionStatus::Connecting) {
            return;
        }

        loop {
            if self.is_stopped() || cancel.is_cancelled() {
                break;
            }

            let attempt = tokio::select! {
                _ = cancel.cancelled() => break,
                result = Transport::connect(&config.endpoint, &self.inner.credential, config.connect_timeout) => result,
            };

            let delay = match attempt {
                Ok((transport, events)) => {
                    policy.on_open();
                    let Some(outcome) = self
                        .serve(generation, Arc::new(transport), events, &cancel)
                        .await
                    else {
                        break;
                    };
                    tracing::info!(
                        "Account {}: connection closed (code {:?}): {}",
                        self.account_id(),
                        outcome.code,
                        outcome.reason
                    );
                    self.emit(ConnectionEvent::Disconnected {
                        code: outcome.code,
                        reason: outcome.reason.clone(),
                    })
                    .await;

                    if self.is_stopped() || cancel.is_cancelled() {
                        break;
                    }
                    match policy.on_close(outcome.code) {
                        Some(delay) => delay,
                        None => {
                            tracing::warn!(
                                "Account {}: connection superseded by a newer one, not reconnecting",
                                self.account_id()
                            );
                            self.stop_superseded(generation, &cancel);
                            break;
                        }
                    }
                }
                Err(e) => {
                    match &e {
                        ConnectionError::AuthRejected { .. } => {
                            tracing::error!(
                                "Account {}: {} - check the configured credential",
                                self.account_id(),
                                e
                            )
                        }
                        _ => tracing::warn!("Account {}: connection failed: {}", self.account_id(), e),
                    }
                    policy.on_connect_failure()
                }
            };

            if !self.advance_status(generation, ConnectionStatus::Reconnecting) {
                break;
            }
            tracing::info!(
                "Account {}: reconnecting in {:?} (attempt {})",
                self.account_id(),
                delay,
                policy.attempt()
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let mut status = lock(&self.inner.status);
        if self.is_current(generation) {
            *status = ConnectionStatus::Disconnected;
        }
    }

    /// Drive one open socket until it closes or is judged dead. `None` when
    /// this loop was stopped before the socket went live.
    async fn serve(
        &self,
        generation: u64,
        transport: Arc<Transport>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        cancel: &CancellationToken,
    ) -> Option<CloseOutcome> {
        let liveness = &self.inner.config.liveness;
        let opened_at = self.inner.clock.now();
        let mut monitor = LivenessMonitor::new(liveness, opened_at);

        {
            let mut slot = lock(&self.inner.transport);
            if cancel.is_cancelled() || !self.is_current(generation) {
                transport.close("client shutdown");
                return None;
            }
            *slot = Some(Arc::clone(&transport));
        }
        *lock(&self.inner.connected_at) = Some(opened_at);
        self.advance_status(generation, ConnectionStatus::Connected);
        tracing::info!(
            "Account {}: connected to {}",
            self.account_id(),
            self.inner.config.endpoint
        );
        self.emit(ConnectionEvent::Connected).await;

        let start = tokio::time::Instant::now();
        let mut ping_timer =
            tokio::time::interval_at(start + liveness.ping_interval, liveness.ping_interval);
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut probe_timer =
            tokio::time::interval_at(start + liveness.probe_interval, liveness.probe_interval);
        probe_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    transport.close("client shutdown");
                    break CloseOutcome::new(Some(NORMAL_CLOSE_CODE), "stopped by operator");
                }
                event = events.recv() => match event {
                    Some(TransportEvent::Text(text)) => {
                        monitor.record_inbound(self.inner.clock.now());
                        let decoded = self.inner.codec.decode(&text);
                        self.handle_inbound(decoded, &transport, &mut monitor).await;
                    }
                    Some(TransportEvent::Binary(data)) => {
                        monitor.record_inbound(self.inner.clock.now());
                        let decoded = self.inner.codec.decode_bytes(&data);
                        self.handle_inbound(decoded, &transport, &mut monitor).await;
                    }
                    Some(TransportEvent::Pong) => {
                        monitor.record_control_pong(self.inner.clock.now());
                    }
                    Some(TransportEvent::Closed { code, reason }) => {
                        break CloseOutcome::new(code, reason);
                    }
                    None => break CloseOutcome::new(None, "transport ended"),
                },
                _ = ping_timer.tick() => {
                    if let Liveness::PongOverdue(silent) = monitor.check_app(self.inner.clock.now()) {
                        tracing::warn!(
                            "Account {}: no pong for {:?}, forcing reconnect",
                            self.account_id(),
                            silent
                        );
                        transport.terminate();
                        break CloseOutcome::new(None, "pong overdue");
                    }
                    self.send_on(&transport, &Frame::Ping { timestamp: current_time_millis() });
                }
                _ = probe_timer.tick() => {
                    if let Liveness::Idle(idle) = monitor.check_control(self.inner.clock.now()) {
                        tracing::warn!(
                            "Account {}: socket idle for {:?}, terminating",
                            self.account_id(),
                            idle
                        );
                        transport.terminate();
                        break CloseOutcome::new(None, "liveness threshold exceeded");
                    }
                    transport.send_ping();
                }
            }
        };

        {
            let mut slot = lock(&self.inner.transport);
            if slot.as_ref().is_some_and(|t| Arc::ptr_eq(t, &transport)) {
                *slot = None;
                *lock(&self.inner.connected_at) = None;
            }
        }
        Some(outcome)
    }

    async fn handle_inbound(
        &self,
        decoded: Result<Frame, ProtocolError>,
        transport: &Transport,
        monitor: &mut LivenessMonitor,
    ) {
        match decoded {
            Err(e) => {
                tracing::warn!("Account {}: dropping malformed frame: {}", self.account_id(), e);
            }
            Ok(Frame::Ping { timestamp }) => {
                tracing::trace!("Account {}: ping received, sending pong", self.account_id());
                self.send_on(transport, &Frame::Pong { timestamp });
            }
            Ok(Frame::Pong { .. }) => {
                monitor.record_app_pong(self.inner.clock.now());
            }
            Ok(frame) => self.emit(ConnectionEvent::Frame(frame)).await,
        }
    }

    fn send_on(&self, transport: &Transport, frame: &Frame) -> bool {
        match self.inner.codec.encode(frame) {
            Ok(text) => transport.send_text(text),
            Err(e) => {
                tracing::warn!("Account {}: cannot encode frame: {}", self.account_id(), e);
                false
            }
        }
    }
}

impl StreamSink for ConnectionManager {
    fn start_stream(&self, message_id: &MessageId) -> bool {
        self.send(&Frame::StartResponse {
            message_id: message_id.clone(),
        })
    }

    fn stream_token(&self, message_id: &MessageId, text: &str) -> bool {
        self.send(&Frame::token(message_id.clone(), text))
    }

    fn stream_event(&self, message_id: &MessageId, event: &StructuredEvent) -> bool {
        self.send(&Frame::outcome(message_id.clone(), event.clone()))
    }

    fn stream_heartbeat(&self, message_id: &MessageId) -> bool {
        self.send(&Frame::Heartbeat {
            message_id: message_id.clone(),
        })
    }

    fn finish_stream(&self, message_id: &MessageId) -> bool {
        self.send(&Frame::FinishResponse {
            message_id: message_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (ConnectionManager, mpsc::Receiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::channel(8);
        let config = AccountConfig {
            endpoint: "ws://127.0.0.1:9".to_string(),
            ..AccountConfig::default()
        };
        (ConnectionManager::new(config, "token".to_string(), tx), rx)
    }

    #[test]
    fn test_send_without_transport_returns_false() {
        let (manager, _rx) = manager();
        assert!(!manager.send(&Frame::Ping { timestamp: 1 }));
        assert!(!manager.is_connected());
    }

    #[test]
    fn test_stream_primitives_report_not_connected() {
        let (manager, _rx) = manager();
        let id = MessageId::from("m1");
        assert!(!manager.start_stream(&id));
        assert!(!manager.stream_token(&id, "hi"));
        assert!(!manager.stream_heartbeat(&id));
        assert!(!manager.finish_stream(&id));
        assert!(!manager.send_proactive("c1", "hello"));
    }

    #[test]
    fn test_initial_status() {
        let (manager, _rx) = manager();
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(manager.connection_age(), None);
    }

    #[tokio::test]
    async fn test_disconnect_before_connect_is_harmless() {
        let (manager, _rx) = manager();
        manager.disconnect();
        manager.disconnect();
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_after_disconnect_rearms_the_loop() {
        let (manager, _rx) = manager();
        manager.connect();
        manager.disconnect();
        manager.connect();

        // Nothing listens on the endpoint, so the new loop keeps retrying
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_ne!(manager.status(), ConnectionStatus::Disconnected);

        manager.disconnect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    }
}
