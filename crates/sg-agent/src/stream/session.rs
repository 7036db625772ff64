//! Per-response stream state machine
//!
//! ```text
//! Idle --first output--> Started --ack--> Ready
//!   |                       |               |
//!   +----- send fails ------+--- reject ----+--> Failed
//! ```
//!
//! Output produced before the acknowledgement is buffered and flushed on
//! ack: structured events first, then text. Finishing before the ack is
//! deferred until the ack resolves. Once failed or finished every mutation
//! is a no-op, so late calls from the producer are harmless.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use sg_core::traits::{StreamSink, TextFilter};
use sg_core::StreamError;
use sg_protocol::{MessageId, StructuredEvent};

use super::ack::AckTable;

/// Lifecycle state of a response stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created, nothing produced yet
    Idle,
    /// Start frame sent, acknowledgement pending
    Started,
    /// Acknowledged; output goes straight to the wire
    Ready,
    /// Terminal
    Failed,
}

impl StreamState {
    /// Short name for logs
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Idle => "idle",
            StreamState::Started => "started",
            StreamState::Ready => "ready",
            StreamState::Failed => "failed",
        }
    }
}

struct SessionInner {
    state: StreamState,
    /// Bytes of accumulated text already sent or buffered
    emitted_len: usize,
    /// Latest accumulated text while the filter holds part of it back
    withheld: Option<String>,
    pending_events: VecDeque<StructuredEvent>,
    pending_text: VecDeque<String>,
    finish_requested: bool,
    finish_sent: bool,
    tool_event_seen: bool,
    failure: Option<StreamError>,
}

impl SessionInner {
    fn new() -> Self {
        Self {
            state: StreamState::Idle,
            emitted_len: 0,
            withheld: None,
            pending_events: VecDeque::new(),
            pending_text: VecDeque::new(),
            finish_requested: false,
            finish_sent: false,
            tool_event_seen: false,
            failure: None,
        }
    }

    fn is_closed(&self) -> bool {
        self.state == StreamState::Failed || self.finish_requested
    }
}

/// One response being streamed for one trigger message
pub struct StreamSession {
    message_id: MessageId,
    sink: Arc<dyn StreamSink>,
    acks: Arc<AckTable>,
    filter: Option<Arc<dyn TextFilter>>,
    inner: Mutex<SessionInner>,
}

impl StreamSession {
    /// Create an idle session
    pub fn new(
        message_id: MessageId,
        sink: Arc<dyn StreamSink>,
        acks: Arc<AckTable>,
        filter: Option<Arc<dyn TextFilter>>,
    ) -> Self {
        Self {
            message_id,
            sink,
            acks,
            filter,
            inner: Mutex::new(SessionInner::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Message this stream answers
    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    /// Current state
    pub fn state(&self) -> StreamState {
        self.lock().state
    }

    /// Whether the start frame was sent and the ack is still outstanding
    pub fn is_awaiting_ack(&self) -> bool {
        self.lock().state == StreamState::Started
    }

    /// Whether the producer asked to finish
    pub fn finish_requested(&self) -> bool {
        self.lock().finish_requested
    }

    /// Whether the terminating frame went out
    pub fn finish_sent(&self) -> bool {
        self.lock().finish_sent
    }

    /// Why the stream failed, if it did
    pub fn failure(&self) -> Option<StreamError> {
        self.lock().failure.clone()
    }

    /// Number of buffered (structured events, text fragments)
    pub fn buffered(&self) -> (usize, usize) {
        let inner = self.lock();
        (inner.pending_events.len(), inner.pending_text.len())
    }

    /// Feed the full text generated so far. Only the new suffix is sent.
    pub fn push_text(&self, accumulated: &str) {
        let mut inner = self.lock();
        if inner.is_closed() {
            return;
        }
        self.push_text_locked(&mut inner, accumulated, false);
    }

    fn push_text_locked(&self, inner: &mut SessionInner, accumulated: &str, is_final: bool) {
        let visible = match &self.filter {
            Some(filter) => filter
                .visible_len(accumulated, inner.tool_event_seen, is_final)
                .min(accumulated.len()),
            None => accumulated.len(),
        };
        inner.withheld = (visible < accumulated.len()).then(|| accumulated.to_string());
        if visible <= inner.emitted_len {
            return;
        }
        let Some(delta) = accumulated.get(inner.emitted_len..visible) else {
            tracing::warn!(
                "Stream {}: accumulated text does not extend what was already sent, ignoring",
                self.message_id
            );
            return;
        };
        let delta = delta.to_string();
        inner.emitted_len = visible;

        match inner.state {
            StreamState::Ready => {
                if !self.sink.stream_token(&self.message_id, &delta) {
                    self.fail_locked(inner, StreamError::NotConnected);
                }
            }
            StreamState::Idle | StreamState::Started => {
                inner.pending_text.push_back(delta);
                self.ensure_started(inner);
            }
            StreamState::Failed => {}
        }
    }

    /// Feed a structured event (tool call, tool result, ...)
    pub fn push_event(&self, event: StructuredEvent) {
        let mut inner = self.lock();
        if inner.is_closed() {
            return;
        }
        if event.is_tool() {
            inner.tool_event_seen = true;
        }

        match inner.state {
            StreamState::Ready => {
                if !self.sink.stream_event(&self.message_id, &event) {
                    self.fail_locked(&mut inner, StreamError::NotConnected);
                }
            }
            StreamState::Idle | StreamState::Started => {
                inner.pending_events.push_back(event);
                self.ensure_started(&mut inner);
            }
            StreamState::Failed => {}
        }
    }

    /// Keep a quiet stream alive. Only sent once the stream is ready.
    pub fn heartbeat(&self) -> bool {
        let mut inner = self.lock();
        if inner.is_closed() || inner.state != StreamState::Ready {
            return false;
        }
        if self.sink.stream_heartbeat(&self.message_id) {
            true
        } else {
            self.fail_locked(&mut inner, StreamError::NotConnected);
            false
        }
    }

    /// The producer has no more output.
    ///
    /// Sends the terminating frame now if the stream is ready, or once the
    /// acknowledgement arrives if it is still pending. Text the filter was
    /// holding back gets one last look first. Idempotent.
    pub fn finish(&self) {
        let mut inner = self.lock();
        if inner.is_closed() {
            return;
        }
        if let Some(accumulated) = inner.withheld.take() {
            self.push_text_locked(&mut inner, &accumulated, true);
        }
        inner.finish_requested = true;

        match inner.state {
            StreamState::Idle => {
                tracing::debug!(
                    "Stream {}: finished without output, nothing to close",
                    self.message_id
                );
            }
            StreamState::Started => {
                tracing::debug!(
                    "Stream {}: finish deferred until acknowledgement",
                    self.message_id
                );
            }
            StreamState::Ready => self.send_finish_locked(&mut inner),
            StreamState::Failed => {}
        }
    }

    /// The start request was accepted. Returns false if no ack was expected.
    pub(crate) fn resolve_ack(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != StreamState::Started {
            return false;
        }
        inner.state = StreamState::Ready;
        tracing::debug!(
            "Stream {}: acknowledged, flushing {} events and {} text fragments",
            self.message_id,
            inner.pending_events.len(),
            inner.pending_text.len()
        );

        while let Some(event) = inner.pending_events.pop_front() {
            if !self.sink.stream_event(&self.message_id, &event) {
                self.fail_locked(&mut inner, StreamError::NotConnected);
                return true;
            }
        }
        while let Some(text) = inner.pending_text.pop_front() {
            if !self.sink.stream_token(&self.message_id, &text) {
                self.fail_locked(&mut inner, StreamError::NotConnected);
                return true;
            }
        }
        if inner.finish_requested {
            self.send_finish_locked(&mut inner);
        }
        true
    }

    /// The start request was rejected or timed out. Returns false if no ack was expected.
    pub(crate) fn reject_ack(&self, error: StreamError) -> bool {
        let mut inner = self.lock();
        if inner.state != StreamState::Started {
            return false;
        }
        self.fail_locked(&mut inner, error);
        true
    }

    /// Force the stream into the failed state
    pub fn fail(&self, error: StreamError) {
        let mut inner = self.lock();
        self.fail_locked(&mut inner, error);
    }

    fn ensure_started(&self, inner: &mut SessionInner) {
        if inner.state != StreamState::Idle {
            return;
        }
        if self.sink.start_stream(&self.message_id) {
            inner.state = StreamState::Started;
            self.acks.begin_wait(&self.message_id);
            tracing::debug!("Stream {}: started, awaiting acknowledgement", self.message_id);
        } else {
            self.fail_locked(inner, StreamError::NotConnected);
        }
    }

    fn send_finish_locked(&self, inner: &mut SessionInner) {
        if inner.finish_sent {
            return;
        }
        if self.sink.finish_stream(&self.message_id) {
            inner.finish_sent = true;
            tracing::debug!("Stream {}: finished", self.message_id);
        } else {
            tracing::warn!(
                "Stream {}: could not send finish, remote side will time it out",
                self.message_id
            );
        }
    }

    fn fail_locked(&self, inner: &mut SessionInner, error: StreamError) {
        if inner.state == StreamState::Failed {
            return;
        }
        let was_awaiting = inner.state == StreamState::Started;
        tracing::warn!(
            "Stream {}: failed in state {}: {}",
            self.message_id,
            inner.state.as_str(),
            error
        );
        inner.state = StreamState::Failed;
        inner.pending_events.clear();
        inner.pending_text.clear();
        inner.failure = Some(error);
        if was_awaiting {
            self.acks.remove(&self.message_id);
        }
    }
}
