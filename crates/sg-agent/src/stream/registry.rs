//! Session registry and acknowledgement routing
//!
//! Tracks every live stream for one account. Acknowledgements that name
//! their message are routed directly; those that don't go to the oldest
//! stream still awaiting one. A stream leaves the registry once its
//! dispatch has completed and it no longer awaits an ack, or when the
//! grace period for a late ack runs out.
//!
//! Lock order is session, then ack table. The registry never calls into a
//! session while holding its disposal lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use sg_core::config::StreamConfig;
use sg_core::traits::{StreamSink, TextFilter};
use sg_core::{Clock, StreamError};
use sg_protocol::MessageId;

use super::ack::AckTable;
use super::filter::SentinelFilter;
use super::session::{StreamSession, StreamState};

/// What one sweep did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Streams whose acknowledgement deadline passed
    pub timed_out: Vec<MessageId>,
    /// Streams force-evicted after their grace period
    pub evicted: Vec<MessageId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.timed_out.is_empty() && self.evicted.is_empty()
    }
}

/// Live streams of one account
pub struct SessionRegistry {
    sink: Arc<dyn StreamSink>,
    clock: Arc<dyn Clock>,
    acks: Arc<AckTable>,
    filter: Option<Arc<dyn TextFilter>>,
    disposal_grace: Duration,
    sessions: DashMap<MessageId, Arc<StreamSession>>,
    disposals: Mutex<HashMap<MessageId, Instant>>,
}

impl SessionRegistry {
    /// Create a registry whose streams write through `sink`
    pub fn new(sink: Arc<dyn StreamSink>, clock: Arc<dyn Clock>, config: &StreamConfig) -> Self {
        let filter = config
            .silent_reply_sentinel
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|s| Arc::new(SentinelFilter::new(s)) as Arc<dyn TextFilter>);

        Self {
            sink,
            acks: Arc::new(AckTable::new(clock.clone(), config.ack_timeout)),
            clock,
            filter,
            disposal_grace: config.disposal_grace,
            sessions: DashMap::new(),
            disposals: Mutex::new(HashMap::new()),
        }
    }

    fn disposals(&self) -> MutexGuard<'_, HashMap<MessageId, Instant>> {
        self.disposals.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new stream for `message_id`, failing any stream it replaces
    pub fn create_session(&self, message_id: MessageId) -> Arc<StreamSession> {
        let session = Arc::new(StreamSession::new(
            message_id.clone(),
            self.sink.clone(),
            self.acks.clone(),
            self.filter.clone(),
        ));

        if let Some(previous) = self.sessions.insert(message_id.clone(), session.clone()) {
            tracing::warn!("Stream {} created twice, replacing the earlier one", message_id);
            previous.fail(StreamError::Replaced);
        }
        self.disposals().remove(&message_id);

        session
    }

    /// Look up a live stream
    pub fn get(&self, message_id: &MessageId) -> Option<Arc<StreamSession>> {
        self.sessions.get(message_id).map(|s| s.value().clone())
    }

    /// Route a start acknowledgement. Returns whether a stream accepted it.
    pub fn resolve_ack(&self, message_id: Option<&MessageId>) -> bool {
        match self.route(message_id) {
            Some(session) => {
                session.resolve_ack();
                self.maybe_dispose(&session);
                true
            }
            None => false,
        }
    }

    /// Route a start rejection. Returns whether a stream accepted it.
    pub fn reject_ack(
        &self,
        message_id: Option<&MessageId>,
        message: &str,
        details: Option<String>,
    ) -> bool {
        match self.route(message_id) {
            Some(session) => {
                session.reject_ack(StreamError::Rejected {
                    message: message.to_string(),
                    details,
                });
                self.maybe_dispose(&session);
                true
            }
            None => false,
        }
    }

    /// Find the stream an acknowledgement belongs to and take its wait entry
    fn route(&self, message_id: Option<&MessageId>) -> Option<Arc<StreamSession>> {
        match message_id {
            Some(id) => {
                let Some(session) = self.get(id) else {
                    tracing::debug!("Acknowledgement for unknown stream {}", id);
                    return None;
                };
                if !session.is_awaiting_ack() || !self.acks.remove(id) {
                    tracing::debug!("Stale acknowledgement for stream {}", id);
                    return None;
                }
                Some(session)
            }
            None => {
                while let Some(id) = self.acks.pop_oldest() {
                    match self.get(&id) {
                        Some(session) if session.is_awaiting_ack() => return Some(session),
                        _ => tracing::debug!("Skipping stale wait entry for {}", id),
                    }
                }
                tracing::debug!("Acknowledgement with no stream awaiting one");
                None
            }
        }
    }

    /// The producer for `session` is done.
    ///
    /// The stream is dropped now, or after the grace period if its
    /// acknowledgement is still outstanding.
    pub fn complete_dispatch(&self, session: &Arc<StreamSession>) {
        if session.is_awaiting_ack() {
            let deadline = self.clock.now() + self.disposal_grace;
            self.disposals()
                .insert(session.message_id().clone(), deadline);
            tracing::debug!(
                "Stream {}: dispatch done, ack outstanding, disposal deferred",
                session.message_id()
            );
            // The ack may have landed between the check and the insert
            if session.is_awaiting_ack() {
                return;
            }
        }
        self.remove(session);
    }

    /// Expire overdue acknowledgements and grace periods
    pub fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        for id in self.acks.take_expired(now) {
            if let Some(session) = self.get(&id) {
                if session.reject_ack(StreamError::AckTimeout) {
                    self.maybe_dispose(&session);
                    report.timed_out.push(id);
                }
            }
        }

        let due: Vec<MessageId> = {
            let mut disposals = self.disposals();
            let due: Vec<MessageId> = disposals
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &due {
                disposals.remove(id);
            }
            due
        };
        for id in due {
            if let Some(session) = self.get(&id) {
                session.fail(StreamError::Evicted);
                if self.remove(&session) {
                    report.evicted.push(id);
                }
            }
        }

        report
    }

    /// Fail and drop every stream. Returns how many were live.
    pub fn fail_all_sessions(&self, reason: &str) -> usize {
        let sessions: Vec<Arc<StreamSession>> =
            self.sessions.iter().map(|e| e.value().clone()).collect();

        let mut count = 0;
        for session in &sessions {
            if self
                .sessions
                .remove_if(session.message_id(), |_, s| Arc::ptr_eq(s, session))
                .is_some()
            {
                session.fail(StreamError::ConnectionLost(reason.to_string()));
                count += 1;
            }
        }
        self.acks.clear();
        self.disposals().clear();

        if count > 0 {
            tracing::info!("Failed {} live streams: {}", count, reason);
        }
        count
    }

    /// Number of live streams
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of streams awaiting an acknowledgement
    pub fn awaiting_count(&self) -> usize {
        self.acks.len()
    }

    /// Run `sweep` on a fixed interval until cancelled
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = registry.sweep();
                        if !report.is_empty() {
                            tracing::debug!(
                                "Sweep: {} ack timeouts, {} evictions",
                                report.timed_out.len(),
                                report.evicted.len()
                            );
                        }
                    }
                }
            }
        })
    }

    /// Drop `session` if it failed, or if its dispatch finished and no ack is outstanding
    fn maybe_dispose(&self, session: &Arc<StreamSession>) {
        let state = session.state();
        let dispatch_done = self.disposals().contains_key(session.message_id());
        if state == StreamState::Failed || (dispatch_done && state != StreamState::Started) {
            self.remove(session);
        }
    }

    fn remove(&self, session: &Arc<StreamSession>) -> bool {
        let id = session.message_id();
        let removed = self
            .sessions
            .remove_if(id, |_, s| Arc::ptr_eq(s, session))
            .is_some();
        if removed {
            self.disposals().remove(id);
            tracing::debug!("Stream {}: disposed", id);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::testing::{RecordingSink, SinkCall};
    use sg_core::ManualClock;

    fn m(id: &str) -> MessageId {
        MessageId::from(id)
    }

    fn registry_with(
        config: StreamConfig,
    ) -> (Arc<RecordingSink>, Arc<ManualClock>, Arc<SessionRegistry>) {
        let sink = Arc::new(RecordingSink::new());
        let clock = Arc::new(ManualClock::new());
        let registry = Arc::new(SessionRegistry::new(sink.clone(), clock.clone(), &config));
        (sink, clock, registry)
    }

    fn registry() -> (Arc<RecordingSink>, Arc<ManualClock>, Arc<SessionRegistry>) {
        registry_with(StreamConfig::default())
    }

    #[test]
    fn test_normal_flow_disposes_after_dispatch() {
        let (sink, _clock, registry) = registry();
        let session = registry.create_session(m("m1"));

        session.push_text("Hello");
        assert_eq!(registry.awaiting_count(), 1);
        assert!(registry.resolve_ack(Some(&m("m1"))));
        session.finish();
        registry.complete_dispatch(&session);

        assert_eq!(
            sink.calls(),
            vec![
                SinkCall::Start(m("m1")),
                SinkCall::Token(m("m1"), "Hello".to_string()),
                SinkCall::Finish(m("m1")),
            ]
        );
        assert!(registry.is_empty());
        assert_eq!(registry.awaiting_count(), 0);
    }

    #[test]
    fn test_uncorrelated_acks_route_in_start_order() {
        let (sink, _clock, registry) = registry();
        let a = registry.create_session(m("a"));
        let b = registry.create_session(m("b"));
        a.push_text("from a");
        b.push_text("from b");

        assert!(registry.resolve_ack(None));
        assert_eq!(a.state(), StreamState::Ready);
        assert_eq!(b.state(), StreamState::Started);

        assert!(registry.resolve_ack(None));
        assert_eq!(b.state(), StreamState::Ready);
        assert!(!registry.resolve_ack(None));

        assert_eq!(sink.text_for(&m("a")), "from a");
        assert_eq!(sink.text_for(&m("b")), "from b");
    }

    #[test]
    fn test_correlated_ack_skips_queue_order() {
        let (_sink, _clock, registry) = registry();
        let a = registry.create_session(m("a"));
        let b = registry.create_session(m("b"));
        a.push_text("a");
        b.push_text("b");

        assert!(registry.resolve_ack(Some(&m("b"))));
        assert!(registry.resolve_ack(None));
        assert_eq!(a.state(), StreamState::Ready);
        assert_eq!(b.state(), StreamState::Ready);
    }

    #[test]
    fn test_stale_and_duplicate_acks_are_ignored() {
        let (_sink, _clock, registry) = registry();
        let session = registry.create_session(m("m1"));

        assert!(!registry.resolve_ack(Some(&m("m1"))), "not started yet");
        session.push_text("Hi");
        assert!(registry.resolve_ack(Some(&m("m1"))));
        assert!(!registry.resolve_ack(Some(&m("m1"))));
        assert!(!registry.resolve_ack(Some(&m("unknown"))));
        assert!(!registry.reject_ack(Some(&m("m1")), "late", None));
        assert_eq!(session.state(), StreamState::Ready);
    }

    #[test]
    fn test_late_ack_after_dispatch_flushes_then_finishes() {
        let (sink, _clock, registry) = registry();
        let session = registry.create_session(m("m1"));

        session.push_text("Hello");
        session.finish();
        registry.complete_dispatch(&session);
        assert_eq!(registry.len(), 1, "disposal waits for the ack");
        assert_eq!(sink.calls(), vec![SinkCall::Start(m("m1"))]);

        assert!(registry.resolve_ack(None));
        assert_eq!(
            sink.calls(),
            vec![
                SinkCall::Start(m("m1")),
                SinkCall::Token(m("m1"), "Hello".to_string()),
                SinkCall::Finish(m("m1")),
            ]
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_ack_timeout_fails_and_disposes() {
        let (sink, clock, registry) = registry();
        let session = registry.create_session(m("m1"));
        session.push_text("Hello");
        session.push_text("Hello there");

        clock.advance(Duration::from_millis(4_999));
        assert!(registry.sweep().is_empty());

        clock.advance(Duration::from_millis(1));
        let report = registry.sweep();
        assert_eq!(report.timed_out, vec![m("m1")]);
        assert_eq!(session.state(), StreamState::Failed);
        assert_eq!(session.failure(), Some(StreamError::AckTimeout));
        assert_eq!(session.buffered(), (0, 0));
        assert!(registry.is_empty());
        assert_eq!(registry.awaiting_count(), 0);

        registry.resolve_ack(Some(&m("m1")));
        session.finish();
        assert_eq!(sink.calls(), vec![SinkCall::Start(m("m1"))]);
    }

    #[test]
    fn test_grace_period_evicts_unacknowledged_stream() {
        let config = StreamConfig {
            ack_timeout: Duration::from_secs(30),
            disposal_grace: Duration::from_secs(2),
            ..StreamConfig::default()
        };
        let (_sink, clock, registry) = registry_with(config);
        let session = registry.create_session(m("m1"));
        session.push_text("Hi");
        session.finish();
        registry.complete_dispatch(&session);

        clock.advance(Duration::from_secs(1));
        assert!(registry.sweep().is_empty());
        assert_eq!(registry.len(), 1);

        clock.advance(Duration::from_secs(1));
        let report = registry.sweep();
        assert_eq!(report.evicted, vec![m("m1")]);
        assert_eq!(session.failure(), Some(StreamError::Evicted));
        assert!(registry.is_empty());
        assert_eq!(registry.awaiting_count(), 0);
    }

    #[test]
    fn test_rejection_fails_and_disposes() {
        let (_sink, _clock, registry) = registry();
        let session = registry.create_session(m("m1"));
        session.push_text("Hi");

        assert!(registry.reject_ack(None, "too many streams", Some("limit=4".to_string())));
        assert_eq!(
            session.failure(),
            Some(StreamError::Rejected {
                message: "too many streams".to_string(),
                details: Some("limit=4".to_string()),
            })
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_connection_drop_fails_everything() {
        let (_sink, clock, registry) = registry();
        let ready = registry.create_session(m("ready"));
        let started = registry.create_session(m("started"));
        ready.push_text("one");
        registry.resolve_ack(Some(&m("ready")));
        started.push_text("two");
        started.finish();
        registry.complete_dispatch(&started);

        assert_eq!(registry.fail_all_sessions("socket closed"), 2);
        assert_eq!(ready.state(), StreamState::Failed);
        assert_eq!(started.state(), StreamState::Failed);
        assert!(registry.is_empty());
        assert_eq!(registry.awaiting_count(), 0);

        clock.advance(Duration::from_secs(60));
        assert!(registry.sweep().is_empty(), "no timers left behind");
    }

    #[test]
    fn test_replacement_fails_previous_stream() {
        let (_sink, _clock, registry) = registry();
        let first = registry.create_session(m("m1"));
        first.push_text("first");
        assert_eq!(registry.awaiting_count(), 1);

        let second = registry.create_session(m("m1"));
        assert_eq!(first.failure(), Some(StreamError::Replaced));
        assert_eq!(registry.awaiting_count(), 0);
        assert_eq!(second.state(), StreamState::Idle);

        // Completing the replaced stream must not drop its successor
        registry.complete_dispatch(&first);
        assert!(Arc::ptr_eq(&registry.get(&m("m1")).unwrap(), &second));
    }

    #[test]
    fn test_send_failure_disposes_on_next_ack_event() {
        let (sink, _clock, registry) = registry();
        let session = registry.create_session(m("m1"));
        session.push_text("Hi");
        sink.set_connected(false);

        assert!(registry.resolve_ack(None));
        assert_eq!(session.state(), StreamState::Failed);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_expires_acks() {
        let (_sink, clock, registry) = registry();
        let cancel = CancellationToken::new();
        let handle = registry.spawn_sweeper(Duration::from_millis(250), cancel.clone());

        let session = registry.create_session(m("m1"));
        session.push_text("Hi");
        clock.advance(Duration::from_secs(6));
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(session.failure(), Some(StreamError::AckTimeout));
        assert!(registry.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }
}
