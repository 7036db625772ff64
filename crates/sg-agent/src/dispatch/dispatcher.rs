//! Routes connection events for one account
//!
//! Triggers start a reply pipeline on its own task. Start acknowledgements
//! and rejections go to the session registry. A disconnect fails every
//! live stream, since nothing queued on the dead socket will be answered.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use sg_protocol::{Frame, RequestType, Trigger};

use crate::connection::ConnectionEvent;
use crate::stream::SessionRegistry;

use super::pipeline::{ReplyHandle, ReplyPipeline};

/// Event loop between a connection and its streams
pub struct InboundDispatcher {
    registry: Arc<SessionRegistry>,
    pipeline: Arc<dyn ReplyPipeline>,
}

impl InboundDispatcher {
    pub fn new(registry: Arc<SessionRegistry>, pipeline: Arc<dyn ReplyPipeline>) -> Self {
        Self { registry, pipeline }
    }

    /// Handle events until the channel closes or `cancel` fires.
    ///
    /// Pipelines still running at that point are aborted.
    pub async fn run(self, mut events: mpsc::Receiver<ConnectionEvent>, cancel: CancellationToken) {
        let mut replies = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event, &mut replies),
                    None => break,
                },
                Some(result) = replies.join_next(), if !replies.is_empty() => {
                    if let Err(e) = result {
                        if e.is_panic() {
                            tracing::error!("Reply task panicked: {}", e);
                        }
                    }
                }
            }
        }

        if !replies.is_empty() {
            tracing::debug!("Aborting {} running replies", replies.len());
        }
        replies.shutdown().await;
        self.registry.fail_all_sessions("dispatcher stopped");
    }

    fn handle_event(&self, event: ConnectionEvent, replies: &mut JoinSet<()>) {
        match event {
            ConnectionEvent::Connected => {
                tracing::debug!("Connection up, ready for triggers");
            }
            ConnectionEvent::Disconnected { code, reason } => {
                let failed = self.registry.fail_all_sessions(&reason);
                tracing::debug!(
                    "Connection down (code {:?}), failed {} streams",
                    code,
                    failed
                );
            }
            ConnectionEvent::Frame(frame) => self.handle_frame(frame, replies),
        }
    }

    fn handle_frame(&self, frame: Frame, replies: &mut JoinSet<()>) {
        match frame {
            Frame::Trigger(trigger) => self.dispatch(trigger, replies),
            Frame::Ack {
                request_type: RequestType::StartResponse,
                message_id,
            } => {
                if !self.registry.resolve_ack(message_id.as_ref()) {
                    tracing::debug!("Start acknowledgement matched no stream");
                }
            }
            Frame::Ack {
                request_type,
                message_id,
            } => {
                tracing::trace!("{} acknowledged ({:?})", request_type.as_str(), message_id);
            }
            Frame::Error {
                request_type: RequestType::StartResponse,
                message,
                message_id,
                details,
            } => {
                let details = details.map(|d| d.to_string());
                if !self
                    .registry
                    .reject_ack(message_id.as_ref(), &message, details)
                {
                    tracing::warn!("Start rejected for no known stream: {}", message);
                }
            }
            Frame::Error {
                request_type,
                message,
                message_id,
                ..
            } => {
                tracing::warn!(
                    "{} rejected ({:?}): {}",
                    request_type.as_str(),
                    message_id,
                    message
                );
            }
            other => {
                tracing::debug!(
                    "Ignoring unexpected {} frame",
                    other.frame_type().as_str()
                );
            }
        }
    }

    fn dispatch(&self, trigger: Trigger, replies: &mut JoinSet<()>) {
        tracing::info!(
            "Trigger {} in conversation {}",
            trigger.message_id,
            trigger.conversation_id
        );
        let session = self.registry.create_session(trigger.message_id.clone());
        let registry = Arc::clone(&self.registry);
        let pipeline = Arc::clone(&self.pipeline);

        replies.spawn(async move {
            let reply = ReplyHandle::new(Arc::clone(&session));
            if let Err(e) = pipeline.generate(trigger, &reply).await {
                tracing::warn!("Reply for {} failed: {:#}", session.message_id(), e);
            }
            session.finish();
            registry.complete_dispatch(&session);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::EchoPipeline;
    use crate::stream::testing::{RecordingSink, SinkCall};
    use crate::stream::StreamState;
    use async_trait::async_trait;
    use sg_core::config::StreamConfig;
    use sg_core::{ManualClock, StreamError};
    use sg_protocol::MessageId;
    use std::time::Duration;

    struct FailingPipeline;

    #[async_trait]
    impl ReplyPipeline for FailingPipeline {
        async fn generate(&self, _trigger: Trigger, reply: &ReplyHandle) -> anyhow::Result<()> {
            reply.on_partial_text("partial");
            anyhow::bail!("model unavailable")
        }
    }

    struct Harness {
        sink: Arc<RecordingSink>,
        registry: Arc<SessionRegistry>,
        events: mpsc::Sender<ConnectionEvent>,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    fn start(pipeline: Arc<dyn ReplyPipeline>) -> Harness {
        let sink = Arc::new(RecordingSink::new());
        let registry = Arc::new(SessionRegistry::new(
            sink.clone(),
            Arc::new(ManualClock::new()),
            &StreamConfig::default(),
        ));
        let (events, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let dispatcher = InboundDispatcher::new(registry.clone(), pipeline);
        let task = tokio::spawn(dispatcher.run(rx, cancel.clone()));
        Harness {
            sink,
            registry,
            events,
            cancel,
            task,
        }
    }

    fn trigger(id: &str, text: &str) -> ConnectionEvent {
        ConnectionEvent::Frame(Frame::Trigger(Trigger {
            message_id: MessageId::from(id),
            conversation_id: "c1".to_string(),
            sender: Some("alice".to_string()),
            text: text.to_string(),
        }))
    }

    fn start_ack(id: Option<&str>) -> ConnectionEvent {
        ConnectionEvent::Frame(Frame::Ack {
            request_type: RequestType::StartResponse,
            message_id: id.map(MessageId::from),
        })
    }

    async fn wait_for(what: &str, cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[tokio::test]
    async fn test_trigger_to_finished_reply() {
        let h = start(Arc::new(EchoPipeline::default()));
        let id = MessageId::from("m1");

        h.events.send(trigger("m1", "hello there")).await.unwrap();
        wait_for("deferred disposal", || h.registry.awaiting_count() == 1).await;
        let session = h.registry.get(&id).unwrap();
        wait_for("finish request", || session.finish_requested()).await;

        h.events.send(start_ack(None)).await.unwrap();
        wait_for("disposal", || h.registry.is_empty()).await;

        assert_eq!(h.sink.text_for(&id), "hello there");
        assert_eq!(h.sink.calls().first(), Some(&SinkCall::Start(id.clone())));
        assert_eq!(h.sink.calls().last(), Some(&SinkCall::Finish(id)));

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_start_rejection_fails_stream() {
        let h = start(Arc::new(EchoPipeline::default()));
        let id = MessageId::from("m1");

        h.events.send(trigger("m1", "hi")).await.unwrap();
        wait_for("start", || h.registry.awaiting_count() == 1).await;
        let session = h.registry.get(&id).unwrap();

        h.events
            .send(ConnectionEvent::Frame(Frame::Error {
                request_type: RequestType::StartResponse,
                message: "busy".to_string(),
                message_id: Some(id.clone()),
                details: None,
            }))
            .await
            .unwrap();
        wait_for("rejection", || session.state() == StreamState::Failed).await;

        assert!(matches!(session.failure(), Some(StreamError::Rejected { .. })));
        wait_for("disposal", || h.registry.is_empty()).await;
        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_pipeline_error_still_finishes() {
        let h = start(Arc::new(FailingPipeline));
        let id = MessageId::from("m1");

        h.events.send(trigger("m1", "hi")).await.unwrap();
        wait_for("start", || h.registry.awaiting_count() == 1).await;
        let session = h.registry.get(&id).unwrap();
        wait_for("finish request", || session.finish_requested()).await;

        h.events.send(start_ack(Some("m1"))).await.unwrap();
        wait_for("finish", || session.finish_sent()).await;
        assert_eq!(h.sink.text_for(&id), "partial");

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_fails_live_streams() {
        let h = start(Arc::new(EchoPipeline::default()));

        h.events.send(trigger("a", "one")).await.unwrap();
        h.events.send(trigger("b", "two")).await.unwrap();
        wait_for("two starts", || h.registry.awaiting_count() == 2).await;
        let a = h.registry.get(&MessageId::from("a")).unwrap();
        let b = h.registry.get(&MessageId::from("b")).unwrap();

        h.events
            .send(ConnectionEvent::Disconnected {
                code: Some(1006),
                reason: "abnormal closure".to_string(),
            })
            .await
            .unwrap();
        wait_for("eviction", || h.registry.is_empty()).await;

        assert_eq!(a.state(), StreamState::Failed);
        assert_eq!(b.state(), StreamState::Failed);
        assert_eq!(h.registry.awaiting_count(), 0);

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_channel_stops_dispatcher() {
        let h = start(Arc::new(EchoPipeline::default()));
        drop(h.events);
        h.task.await.unwrap();
        assert!(h.registry.is_empty());
    }
}
