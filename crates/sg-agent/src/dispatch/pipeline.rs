//! Host reply pipeline interface
//!
//! The pipeline produces a reply for one trigger and reports its output
//! through a [`ReplyHandle`]. The handle feeds the stream session; the
//! pipeline never sees frames or acknowledgements.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use sg_protocol::{MessageId, StructuredEvent, Trigger};

use crate::stream::StreamSession;

/// Separator placed between consecutive delivered text blocks
const BLOCK_SEPARATOR: &str = "\n\n";

/// Produces the reply to a trigger
#[async_trait]
pub trait ReplyPipeline: Send + Sync {
    /// Generate a reply, reporting output through `reply`.
    ///
    /// Returning (with or without an error) ends the reply; the stream is
    /// finished afterwards either way.
    async fn generate(&self, trigger: Trigger, reply: &ReplyHandle) -> anyhow::Result<()>;
}

/// What a delivery carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryKind {
    /// Tool activity; becomes a structured event
    Tool,
    /// An intermediate block of reply text
    Block,
    /// The last block of reply text
    Final,
}

/// One unit of pipeline output
#[derive(Debug, Clone, Default)]
pub struct ReplyPayload {
    pub text: Option<String>,
    pub event: Option<StructuredEvent>,
}

impl ReplyPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            event: None,
        }
    }

    pub fn event(event: StructuredEvent) -> Self {
        Self {
            text: None,
            event: Some(event),
        }
    }
}

#[derive(Default)]
struct HandleState {
    /// The pipeline streams partial text itself
    partial_seen: bool,
    /// Text assembled from delivered blocks
    delivered: String,
}

/// Output channel handed to a pipeline for one reply
pub struct ReplyHandle {
    session: Arc<StreamSession>,
    state: Mutex<HandleState>,
}

impl ReplyHandle {
    pub fn new(session: Arc<StreamSession>) -> Self {
        Self {
            session,
            state: Mutex::new(HandleState::default()),
        }
    }

    /// Message being answered
    pub fn message_id(&self) -> &MessageId {
        self.session.message_id()
    }

    /// Report the full reply text generated so far
    pub fn on_partial_text(&self, accumulated: &str) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .partial_seen = true;
        self.session.push_text(accumulated);
    }

    /// Report a finished unit of output.
    ///
    /// Block and final text is only streamed when the pipeline never used
    /// [`on_partial_text`](Self::on_partial_text), since it would otherwise
    /// repeat text already sent.
    pub fn deliver(&self, payload: ReplyPayload, kind: DeliveryKind) {
        if kind == DeliveryKind::Tool {
            match (payload.event, payload.text) {
                (Some(event), _) => self.session.push_event(event),
                (None, Some(text)) => self
                    .session
                    .push_event(StructuredEvent::new("tool_output", json!({ "text": text }))),
                (None, None) => {}
            }
            return;
        }

        if let Some(event) = payload.event {
            self.session.push_event(event);
        }
        let Some(text) = payload.text.filter(|t| !t.is_empty()) else {
            return;
        };

        let accumulated = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.partial_seen {
                return;
            }
            if !state.delivered.is_empty() {
                state.delivered.push_str(BLOCK_SEPARATOR);
            }
            state.delivered.push_str(&text);
            state.delivered.clone()
        };
        self.session.push_text(&accumulated);
    }

    /// Keep the stream alive during a long quiet stretch
    pub fn heartbeat(&self) -> bool {
        self.session.heartbeat()
    }
}

/// Streams the trigger text back one word at a time
#[derive(Debug, Clone, Default)]
pub struct EchoPipeline {
    delay: Duration,
}

impl EchoPipeline {
    /// Echo with a pause between words
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl ReplyPipeline for EchoPipeline {
    async fn generate(&self, trigger: Trigger, reply: &ReplyHandle) -> anyhow::Result<()> {
        tracing::debug!(
            "Echoing {} words for {}",
            trigger.text.split_whitespace().count(),
            trigger.message_id
        );

        let mut accumulated = String::new();
        for word in trigger.text.split_whitespace() {
            if !accumulated.is_empty() {
                accumulated.push(' ');
            }
            accumulated.push_str(word);
            reply.on_partial_text(&accumulated);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        }
        Ok(())
    }
}
