//! Recording sink for stream tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use sg_core::traits::StreamSink;
use sg_protocol::{MessageId, StructuredEvent};

#[derive(Debug, Clone, PartialEq)]
pub enum SinkCall {
    Start(MessageId),
    Token(MessageId, String),
    Event(MessageId, StructuredEvent),
    Heartbeat(MessageId),
    Finish(MessageId),
}

/// Records every successful send. While disconnected every send fails.
pub struct RecordingSink {
    connected: AtomicBool,
    calls: Mutex<Vec<SinkCall>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&SinkCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    /// Concatenation of every token sent for `id`
    pub fn text_for(&self, id: &MessageId) -> String {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                SinkCall::Token(m, text) if m == id => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: SinkCall) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        self.calls.lock().unwrap().push(call);
        true
    }
}

impl StreamSink for RecordingSink {
    fn start_stream(&self, message_id: &MessageId) -> bool {
        self.record(SinkCall::Start(message_id.clone()))
    }

    fn stream_token(&self, message_id: &MessageId, text: &str) -> bool {
        self.record(SinkCall::Token(message_id.clone(), text.to_string()))
    }

    fn stream_event(&self, message_id: &MessageId, event: &StructuredEvent) -> bool {
        self.record(SinkCall::Event(message_id.clone(), event.clone()))
    }

    fn stream_heartbeat(&self, message_id: &MessageId) -> bool {
        self.record(SinkCall::Heartbeat(message_id.clone()))
    }

    fn finish_stream(&self, message_id: &MessageId) -> bool {
        self.record(SinkCall::Finish(message_id.clone()))
    }
}
