//! Inbound routing and the host reply pipeline

mod dispatcher;
mod pipeline;

pub use dispatcher::InboundDispatcher;
pub use pipeline::{DeliveryKind, EchoPipeline, ReplyHandle, ReplyPayload, ReplyPipeline};
