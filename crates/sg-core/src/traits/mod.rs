//! Core trait definitions

mod filter;
mod sink;

pub use filter::TextFilter;
pub use sink::StreamSink;
