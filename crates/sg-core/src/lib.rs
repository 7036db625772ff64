//! sg-core: Core abstractions and configuration for streamgate
//!
//! This crate provides shared types, traits, error taxonomy and
//! configuration structures used by the agent runtime.

pub mod config;
pub mod error;
pub mod time;
pub mod traits;
pub mod types;

pub use error::{ConfigError, ConnectionError, SgError, StreamError};
pub use time::{Clock, ManualClock, SystemClock};
pub use types::{AccountId, ConnectionStatus};
