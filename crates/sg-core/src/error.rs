//! Core error types for streamgate

use sg_protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the streamgate ecosystem
#[derive(Error, Debug)]
pub enum SgError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Stream error
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection-related errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// The remote side refused our credential
    #[error("Authentication rejected (HTTP {status})")]
    AuthRejected { status: u16 },

    /// Endpoint or credential could not be turned into a handshake request
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Websocket handshake failed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Handshake did not finish in time
    #[error("Connection timed out")]
    Timeout,
}

/// Why a response stream ended without completing
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// A frame could not be handed to the transport
    #[error("Not connected")]
    NotConnected,

    /// The remote side rejected the stream start
    #[error("Stream rejected: {message}")]
    Rejected {
        message: String,
        details: Option<String>,
    },

    /// No acknowledgement arrived before the deadline
    #[error("Acknowledgement timed out")]
    AckTimeout,

    /// The connection carrying the stream went away
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// A newer stream was registered for the same message
    #[error("Replaced by a newer stream")]
    Replaced,

    /// Evicted after the disposal grace period
    #[error("Evicted after grace period")]
    Evicted,
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}
