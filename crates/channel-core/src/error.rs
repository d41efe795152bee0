//! Error types for the channel core
//!
//! Most channel operations report failure through the soft hangup mechanism
//! rather than through distinct error codes; the variants here cover the
//! cases where the immediate caller needs to know what went wrong.

use thiserror::Error;

/// Result type for channel core operations
pub type Result<T> = std::result::Result<T, ChannelError>;

/// Errors that can occur in the channel core
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The technology does not implement this capability
    #[error("Operation not supported by technology {tech}: {operation}")]
    NotSupported { tech: String, operation: String },

    /// No technology registered under this type name
    #[error("No channel type registered for '{name}'")]
    TechnologyNotFound { name: String },

    /// A technology with the same type name is already registered
    #[error("Channel type '{name}' is already registered")]
    DuplicateTechnology { name: String },

    /// The registry refuses new channels
    #[error("Channel allocation refused: system is shutting down")]
    ShuttingDown,

    /// The channel is hung up, a zombie, or has a soft hangup pending
    #[error("Channel {channel} is hung up")]
    HungUp { channel: String },

    /// Masquerade could not be requested or performed
    #[error("Masquerade failed for {channel}: {reason}")]
    Masquerade { channel: String, reason: String },

    /// No translation path between two formats
    #[error("Unable to find a codec translation path from {from} to {to}")]
    NoTranslationPath { from: String, to: String },

    /// Non-voice frame queued past the hard queue limit
    #[error("Exceptionally long queue length queuing to {channel} ({depth} frames)")]
    QueueOverflow { channel: String, depth: usize },

    /// Bridge could not be started
    #[error("Bridge rejected: {reason}")]
    BridgeRejected { reason: String },

    /// Channel could not be locked after bounded retries
    #[error("Could not lock channel after {retries} retries")]
    LockContention { retries: u32 },

    /// The channel could not be created by the technology
    #[error("Unable to request channel {tech}/{data}: {cause}")]
    RequestFailed { tech: String, data: String, cause: crate::channel::HangupCause },

    /// Invalid argument supplied by the caller
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Technology driver reported a failure
    #[error("Technology error in {operation}: {message}")]
    Technology { operation: String, message: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Configuration file could not be parsed
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    /// Create a not supported error
    pub fn not_supported(tech: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::NotSupported {
            tech: tech.into(),
            operation: operation.into(),
        }
    }

    /// Create a hung up error
    pub fn hung_up(channel: impl Into<String>) -> Self {
        Self::HungUp {
            channel: channel.into(),
        }
    }

    /// Create a masquerade error
    pub fn masquerade(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Masquerade {
            channel: channel.into(),
            reason: reason.into(),
        }
    }

    /// Create a technology error
    pub fn technology(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Technology {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Whether this error means the capability is simply absent
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported { .. })
    }
}
