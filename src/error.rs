//! Relay error taxonomy

use thiserror::Error;

use crate::model::SourcePosition;

pub type Result<T, E = RelayError> = std::result::Result<T, E>;

/// Errors raised by relay stages.
///
/// Retryable variants are retried inside the owning stage and never surface
/// past it unless the retry budget is exhausted, see [`RelayError::is_transient`].
#[derive(Error, Debug)]
pub enum RelayError {
    /// Source log cannot be reached right now
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// Source log was truncated past the last captured position
    #[error("source log gap: truncated through {truncated_through}, last captured {last_captured:?}")]
    SourceLogGapDetected {
        truncated_through: SourcePosition,
        last_captured: Option<SourcePosition>,
    },

    /// Source handed out a position that does not advance
    #[error("source out of order: got {got} after {after}")]
    SourceOutOfOrder {
        after: SourcePosition,
        got: SourcePosition,
    },

    #[error("channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// Consumer fell behind retention
    #[error("channel offset expired on partition {partition}: requested {requested}, earliest {earliest}")]
    ChannelOffsetExpired {
        partition: u32,
        requested: u64,
        earliest: u64,
    },

    #[error("target unavailable: {0}")]
    TargetUnavailable(String),

    /// Target refused a well-formed mutation for a non-transient reason
    #[error("target rejected apply on {table}: {reason}")]
    TargetApplyRejected { table: String, reason: String },

    #[error("consumer {consumer} partition {partition} is faulted: {reason}")]
    Faulted {
        consumer: String,
        partition: u32,
        reason: String,
    },

    #[error("cursor {cursor} would regress from {current} to {requested}")]
    CursorRegression {
        cursor: String,
        current: u64,
        requested: u64,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RelayError {
    /// Whether the owning stage should back off and try again
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayError::SourceUnavailable(_)
                | RelayError::ChannelUnavailable(_)
                | RelayError::TargetUnavailable(_)
        )
    }

    /// Whether restarting the stage cannot help: the condition needs an
    /// operator or a config change
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::SourceLogGapDetected { .. }
                | RelayError::SourceOutOfOrder { .. }
                | RelayError::ChannelOffsetExpired { .. }
                | RelayError::TargetApplyRejected { .. }
                | RelayError::Faulted { .. }
                | RelayError::Config(_)
                | RelayError::Encoding(_)
        )
    }
}

impl From<apache_avro::Error> for RelayError {
    fn from(e: apache_avro::Error) -> Self {
        RelayError::Codec(e.to_string())
    }
}

impl From<config::ConfigError> for RelayError {
    fn from(e: config::ConfigError) -> Self {
        RelayError::Config(e.to_string())
    }
}
