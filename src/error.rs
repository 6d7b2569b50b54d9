use thiserror::Error;

/// Malformed rule configuration. Always fatal at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("channel key is empty")]
    EmptyChannel,
    #[error("invalid channel key: {0:?}")]
    InvalidChannel(String),
    #[error("rule entry {0:?} is missing the ':' separator")]
    MissingSeparator(String),
    #[error("channel {0} has no phrase groups")]
    NoGroups(String),
    #[error("channel {channel} has an empty phrase group")]
    EmptyGroup { channel: String },
    #[error("channel {channel} has an empty word in group {group:?}")]
    EmptyToken { channel: String, group: String },
}

/// Failures of the processed-message ledger.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another handler already recorded this message.
    #[error("message {0} is already recorded")]
    UniqueViolation(i64),
    #[error("storage failure: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Per-event failures. Contained at the event boundary, never fatal.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error("failed to deliver notification for message {message_id}")]
    Delivery {
        message_id: i64,
        #[source]
        source: anyhow::Error,
    },
}
