use thiserror::Error;

use crate::models::relay::RelayUrlError;

pub type Result<T> = core::result::Result<T, BigBrotrError>;

#[derive(Error, Debug)]
pub enum BigBrotrError {
    #[error("Filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid relay URL: {0}")]
    RelayUrl(#[from] RelayUrlError),

    #[error("Model validation error: {0}")]
    ModelValidation(String),

    #[error("Invalid SQL identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Batch size {got} exceeds maximum {max} for {operation}")]
    BatchTooLarge {
        operation: &'static str,
        got: usize,
        max: usize,
    },

    #[error("Ragged bulk-insert input: row {row} has {got} columns, expected {expected}")]
    RaggedRows {
        row: usize,
        got: usize,
        expected: usize,
    },

    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("SOCKS5 proxy error: {0}")]
    Socks(#[from] tokio_socks::Error),

    #[error("Nostr client error: {0}")]
    NostrClient(#[from] nostr_sdk::client::Error),

    #[error("Nostr key error: {0}")]
    NostrKey(#[from] nostr_sdk::key::Error),

    #[error("Nostr event error: {0}")]
    NostrEvent(#[from] nostr_sdk::event::Error),

    #[error("Nostr event builder error: {0}")]
    NostrEventBuilder(#[from] nostr_sdk::event::builder::Error),

    #[error("Nostr url error: {0}")]
    NostrUrl(#[from] nostr_sdk::types::url::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("GeoIP error: {0}")]
    GeoIp(#[from] maxminddb::MaxMindDBError),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Shutdown requested")]
    Cancelled,

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl BigBrotrError {
    /// Short stable label used for `errors_<kind>` metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Filesystem(_) => "filesystem",
            Self::Configuration(_) => "configuration",
            Self::RelayUrl(_) => "relay_url",
            Self::ModelValidation(_) => "model_validation",
            Self::InvalidIdentifier(_) => "invalid_identifier",
            Self::BatchTooLarge { .. } => "batch_too_large",
            Self::RaggedRows { .. } => "ragged_rows",
            Self::Connection(_) => "connection",
            Self::Sqlx(_) => "sqlx",
            Self::Http(_) => "http",
            Self::WebSocket(_) => "websocket",
            Self::Socks(_) => "socks",
            Self::NostrClient(_) => "nostr_client",
            Self::NostrKey(_) => "nostr_key",
            Self::NostrEvent(_) => "nostr_event",
            Self::NostrEventBuilder(_) => "nostr_event_builder",
            Self::NostrUrl(_) => "nostr_url",
            Self::Serialization(_) => "serialization",
            Self::Yaml(_) => "yaml",
            Self::GeoIp(_) => "geoip",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::Other(_) => "other",
        }
    }

    /// Cancellation propagates through the cycle loop without being
    /// counted as a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BigBrotrError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        BigBrotrError::WebSocket(Box::new(err))
    }
}

impl From<tokio::time::error::Elapsed> for BigBrotrError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        BigBrotrError::Timeout("deadline elapsed".to_string())
    }
}
