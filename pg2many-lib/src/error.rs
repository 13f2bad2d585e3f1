use thiserror::Error;

/// Error type covering every failure surface of the replicator
#[derive(Error, Debug)]
pub enum CdcError {
    /// Configuration errors (missing fields, unparseable file)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failures on the source replication connection
    #[error("Source connection error: {0}")]
    Connection(String),

    /// Wire / pgoutput protocol parsing errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Typed tuple decoding errors
    #[error("Decode error: {0}")]
    Decode(String),

    /// A sink write or close failed
    #[error("Sink error: {0}")]
    Sink(String),

    /// Terminal failure after the retry decorator exhausted its attempts
    #[error("sink {sink} failed after {attempts} attempts: {source}")]
    SinkExhausted {
        sink: String,
        attempts: u32,
        #[source]
        source: Box<CdcError>,
    },

    /// Retry aborted because the shutdown signal fired during backoff
    #[error("sink {sink} cancelled while retrying: {source}")]
    RetryCancelled {
        sink: String,
        #[source]
        source: Box<CdcError>,
    },

    /// Aggregate failure from the broadcast decorator
    #[error("broadcast failed: {}", join_errors(.0))]
    Broadcast(Vec<CdcError>),

    /// Transactional SQL sink errors
    #[error("PostgreSQL sink error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Columnar analytic sink errors
    #[error("ClickHouse sink error: {0}")]
    ClickHouse(#[from] clickhouse::error::Error),

    /// Key/value sink errors
    #[error("Redis sink error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors
    #[error("CDC error: {0}")]
    Generic(String),
}

impl CdcError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        CdcError::Config(msg.into())
    }

    /// Create a new source connection error
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        CdcError::Connection(msg.into())
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        CdcError::Protocol(msg.into())
    }

    /// Create a new decode error
    pub fn decode<S: Into<String>>(msg: S) -> Self {
        CdcError::Decode(msg.into())
    }

    /// Create a new sink error
    pub fn sink<S: Into<String>>(msg: S) -> Self {
        CdcError::Sink(msg.into())
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(msg: S) -> Self {
        CdcError::Generic(msg.into())
    }
}

/// Render every inner failure of a broadcast error, separated by "; "
fn join_errors(errors: &[CdcError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for CDC operations
pub type Result<T> = std::result::Result<T, CdcError>;
