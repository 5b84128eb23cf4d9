use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("unknown pool: {0}")]
    UnknownPool(String),

    #[error("pool limit exceeded: configured {requested}, max {max}")]
    PoolLimitExceeded { requested: usize, max: usize },

    #[error("group queue full in pool {0}")]
    QueueFull(String),

    #[error("duplicate message in flight: {0}")]
    Duplicate(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("shutdown in progress")]
    ShutdownInProgress,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
