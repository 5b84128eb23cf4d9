use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("SQS error: {0}")]
    Sqs(String),

    #[error("AMQP error: {0}")]
    Amqp(String),

    #[cfg(feature = "embedded")]
    #[error("embedded queue error: {0}")]
    Embedded(#[from] sqlx::Error),

    #[error("payload parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unknown broker handle: {0}")]
    UnknownHandle(String),

    #[error("consumer stopped")]
    Stopped,
}
