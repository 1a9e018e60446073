use thiserror::Error;

/// Failures of the preference repository or the counter store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("Invalid stored value: {0}")]
    InvalidValue(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Failures talking to the message broker.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown queue: {0}")]
    UnknownQueue(String),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
