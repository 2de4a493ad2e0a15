use thiserror::Error;

use super::messages::Queue;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Dispatch channel for {0} is full")]
    ChannelFull(Queue),

    #[error("Dispatch channel for {0} is closed")]
    Closed(Queue),

    #[error("Broker unavailable: {0}")]
    Broker(#[from] redis::RedisError),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error("Giving up on {kind} after {attempts} attempts: {last}")]
    Exhausted {
        kind: &'static str,
        attempts: u32,
        last: Box<DispatchError>,
    },
}

impl DispatchError {
    /// Whether another send attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, DispatchError::ChannelFull(_) | DispatchError::Broker(_))
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;
