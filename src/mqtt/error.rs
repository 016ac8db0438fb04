use super::connection::{ConnectionEvent, ConnectionState};
use std::time::Duration;

/// Failures talking to the broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Socket or protocol level failure of the link
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Not connected to broker")]
    NotConnected,

    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Broker refused connection: {0}")]
    Refused(String),

    #[error("Invalid topic '{0}'")]
    InvalidTopic(String),

    #[error("Payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Invalid connection transition from {from:?} on {event:?}")]
    InvalidTransition {
        from: ConnectionState,
        event: ConnectionEvent,
    },
}

impl BrokerError {
    /// Transport-class errors are answered with a reconnect, everything else with a retry.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            BrokerError::Transport(_) | BrokerError::NotConnected | BrokerError::ConnectTimeout(_)
        )
    }
}
