//! Tunnel error types.

use std::io;
use std::sync::Arc;

use knx_wire::{Status, WireError};
use thiserror::Error;

/// Errors surfaced by tunnel operations
#[derive(Error, Debug, Clone)]
pub enum TunnelError {
    /// The transport failed to send or receive
    #[error("transport error: {0}")]
    Transport(Arc<io::Error>),

    /// The transport's inbound stream ended
    #[error("transport closed")]
    TransportClosed,

    /// A message could not be encoded or decoded
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// The gateway refused the connection request
    #[error("connection rejected: {0}")]
    ConnectionRejected(Status),

    /// The gateway acknowledged a data request with an error status
    #[error("request rejected: {0}")]
    RequestRejected(Status),

    /// The gateway reported a non-normal connection state
    #[error("bad connection state: {0}")]
    ConnectionState(Status),

    /// No matching response arrived in time
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The gateway stopped answering heartbeats
    #[error("heartbeat failed: {0}")]
    HeartbeatFailed(Box<TunnelError>),

    /// The operation's scope was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// The tunnel is no longer established
    #[error("tunnel closed")]
    Closed,
}

impl TunnelError {
    /// Whether this error ends the connection
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TunnelError::Transport(_) | TunnelError::TransportClosed | TunnelError::HeartbeatFailed(_)
        )
    }
}

impl From<io::Error> for TunnelError {
    fn from(err: io::Error) -> Self {
        TunnelError::Transport(Arc::new(err))
    }
}

/// Result alias for tunnel operations
pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(TunnelError::TransportClosed.is_fatal());
        assert!(TunnelError::from(io::Error::from(io::ErrorKind::ConnectionRefused)).is_fatal());
        assert!(TunnelError::HeartbeatFailed(Box::new(TunnelError::Timeout("heartbeat"))).is_fatal());
        assert!(!TunnelError::RequestRejected(Status(0x29)).is_fatal());
        assert!(!TunnelError::Timeout("ack").is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = TunnelError::HeartbeatFailed(Box::new(TunnelError::ConnectionState(
            Status::CONNECTION_ID,
        )));
        assert_eq!(
            err.to_string(),
            "heartbeat failed: bad connection state: no active connection with this channel id (0x21)"
        );
    }
}
