//! Error types for transport and device operations.

use std::net::SocketAddr;

use thiserror::Error;

/// Failure on a socket, a connect attempt, or a handshake.
#[derive(Debug, Error)]
pub enum CommsError {
    /// Peer closed the connection (zero-length read) or it was closed locally
    #[error("transport closed")]
    TransportClosed,

    #[error("timed out connecting to {addr}")]
    ConnectionTimeout { addr: SocketAddr },

    /// None of the candidate ports could be bound or connected
    #[error("no port available among {ports:?}")]
    NoPortAvailable { ports: Vec<u16> },

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CommsError {
    /// Whether the error means the conversation is over for good.
    pub fn is_closed(&self) -> bool {
        match self {
            CommsError::TransportClosed => true,
            CommsError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Failure talking to a device's control loop.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The device loop has exited and dropped its command queue
    #[error("device command queue disconnected")]
    QueueDisconnected,

    #[error("device settings lock poisoned")]
    SettingsPoisoned,

    /// The device loop currently owns this parameter and refused a direct set
    #[error("{0} is owned by the device loop")]
    Busy(&'static str),

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<DeviceError>,
    },
}

impl DeviceError {
    /// Whether retrying could help.
    pub fn is_transient(&self) -> bool {
        matches!(self, DeviceError::Busy(_))
    }
}
