//! Status codes carried in KNXnet/IP responses.

use std::fmt;

/// Status byte of a response or acknowledgement.
///
/// Gateways may answer with codes outside the named set, so the raw byte is
/// kept and surfaced to callers unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub u8);

impl Status {
    /// Operation succeeded / connection is normal
    pub const NO_ERROR: Status = Status(0x00);
    /// Requested host protocol is not supported
    pub const HOST_PROTOCOL_TYPE: Status = Status(0x01);
    /// Requested protocol version is not supported
    pub const VERSION_NOT_SUPPORTED: Status = Status(0x02);
    /// Received sequence number is out of order
    pub const SEQUENCE_NUMBER: Status = Status(0x04);
    /// No active connection with the given channel id
    pub const CONNECTION_ID: Status = Status(0x21);
    /// Requested connection type is not supported
    pub const CONNECTION_TYPE: Status = Status(0x22);
    /// Requested connection option is not supported
    pub const CONNECTION_OPTION: Status = Status(0x23);
    /// All connection slots are in use; the gateway may accept later
    pub const NO_MORE_CONNECTIONS: Status = Status(0x24);
    /// Error in the data connection
    pub const DATA_CONNECTION: Status = Status(0x26);
    /// Error in the KNX sub-network connection
    pub const KNX_CONNECTION: Status = Status(0x27);
    /// Requested tunnelling layer is not supported
    pub const TUNNELLING_LAYER: Status = Status(0x29);

    /// Whether this is the success / normal status
    pub fn is_ok(self) -> bool {
        self == Self::NO_ERROR
    }

    /// Whether the gateway is temporarily out of connection slots
    pub fn is_busy(self) -> bool {
        self == Self::NO_MORE_CONNECTIONS
    }

    /// Short human readable description
    pub fn description(self) -> &'static str {
        match self {
            Self::NO_ERROR => "no error",
            Self::HOST_PROTOCOL_TYPE => "host protocol type not supported",
            Self::VERSION_NOT_SUPPORTED => "protocol version not supported",
            Self::SEQUENCE_NUMBER => "sequence number out of order",
            Self::CONNECTION_ID => "no active connection with this channel id",
            Self::CONNECTION_TYPE => "connection type not supported",
            Self::CONNECTION_OPTION => "connection option not supported",
            Self::NO_MORE_CONNECTIONS => "no more connections available",
            Self::DATA_CONNECTION => "data connection error",
            Self::KNX_CONNECTION => "KNX connection error",
            Self::TUNNELLING_LAYER => "tunnelling layer not supported",
            _ => "unknown status",
        }
    }
}

impl From<u8> for Status {
    fn from(value: u8) -> Self {
        Status(value)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#04x})", self.description(), self.0)
    }
}
