//! KNXnet/IP tunnelling wire format.
//!
//! This crate encodes and decodes the eight connection-management and
//! tunnelling messages a tunnelling client exchanges with a gateway. The
//! cEMI frame inside a tunnelling request is carried as opaque bytes.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u8 header_len (0x06) | always 6                   |
//! +----------------------+----------------------------+
//! | u8 version (0x10)    | KNXnet/IP 1.0              |
//! +----------------------+----------------------------+
//! | u16 service          | e.g. 0x0420 tunnelling req |
//! +----------------------+----------------------------+
//! | u16 total_len        | header + body              |
//! +----------------------+----------------------------+
//! | body                 | service specific           |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod header;
pub mod hpai;
pub mod message;
pub mod status;

// Re-export main types
pub use codec::{decode, encode, MAX_MESSAGE_SIZE};
pub use error::WireError;
pub use header::{Header, ServiceType, DEFAULT_GATEWAY_PORT, HEADER_SIZE, PROTOCOL_VERSION};
pub use hpai::{HostInfo, HostProtocol, HPAI_SIZE};
pub use message::{
    ConnectionRequest, ConnectionResponse, ConnectionStateRequest, ConnectionStateResponse,
    DisconnectRequest, DisconnectResponse, Message, TunnelLayer, TunnellingAck,
    TunnellingRequest,
};
pub use status::Status;
