//! KNXnet/IP frame header.
//!
//! Every KNXnet/IP datagram starts with the same 6-byte header carrying the
//! service type and the total length of the datagram.

use bytes::{Buf, BufMut, BytesMut};

use crate::WireError;

/// Header length byte (always 6 for KNXnet/IP 1.0)
pub const HEADER_SIZE: usize = 0x06;

/// KNXnet/IP protocol version 1.0
pub const PROTOCOL_VERSION: u8 = 0x10;

/// Standard UDP port of a KNXnet/IP gateway
pub const DEFAULT_GATEWAY_PORT: u16 = 3671;

/// Service types used by the tunnelling client
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceType {
    /// CONNECT_REQUEST
    ConnectionRequest = 0x0205,
    /// CONNECT_RESPONSE
    ConnectionResponse = 0x0206,
    /// CONNECTIONSTATE_REQUEST (heartbeat)
    ConnectionStateRequest = 0x0207,
    /// CONNECTIONSTATE_RESPONSE
    ConnectionStateResponse = 0x0208,
    /// DISCONNECT_REQUEST
    DisconnectRequest = 0x0209,
    /// DISCONNECT_RESPONSE
    DisconnectResponse = 0x020A,
    /// TUNNELLING_REQUEST
    TunnellingRequest = 0x0420,
    /// TUNNELLING_ACK
    TunnellingAck = 0x0421,
}

impl TryFrom<u16> for ServiceType {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0205 => Ok(ServiceType::ConnectionRequest),
            0x0206 => Ok(ServiceType::ConnectionResponse),
            0x0207 => Ok(ServiceType::ConnectionStateRequest),
            0x0208 => Ok(ServiceType::ConnectionStateResponse),
            0x0209 => Ok(ServiceType::DisconnectRequest),
            0x020A => Ok(ServiceType::DisconnectResponse),
            0x0420 => Ok(ServiceType::TunnellingRequest),
            0x0421 => Ok(ServiceType::TunnellingAck),
            _ => Err(WireError::Service(value)),
        }
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Service carried by the datagram
    pub service: ServiceType,
    /// Total datagram length including this header
    pub total_len: u16,
}

impl Header {
    /// Create a header for a body of `body_len` bytes
    pub fn new(service: ServiceType, body_len: usize) -> Result<Self, WireError> {
        let total = HEADER_SIZE + body_len;
        let total_len = u16::try_from(total).map_err(|_| WireError::Size(total))?;
        Ok(Self { service, total_len })
    }

    /// Encode the header (big-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(HEADER_SIZE as u8);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u16(self.service as u16);
        buf.put_u16(self.total_len);
    }

    /// Decode the header from the front of `buf`
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        if buf.remaining() < HEADER_SIZE {
            return Err(WireError::Incomplete {
                needed: HEADER_SIZE,
                available: buf.remaining(),
            });
        }

        let header_len = buf.get_u8();
        if header_len as usize != HEADER_SIZE {
            return Err(WireError::HeaderLength(header_len));
        }

        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(WireError::Version(version));
        }

        let service = ServiceType::try_from(buf.get_u16())?;
        let total_len = buf.get_u16();

        Ok(Self { service, total_len })
    }
}
