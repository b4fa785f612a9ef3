//! Tunnelling message bodies.
//!
//! Each struct encodes and decodes only its body; the frame header is handled
//! by [`crate::codec`].

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::header::ServiceType;
use crate::hpai::HostInfo;
use crate::status::Status;
use crate::WireError;

/// Connection type code for a tunnel connection
pub const TUNNEL_CONNECTION: u8 = 0x04;

/// Encoded size of a connection header
pub const CONNECTION_HEADER_SIZE: usize = 4;

/// Encoded size of the connection request information block
const CRI_SIZE: usize = 4;

/// Encoded size of the connection response data block
const CRD_SIZE: usize = 4;

/// Tunnelling layer requested at connection time
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TunnelLayer {
    /// Data link layer tunnel (group communication)
    #[default]
    LinkLayer = 0x02,
    /// Raw frames
    Raw = 0x04,
    /// Bus monitor
    BusMonitor = 0x80,
}

impl TryFrom<u8> for TunnelLayer {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x02 => Ok(TunnelLayer::LinkLayer),
            0x04 => Ok(TunnelLayer::Raw),
            0x80 => Ok(TunnelLayer::BusMonitor),
            _ => Err(WireError::Layer(value)),
        }
    }
}

fn ensure(available: usize, needed: usize) -> Result<(), WireError> {
    if available < needed {
        return Err(WireError::Incomplete { needed, available });
    }
    Ok(())
}

/// Connection header prefixed to tunnelling requests and acknowledgements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHeader {
    /// Channel id
    pub channel: u8,
    /// Sequence counter
    pub sequence: u8,
    /// Status (reserved, zero, in requests)
    pub status: Status,
}

impl ConnectionHeader {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(CONNECTION_HEADER_SIZE as u8);
        buf.put_u8(self.channel);
        buf.put_u8(self.sequence);
        buf.put_u8(self.status.0);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        ensure(buf.remaining(), CONNECTION_HEADER_SIZE)?;
        let length = buf.get_u8();
        if length as usize != CONNECTION_HEADER_SIZE {
            return Err(WireError::StructureLength {
                structure: "connection header",
                length,
            });
        }
        Ok(Self {
            channel: buf.get_u8(),
            sequence: buf.get_u8(),
            status: Status(buf.get_u8()),
        })
    }
}

/// CONNECT_REQUEST
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    /// Control endpoint of the client
    pub control: HostInfo,
    /// Data endpoint of the client
    pub data: HostInfo,
    /// Requested tunnelling layer
    pub layer: TunnelLayer,
}

impl ConnectionRequest {
    /// Request a tunnel on `layer` using NAT endpoints
    pub fn new(layer: TunnelLayer) -> Self {
        Self {
            control: HostInfo::nat(),
            data: HostInfo::nat(),
            layer,
        }
    }

    pub(crate) fn encode_body(&self, buf: &mut BytesMut) {
        self.control.encode(buf);
        self.data.encode(buf);
        buf.put_u8(CRI_SIZE as u8);
        buf.put_u8(TUNNEL_CONNECTION);
        buf.put_u8(self.layer as u8);
        buf.put_u8(0x00);
    }

    pub(crate) fn decode_body(buf: &mut Bytes) -> Result<Self, WireError> {
        let control = HostInfo::decode(buf)?;
        let data = HostInfo::decode(buf)?;
        ensure(buf.remaining(), CRI_SIZE)?;
        let length = buf.get_u8();
        if length as usize != CRI_SIZE {
            return Err(WireError::StructureLength {
                structure: "cri",
                length,
            });
        }
        let _connection_type = buf.get_u8();
        let layer = TunnelLayer::try_from(buf.get_u8())?;
        let _reserved = buf.get_u8();
        Ok(Self {
            control,
            data,
            layer,
        })
    }
}

/// CONNECT_RESPONSE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionResponse {
    /// Channel id assigned by the gateway
    pub channel: u8,
    /// Outcome of the request
    pub status: Status,
    /// Endpoint the gateway designates for this connection
    pub control: HostInfo,
    /// Individual address assigned to the tunnel, if reported
    pub individual_address: Option<u16>,
}

impl ConnectionResponse {
    pub(crate) fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u8(self.channel);
        buf.put_u8(self.status.0);
        self.control.encode(buf);
        buf.put_u8(CRD_SIZE as u8);
        buf.put_u8(TUNNEL_CONNECTION);
        buf.put_u16(self.individual_address.unwrap_or(0));
    }

    pub(crate) fn decode_body(buf: &mut Bytes) -> Result<Self, WireError> {
        ensure(buf.remaining(), 2)?;
        let channel = buf.get_u8();
        let status = Status(buf.get_u8());

        // Gateways refusing a connection may omit everything after the status.
        let control = if buf.has_remaining() {
            HostInfo::decode(buf)?
        } else {
            HostInfo::nat()
        };

        let individual_address = if buf.remaining() >= CRD_SIZE {
            let _length = buf.get_u8();
            let _connection_type = buf.get_u8();
            Some(buf.get_u16())
        } else {
            None
        };

        Ok(Self {
            channel,
            status,
            control,
            individual_address,
        })
    }
}

/// CONNECTIONSTATE_REQUEST
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStateRequest {
    /// Channel id
    pub channel: u8,
    /// Reserved, zero
    pub status: Status,
    /// Control endpoint of the client
    pub control: HostInfo,
}

/// DISCONNECT_REQUEST
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectRequest {
    /// Channel id
    pub channel: u8,
    /// Reserved, zero
    pub status: Status,
    /// Control endpoint
    pub control: HostInfo,
}

/// CONNECTIONSTATE_RESPONSE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStateResponse {
    /// Channel id
    pub channel: u8,
    /// Connection state reported by the gateway
    pub status: Status,
}

/// DISCONNECT_RESPONSE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectResponse {
    /// Channel id
    pub channel: u8,
    /// Outcome of the disconnect
    pub status: Status,
}

macro_rules! channel_request_body {
    ($ty:ident) => {
        impl $ty {
            pub(crate) fn encode_body(&self, buf: &mut BytesMut) {
                buf.put_u8(self.channel);
                buf.put_u8(self.status.0);
                self.control.encode(buf);
            }

            pub(crate) fn decode_body(buf: &mut Bytes) -> Result<Self, WireError> {
                ensure(buf.remaining(), 2)?;
                let channel = buf.get_u8();
                let status = Status(buf.get_u8());
                let control = HostInfo::decode(buf)?;
                Ok(Self {
                    channel,
                    status,
                    control,
                })
            }
        }
    };
}

macro_rules! channel_response_body {
    ($ty:ident) => {
        impl $ty {
            pub(crate) fn encode_body(&self, buf: &mut BytesMut) {
                buf.put_u8(self.channel);
                buf.put_u8(self.status.0);
            }

            pub(crate) fn decode_body(buf: &mut Bytes) -> Result<Self, WireError> {
                ensure(buf.remaining(), 2)?;
                Ok(Self {
                    channel: buf.get_u8(),
                    status: Status(buf.get_u8()),
                })
            }
        }
    };
}

channel_request_body!(ConnectionStateRequest);
channel_request_body!(DisconnectRequest);
channel_response_body!(ConnectionStateResponse);
channel_response_body!(DisconnectResponse);

/// TUNNELLING_REQUEST carrying an opaque cEMI frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnellingRequest {
    /// Channel id
    pub channel: u8,
    /// Sequence counter of the sender
    pub sequence: u8,
    /// cEMI frame
    pub payload: Bytes,
}

impl TunnellingRequest {
    pub(crate) fn encode_body(&self, buf: &mut BytesMut) {
        ConnectionHeader {
            channel: self.channel,
            sequence: self.sequence,
            status: Status::NO_ERROR,
        }
        .encode(buf);
        buf.put_slice(&self.payload);
    }

    pub(crate) fn decode_body(buf: &mut Bytes) -> Result<Self, WireError> {
        let header = ConnectionHeader::decode(buf)?;
        let payload = buf.split_to(buf.len());
        Ok(Self {
            channel: header.channel,
            sequence: header.sequence,
            payload,
        })
    }
}

/// TUNNELLING_ACK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnellingAck {
    /// Channel id
    pub channel: u8,
    /// Sequence counter being acknowledged
    pub sequence: u8,
    /// Outcome
    pub status: Status,
}

impl TunnellingAck {
    pub(crate) fn encode_body(&self, buf: &mut BytesMut) {
        ConnectionHeader {
            channel: self.channel,
            sequence: self.sequence,
            status: self.status,
        }
        .encode(buf);
    }

    pub(crate) fn decode_body(buf: &mut Bytes) -> Result<Self, WireError> {
        let header = ConnectionHeader::decode(buf)?;
        Ok(Self {
            channel: header.channel,
            sequence: header.sequence,
            status: header.status,
        })
    }
}

/// Every message the tunnelling client sends or understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// CONNECT_REQUEST
    ConnectionRequest(ConnectionRequest),
    /// CONNECT_RESPONSE
    ConnectionResponse(ConnectionResponse),
    /// CONNECTIONSTATE_REQUEST
    ConnectionStateRequest(ConnectionStateRequest),
    /// CONNECTIONSTATE_RESPONSE
    ConnectionStateResponse(ConnectionStateResponse),
    /// DISCONNECT_REQUEST
    DisconnectRequest(DisconnectRequest),
    /// DISCONNECT_RESPONSE
    DisconnectResponse(DisconnectResponse),
    /// TUNNELLING_REQUEST
    TunnellingRequest(TunnellingRequest),
    /// TUNNELLING_ACK
    TunnellingAck(TunnellingAck),
}

impl Message {
    /// Service type of this message
    pub fn service(&self) -> ServiceType {
        match self {
            Message::ConnectionRequest(_) => ServiceType::ConnectionRequest,
            Message::ConnectionResponse(_) => ServiceType::ConnectionResponse,
            Message::ConnectionStateRequest(_) => ServiceType::ConnectionStateRequest,
            Message::ConnectionStateResponse(_) => ServiceType::ConnectionStateResponse,
            Message::DisconnectRequest(_) => ServiceType::DisconnectRequest,
            Message::DisconnectResponse(_) => ServiceType::DisconnectResponse,
            Message::TunnellingRequest(_) => ServiceType::TunnellingRequest,
            Message::TunnellingAck(_) => ServiceType::TunnellingAck,
        }
    }

    /// Channel id the message belongs to, if it carries one
    pub fn channel(&self) -> Option<u8> {
        match self {
            Message::ConnectionRequest(_) => None,
            Message::ConnectionResponse(m) => Some(m.channel),
            Message::ConnectionStateRequest(m) => Some(m.channel),
            Message::ConnectionStateResponse(m) => Some(m.channel),
            Message::DisconnectRequest(m) => Some(m.channel),
            Message::DisconnectResponse(m) => Some(m.channel),
            Message::TunnellingRequest(m) => Some(m.channel),
            Message::TunnellingAck(m) => Some(m.channel),
        }
    }
}

macro_rules! impl_from_body {
    ($($ty:ident),* $(,)?) => {
        $(
            impl From<$ty> for Message {
                fn from(body: $ty) -> Self {
                    Message::$ty(body)
                }
            }
        )*
    };
}

impl_from_body!(
    ConnectionRequest,
    ConnectionResponse,
    ConnectionStateRequest,
    ConnectionStateResponse,
    DisconnectRequest,
    DisconnectResponse,
    TunnellingRequest,
    TunnellingAck,
);
