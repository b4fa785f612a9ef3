//! Host Protocol Address Information (HPAI).
//!
//! An HPAI names an IP endpoint inside KNXnet/IP bodies. Tunnelling clients
//! behind NAT send the all-zero endpoint so that the gateway answers to the
//! datagram's source address.

use bytes::{Buf, BufMut, BytesMut};
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::WireError;

/// Encoded size of an HPAI structure
pub const HPAI_SIZE: usize = 8;

/// Host protocol codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostProtocol {
    /// IPv4 over UDP
    Udp = 0x01,
    /// IPv4 over TCP
    Tcp = 0x02,
}

impl TryFrom<u8> for HostProtocol {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(HostProtocol::Udp),
            0x02 => Ok(HostProtocol::Tcp),
            _ => Err(WireError::HostProtocol(value)),
        }
    }
}

/// Endpoint information carried in connection-management messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostInfo {
    /// Transport protocol of the endpoint
    pub protocol: HostProtocol,
    /// IPv4 address
    pub address: Ipv4Addr,
    /// Port
    pub port: u16,
}

impl HostInfo {
    /// Create a UDP endpoint
    pub fn udp(endpoint: SocketAddrV4) -> Self {
        Self {
            protocol: HostProtocol::Udp,
            address: *endpoint.ip(),
            port: endpoint.port(),
        }
    }

    /// The NAT endpoint `0.0.0.0:0`
    pub fn nat() -> Self {
        Self::udp(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
    }

    /// Whether this is the NAT endpoint
    pub fn is_nat(&self) -> bool {
        self.address.is_unspecified() && self.port == 0
    }

    /// Endpoint as a socket address
    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.address, self.port)
    }

    /// Encode the HPAI
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(HPAI_SIZE as u8);
        buf.put_u8(self.protocol as u8);
        buf.put_slice(&self.address.octets());
        buf.put_u16(self.port);
    }

    /// Decode an HPAI from the front of `buf`
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        if buf.remaining() < HPAI_SIZE {
            return Err(WireError::Incomplete {
                needed: HPAI_SIZE,
                available: buf.remaining(),
            });
        }

        let length = buf.get_u8();
        if length as usize != HPAI_SIZE {
            return Err(WireError::StructureLength {
                structure: "hpai",
                length,
            });
        }

        let protocol = HostProtocol::try_from(buf.get_u8())?;
        let address = Ipv4Addr::from(buf.get_u32());
        let port = buf.get_u16();

        Ok(Self {
            protocol,
            address,
            port,
        })
    }
}

impl Default for HostInfo {
    fn default() -> Self {
        Self::nat()
    }
}

impl std::fmt::Display for HostInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}/{}:{}", self.protocol, self.address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hpai_layout() {
        let info = HostInfo::udp(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 10), 3671));
        let mut buf = BytesMut::new();
        info.encode(&mut buf);

        assert_eq!(&buf[..], &[0x08, 0x01, 192, 168, 1, 10, 0x0E, 0x57]);
        assert_eq!(HostInfo::decode(&mut buf.freeze()).unwrap(), info);
    }

    #[test]
    fn test_nat_endpoint() {
        let nat = HostInfo::nat();
        assert!(nat.is_nat());
        assert_eq!(nat.to_string(), "Udp/0.0.0.0:0");
    }

    #[test]
    fn test_bad_hpai() {
        let mut bad_len: &[u8] = &[0x06, 0x01, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            HostInfo::decode(&mut bad_len),
            Err(WireError::StructureLength { structure: "hpai", length: 6 })
        ));

        let mut bad_proto: &[u8] = &[0x08, 0x09, 0, 0, 0, 0, 0, 0];
        assert_eq!(HostInfo::decode(&mut bad_proto), Err(WireError::HostProtocol(0x09)));
    }
}
