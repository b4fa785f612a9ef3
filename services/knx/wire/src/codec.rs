//! Datagram encoding and decoding.
//!
//! One KNXnet/IP datagram carries exactly one [`Message`]: a 6-byte header
//! followed by the service-specific body.

use bytes::{Bytes, BytesMut};

use crate::header::{Header, ServiceType, HEADER_SIZE};
use crate::message::{
    ConnectionRequest, ConnectionResponse, ConnectionStateRequest, ConnectionStateResponse,
    DisconnectRequest, DisconnectResponse, Message, TunnellingAck, TunnellingRequest,
};
use crate::WireError;

/// Largest datagram the codec will produce or accept
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

/// Encode a message into a complete datagram
pub fn encode(message: &Message) -> Result<Bytes, WireError> {
    let mut body = BytesMut::with_capacity(32);
    match message {
        Message::ConnectionRequest(m) => m.encode_body(&mut body),
        Message::ConnectionResponse(m) => m.encode_body(&mut body),
        Message::ConnectionStateRequest(m) => m.encode_body(&mut body),
        Message::ConnectionStateResponse(m) => m.encode_body(&mut body),
        Message::DisconnectRequest(m) => m.encode_body(&mut body),
        Message::DisconnectResponse(m) => m.encode_body(&mut body),
        Message::TunnellingRequest(m) => m.encode_body(&mut body),
        Message::TunnellingAck(m) => m.encode_body(&mut body),
    }

    let header = Header::new(message.service(), body.len())?;
    let mut buf = BytesMut::with_capacity(header.total_len as usize);
    header.encode(&mut buf);
    buf.extend_from_slice(&body);
    Ok(buf.freeze())
}

/// Decode one datagram
pub fn decode(mut datagram: Bytes) -> Result<Message, WireError> {
    let actual = datagram.len();
    if actual > MAX_MESSAGE_SIZE {
        return Err(WireError::Size(actual));
    }

    let header = Header::decode(&mut datagram)?;
    let declared = header.total_len as usize;
    if declared != actual || declared < HEADER_SIZE {
        return Err(WireError::Length { declared, actual });
    }

    // Trailing bytes after a well-formed body are ignored.
    let body = &mut datagram;
    let message = match header.service {
        ServiceType::ConnectionRequest => ConnectionRequest::decode_body(body)?.into(),
        ServiceType::ConnectionResponse => ConnectionResponse::decode_body(body)?.into(),
        ServiceType::ConnectionStateRequest => ConnectionStateRequest::decode_body(body)?.into(),
        ServiceType::ConnectionStateResponse => {
            ConnectionStateResponse::decode_body(body)?.into()
        }
        ServiceType::DisconnectRequest => DisconnectRequest::decode_body(body)?.into(),
        ServiceType::DisconnectResponse => DisconnectResponse::decode_body(body)?.into(),
        ServiceType::TunnellingRequest => TunnellingRequest::decode_body(body)?.into(),
        ServiceType::TunnellingAck => TunnellingAck::decode_body(body)?.into(),
    };

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hpai::HostInfo;
    use crate::message::TunnelLayer;
    use crate::status::Status;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn gateway() -> HostInfo {
        HostInfo::udp(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 20), 3671))
    }

    #[test]
    fn test_connection_request_layout() {
        let msg = Message::from(ConnectionRequest::new(TunnelLayer::LinkLayer));
        let bytes = encode(&msg).unwrap();

        assert_eq!(
            &bytes[..],
            &[
                0x06, 0x10, 0x02, 0x05, 0x00, 0x1A, // header
                0x08, 0x01, 0, 0, 0, 0, 0, 0, // control
                0x08, 0x01, 0, 0, 0, 0, 0, 0, // data
                0x04, 0x04, 0x02, 0x00, // cri
            ]
        );
        assert_eq!(decode(bytes).unwrap(), msg);
    }

    #[test]
    fn test_connection_response_layout() {
        let datagram = Bytes::from_static(&[
            0x06, 0x10, 0x02, 0x06, 0x00, 0x14, // header
            0x15, 0x00, // channel, status
            0x08, 0x01, 192, 168, 1, 20, 0x0E, 0x57, // endpoint
            0x04, 0x04, 0x11, 0xFF, // crd
        ]);

        let expected = Message::from(ConnectionResponse {
            channel: 0x15,
            status: Status::NO_ERROR,
            control: gateway(),
            individual_address: Some(0x11FF),
        });
        assert_eq!(decode(datagram.clone()).unwrap(), expected);
        assert_eq!(encode(&expected).unwrap(), datagram);
    }

    #[test]
    fn test_short_rejection_response() {
        let datagram = Bytes::from_static(&[0x06, 0x10, 0x02, 0x06, 0x00, 0x08, 0x00, 0x24]);
        match decode(datagram).unwrap() {
            Message::ConnectionResponse(res) => {
                assert!(res.status.is_busy());
                assert_eq!(res.individual_address, None);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_connection_state_layout() {
        let request = Message::from(ConnectionStateRequest {
            channel: 7,
            status: Status::NO_ERROR,
            control: HostInfo::nat(),
        });
        assert_eq!(
            &encode(&request).unwrap()[..],
            &[0x06, 0x10, 0x02, 0x07, 0x00, 0x10, 0x07, 0x00, 0x08, 0x01, 0, 0, 0, 0, 0, 0]
        );

        let response = Message::from(ConnectionStateResponse {
            channel: 7,
            status: Status::CONNECTION_ID,
        });
        let bytes = encode(&response).unwrap();
        assert_eq!(&bytes[..], &[0x06, 0x10, 0x02, 0x08, 0x00, 0x08, 0x07, 0x21]);
        assert_eq!(decode(bytes).unwrap(), response);
    }

    #[test]
    fn test_disconnect_layout() {
        let request = Message::from(DisconnectRequest {
            channel: 3,
            status: Status::NO_ERROR,
            control: gateway(),
        });
        let bytes = encode(&request).unwrap();
        assert_eq!(
            &bytes[..],
            &[0x06, 0x10, 0x02, 0x09, 0x00, 0x10, 0x03, 0x00, 0x08, 0x01, 192, 168, 1, 20, 0x0E, 0x57]
        );
        assert_eq!(decode(bytes).unwrap(), request);

        let response = Message::from(DisconnectResponse {
            channel: 3,
            status: Status::NO_ERROR,
        });
        assert_eq!(
            &encode(&response).unwrap()[..],
            &[0x06, 0x10, 0x02, 0x0A, 0x00, 0x08, 0x03, 0x00]
        );
    }

    #[test]
    fn test_tunnelling_layout() {
        let request = Message::from(TunnellingRequest {
            channel: 0x15,
            sequence: 0xFF,
            payload: Bytes::from_static(&[0x29, 0x00, 0xBC, 0xE0]),
        });
        let bytes = encode(&request).unwrap();
        assert_eq!(
            &bytes[..],
            &[0x06, 0x10, 0x04, 0x20, 0x00, 0x0E, 0x04, 0x15, 0xFF, 0x00, 0x29, 0x00, 0xBC, 0xE0]
        );
        assert_eq!(decode(bytes).unwrap(), request);

        let ack = Message::from(TunnellingAck {
            channel: 0x15,
            sequence: 0xFF,
            status: Status::NO_ERROR,
        });
        let bytes = encode(&ack).unwrap();
        assert_eq!(&bytes[..], &[0x06, 0x10, 0x04, 0x21, 0x00, 0x0A, 0x04, 0x15, 0xFF, 0x00]);
        assert_eq!(decode(bytes).unwrap(), ack);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        // declared length larger than datagram
        let wrong_len = Bytes::from_static(&[0x06, 0x10, 0x04, 0x21, 0x00, 0x0B, 0x04, 0x15, 0xFF, 0x00]);
        assert_eq!(
            decode(wrong_len),
            Err(WireError::Length { declared: 11, actual: 10 })
        );

        // search request is not a tunnelling service
        let unknown = Bytes::from_static(&[0x06, 0x10, 0x02, 0x01, 0x00, 0x06]);
        assert_eq!(decode(unknown), Err(WireError::Service(0x0201)));

        let truncated = Bytes::from_static(&[0x06, 0x10, 0x04, 0x21, 0x00, 0x08, 0x04, 0x15]);
        assert!(matches!(decode(truncated), Err(WireError::Incomplete { .. })));

        let bad_conn_header =
            Bytes::from_static(&[0x06, 0x10, 0x04, 0x21, 0x00, 0x0A, 0x05, 0x15, 0xFF, 0x00]);
        assert!(matches!(
            decode(bad_conn_header),
            Err(WireError::StructureLength { structure: "connection header", length: 5 })
        ));
    }
}
