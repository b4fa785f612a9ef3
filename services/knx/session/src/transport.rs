//! Datagram transports for tunnels.
//!
//! A transport sends one decoded message at a time and yields the stream of
//! decoded inbound messages. Closing it terminates both directions.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use knx_wire::Message;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, TunnelError};

/// Number of decoded messages buffered between a transport and its reader
pub const INBOUND_CAPACITY: usize = 64;

/// Receive buffer for one datagram
const RECV_BUFFER_SIZE: usize = 1024;

/// Duplex message transport between a tunnel and its gateway
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Encode and transmit one message
    async fn send(&self, message: Message) -> Result<()>;

    /// Take the inbound message stream. Only the first call returns it.
    fn inbound(&self) -> Option<InboundMessages>;

    /// Close the transport. The inbound stream ends and later sends fail.
    async fn close(&self);
}

/// Stream of decoded messages received by a transport
#[derive(Debug)]
pub struct InboundMessages {
    rx: mpsc::Receiver<Message>,
    closed: CancellationToken,
}

impl InboundMessages {
    fn new(rx: mpsc::Receiver<Message>, closed: CancellationToken) -> Self {
        Self { rx, closed }
    }

    /// Next inbound message, or `None` once the transport has closed
    pub async fn next(&mut self) -> Option<Message> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            message = self.rx.recv() => message,
        }
    }
}

fn take_inbound(slot: &Mutex<Option<InboundMessages>>) -> Option<InboundMessages> {
    slot.lock().ok().and_then(|mut inbound| inbound.take())
}

/// UDP transport connected to a single gateway
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    gateway: SocketAddr,
    inbound: Mutex<Option<InboundMessages>>,
    closed: CancellationToken,
}

impl UdpTransport {
    /// Bind an ephemeral local port and connect it to `gateway`
    pub async fn connect(gateway: SocketAddr) -> Result<Self> {
        let local: SocketAddr = if gateway.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket = UdpSocket::bind(local).await?;
        socket.connect(gateway).await?;
        let socket = Arc::new(socket);
        debug!("UDP transport {} -> {}", socket.local_addr()?, gateway);

        let closed = CancellationToken::new();
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        tokio::spawn(read_loop(socket.clone(), tx, closed.clone()));

        Ok(Self {
            socket,
            gateway,
            inbound: Mutex::new(Some(InboundMessages::new(rx, closed.clone()))),
            closed,
        })
    }

    /// Local address of the socket
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Address of the gateway
    pub fn gateway(&self) -> SocketAddr {
        self.gateway
    }
}

async fn read_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<Message>, closed: CancellationToken) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];

    loop {
        let received = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            received = socket.recv(&mut buf) => received,
        };

        match received {
            Ok(n) => match knx_wire::decode(Bytes::copy_from_slice(&buf[..n])) {
                Ok(message) => {
                    debug!("<- {:?}", message.service());
                    if tx.send(message).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Dropping malformed datagram ({} bytes): {}", n, e);
                }
            },
            // ICMP port unreachable from an earlier send; the gateway may still come up.
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                debug!("Gateway unreachable: {}", e);
            }
            Err(e) => {
                warn!("UDP receive failed: {}", e);
                break;
            }
        }
    }

    debug!("UDP reader stopped");
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, message: Message) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(TunnelError::TransportClosed);
        }

        let datagram = knx_wire::encode(&message)?;
        debug!("-> {:?} ({} bytes)", message.service(), datagram.len());
        self.socket.send(&datagram).await?;
        Ok(())
    }

    fn inbound(&self) -> Option<InboundMessages> {
        take_inbound(&self.inbound)
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

/// In-memory transport whose other end is a [`ChannelPeer`]
pub struct ChannelTransport {
    outbound: mpsc::Sender<Message>,
    inbound: Mutex<Option<InboundMessages>>,
    closed: CancellationToken,
}

/// Gateway side of a [`ChannelTransport`]
#[derive(Debug)]
pub struct ChannelPeer {
    received: mpsc::Receiver<Message>,
    sender: mpsc::Sender<Message>,
    closed: CancellationToken,
}

/// Create a connected in-memory transport and its peer
pub fn channel_pair(capacity: usize) -> (ChannelTransport, ChannelPeer) {
    let closed = CancellationToken::new();
    let (to_peer, from_client) = mpsc::channel(capacity);
    let (to_client, from_peer) = mpsc::channel(capacity);

    let transport = ChannelTransport {
        outbound: to_peer,
        inbound: Mutex::new(Some(InboundMessages::new(from_peer, closed.clone()))),
        closed: closed.clone(),
    };
    let peer = ChannelPeer {
        received: from_client,
        sender: to_client,
        closed,
    };
    (transport, peer)
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, message: Message) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(TunnelError::TransportClosed);
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| TunnelError::TransportClosed)
    }

    fn inbound(&self) -> Option<InboundMessages> {
        take_inbound(&self.inbound)
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

impl ChannelPeer {
    /// Next message sent by the client. Returns `None` once the transport
    /// has closed and everything sent before has been drained.
    pub async fn recv(&mut self) -> Option<Message> {
        tokio::select! {
            biased;
            message = self.received.recv() => message,
            _ = self.closed.cancelled() => self.received.try_recv().ok(),
        }
    }

    /// Deliver a message to the client. Returns false if it can no longer
    /// be delivered.
    pub async fn send(&self, message: impl Into<Message>) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        self.sender.send(message.into()).await.is_ok()
    }

    /// Whether the client closed the transport
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use knx_wire::{Status, TunnellingAck};

    fn ack(sequence: u8) -> Message {
        TunnellingAck {
            channel: 1,
            sequence,
            status: Status::NO_ERROR,
        }
        .into()
    }

    #[tokio::test]
    async fn test_channel_pair_roundtrip() {
        let (transport, mut peer) = channel_pair(4);
        let mut inbound = transport.inbound().unwrap();
        assert!(transport.inbound().is_none());

        transport.send(ack(1)).await.unwrap();
        assert_eq!(peer.recv().await, Some(ack(1)));

        assert!(peer.send(ack(2)).await);
        assert_eq!(inbound.next().await, Some(ack(2)));
    }

    #[tokio::test]
    async fn test_close_ends_both_directions() {
        let (transport, mut peer) = channel_pair(4);
        let mut inbound = transport.inbound().unwrap();

        transport.send(ack(1)).await.unwrap();
        transport.close().await;

        assert!(peer.is_closed());
        assert_eq!(inbound.next().await, None);
        assert!(matches!(
            transport.send(ack(2)).await,
            Err(TunnelError::TransportClosed)
        ));
        assert!(!peer.send(ack(3)).await);

        // queued before close
        assert_eq!(peer.recv().await, Some(ack(1)));
        assert_eq!(peer.recv().await, None);
    }

    #[tokio::test]
    async fn test_udp_transport_decodes_and_skips_garbage() {
        let gateway = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport = UdpTransport::connect(gateway.local_addr().unwrap())
            .await
            .unwrap();
        assert_eq!(transport.gateway(), gateway.local_addr().unwrap());
        let mut inbound = transport.inbound().unwrap();

        transport.send(ack(9)).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, client) = gateway.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0x06, 0x10, 0x04, 0x21, 0x00, 0x0A, 0x04, 0x01, 0x09, 0x00]);

        gateway.send_to(&[0xde, 0xad], client).await.unwrap();
        let datagram = knx_wire::encode(&ack(10)).unwrap();
        gateway.send_to(&datagram, client).await.unwrap();
        assert_eq!(inbound.next().await, Some(ack(10)));

        transport.close().await;
        assert_eq!(inbound.next().await, None);
    }
}
