//! Connection handshake.
//!
//! The client sends a connection request with NAT endpoints and resends it
//! until the gateway accepts, refuses, or the response timeout elapses. A
//! busy gateway (no free tunnel slots) is waited on, not treated as a refusal.

use knx_wire::{ConnectionRequest, HostInfo, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, TunnelError};
use crate::exchange::{Exchange, Verdict};
use crate::session::TunnelConfig;
use crate::transport::{InboundMessages, Transport};

/// Connection parameters granted by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Negotiated {
    /// Channel id assigned to the tunnel
    pub channel: u8,
    /// Endpoint reported by the gateway, used for the disconnect request
    pub control: HostInfo,
    /// Individual address of the tunnel on the bus, if reported
    pub individual_address: Option<u16>,
}

/// Run the handshake over `transport`, reading responses from `inbound`
pub(crate) async fn negotiate(
    transport: &dyn Transport,
    inbound: &mut InboundMessages,
    config: &TunnelConfig,
    cancel: &CancellationToken,
) -> Result<Negotiated> {
    let exchange = Exchange {
        transport,
        cancel,
        resend_interval: config.resend_interval,
        timeout: config.response_timeout,
        what: "connection response",
    };

    let request = Message::from(ConnectionRequest::new(config.layer));
    exchange
        .run(request, inbound, |message: Message| match message {
            Message::ConnectionResponse(res) if res.status.is_ok() => Verdict::Accept(Negotiated {
                channel: res.channel,
                control: res.control,
                individual_address: res.individual_address,
            }),
            Message::ConnectionResponse(res) if res.status.is_busy() => {
                debug!("Gateway busy ({}), waiting", res.status);
                Verdict::Ignore
            }
            Message::ConnectionResponse(res) => {
                warn!("Gateway refused connection: {}", res.status);
                Verdict::Reject(TunnelError::ConnectionRejected(res.status))
            }
            other => {
                debug!("Ignoring {:?} during handshake", other.service());
                Verdict::Ignore
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel_pair;
    use knx_wire::{ConnectionResponse, DisconnectResponse, Status, TunnelLayer};
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::time::Duration;
    use tokio::time::Instant;

    fn response(channel: u8, status: Status) -> ConnectionResponse {
        ConnectionResponse {
            channel,
            status,
            control: HostInfo::udp(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 3671)),
            individual_address: Some(0x1101),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_then_accepted() {
        let (transport, mut peer) = channel_pair(16);
        let mut inbound = transport.inbound().unwrap();
        let config = TunnelConfig::default();
        let cancel = CancellationToken::new();

        let gateway = tokio::spawn(async move {
            let first = peer.recv().await.unwrap();
            match first {
                Message::ConnectionRequest(req) => {
                    assert_eq!(req.layer, TunnelLayer::LinkLayer);
                    assert!(req.control.is_nat() && req.data.is_nat());
                }
                other => panic!("unexpected {:?}", other),
            }
            peer.send(response(0, Status::NO_MORE_CONNECTIONS)).await;
            peer.send(DisconnectResponse { channel: 9, status: Status::NO_ERROR }).await;

            // answer the resend
            peer.recv().await.unwrap();
            peer.send(response(0x2A, Status::NO_ERROR)).await;
            peer
        });

        let negotiated = negotiate(&transport, &mut inbound, &config, &cancel)
            .await
            .unwrap();
        assert_eq!(negotiated.channel, 0x2A);
        assert_eq!(negotiated.individual_address, Some(0x1101));
        assert_eq!(negotiated.control.port, 3671);
        gateway.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected() {
        let (transport, peer) = channel_pair(16);
        let mut inbound = transport.inbound().unwrap();
        peer.send(response(0, Status::CONNECTION_TYPE)).await;

        let result = negotiate(
            &transport,
            &mut inbound,
            &TunnelConfig::default(),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(
            result,
            Err(TunnelError::ConnectionRejected(Status::CONNECTION_TYPE))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_bounds() {
        let (transport, _peer) = channel_pair(64);
        let mut inbound = transport.inbound().unwrap();
        let config = TunnelConfig {
            response_timeout: Duration::from_secs(3),
            ..TunnelConfig::default()
        };

        let started = Instant::now();
        let result = negotiate(&transport, &mut inbound, &config, &CancellationToken::new()).await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(TunnelError::Timeout(_))));
        assert!(elapsed >= config.response_timeout);
        assert!(elapsed < config.response_timeout + config.resend_interval);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_closed_during_handshake() {
        let (transport, _peer) = channel_pair(16);
        let mut inbound = transport.inbound().unwrap();
        transport.close().await;

        let result = negotiate(
            &transport,
            &mut inbound,
            &TunnelConfig::default(),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(TunnelError::TransportClosed)));
    }
}
