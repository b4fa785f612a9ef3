//! Public tunnel handle.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use knx_wire::{DisconnectRequest, HostInfo, Message, Status, TunnellingAck, TunnellingRequest};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, TunnelError};
use crate::exchange::{Exchange, Pending, Verdict};
use crate::session::{establish, ConnectionState, Lifecycle, Termination, TunnelConfig};
use crate::transport::{Transport, UdpTransport};

struct Inner {
    transport: Arc<dyn Transport>,
    config: TunnelConfig,
    channel: u8,
    control: HostInfo,
    individual_address: Option<u16>,
    cancel: CancellationToken,
    lifecycle: watch::Receiver<Lifecycle>,
    failures: mpsc::Sender<TunnelError>,
    /// Held for the whole data exchange; guards the outbound sequence
    exchange_lock: Mutex<()>,
    acks: Pending<TunnellingAck>,
    outbound_sequence: AtomicU8,
    close_requested: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Handle to an established tunnel. Clones share the connection.
#[derive(Clone)]
pub struct Tunnel {
    inner: Arc<Inner>,
}

/// Payloads pushed by the gateway, in arrival order as far as the
/// application keeps up. Ends when the tunnel terminates.
#[derive(Debug)]
pub struct Inbound {
    rx: mpsc::Receiver<Bytes>,
}

impl Tunnel {
    /// Open a tunnel to the gateway at `gateway` over UDP
    pub async fn connect(gateway: SocketAddr, config: TunnelConfig) -> Result<(Tunnel, Inbound)> {
        info!("Connecting to gateway {}", gateway);
        let transport = UdpTransport::connect(gateway).await?;
        Self::connect_with(transport, config).await
    }

    /// Open a tunnel over an existing transport
    pub async fn connect_with<T: Transport>(transport: T, config: TunnelConfig) -> Result<(Tunnel, Inbound)> {
        let config = config.normalized();
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let connection = establish(transport.clone(), config.clone()).await?;

        let inner = Inner {
            transport,
            config,
            channel: connection.channel,
            control: connection.control,
            individual_address: connection.individual_address,
            cancel: connection.cancel,
            lifecycle: connection.lifecycle,
            failures: connection.failures,
            exchange_lock: Mutex::new(()),
            acks: connection.acks,
            outbound_sequence: AtomicU8::new(0),
            close_requested: AtomicBool::new(false),
        };

        let tunnel = Tunnel {
            inner: Arc::new(inner),
        };
        let inbound = Inbound {
            rx: connection.deliveries,
        };
        Ok((tunnel, inbound))
    }

    /// Send one cEMI frame and wait for the gateway's acknowledgement.
    ///
    /// Concurrent callers are served one at a time. The outbound sequence
    /// number advances only when the gateway accepts the frame. Returns
    /// `Closed` if the tunnel is no longer established and `Cancelled` if
    /// it terminates while the frame is waiting for its acknowledgement.
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        let inner = &self.inner;
        if !self.is_established() {
            return Err(TunnelError::Closed);
        }

        let _exchange = inner.exchange_lock.lock().await;
        if !self.is_established() {
            return Err(TunnelError::Closed);
        }

        let channel = inner.channel;
        let sequence = inner.outbound_sequence.load(Ordering::Acquire);
        let request = Message::from(TunnellingRequest {
            channel,
            sequence,
            payload: payload.into(),
        });

        let exchange = Exchange {
            transport: &*inner.transport,
            cancel: &inner.cancel,
            resend_interval: inner.config.resend_interval,
            timeout: inner.config.response_timeout,
            what: "tunnelling ack",
        };

        let mut acks = inner.acks.register();
        let result = exchange
            .run(request, &mut acks, |ack: TunnellingAck| {
                if ack.channel != channel || ack.sequence != sequence {
                    Verdict::Ignore
                } else if ack.status.is_ok() {
                    Verdict::Accept(())
                } else {
                    Verdict::Reject(TunnelError::RequestRejected(ack.status))
                }
            })
            .await;

        match result {
            Ok(()) => {
                inner
                    .outbound_sequence
                    .store(sequence.wrapping_add(1), Ordering::Release);
                debug!("Tunnelling request {} acknowledged", sequence);
                Ok(())
            }
            Err(e) => {
                if e.is_fatal() {
                    let _ = inner.failures.try_send(e.clone());
                }
                Err(e)
            }
        }
    }

    /// Disconnect and wait until the tunnel is closed.
    ///
    /// The first call on an established tunnel sends one disconnect request
    /// and gives the gateway one resend interval to confirm it. Later calls
    /// only wait.
    pub async fn close(&self) {
        let inner = &self.inner;
        let first = !inner.close_requested.swap(true, Ordering::AcqRel);

        if first && self.is_established() {
            let request = DisconnectRequest {
                channel: inner.channel,
                status: Status::NO_ERROR,
                control: inner.control,
            };
            match inner.transport.send(request.into()).await {
                Ok(()) => {
                    let mut lifecycle = inner.lifecycle.clone();
                    let confirmed = tokio::time::timeout(
                        inner.config.resend_interval,
                        lifecycle.wait_for(|l| l.state != ConnectionState::Established),
                    )
                    .await
                    .is_ok();
                    if !confirmed {
                        debug!("No disconnect response on channel {}", inner.channel);
                    }
                }
                Err(e) => warn!("Failed to send disconnect request: {}", e),
            }
        }

        inner.cancel.cancel();
        let mut lifecycle = inner.lifecycle.clone();
        let _ = lifecycle
            .wait_for(|l| l.state == ConnectionState::Closed)
            .await;
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.inner.lifecycle.borrow().state
    }

    /// Why the tunnel ended, once it has
    pub fn termination(&self) -> Option<Termination> {
        self.inner.lifecycle.borrow().termination.clone()
    }

    /// Wait until the tunnel ends and return the cause
    pub async fn terminated(&self) -> Termination {
        let mut lifecycle = self.inner.lifecycle.clone();
        let termination = match lifecycle.wait_for(|l| l.termination.is_some()).await {
            Ok(l) => l.termination.clone(),
            Err(_) => None,
        };
        termination.unwrap_or(Termination::Closed)
    }

    /// Channel id assigned by the gateway
    pub fn channel_id(&self) -> u8 {
        self.inner.channel
    }

    /// Individual address of the tunnel, if the gateway reported one
    pub fn individual_address(&self) -> Option<u16> {
        self.inner.individual_address
    }

    /// Sequence number the next data request will carry
    pub fn outbound_sequence(&self) -> u8 {
        self.inner.outbound_sequence.load(Ordering::Acquire)
    }

    fn is_established(&self) -> bool {
        self.state() == ConnectionState::Established && !self.inner.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("channel", &self.inner.channel)
            .field("state", &self.state())
            .finish()
    }
}

impl Inbound {
    /// Next payload, or `None` once the tunnel has terminated
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

impl Stream for Inbound {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
