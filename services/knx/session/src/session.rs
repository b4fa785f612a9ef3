//! Connection state machine.
//!
//! [`establish`] runs the handshake and then spawns two tasks under one
//! cancellation token: the dispatch loop, which owns the inbound stream and
//! the inbound sequence counter, and the heartbeat monitor. The two talk only
//! through channels. When the dispatch loop sees a termination cause it
//! cancels the token, waits for the monitor, closes the transport and
//! publishes `Closed`.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use knx_wire::{
    ConnectionStateResponse, DisconnectResponse, HostInfo, Message, Status, TunnelLayer,
    TunnellingAck,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, TunnelError};
use crate::exchange::Pending;
use crate::handshake::negotiate;
use crate::keepalive::HeartbeatMonitor;
use crate::transport::{InboundMessages, Transport};

/// Payloads buffered for the application before delivery starts waiting
pub const DELIVERY_CAPACITY: usize = 32;

/// Pending termination signals (heartbeat failure, fatal send error)
const FAILURE_CAPACITY: usize = 4;

/// Timing and layer settings of a tunnel
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Interval between resends of an unanswered request
    pub resend_interval: Duration,
    /// Inbound silence after which the gateway is probed
    pub heartbeat_delay: Duration,
    /// Overall bound of one request/response exchange
    pub response_timeout: Duration,
    /// How long an inbound payload may wait for the application
    pub delivery_timeout: Duration,
    /// Requested tunnelling layer
    pub layer: TunnelLayer,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            resend_interval: Duration::from_millis(500),
            heartbeat_delay: Duration::from_secs(10),
            response_timeout: Duration::from_secs(10),
            delivery_timeout: Duration::from_secs(60),
            layer: TunnelLayer::LinkLayer,
        }
    }
}

impl TunnelConfig {
    /// Replace zero durations with their defaults
    pub fn normalized(self) -> Self {
        let defaults = Self::default();
        let or_default = |value: Duration, default: Duration| {
            if value.is_zero() {
                default
            } else {
                value
            }
        };

        Self {
            resend_interval: or_default(self.resend_interval, defaults.resend_interval),
            heartbeat_delay: or_default(self.heartbeat_delay, defaults.heartbeat_delay),
            response_timeout: or_default(self.response_timeout, defaults.response_timeout),
            delivery_timeout: or_default(self.delivery_timeout, defaults.delivery_timeout),
            layer: self.layer,
        }
    }
}

/// Lifecycle state of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in progress
    Connecting,
    /// Channel assigned, data may flow
    Established,
    /// A termination cause was seen; background tasks are unwinding
    Terminating,
    /// Background tasks stopped and transport closed
    Closed,
}

/// Why a tunnel ended
#[derive(Debug, Clone)]
pub enum Termination {
    /// Closed locally or disconnect confirmed by the gateway
    Closed,
    /// The gateway sent a disconnect request
    Disconnected,
    /// Heartbeat failure or fatal transport error
    Failed(TunnelError),
}

/// State published by the dispatch loop
#[derive(Debug, Clone)]
pub(crate) struct Lifecycle {
    pub state: ConnectionState,
    pub termination: Option<Termination>,
}

/// Handles to an established connection
pub(crate) struct Connection {
    pub channel: u8,
    pub control: HostInfo,
    pub individual_address: Option<u16>,
    pub cancel: CancellationToken,
    pub lifecycle: watch::Receiver<Lifecycle>,
    pub failures: mpsc::Sender<TunnelError>,
    pub acks: Pending<TunnellingAck>,
    pub deliveries: mpsc::Receiver<Bytes>,
}

/// Run the handshake and start the dispatch loop and heartbeat monitor
pub(crate) async fn establish(transport: Arc<dyn Transport>, config: TunnelConfig) -> Result<Connection> {
    let Some(mut inbound) = transport.inbound() else {
        return Err(TunnelError::TransportClosed);
    };

    let cancel = CancellationToken::new();
    let (lifecycle_tx, lifecycle) = watch::channel(Lifecycle {
        state: ConnectionState::Connecting,
        termination: None,
    });

    let negotiated = match negotiate(&*transport, &mut inbound, &config, &cancel).await {
        Ok(negotiated) => negotiated,
        Err(e) => {
            transport.close().await;
            return Err(e);
        }
    };
    info!(
        "Tunnel established on channel {} (gateway {}, address {:?})",
        negotiated.channel, negotiated.control, negotiated.individual_address
    );

    let (activity_tx, activity_rx) = mpsc::channel(1);
    let states = Pending::new();
    let acks = Pending::new();
    let (deliveries_tx, deliveries) = mpsc::channel(DELIVERY_CAPACITY);
    let (failures, failures_rx) = mpsc::channel(FAILURE_CAPACITY);

    let monitor = tokio::spawn(
        HeartbeatMonitor {
            transport: transport.clone(),
            channel: negotiated.channel,
            config: config.clone(),
            activity: activity_rx,
            responses: states.clone(),
            failures: failures.clone(),
            cancel: cancel.clone(),
        }
        .run(),
    );

    lifecycle_tx.send_modify(|l| l.state = ConnectionState::Established);

    let dispatcher = Dispatcher {
        transport,
        config,
        channel: negotiated.channel,
        inbound,
        expected_sequence: 0,
        deliveries: deliveries_tx,
        acks: acks.clone(),
        states,
        activity: activity_tx,
        failures: failures_rx,
        cancel: cancel.clone(),
        lifecycle: lifecycle_tx,
        monitor,
    };
    tokio::spawn(dispatcher.run());

    Ok(Connection {
        channel: negotiated.channel,
        control: negotiated.control,
        individual_address: negotiated.individual_address,
        cancel,
        lifecycle,
        failures,
        acks,
        deliveries,
    })
}

/// Inbound dispatch loop of one connection
struct Dispatcher {
    transport: Arc<dyn Transport>,
    config: TunnelConfig,
    channel: u8,
    inbound: InboundMessages,
    /// Next sequence number expected from the gateway
    expected_sequence: u8,
    deliveries: mpsc::Sender<Bytes>,
    acks: Pending<TunnellingAck>,
    states: Pending<ConnectionStateResponse>,
    activity: mpsc::Sender<()>,
    failures: mpsc::Receiver<TunnelError>,
    cancel: CancellationToken,
    lifecycle: watch::Sender<Lifecycle>,
    monitor: JoinHandle<()>,
}

impl Dispatcher {
    async fn run(mut self) {
        let termination = loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break Termination::Closed,

                Some(err) = self.failures.recv() => break Termination::Failed(err),

                message = self.inbound.next() => {
                    let Some(message) = message else {
                        break Termination::Failed(TunnelError::TransportClosed);
                    };
                    if let Some(termination) = self.handle(message).await {
                        break termination;
                    }
                }
            }
        };

        self.shutdown(termination).await;
    }

    async fn handle(&mut self, message: Message) -> Option<Termination> {
        if message.channel() != Some(self.channel) {
            warn!(
                "Dropping {:?} for channel {:?} (ours is {})",
                message.service(),
                message.channel(),
                self.channel
            );
            return None;
        }
        let _ = self.activity.try_send(());

        match message {
            Message::DisconnectRequest(_) => {
                info!("Gateway disconnected channel {}", self.channel);
                let response = DisconnectResponse {
                    channel: self.channel,
                    status: Status::NO_ERROR,
                };
                if let Err(e) = self.transport.send(response.into()).await {
                    warn!("Failed to confirm disconnect: {}", e);
                }
                Some(Termination::Disconnected)
            }

            Message::DisconnectResponse(res) => {
                debug!("Disconnect confirmed ({})", res.status);
                Some(Termination::Closed)
            }

            Message::TunnellingRequest(req) => {
                let in_sequence = req.sequence == self.expected_sequence;
                if in_sequence {
                    self.expected_sequence = self.expected_sequence.wrapping_add(1);
                } else {
                    debug!(
                        "Not delivering tunnelling request {} (expected {})",
                        req.sequence, self.expected_sequence
                    );
                }

                // Acknowledged either way, so the gateway stops repeating it.
                let ack = TunnellingAck {
                    channel: self.channel,
                    sequence: req.sequence,
                    status: Status::NO_ERROR,
                };
                if let Err(e) = self.transport.send(ack.into()).await {
                    if e.is_fatal() {
                        return Some(Termination::Failed(e));
                    }
                    warn!("Failed to acknowledge {}: {}", req.sequence, e);
                }

                if in_sequence {
                    self.deliver(req.payload);
                }
                None
            }

            Message::TunnellingAck(ack) => {
                self.forward(&self.acks, ack, "tunnelling ack");
                None
            }

            Message::ConnectionStateResponse(res) => {
                self.forward(&self.states, res, "connection state response");
                None
            }

            other => {
                debug!("Ignoring {:?}", other.service());
                None
            }
        }
    }

    /// Hand a payload to the application without blocking the loop
    fn deliver(&self, payload: Bytes) {
        let deliveries = self.deliveries.clone();
        let cancel = self.cancel.clone();
        let timeout = self.config.delivery_timeout;

        tokio::spawn(async move {
            tokio::select! {
                biased;
                sent = deliveries.send_timeout(payload, timeout) => {
                    if sent.is_err() {
                        warn!("Dropping inbound payload, application did not read it");
                    }
                }
                _ = cancel.cancelled() => {}
            }
        });
    }

    /// Forward a response to its waiting exchange, dropping it if no
    /// exchange waits or the exchange ends before taking it
    fn forward<T: Send + 'static>(&self, pending: &Pending<T>, value: T, what: &'static str) {
        let Some(tx) = pending.waiter() else {
            debug!("Dropping unsolicited {}", what);
            return;
        };
        let cancel = self.cancel.clone();
        let timeout = self.config.response_timeout;

        tokio::spawn(async move {
            tokio::select! {
                biased;
                sent = tx.send_timeout(value, timeout) => {
                    if sent.is_err() {
                        debug!("Dropping late {}", what);
                    }
                }
                _ = cancel.cancelled() => {}
            }
        });
    }

    async fn shutdown(self, termination: Termination) {
        match &termination {
            Termination::Failed(e) => error!("Channel {} failed: {}", self.channel, e),
            other => info!("Channel {} ending: {:?}", self.channel, other),
        }

        self.lifecycle.send_modify(|l| {
            l.state = ConnectionState::Terminating;
            l.termination = Some(termination);
        });

        self.cancel.cancel();
        if let Err(e) = self.monitor.await {
            warn!("Heartbeat task ended abnormally: {}", e);
        }
        self.transport.close().await;

        // Dropping our sender ends the application stream once pending
        // deliveries finish.
        drop(self.deliveries);
        self.lifecycle.send_modify(|l| l.state = ConnectionState::Closed);
        info!("Channel {} closed", self.channel);
    }
}
