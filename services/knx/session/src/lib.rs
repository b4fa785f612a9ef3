//! Connection lifecycle for KNXnet/IP tunnels.
//!
//! This crate turns the connectionless KNXnet/IP datagrams into a stateful
//! tunnel: it negotiates a channel with the gateway, sends sequenced data
//! requests with resend-on-timeout, acknowledges gateway pushes, probes the
//! gateway after periods of silence and tears the connection down in order.
//!
//! ## Features
//!
//! - **Handshake**: connection request with resend; a busy gateway is waited on
//! - **Data exchange**: one outstanding request at a time, wrapping sequence numbers
//! - **Heartbeat**: connection-state probes after inbound silence
//! - **Transports**: UDP, plus an in-memory channel pair for embedding and tests
//!
//! ## Example
//!
//! ```rust,no_run
//! use knx_session::{Tunnel, TunnelConfig};
//!
//! # async fn example() -> Result<(), knx_session::TunnelError> {
//! let gateway = "192.168.1.20:3671".parse().unwrap();
//! let (tunnel, mut inbound) = Tunnel::connect(gateway, TunnelConfig::default()).await?;
//!
//! // L_Data.req, group write 1/0/1 = on
//! tunnel
//!     .send(vec![0x11, 0x00, 0xBC, 0xE0, 0x00, 0x00, 0x08, 0x01, 0x01, 0x00, 0x81])
//!     .await?;
//!
//! while let Some(frame) = inbound.recv().await {
//!     println!("cEMI {:02x?}", &frame[..]);
//! }
//!
//! println!("tunnel ended: {:?}", tunnel.terminated().await);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
mod exchange;
mod handshake;
mod keepalive;
pub mod session;
pub mod transport;
pub mod tunnel;

// Re-export main types
pub use error::{Result, TunnelError};
pub use session::{ConnectionState, Termination, TunnelConfig, DELIVERY_CAPACITY};
pub use transport::{
    channel_pair, ChannelPeer, ChannelTransport, InboundMessages, Transport, UdpTransport,
    INBOUND_CAPACITY,
};
pub use tunnel::{Inbound, Tunnel};
