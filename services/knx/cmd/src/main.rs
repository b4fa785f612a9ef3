//! KNXnet/IP tunnelling client binary.
//!
//! Opens a tunnel to a gateway, sends the cEMI frames given on the command
//! line and prints every frame the gateway pushes until interrupted.

use anyhow::{bail, Context};
use bytes::Bytes;
use clap::Parser;
use knx_session::{Termination, Tunnel};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[macro_use]
mod logging;
mod config;

use config::{parse_gateway, parse_layer, KnxConfig};
use logging::KnxLogFormatter;

/// KNXnet/IP tunnelling client
#[derive(Parser, Debug)]
#[command(name = "knx-tunnel", version, about = "KNXnet/IP tunnelling client")]
struct Args {
    /// Gateway address, e.g. 192.168.1.20 or 192.168.1.20:3671
    #[arg(long)]
    gateway: Option<String>,

    /// Configuration file path
    #[arg(long, default_value = "knx.yaml")]
    config: PathBuf,

    /// Tunnelling layer: link, raw, busmonitor
    #[arg(long)]
    layer: Option<String>,

    /// Resend interval for unanswered requests, e.g. 500ms
    #[arg(long)]
    resend_interval: Option<humantime::Duration>,

    /// Inbound silence before a heartbeat probe, e.g. 10s
    #[arg(long)]
    heartbeat_delay: Option<humantime::Duration>,

    /// Response timeout for one exchange, e.g. 10s
    #[arg(long)]
    response_timeout: Option<humantime::Duration>,

    /// cEMI frame to send, hex encoded (repeatable)
    #[arg(long = "send", value_name = "HEX")]
    send: Vec<String>,

    /// Close the tunnel after sending instead of printing inbound frames
    #[arg(long)]
    once: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("knx_tunnel={}", args.log_level).parse()?)
        .add_directive(format!("knx_session={}", args.log_level).parse()?)
        .add_directive(format!("knx_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .event_format(KnxLogFormatter::new("knx-tunnel"))
        .init();

    info!("Starting KNXnet/IP tunnel client v{}", env!("CARGO_PKG_VERSION"));

    let mut config = KnxConfig::load_from_file(&args.config)?;
    apply_args(&mut config, &args)?;

    let Some(gateway) = config.gateway else {
        bail!("no gateway address; pass --gateway or set KNX_GATEWAY");
    };

    let payloads = args
        .send
        .iter()
        .map(String::as_str)
        .map(decode_frame)
        .collect::<anyhow::Result<Vec<_>>>()?;

    run(gateway, config, payloads, args.once).await
}

fn apply_args(config: &mut KnxConfig, args: &Args) -> anyhow::Result<()> {
    if let Some(gateway) = &args.gateway {
        config.gateway = Some(parse_gateway(gateway)?);
    }
    if let Some(layer) = &args.layer {
        config.tunnel.layer = parse_layer(layer)?;
    }
    if let Some(d) = args.resend_interval {
        config.tunnel.resend_interval = d.into();
    }
    if let Some(d) = args.heartbeat_delay {
        config.tunnel.heartbeat_delay = d.into();
    }
    if let Some(d) = args.response_timeout {
        config.tunnel.response_timeout = d.into();
    }
    Ok(())
}

fn decode_frame(frame: &str) -> anyhow::Result<Bytes> {
    let cleaned: String = frame
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    let bytes = hex::decode(&cleaned).with_context(|| format!("invalid hex frame {:?}", frame))?;
    if bytes.is_empty() {
        bail!("empty frame");
    }
    Ok(Bytes::from(bytes))
}

async fn run(
    gateway: SocketAddr,
    config: KnxConfig,
    payloads: Vec<Bytes>,
    once: bool,
) -> anyhow::Result<()> {
    let (tunnel, mut inbound) = Tunnel::connect(gateway, config.tunnel)
        .await
        .with_context(|| format!("failed to open tunnel to {}", gateway))?;
    component_info!(
        "tunnel",
        "Connected to {} on channel {} (address {})",
        gateway,
        tunnel.channel_id(),
        tunnel
            .individual_address()
            .map(format_individual_address)
            .unwrap_or_else(|| "-".to_string())
    );

    for payload in payloads {
        match tunnel.send(payload.clone()).await {
            Ok(()) => component_info!("send", "Sent {}", hex::encode(&payload)),
            Err(e) => component_error!("send", "Failed to send {}: {}", hex::encode(&payload), e),
        }
    }

    if !once {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    component_info!("tunnel", "Interrupted, closing");
                    break;
                }
                frame = inbound.recv() => match frame {
                    Some(frame) => println!("{}", hex::encode(&frame)),
                    None => break,
                },
            }
        }
    }

    tunnel.close().await;
    match tunnel.terminated().await {
        Termination::Failed(e) => {
            component_warn!("tunnel", "Tunnel failed: {}", e);
            Err(e).context("tunnel terminated")
        }
        other => {
            component_debug!("tunnel", "Tunnel ended: {:?}", other);
            Ok(())
        }
    }
}

/// Individual address in `area.line.device` notation
fn format_individual_address(address: u16) -> String {
    format!("{}.{}.{}", address >> 12, (address >> 8) & 0x0F, address & 0xFF)
}
