//! Configuration handling for the tunnel client.
//!
//! Settings come from an optional YAML file, then `KNX_*` environment
//! variables, then command-line flags (applied in `main`).

use anyhow::{Context, Result};
use knx_session::TunnelConfig;
use knx_wire::{TunnelLayer, DEFAULT_GATEWAY_PORT};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Client configuration
#[derive(Debug, Clone, Default)]
pub struct KnxConfig {
    /// Gateway address
    pub gateway: Option<SocketAddr>,
    /// Tunnel timing and layer
    pub tunnel: TunnelConfig,
}

/// File layout
#[derive(Debug, Deserialize)]
struct FileConfig {
    gateway: Option<String>,
    layer: Option<String>,
    tunnel: Option<TimingConfig>,
}

/// Durations in humantime notation, e.g. `500ms`, `10s`
#[derive(Debug, Deserialize)]
struct TimingConfig {
    resend_interval: Option<String>,
    heartbeat_delay: Option<String>,
    response_timeout: Option<String>,
    delivery_timeout: Option<String>,
}

impl KnxConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = Self::default();

        match std::fs::read_to_string(path) {
            Ok(content) => {
                let file: FileConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("invalid config file {:?}", path))?;
                config.apply_file_config(file)?;
                info!("Loaded configuration from {:?}", path);
            }
            Err(_) => warn!("Config file {:?} not found, using defaults", path),
        }

        config.apply_overrides(|key| std::env::var(key).ok())?;

        info!(
            "Tunnel configuration: gateway={:?}, layer={:?}, resend={:?}, heartbeat={:?}, timeout={:?}",
            config.gateway,
            config.tunnel.layer,
            config.tunnel.resend_interval,
            config.tunnel.heartbeat_delay,
            config.tunnel.response_timeout
        );

        Ok(config)
    }

    fn apply_file_config(&mut self, file: FileConfig) -> Result<()> {
        if let Some(gateway) = file.gateway {
            self.gateway = Some(parse_gateway(&gateway)?);
        }
        if let Some(layer) = file.layer {
            self.tunnel.layer = parse_layer(&layer)?;
        }
        if let Some(timing) = file.tunnel {
            let tunnel = &mut self.tunnel;
            set_duration(&mut tunnel.resend_interval, timing.resend_interval, "resend_interval")?;
            set_duration(&mut tunnel.heartbeat_delay, timing.heartbeat_delay, "heartbeat_delay")?;
            set_duration(&mut tunnel.response_timeout, timing.response_timeout, "response_timeout")?;
            set_duration(&mut tunnel.delivery_timeout, timing.delivery_timeout, "delivery_timeout")?;
        }
        Ok(())
    }

    /// Apply `KNX_*` overrides read through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(gateway) = lookup("KNX_GATEWAY") {
            self.gateway = Some(parse_gateway(&gateway)?);
            info!("Gateway overridden by environment: {}", gateway);
        }
        if let Some(layer) = lookup("KNX_LAYER") {
            self.tunnel.layer = parse_layer(&layer)?;
            info!("Layer overridden by environment: {}", layer);
        }

        let tunnel = &mut self.tunnel;
        for (key, target) in [
            ("KNX_RESEND_INTERVAL", &mut tunnel.resend_interval),
            ("KNX_HEARTBEAT_DELAY", &mut tunnel.heartbeat_delay),
            ("KNX_RESPONSE_TIMEOUT", &mut tunnel.response_timeout),
            ("KNX_DELIVERY_TIMEOUT", &mut tunnel.delivery_timeout),
        ] {
            if let Some(value) = lookup(key) {
                set_duration(target, Some(value), key)?;
                info!("{} overridden by environment: {:?}", key, target);
            }
        }

        Ok(())
    }
}

fn set_duration(target: &mut Duration, value: Option<String>, name: &str) -> Result<()> {
    if let Some(value) = value {
        *target = humantime::parse_duration(value.trim())
            .with_context(|| format!("invalid duration for {}: {:?}", name, value))?;
    }
    Ok(())
}

/// Parse `host:port` or a bare IP address (standard port)
pub fn parse_gateway(value: &str) -> Result<SocketAddr> {
    let value = value.trim();
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let ip: IpAddr = value
        .parse()
        .with_context(|| format!("invalid gateway address {:?}", value))?;
    Ok(SocketAddr::new(ip, DEFAULT_GATEWAY_PORT))
}

/// Parse a tunnelling layer name
pub fn parse_layer(value: &str) -> Result<TunnelLayer> {
    match value.trim().to_ascii_lowercase().as_str() {
        "link" | "linklayer" | "link-layer" => Ok(TunnelLayer::LinkLayer),
        "raw" => Ok(TunnelLayer::Raw),
        "busmonitor" | "bus-monitor" | "monitor" => Ok(TunnelLayer::BusMonitor),
        other => anyhow::bail!("unknown tunnelling layer {:?}", other),
    }
}
