//! Kernel WireGuard device driven through the `wg` and `ip` tools.
//!
//! Single hop uses one interface. Multi-hop adds `<name>-in`, peered with
//! the entry relay, and routes the exit relay's address through it so the
//! outer interface reaches the exit relay inside the entry tunnel.

use async_trait::async_trait;
use fos_tunnel_core::{TunnelAdapter, TunnelAdapterError};
use fos_tunnel_monitor::TunnelDeviceInfo;
use fos_tunnel_types::{HopConfiguration, IpAddressRange, TunnelAdapterConfiguration, TunnelStats};
use parking_lot::Mutex;
use std::io;
use std::net::IpAddr;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Run a command, feeding `stdin` if given. Fails with stderr on a non-zero exit.
async fn run(program: &str, args: &[&str], stdin: Option<&str>) -> Result<(), String> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .map_err(|e| format!("{}: {}", program, e))?;
    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes())
            .await
            .map_err(|e| format!("{}: {}", program, e))?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| format!("{}: {}", program, e))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("{} {}: {}", program, args.join(" "), stderr.trim()));
    }
    Ok(())
}

/// `wg setconf` input for one hop.
pub(crate) fn render_hop(hop: &HopConfiguration) -> String {
    let peer = &hop.peer;
    let allowed_ips = peer
        .allowed_ips
        .iter()
        .map(IpAddressRange::to_string)
        .collect::<Vec<_>>()
        .join(", ");

    let mut config = format!(
        "[Interface]\nPrivateKey = {}\n\n[Peer]\nPublicKey = {}\nEndpoint = {}\nAllowedIPs = {}\n",
        hop.private_key.to_base64(),
        peer.public_key.to_base64(),
        peer.endpoint,
        allowed_ips
    );
    if let Some(preshared_key) = &peer.preshared_key {
        config.push_str(&format!("PresharedKey = {}\n", preshared_key.to_base64()));
    }
    if let Some(keepalive) = peer.keepalive {
        config.push_str(&format!("PersistentKeepalive = {}\n", keepalive));
    }
    config
}

/// No peers: the interface stays up and drops everything routed to it.
const BLOCKED_CONFIG: &str = "[Interface]\n";

pub struct WgTunnelAdapter {
    interface: String,
    entry_interface: String,
    /// Exit relay address currently routed through the entry interface
    entry_route: Mutex<Option<IpAddr>>,
}

impl WgTunnelAdapter {
    pub fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
            entry_interface: format!("{}-in", interface),
            entry_route: Mutex::new(None),
        }
    }

    async fn exists(name: &str) -> bool {
        run("ip", &["link", "show", "dev", name], None).await.is_ok()
    }

    async fn ensure_interface(name: &str) -> Result<(), String> {
        if !Self::exists(name).await {
            info!("Creating WireGuard interface {}", name);
            run("ip", &["link", "add", "dev", name, "type", "wireguard"], None).await?;
        }
        Ok(())
    }

    async fn set_addresses(name: &str, addresses: &[IpAddressRange]) -> Result<(), String> {
        run("ip", &["address", "flush", "dev", name], None).await?;
        for address in addresses {
            run("ip", &["address", "add", &address.to_string(), "dev", name], None).await?;
        }
        run("ip", &["link", "set", "up", "dev", name], None).await
    }

    async fn remove_entry(&self) {
        let route = self.entry_route.lock().take();
        if let Some(route) = route {
            let host = IpAddressRange::host(route).to_string();
            if let Err(e) = run("ip", &["route", "del", &host], None).await {
                debug!("Entry route already gone: {}", e);
            }
        }
        if Self::exists(&self.entry_interface).await {
            if let Err(e) = run("ip", &["link", "del", "dev", &self.entry_interface], None).await {
                warn!("Failed to remove {}: {}", self.entry_interface, e);
            }
        }
    }

    async fn apply(&self, configuration: &TunnelAdapterConfiguration) -> Result<(), String> {
        if configuration.daita.is_some() {
            warn!("DAITA is not available on the kernel WireGuard device, ignoring");
        }

        match (&configuration.entry, &configuration.exit) {
            (Some(entry), Some(exit)) => {
                Self::ensure_interface(&self.entry_interface).await?;
                run(
                    "wg",
                    &["setconf", &self.entry_interface, "/dev/stdin"],
                    Some(&render_hop(entry)),
                )
                .await?;
                Self::set_addresses(&self.entry_interface, &configuration.interface_addresses)
                    .await?;

                let exit_ip = exit.peer.endpoint.ip();
                let host = IpAddressRange::host(exit_ip).to_string();
                run(
                    "ip",
                    &["route", "replace", &host, "dev", &self.entry_interface],
                    None,
                )
                .await?;
                *self.entry_route.lock() = Some(exit_ip);
            }
            _ => self.remove_entry().await,
        }

        let exit_config = configuration
            .exit
            .as_ref()
            .map(render_hop)
            .unwrap_or_else(|| BLOCKED_CONFIG.to_string());
        Self::ensure_interface(&self.interface).await?;
        run(
            "wg",
            &["setconf", &self.interface, "/dev/stdin"],
            Some(&exit_config),
        )
        .await?;
        Self::set_addresses(&self.interface, &configuration.interface_addresses).await
    }

    async fn read_counter(&self, name: &str) -> io::Result<u64> {
        let path = format!("/sys/class/net/{}/statistics/{}", self.interface, name);
        let value = tokio::fs::read_to_string(&path).await?;
        value
            .trim()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

#[async_trait]
impl TunnelAdapter for WgTunnelAdapter {
    async fn start(
        &self,
        configuration: TunnelAdapterConfiguration,
    ) -> Result<(), TunnelAdapterError> {
        info!(
            "Starting {} ({})",
            self.interface,
            if configuration.is_blocked() { "blocked" } else { "connected" }
        );
        self.apply(&configuration)
            .await
            .map_err(TunnelAdapterError::Start)
    }

    async fn reconfigure(
        &self,
        configuration: TunnelAdapterConfiguration,
    ) -> Result<(), TunnelAdapterError> {
        debug!("Reconfiguring {}", self.interface);
        self.apply(&configuration)
            .await
            .map_err(TunnelAdapterError::Reconfigure)
    }

    async fn stop(&self) -> Result<(), TunnelAdapterError> {
        info!("Removing {}", self.interface);
        self.remove_entry().await;
        if Self::exists(&self.interface).await {
            run("ip", &["link", "del", "dev", &self.interface], None)
                .await
                .map_err(TunnelAdapterError::Stop)?;
        }
        Ok(())
    }
}

#[async_trait]
impl TunnelDeviceInfo for WgTunnelAdapter {
    fn interface_name(&self) -> Option<String> {
        Some(self.interface.clone())
    }

    async fn stats(&self) -> io::Result<TunnelStats> {
        Ok(TunnelStats {
            bytes_sent: self.read_counter("tx_bytes").await?,
            bytes_received: self.read_counter("rx_bytes").await?,
        })
    }
}
