//! fos-tunnel: packet tunnel daemon
//!
//! Wires the tunnel actor to a kernel WireGuard device, a JSON settings file,
//! a static relay list and the routing table, then serves host messages on
//! stdin until interrupted.

mod api_proxy;
mod host;
mod relay_list;
mod route_observer;
mod settings_file;
mod wg_adapter;

use anyhow::{Context, Result};
use clap::Parser;
use fos_config_client::ConfigServiceClient;
use fos_obfuscation::ProtocolObfuscator;
use fos_tunnel_core::{
    ActorDependencies, ApiRequestProxy, AppMessageHandler, DefaultBlockedStateErrorMapper,
    PacketTunnelActor, StartOptions,
};
use fos_tunnel_monitor::{IcmpPinger, TunnelMonitor};
use fos_tunnel_types::TunnelConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use url::Url;

use api_proxy::HttpApiProxy;
use relay_list::StaticRelaySelector;
use route_observer::RouteTablePathObserver;
use settings_file::FileSettingsReader;
use wg_adapter::WgTunnelAdapter;

// Global allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "fos-tunnel", version, about = "Packet tunnel control plane")]
struct Args {
    /// Timings and obfuscation settings (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Device key, addresses and tunnel options (JSON)
    #[arg(long)]
    settings: PathBuf,

    /// Relay list (JSON array)
    #[arg(long)]
    relays: PathBuf,

    /// WireGuard interface name
    #[arg(long, default_value = "wg-fos")]
    interface: String,

    /// Base URL for API requests proxied on behalf of the host
    #[arg(long)]
    api_url: Option<Url>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    info!("fos-tunnel starting on {}", args.interface);

    let config = match &args.config {
        Some(path) => TunnelConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => TunnelConfig::default(),
    };
    let relay_selector = StaticRelaySelector::load(&args.relays)?;

    let adapter = Arc::new(WgTunnelAdapter::new(&args.interface));
    let monitor = TunnelMonitor::new(IcmpPinger::new(), adapter.clone(), config.monitor.clone());

    let dependencies = ActorDependencies {
        tunnel_adapter: adapter,
        tunnel_monitor: Arc::new(monitor),
        default_path_observer: Arc::new(RouteTablePathObserver::new(&args.interface)),
        blocked_state_error_mapper: Arc::new(DefaultBlockedStateErrorMapper),
        relay_selector: Arc::new(relay_selector),
        settings_reader: Arc::new(FileSettingsReader::new(args.settings)),
        protocol_obfuscator: Arc::new(ProtocolObfuscator::with_config(config.obfuscation.clone())),
        ephemeral_peer_negotiator: Arc::new(ConfigServiceClient::new()),
    };
    let actor = Arc::new(PacketTunnelActor::new(
        dependencies,
        config.actor.clone(),
        config.negotiation.clone(),
    ));

    let api_proxy = args
        .api_url
        .map(|url| Arc::new(HttpApiProxy::new(url)) as Arc<dyn ApiRequestProxy>);
    let handler = Arc::new(AppMessageHandler::new(actor.clone(), api_proxy));

    actor.start(StartOptions::default());
    let host = tokio::spawn(host::serve(handler));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for ctrl-c")?;
            info!("Interrupted");
        }
        result = host => {
            result.context("host message loop panicked")??;
            info!("Host closed stdin");
        }
    }

    actor.stop();
    actor.wait_until_disconnected().await;

    info!("fos-tunnel shutting down");
    Ok(())
}
