//! Default path observation by polling the IPv4 routing table.

use fos_tunnel_core::{DefaultPathObserver, NetworkPathHandler};
use fos_tunnel_types::{NetworkPath, PathStatus};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

const ROUTE_TABLE: &str = "/proc/net/route";
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// True if `table` has a default route on an interface other than the
/// tunnel's own.
pub(crate) fn has_default_route(table: &str, tunnel_interface: &str) -> bool {
    table.lines().skip(1).any(|line| {
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some(interface), Some(destination)) => {
                destination == "00000000" && !interface.starts_with(tunnel_interface)
            }
            _ => false,
        }
    })
}

fn read_path(tunnel_interface: &str) -> NetworkPath {
    let status = match std::fs::read_to_string(ROUTE_TABLE) {
        Ok(table) if has_default_route(&table, tunnel_interface) => PathStatus::Satisfied,
        Ok(_) => PathStatus::Unsatisfied,
        Err(e) => {
            debug!("Cannot read {}: {}", ROUTE_TABLE, e);
            PathStatus::Unsatisfied
        }
    };
    NetworkPath::new(status)
}

struct ObserverState {
    current: NetworkPath,
    task: Option<JoinHandle<()>>,
}

pub struct RouteTablePathObserver {
    tunnel_interface: String,
    state: Arc<Mutex<ObserverState>>,
}

impl RouteTablePathObserver {
    pub fn new(tunnel_interface: &str) -> Self {
        Self {
            tunnel_interface: tunnel_interface.to_string(),
            state: Arc::new(Mutex::new(ObserverState {
                current: read_path(tunnel_interface),
                task: None,
            })),
        }
    }
}

impl DefaultPathObserver for RouteTablePathObserver {
    fn current_path(&self) -> Option<NetworkPath> {
        Some(self.state.lock().current.clone())
    }

    fn start(&self, handler: NetworkPathHandler) {
        let state = self.state.clone();
        let tunnel_interface = self.tunnel_interface.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(POLL_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let path = read_path(&tunnel_interface);
                let changed = {
                    let mut state = state.lock();
                    let changed = state.current != path;
                    state.current = path.clone();
                    changed
                };
                if changed {
                    debug!("Default path is now {:?}", path.status);
                    handler(path);
                }
            }
        });

        if let Some(previous) = self.state.lock().task.replace(task) {
            previous.abort();
        }
    }

    fn stop(&self) {
        if let Some(task) = self.state.lock().task.take() {
            task.abort();
        }
    }
}

impl Drop for RouteTablePathObserver {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
Iface\tDestination\tGateway\tFlags\tRefCnt\tUse\tMetric\tMask\tMTU\tWindow\tIRTT
wg-fos\t00000000\t00000000\t0001\t0\t0\t0\t00000000\t0\t0\t0
eth0\t0000A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\t0\t0\t0
";

    #[test]
    fn test_tunnel_default_route_does_not_count() {
        assert!(!has_default_route(TABLE, "wg-fos"));
    }

    #[test]
    fn test_physical_default_route() {
        let table = format!("{}eth0\t00000000\t0100A8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0\n", TABLE);
        assert!(has_default_route(&table, "wg-fos"));
    }

    #[test]
    fn test_empty_table() {
        assert!(!has_default_route("", "wg-fos"));
    }
}
