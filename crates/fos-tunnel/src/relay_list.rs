//! Relay selection from a fixed JSON relay list.

use anyhow::Context;
use fos_tunnel_core::{RelaySelector, RelaySelectorError};
use fos_tunnel_types::{RelayConstraints, SelectedRelay, SelectedRelays};
use rand::seq::SliceRandom;
use std::path::Path;
use tracing::debug;

/// `se` matches a country, `se-got` a city, anything else a hostname.
fn matches_location(relay: &SelectedRelay, location: Option<&str>) -> bool {
    let Some(location) = location else {
        return true;
    };
    let city = format!(
        "{}-{}",
        relay.location.country_code, relay.location.city_code
    );
    location == relay.location.country_code || location == city || location == relay.hostname
}

pub struct StaticRelaySelector {
    relays: Vec<SelectedRelay>,
}

impl StaticRelaySelector {
    pub fn new(relays: Vec<SelectedRelay>) -> Self {
        Self { relays }
    }

    /// Load a JSON array of relays.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading relay list {}", path.display()))?;
        let relays: Vec<SelectedRelay> = serde_json::from_str(&content)
            .with_context(|| format!("parsing relay list {}", path.display()))?;
        debug!("Loaded {} relays", relays.len());
        Ok(Self::new(relays))
    }

    fn pick(
        &self,
        location: Option<&str>,
        exclude: Option<&str>,
        constraints: &RelayConstraints,
        attempt: u32,
    ) -> Result<SelectedRelay, RelaySelectorError> {
        let candidates: Vec<&SelectedRelay> = self
            .relays
            .iter()
            .filter(|relay| matches_location(relay, location))
            .filter(|relay| Some(relay.hostname.as_str()) != exclude)
            .collect();

        let mut relay = candidates
            .choose(&mut rand::thread_rng())
            .map(|relay| (*relay).clone())
            .ok_or(RelaySelectorError::NoRelaysSatisfyingConstraints)?;
        if let Some(port) = constraints.port {
            relay.endpoint.socket_address.set_port(port);
        }
        relay.retry_attempts = attempt;
        Ok(relay)
    }
}

impl RelaySelector for StaticRelaySelector {
    fn select_relays(
        &self,
        constraints: &RelayConstraints,
        connection_attempt_count: u32,
        multihop: bool,
    ) -> Result<SelectedRelays, RelaySelectorError> {
        let exit = self.pick(
            constraints.location.as_deref(),
            None,
            constraints,
            connection_attempt_count,
        )?;
        let entry = if multihop {
            Some(self.pick(
                constraints.entry_location.as_deref(),
                Some(exit.hostname.as_str()),
                constraints,
                connection_attempt_count,
            )?)
        } else {
            None
        };

        Ok(SelectedRelays {
            entry,
            exit,
            retry_attempt: connection_attempt_count,
        })
    }
}
