//! Adapter configurations built from a connection attempt.

use crate::state::ConnectionData;
use fos_ephemeral_peer::{EphemeralPeerNegotiationState, EphemeralPeerRelayConfiguration};
use fos_tunnel_types::{
    HopConfiguration, IpAddressRange, PeerConfig, PrivateKey, SelectedEndpoint,
    TunnelAdapterConfiguration,
};
use std::net::SocketAddr;

fn hop(
    private_key: PrivateKey,
    endpoint: &SelectedEndpoint,
    socket_address: SocketAddr,
    allowed_ips: Vec<IpAddressRange>,
) -> HopConfiguration {
    HopConfiguration {
        private_key,
        peer: PeerConfig::new(endpoint.public_key, socket_address).with_allowed_ips(allowed_ips),
    }
}

/// Device key on every hop; the first hop dials the obfuscated endpoint.
pub(crate) fn direct_configuration(connection: &ConnectionData) -> TunnelAdapterConfiguration {
    let relays = &connection.selected_relays;
    let exit = &relays.exit.endpoint;
    let key = connection.current_key.clone();

    match &relays.entry {
        Some(entry) => {
            let entry_hop = hop(
                key.clone(),
                &entry.endpoint,
                connection.connected_endpoint.socket_address,
                vec![IpAddressRange::host(exit.socket_address.ip())],
            );
            let exit_hop = hop(key, exit, exit.socket_address, IpAddressRange::all_routes());
            TunnelAdapterConfiguration::multihop(
                connection.interface_addresses.clone(),
                connection.dns_servers.clone(),
                entry_hop,
                exit_hop,
                exit.ipv4_gateway,
            )
        }
        None => {
            let exit_hop = hop(
                key,
                exit,
                connection.connected_endpoint.socket_address,
                IpAddressRange::all_routes(),
            );
            TunnelAdapterConfiguration::single_hop(
                connection.interface_addresses.clone(),
                connection.dns_servers.clone(),
                exit_hop,
                exit.ipv4_gateway,
            )
        }
    }
}

fn exchange_hop(leg: &EphemeralPeerRelayConfiguration, socket_address: SocketAddr) -> HopConfiguration {
    let configuration = &leg.configuration;
    HopConfiguration {
        private_key: configuration.private_key.clone(),
        peer: PeerConfig::new(leg.relay.endpoint.public_key, socket_address)
            .with_allowed_ips(configuration.allowed_ips.clone())
            .with_preshared_key(configuration.preshared_key.clone()),
    }
}

/// Configuration for one step of an ephemeral peer exchange.
pub(crate) fn exchange_configuration(
    connection: &ConnectionData,
    state: &EphemeralPeerNegotiationState,
) -> TunnelAdapterConfiguration {
    let ingress = connection.connected_endpoint.socket_address;
    match state {
        EphemeralPeerNegotiationState::Single(exit) => TunnelAdapterConfiguration::single_hop(
            connection.interface_addresses.clone(),
            connection.dns_servers.clone(),
            exchange_hop(exit, ingress),
            exit.relay.endpoint.ipv4_gateway,
        )
        .with_daita(exit.configuration.daita.clone()),
        EphemeralPeerNegotiationState::Multi { entry, exit } => {
            TunnelAdapterConfiguration::multihop(
                connection.interface_addresses.clone(),
                connection.dns_servers.clone(),
                exchange_hop(entry, ingress),
                exchange_hop(exit, exit.relay.endpoint.socket_address),
                exit.relay.endpoint.ipv4_gateway,
            )
            .with_daita(entry.configuration.daita.clone())
        }
    }
}
