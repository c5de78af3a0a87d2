//! Addressing and network reachability primitives.

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// An address with a prefix length, written in CIDR notation (`10.64.0.1/32`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpAddressRange {
    pub address: IpAddr,
    pub prefix: u8,
}

impl IpAddressRange {
    pub fn new(address: IpAddr, prefix: u8) -> Self {
        Self { address, prefix }
    }

    /// A range covering exactly one address.
    pub fn host(address: IpAddr) -> Self {
        let prefix = if address.is_ipv4() { 32 } else { 128 };
        Self { address, prefix }
    }

    /// `0.0.0.0/0` and `::/0`
    pub fn all_routes() -> Vec<Self> {
        vec![
            Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            Self::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        ]
    }
}

impl fmt::Display for IpAddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

impl FromStr for IpAddressRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, prefix) = match s.split_once('/') {
            Some((address, prefix)) => (address, Some(prefix)),
            None => (s, None),
        };
        let address: IpAddr = address
            .parse()
            .map_err(|_| format!("invalid address in range: {s}"))?;
        let max_prefix = if address.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(prefix) => prefix
                .parse::<u8>()
                .map_err(|_| format!("invalid prefix in range: {s}"))?,
            None => max_prefix,
        };
        if prefix > max_prefix {
            return Err(format!("prefix out of bounds in range: {s}"));
        }
        Ok(Self { address, prefix })
    }
}

impl Serialize for IpAddressRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IpAddressRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Status of the default network path as reported by the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathStatus {
    Satisfied,
    Unsatisfied,
    RequiresConnection,
}

/// Snapshot of the default network path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPath {
    pub status: PathStatus,
}

impl NetworkPath {
    pub fn new(status: PathStatus) -> Self {
        Self { status }
    }

    pub fn reachability(&self) -> NetworkReachability {
        match self.status {
            PathStatus::Satisfied => NetworkReachability::Reachable,
            PathStatus::Unsatisfied | PathStatus::RequiresConnection => {
                NetworkReachability::Unreachable
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkReachability {
    #[default]
    Undetermined,
    Reachable,
    Unreachable,
}

/// Byte counters read from the tunnel device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    /// Bytes sent through tunnel
    pub bytes_sent: u64,
    /// Bytes received through tunnel
    pub bytes_received: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cidr() {
        let range: IpAddressRange = "10.64.0.1/32".parse().unwrap();
        assert_eq!(range.address, IpAddr::V4(Ipv4Addr::new(10, 64, 0, 1)));
        assert_eq!(range.prefix, 32);
        assert_eq!(range.to_string(), "10.64.0.1/32");

        let bare: IpAddressRange = "fc00::1".parse().unwrap();
        assert_eq!(bare.prefix, 128);
    }

    #[test]
    fn test_parse_cidr_rejects_bad_prefix() {
        assert!("10.0.0.1/33".parse::<IpAddressRange>().is_err());
        assert!("10.0.0.1/x".parse::<IpAddressRange>().is_err());
        assert!("nonsense/8".parse::<IpAddressRange>().is_err());
    }

    #[test]
    fn test_path_reachability() {
        assert_eq!(
            NetworkPath::new(PathStatus::Satisfied).reachability(),
            NetworkReachability::Reachable
        );
        assert_eq!(
            NetworkPath::new(PathStatus::RequiresConnection).reachability(),
            NetworkReachability::Unreachable
        );
    }
}
