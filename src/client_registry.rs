//! Per-remote identity resolution.
//!
//! A single emulated device can present itself as a different Shelly to
//! every configured peer. The registry maps a remote IP address to the
//! MAC, hostname and power calibration that peer should see.

use crate::config::{ClientContextConfig, DeviceDefaults};
use std::collections::HashMap;
use std::net::{IpAddr, ToSocketAddrs};

/// Prefix of the hostname a Pro 3EM derives from its MAC.
pub const HOSTNAME_PREFIX: &str = "shellypro3em";

/// Identity overrides configured for one remote peer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientContext {
    pub mac: Option<String>,
    pub hostname: Option<String>,
    pub power_factor: Option<f64>,
}

/// Identity presented to one remote, with every default filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientIdentity {
    pub mac: String,
    pub hostname: String,
    pub power_factor: f64,
}

/// Read-only after construction, shared by every session.
#[derive(Debug, Clone)]
pub struct ClientContextRegistry {
    contexts: HashMap<IpAddr, ClientContext>,
    default_mac: String,
    default_hostname: String,
}

impl ClientContextRegistry {
    /// Builds the registry from configured peers. Peers whose address does
    /// not resolve are logged and skipped.
    pub fn from_config(entries: &[ClientContextConfig], defaults: &DeviceDefaults) -> Self {
        let mut contexts = HashMap::new();

        for entry in entries {
            let Some(address) = resolve_address(&entry.address) else {
                tracing::warn!(address = %entry.address, "unknown host in client context, skipping");
                continue;
            };

            let mac = entry.mac.as_ref().map(|mac| mac.to_uppercase());
            let hostname = entry
                .hostname
                .clone()
                .or_else(|| mac.as_deref().map(derive_hostname));

            tracing::debug!(%address, ?mac, ?hostname, "registered client context");
            contexts.insert(
                address,
                ClientContext {
                    mac,
                    hostname,
                    power_factor: entry.power_factor,
                },
            );
        }

        let default_mac = defaults.mac.to_uppercase();
        let default_hostname = defaults
            .hostname
            .clone()
            .unwrap_or_else(|| derive_hostname(&default_mac));

        Self {
            contexts,
            default_mac,
            default_hostname,
        }
    }

    /// Never fails, an unknown remote gets the device-wide identity.
    pub fn resolve(&self, remote: IpAddr) -> ClientIdentity {
        let context = self.contexts.get(&remote.to_canonical());

        ClientIdentity {
            mac: context
                .and_then(|c| c.mac.clone())
                .unwrap_or_else(|| self.default_mac.clone()),
            hostname: context
                .and_then(|c| c.hostname.clone())
                .unwrap_or_else(|| self.default_hostname.clone()),
            power_factor: context.and_then(|c| c.power_factor).unwrap_or(1.0),
        }
    }

    pub fn context(&self, remote: IpAddr) -> Option<&ClientContext> {
        self.contexts.get(&remote.to_canonical())
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

/// `shellypro3em-<mac lowercased>`
pub fn derive_hostname(mac: &str) -> String {
    format!("{HOSTNAME_PREFIX}-{}", mac.to_lowercase())
}

fn resolve_address(address: &str) -> Option<IpAddr> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Some(ip.to_canonical());
    }
    (address, 0u16)
        .to_socket_addrs()
        .ok()?
        .next()
        .map(|socket_addr| socket_addr.ip().to_canonical())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    fn defaults() -> DeviceDefaults {
        DeviceDefaults {
            device_type: "SPEM-003CEBEU".to_string(),
            mac: "b827eb364242".to_string(),
            hostname: None,
        }
    }

    fn peer(address: &str, mac: Option<&str>) -> ClientContextConfig {
        ClientContextConfig {
            address: address.to_string(),
            mac: mac.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_unknown_remote_gets_defaults() {
        let registry = ClientContextRegistry::from_config(&[], &defaults());
        let identity = registry.resolve("192.168.1.77".parse().unwrap());

        assert_eq!(identity.mac, "B827EB364242");
        assert_eq!(identity.hostname, "shellypro3em-b827eb364242");
        assert_eq!(identity.power_factor, 1.0);
    }

    #[test]
    fn test_configured_default_hostname_wins() {
        let mut defaults = defaults();
        defaults.hostname = Some("my-meter".to_string());
        let registry = ClientContextRegistry::from_config(&[], &defaults);

        let identity = registry.resolve("10.1.1.1".parse().unwrap());
        assert_eq!(identity.hostname, "my-meter");
    }

    #[test]
    fn test_mac_only_peer_derives_hostname() {
        let registry = ClientContextRegistry::from_config(
            &[peer("10.0.0.5", Some("aa:bb:cc:dd:ee:ff"))],
            &defaults(),
        );
        let identity = registry.resolve("10.0.0.5".parse().unwrap());

        assert_eq!(identity.mac, "AA:BB:CC:DD:EE:FF");
        assert_eq!(identity.hostname, "shellypro3em-aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn test_peer_without_mac_falls_back_per_field() {
        let mut entry = peer("10.0.0.6", None);
        entry.power_factor = Some(0.25);
        let registry = ClientContextRegistry::from_config(&[entry], &defaults());

        let identity = registry.resolve("10.0.0.6".parse().unwrap());
        assert_eq!(identity.mac, "B827EB364242");
        assert_eq!(identity.hostname, "shellypro3em-b827eb364242");
        assert_eq!(identity.power_factor, 0.25);
    }

    #[test]
    fn test_explicit_peer_hostname_wins_over_derived() {
        let mut entry = peer("10.0.0.7", Some("112233445566"));
        entry.hostname = Some("inverter-facing-meter".to_string());
        let registry = ClientContextRegistry::from_config(&[entry], &defaults());

        let identity = registry.resolve("10.0.0.7".parse().unwrap());
        assert_eq!(identity.mac, "112233445566");
        assert_eq!(identity.hostname, "inverter-facing-meter");
    }

    #[test]
    fn test_unresolvable_peer_is_skipped() {
        let registry = ClientContextRegistry::from_config(
            &[
                peer("not a valid host name!", Some("001122334455")),
                peer("10.0.0.5", Some("AABBCCDDEEFF")),
            ],
            &defaults(),
        );

        assert_eq!(registry.len(), 1);
        assert!(registry.context("10.0.0.5".parse().unwrap()).is_some());
    }

    #[test]
    fn test_distinct_peers_resolve_distinctly() {
        let registry = ClientContextRegistry::from_config(
            &[
                peer("10.0.0.5", Some("AABBCCDDEEFF")),
                peer("10.0.0.8", Some("001122334455")),
            ],
            &defaults(),
        );

        let first = registry.resolve("10.0.0.5".parse().unwrap());
        let second = registry.resolve("10.0.0.8".parse().unwrap());
        assert_ne!(first.mac, second.mac);
        assert_ne!(first.hostname, second.hostname);
    }

    #[test]
    fn test_ipv4_mapped_remote_matches_ipv4_peer() {
        let registry = ClientContextRegistry::from_config(
            &[peer("10.0.0.5", Some("AABBCCDDEEFF"))],
            &defaults(),
        );
        let mapped = IpAddr::V6(Ipv6Addr::new(0, 0, 0, 0, 0, 0xffff, 0x0a00, 0x0005));

        assert_eq!(registry.resolve(mapped).mac, "AABBCCDDEEFF");
    }
}
