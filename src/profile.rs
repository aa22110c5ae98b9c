//! Connection profile handed to the overlay engine.
//!
//! Only the sections this service fills in are modelled. The engine reads the
//! rendered YAML directly.

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// How a node should behave on the overlay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub name: String,
    /// Comma separated group list
    pub groups: String,
    pub am_lighthouse: bool,
    pub punch: bool,
    pub am_relay: bool,
    pub use_relays: bool,
    pub use_tun: bool,
    pub tun_dev_name: String,
    pub accept_outbound: bool,
    pub accept_inbound: bool,
}

impl NodeSpec {
    /// The coordinator's own node: lighthouse and relay with a TUN device.
    pub fn server(tun_dev_name: &str) -> Self {
        Self {
            name: "server".to_string(),
            groups: "server".to_string(),
            am_lighthouse: true,
            punch: true,
            am_relay: true,
            use_relays: true,
            use_tun: true,
            tun_dev_name: tun_dev_name.to_string(),
            accept_outbound: true,
            accept_inbound: true,
        }
    }

    /// A userspace client that only accepts inbound traffic.
    pub fn client(name: &str) -> Self {
        Self {
            name: name.to_string(),
            groups: "client".to_string(),
            am_lighthouse: false,
            punch: false,
            am_relay: false,
            use_relays: false,
            use_tun: false,
            tun_dev_name: String::new(),
            accept_outbound: false,
            accept_inbound: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkiSettings {
    pub ca: String,
    pub cert: String,
    /// Empty when the node keeps its own private key
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LighthouseSettings {
    #[serde(default)]
    pub am_lighthouse: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunchySettings {
    pub punch: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaySettings {
    pub am_relay: bool,
    pub use_relays: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunSettings {
    pub disabled: bool,
    #[serde(default)]
    pub dev: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub port: String,
    pub proto: String,
    pub host: String,
}

impl FirewallRule {
    pub fn any() -> Self {
        Self {
            port: "any".to_string(),
            proto: "any".to_string(),
            host: "any".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbound: Option<Vec<FirewallRule>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbound: Option<Vec<FirewallRule>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Inbound port forward: `PORT:DIAL_ADDRESS:tcp|udp|both`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub listen_port: u16,
    pub dial_address: String,
    pub protocols: Vec<Protocol>,
}

impl FromStr for PortMapping {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            AppError::validation(format!(
                "invalid port mapping format: '{s}'. expected format: PORT:DIAL_ADDRESS:tcp/udp/both"
            ))
        };

        let (port, rest) = s.split_once(':').ok_or_else(invalid)?;
        let (dial_address, protocol) = rest.rsplit_once(':').ok_or_else(invalid)?;

        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let listen_port = port
            .parse::<u16>()
            .map_err(|e| AppError::validation(format!("invalid port number in mapping '{s}': {e}")))?;

        let dial_address = dial_address.trim();
        if dial_address.is_empty() {
            return Err(AppError::validation(format!(
                "DIAL_ADDRESS cannot be empty in mapping '{s}'"
            )));
        }

        let protocols = match protocol {
            "tcp" => vec![Protocol::Tcp],
            "udp" => vec![Protocol::Udp],
            "both" => vec![Protocol::Tcp, Protocol::Udp],
            _ => return Err(invalid()),
        };

        Ok(Self {
            listen_port,
            dial_address: dial_address.to_string(),
            protocols,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForwardingSettings {
    pub inbound: Vec<PortMapping>,
}

/// Rendered overlay settings for one node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    pub pki: PkiSettings,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub static_host_map: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub lighthouse: LighthouseSettings,
    #[serde(default)]
    pub punchy: PunchySettings,
    #[serde(default)]
    pub relay: RelaySettings,
    #[serde(default)]
    pub tun: TunSettings,
    #[serde(default)]
    pub firewall: FirewallSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<ListenSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_forwarding: Option<PortForwardingSettings>,
}

impl ConnectionProfile {
    /// Build the profile for `spec` around an already signed certificate.
    pub fn new(spec: &NodeSpec, ca_pem: &str, cert_pem: &str, key_pem: &str) -> Self {
        let rules = || Some(vec![FirewallRule::any()]);
        Self {
            pki: PkiSettings {
                ca: ca_pem.to_string(),
                cert: cert_pem.to_string(),
                key: key_pem.to_string(),
            },
            static_host_map: BTreeMap::new(),
            lighthouse: LighthouseSettings {
                am_lighthouse: spec.am_lighthouse,
                hosts: Vec::new(),
            },
            punchy: PunchySettings { punch: spec.punch },
            relay: RelaySettings {
                am_relay: spec.am_relay,
                use_relays: spec.use_relays,
            },
            tun: TunSettings {
                disabled: !spec.use_tun,
                dev: spec.tun_dev_name.clone(),
            },
            firewall: FirewallSettings {
                outbound: if spec.accept_outbound { rules() } else { None },
                inbound: if spec.accept_inbound { rules() } else { None },
            },
            listen: None,
            port_forwarding: None,
        }
    }

    /// Point the node at a lighthouse reachable on `public_addrs`.
    pub fn apply_lighthouse(&mut self, overlay_addr: &str, public_addrs: Vec<String>) {
        self.static_host_map
            .insert(overlay_addr.to_string(), public_addrs);
        self.lighthouse.hosts = vec![overlay_addr.to_string()];
    }

    /// Set the listen section from `host:port`; IPv6 hosts use `[::]:port`.
    pub fn apply_listen(&mut self, listen_addr: &str) -> AppResult<()> {
        let addr = listen_addr
            .trim()
            .parse::<SocketAddr>()
            .map_err(|e| AppError::validation(format!("splitting address {listen_addr}: {e}")))?;
        self.listen = Some(ListenSettings {
            host: addr.ip().to_string(),
            port: addr.port(),
        });
        Ok(())
    }

    pub fn apply_port_mappings(&mut self, mappings: Vec<PortMapping>) {
        self.port_forwarding = Some(PortForwardingSettings { inbound: mappings });
    }

    pub fn set_private_key(&mut self, key_pem: &str) {
        self.pki.key = key_pem.to_string();
    }

    pub fn to_yaml(&self) -> AppResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_yaml(input: &str) -> AppResult<Self> {
        Ok(serde_yaml::from_str(input)?)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_mapping_parsing() {
        let mapping: PortMapping = "8080:127.0.0.1:80:both".parse().unwrap();
        assert_eq!(mapping.listen_port, 8080);
        assert_eq!(mapping.dial_address, "127.0.0.1:80");
        assert_eq!(mapping.protocols, vec![Protocol::Tcp, Protocol::Udp]);

        let mapping: PortMapping = "53:dns.local:53:udp".parse().unwrap();
        assert_eq!(mapping.protocols, vec![Protocol::Udp]);
    }

    #[test]
    fn test_port_mapping_rejects_bad_input() {
        for input in [
            "abc:127.0.0.1:tcp",
            "80::tcp",
            "80:host:sctp",
            "99999:host:tcp",
            "80",
            ":host:tcp",
        ] {
            assert!(
                matches!(input.parse::<PortMapping>(), Err(AppError::Validation(_))),
                "{input} should be rejected"
            );
        }
    }

    #[test]
    fn test_client_firewall_inbound_only() {
        let profile = ConnectionProfile::new(&NodeSpec::client("c1"), "ca", "cert", "key");
        assert!(profile.firewall.inbound.is_some());
        assert!(profile.firewall.outbound.is_none());
        assert!(profile.tun.disabled);

        let yaml = profile.to_yaml().unwrap();
        assert!(!yaml.contains("outbound"));
        assert!(!yaml.contains("listen"));
    }

    #[test]
    fn test_server_profile_flags() {
        let profile = ConnectionProfile::new(&NodeSpec::server("nebula1"), "ca", "cert", "key");
        assert!(profile.lighthouse.am_lighthouse);
        assert!(profile.punchy.punch);
        assert!(profile.relay.am_relay && profile.relay.use_relays);
        assert!(!profile.tun.disabled);
        assert_eq!(profile.tun.dev, "nebula1");
        assert!(profile.firewall.outbound.is_some());
    }

    #[test]
    fn test_apply_listen() {
        let mut profile = ConnectionProfile::default();
        profile.apply_listen("0.0.0.0:4242").unwrap();
        assert_eq!(
            profile.listen,
            Some(ListenSettings {
                host: "0.0.0.0".to_string(),
                port: 4242
            })
        );

        profile.apply_listen("[::]:4243").unwrap();
        assert_eq!(profile.listen.as_ref().unwrap().host, "::");

        assert!(profile.apply_listen("no-port").is_err());
    }

    #[test]
    fn test_yaml_round_trip_with_routing() {
        let mut profile = ConnectionProfile::new(&NodeSpec::client("c1"), "ca", "cert", "");
        profile.apply_lighthouse("10.0.0.1", vec!["203.0.113.5:4242".to_string()]);
        profile.apply_port_mappings(vec!["2222:127.0.0.1:22:tcp".parse().unwrap()]);

        let yaml = profile.to_yaml().unwrap();
        assert!(yaml.contains("static_host_map"));
        assert!(yaml.contains("listen_port: 2222"));
        assert!(!yaml.contains("key:"));

        let parsed = ConnectionProfile::from_yaml(&yaml).unwrap();
        assert_eq!(parsed, profile);
        assert_eq!(parsed.lighthouse.hosts, vec!["10.0.0.1"]);
    }
}
