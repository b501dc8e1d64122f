//! The typed configuration tree.
//!
//! Every field has a default, so an empty (or absent) file yields a
//! working local resolver.  The file is loaded once at startup and
//! re-read on SIGUSR1; readers hold an `Arc<Settings>` snapshot for
//! the duration of a query, so a reload never changes the rules
//! mid-resolution.

use config::{Config, ConfigError, File};
use ipnet::IpNet;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub server: ServerSettings,
    pub upstreams: Vec<UpstreamSettings>,
    pub cache: CacheSettings,
    pub security: SecuritySettings,
    pub forwarder: ForwarderSettings,
}

impl Settings {
    /// Load settings from a file, filling anything unspecified with
    /// the defaults.
    pub fn new(filename: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name(filename))
            .build()?
            .try_deserialize()
    }

    /// The addresses to forward to, in declared order.
    pub fn upstream_addrs(&self) -> Vec<SocketAddr> {
        self.upstreams
            .iter()
            .map(UpstreamSettings::socket_addr)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSettings {
    /// IP address the DNS sockets bind on.
    pub bind_address: IpAddr,

    /// Port the DNS sockets bind on.
    pub dns_port: u16,

    /// Worker threads for the runtime.  Zero means one per core.
    pub workers: usize,

    /// Cap on queries being processed at once; excess queries are
    /// refused.
    pub max_concurrent_requests: usize,

    /// Depth of the per-socket response queues.
    pub request_queue_size: usize,

    /// Seconds a TCP connection may sit idle between queries.
    pub connection_timeout: u64,

    /// Seconds to let in-flight queries finish at shutdown.
    pub shutdown_grace: u64,
}

impl ServerSettings {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.dns_port)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            dns_port: 5353,
            workers: 0,
            max_concurrent_requests: 1000,
            request_queue_size: 64,
            connection_timeout: 10,
            shutdown_grace: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamSettings {
    pub address: IpAddr,
    #[serde(default = "default_dns_port")]
    pub port: u16,
}

impl UpstreamSettings {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

fn default_dns_port() -> u16 {
    53
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSettings {
    /// Cap on the summed serialised size of cached responses.
    pub max_size_bytes: usize,

    /// Record TTLs are clamped to this range on the way in.
    pub min_ttl: u32,
    pub max_ttl: u32,

    /// TTL for NXDOMAIN / NODATA entries, unless the answer's SOA
    /// MINIMUM is lower.
    pub negative_ttl: u32,

    /// Where to save the cache at shutdown and load it from at
    /// startup.  Unset disables persistence.
    pub persist_path: Option<PathBuf>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_size_bytes: 10 * 1024 * 1024,
            min_ttl: 0,
            max_ttl: 86400,
            negative_ttl: 300,
            persist_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecuritySettings {
    /// Queries allowed per client IP per minute.  Zero disables rate
    /// limiting.
    pub rate_limit_per_ip: u32,

    /// Networks allowed to query, checked after `blocked_networks`.
    /// An empty list allows everything not blocked.
    pub allowed_networks: Vec<IpNet>,

    /// Networks whose queries are dropped without response.
    pub blocked_networks: Vec<IpNet>,

    /// Inbound packets and frames longer than this are treated as
    /// malformed.
    pub max_query_length: usize,

    /// Drop unparseable packets silently instead of answering
    /// FORMERR.
    pub block_malformed_requests: bool,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            rate_limit_per_ip: 0,
            allowed_networks: vec![
                "0.0.0.0/0".parse().expect("valid default network"),
                "::/0".parse().expect("valid default network"),
            ],
            blocked_networks: Vec::new(),
            max_query_length: 512,
            block_malformed_requests: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ForwarderSettings {
    /// Overall deadline for resolving one query, in seconds.
    pub query_timeout: u64,

    /// Timeout for a single upstream attempt, in seconds.
    pub per_attempt_timeout: u64,

    /// How many upstreams to try before giving up.
    pub max_attempts: u32,
}

impl ForwarderSettings {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout)
    }

    pub fn per_attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.per_attempt_timeout)
    }
}

impl Default for ForwarderSettings {
    fn default() -> Self {
        Self {
            query_timeout: 5,
            per_attempt_timeout: 2,
            max_attempts: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn from_toml(s: &str) -> Settings {
        Config::builder()
            .add_source(File::from_str(s, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn empty_config_is_default() {
        assert_eq!(Settings::default(), from_toml(""));
    }

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();

        assert!(settings.upstreams.is_empty());
        assert_eq!(512, settings.security.max_query_length);
        assert_eq!(0, settings.security.rate_limit_per_ip);
        assert_eq!(Duration::from_secs(5), settings.forwarder.query_timeout());
        assert_eq!(
            Duration::from_secs(2),
            settings.forwarder.per_attempt_timeout()
        );
    }

    #[test]
    fn upstream_port_defaults_to_53() {
        let settings = from_toml(
            r#"
            [[upstreams]]
            address = "8.8.8.8"

            [[upstreams]]
            address = "1.1.1.1"
            port = 5353
            "#,
        );

        let expected: Vec<SocketAddr> = vec![
            "8.8.8.8:53".parse().unwrap(),
            "1.1.1.1:5353".parse().unwrap(),
        ];
        assert_eq!(expected, settings.upstream_addrs());
    }

    #[test]
    fn sections_override_independently() {
        let settings = from_toml(
            r#"
            [cache]
            max_size_bytes = 1024
            negative_ttl = 60

            [security]
            rate_limit_per_ip = 5
            blocked_networks = ["10.66.0.0/16"]
            "#,
        );

        assert_eq!(1024, settings.cache.max_size_bytes);
        assert_eq!(60, settings.cache.negative_ttl);
        assert_eq!(86400, settings.cache.max_ttl);
        assert_eq!(5, settings.security.rate_limit_per_ip);
        assert_eq!(1, settings.security.blocked_networks.len());
        assert_eq!(ServerSettings::default(), settings.server);
    }
}
