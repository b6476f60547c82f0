use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::{bail, Context, Result};
use ::config::{Config, Environment};
use serde::{Deserialize, Serialize};

/// Resolver-side DNS configuration, loaded from the `DNS_*`
/// environment group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Per-tick base timeout in seconds; also the next-wake fallback
    /// when no upstream TTL was observed.
    #[serde(default = "default_resolver_timeout")]
    pub timeout: u64,
}

impl ResolverConfig {
    pub fn from_env() -> Result<Self> {
        let cfg: Self = Config::builder()
            .add_source(
                Environment::with_prefix("DNS")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("servers")
                    .with_list_parse_key("domains"),
            )
            .build()
            .context("failed building DNS environment source")?
            .try_deserialize()
            .context("failed parsing DNS_* environment")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        for server in &self.servers {
            server.parse::<SocketAddr>().with_context(|| {
                format!("DNS_SERVERS entry {server} must be an address:port pair")
            })?;
        }

        if self.timeout == 0 {
            bail!("DNS_TIMEOUT must be non-zero");
        }

        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_resolver_timeout() -> u64 {
    5
}

/// Container-DNS server configuration, loaded from the same `DNS_*`
/// group as the resolver flavor (the two flavors are separate
/// binaries and never share a process).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerDnsConfig {
    #[serde(default = "default_dns_address")]
    pub address: String,
    #[serde(default = "default_dns_network")]
    pub network: String,
}

impl ContainerDnsConfig {
    pub fn from_env() -> Result<Self> {
        let cfg: Self = Config::builder()
            .add_source(Environment::with_prefix("DNS").try_parsing(true))
            .build()
            .context("failed building DNS environment source")?
            .try_deserialize()
            .context("failed parsing DNS_* environment")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            bail!("DNS_ADDRESS must not be empty");
        }
        if self.network != "udp" {
            bail!("DNS_NETWORK {} is not supported; only udp", self.network);
        }
        Ok(())
    }
}

fn default_dns_address() -> String {
    ":53".to_string()
}

fn default_dns_network() -> String {
    "udp".to_string()
}

/// BGP server configuration, loaded from the `BGP_*` group with path
/// attributes under `BGP_ATTRIBUTES_*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BgpConfig {
    #[serde(default)]
    pub clients: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bgp_network")]
    pub network: String,
    #[serde(default = "default_bgp_address")]
    pub address: String,
    #[serde(default = "default_router_id")]
    pub router_id: String,
    #[serde(skip)]
    pub attributes: AttributesConfig,
}

impl BgpConfig {
    pub fn from_env() -> Result<Self> {
        let mut cfg: Self = Config::builder()
            .add_source(
                Environment::with_prefix("BGP")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("clients"),
            )
            .build()
            .context("failed building BGP environment source")?
            .try_deserialize()
            .context("failed parsing BGP_* environment")?;

        cfg.attributes = Config::builder()
            .add_source(Environment::with_prefix("BGP_ATTRIBUTES").try_parsing(true))
            .build()
            .context("failed building BGP_ATTRIBUTES environment source")?
            .try_deserialize()
            .context("failed parsing BGP_ATTRIBUTES_* environment")?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        self.router_id
            .parse::<Ipv4Addr>()
            .with_context(|| format!("BGP_ROUTER_ID {} must be an IPv4 address", self.router_id))?;

        for client in &self.clients {
            client.parse::<IpAddr>().with_context(|| {
                format!("BGP_CLIENTS entry {client} must be an IP address")
            })?;
        }

        if self.network != "tcp" {
            bail!("BGP_NETWORK {} is not supported; only tcp", self.network);
        }

        if self.address.is_empty() {
            bail!("BGP_ADDRESS must not be empty");
        }

        self.attributes.validate()
    }
}

fn default_bgp_network() -> String {
    "tcp".to_string()
}

fn default_bgp_address() -> String {
    ":51179".to_string()
}

fn default_router_id() -> String {
    "127.0.0.1".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributesConfig {
    #[serde(default = "default_next_hop")]
    pub next_hop: String,
    #[serde(default = "default_local_pref")]
    pub local_pref: u32,
}

impl Default for AttributesConfig {
    fn default() -> Self {
        Self {
            next_hop: default_next_hop(),
            local_pref: default_local_pref(),
        }
    }
}

impl AttributesConfig {
    pub fn validate(&self) -> Result<()> {
        self.next_hop.parse::<Ipv4Addr>().with_context(|| {
            format!(
                "BGP_ATTRIBUTES_NEXT_HOP {} must be an IPv4 address",
                self.next_hop
            )
        })?;
        Ok(())
    }
}

fn default_next_hop() -> String {
    "192.168.88.1".to_string()
}

fn default_local_pref() -> u32 {
    100
}

/// RouterOS (Mikrotik) static-DNS helper configuration, loaded from
/// the `ROUTER_*` group. Disabled by default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_router_address")]
    pub address: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_router_user")]
    pub username: String,
    #[serde(default = "default_router_user")]
    pub password: String,
}

impl RouterConfig {
    pub fn from_env() -> Result<Self> {
        let cfg: Self = Config::builder()
            .add_source(Environment::with_prefix("ROUTER").try_parsing(true))
            .build()
            .context("failed building ROUTER environment source")?
            .try_deserialize()
            .context("failed parsing ROUTER_* environment")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if self.address.is_empty() {
            bail!("empty RouterOS address");
        }
        if self.username.is_empty() {
            bail!("empty RouterOS username");
        }
        if self.password.is_empty() {
            bail!("empty RouterOS password");
        }

        Ok(())
    }
}

fn default_router_address() -> String {
    "192.168.88.1".to_string()
}

fn default_router_user() -> String {
    "admin".to_string()
}

/// Logging configuration, loaded from the `LOGGER_*` group. The
/// level is a tracing env-filter directive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl LoggerConfig {
    pub fn from_env() -> Result<Self> {
        Config::builder()
            .add_source(Environment::with_prefix("LOGGER").try_parsing(true))
            .build()
            .context("failed building LOGGER environment source")?
            .try_deserialize()
            .context("failed parsing LOGGER_* environment")
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
