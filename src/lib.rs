use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

pub mod cache_key;
pub mod error;
pub mod proxy;
pub mod rate_limit;
pub mod rewrite;
pub mod store;
pub mod upstream;

pub use cache_key::{derive_key, parse_query};
pub use error::ProxyError;
pub use proxy::{app, ProxyServer};
pub use rate_limit::RateLimiter;
pub use rewrite::AssetRewriter;
pub use store::{CacheStats, CacheStore};
pub use upstream::{ContentfulClient, Upstream, UpstreamCredential};

// Constants
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONFIG_PATH: &str = "/etc/conf.d/cms-proxy.yaml";
pub const ENV_SPACE_ID: &str = "CONTENTFUL_SPACE_ID";
pub const ENV_ACCESS_TOKEN: &str = "CONTENTFUL_ACCESS_TOKEN";

// Configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub cache: CacheConfig,
    pub assets: AssetsConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub listen: Vec<String>,
    /// Guards the cache admin routes when set.
    pub admin_key: Option<String>,
    pub request_timeout: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub space_id: String,
    pub access_token: String,
    pub timeout: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl: String,
    /// Periodic purge of expired entries; lazy expiry only when unset.
    pub sweep_interval: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AssetsConfig {
    pub upstream_host: String,
    pub public_host: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests: u32,
    pub window: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            listen: vec!["0.0.0.0".to_string()],
            admin_key: None,
            request_timeout: humantime::format_duration(DEFAULT_REQUEST_TIMEOUT).to_string(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: upstream::DEFAULT_UPSTREAM_BASE_URL.to_string(),
            space_id: String::new(),
            access_token: String::new(),
            timeout: humantime::format_duration(upstream::UPSTREAM_TIMEOUT).to_string(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: humantime::format_duration(store::DEFAULT_CACHE_TTL).to_string(),
            sweep_interval: None,
        }
    }
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            upstream_host: rewrite::DEFAULT_UPSTREAM_ASSET_HOST.to_string(),
            public_host: None,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests: 100,
            window: "15m".to_string(),
        }
    }
}

impl ServerConfig {
    /// One socket per `listen` entry; an empty list means all IPv4 interfaces.
    pub fn socket_addrs(&self) -> Result<Vec<SocketAddr>> {
        if self.listen.is_empty() {
            return Ok(vec![SocketAddr::from(([0, 0, 0, 0], self.port))]);
        }
        self.listen
            .iter()
            .map(|host| {
                let ip: IpAddr = host
                    .trim()
                    .trim_start_matches('[')
                    .trim_end_matches(']')
                    .parse()
                    .with_context(|| format!("invalid listen address {host:?}"))?;
                Ok(SocketAddr::new(ip, self.port))
            })
            .collect()
    }
}

impl UpstreamConfig {
    /// Both halves must be present, otherwise the proxy runs unconfigured.
    pub fn credential(&self) -> Option<UpstreamCredential> {
        let space_id = self.space_id.trim();
        let access_token = self.access_token.trim();
        if space_id.is_empty() || access_token.is_empty() {
            return None;
        }
        Some(UpstreamCredential {
            space_id: space_id.to_string(),
            access_token: access_token.to_string(),
        })
    }
}

impl AppConfig {
    pub fn from_yaml(data: &str) -> Result<Self> {
        serde_yaml::from_str(data).context("invalid configuration file")
    }

    /// Credentials from the environment take precedence over the file.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(space_id) = lookup(ENV_SPACE_ID) {
            self.upstream.space_id = space_id;
        }
        if let Some(token) = lookup(ENV_ACCESS_TOKEN) {
            self.upstream.access_token = token;
        }
    }
}

fn scaled_secs(count: &str, unit_secs: u64) -> Result<Duration> {
    let n: u64 = count.parse()?;
    n.checked_mul(unit_secs)
        .map(Duration::from_secs)
        .ok_or_else(|| anyhow!("duration {count:?} is too large"))
}

pub fn parse_ttl(ttl: &str) -> Result<Duration> {
    let ttl = ttl.trim();
    if let Some(stripped) = ttl.strip_suffix('y') {
        scaled_secs(stripped, 365 * 24 * 3600)
    } else if let Some(stripped) = ttl.strip_suffix('w') {
        scaled_secs(stripped, 7 * 24 * 3600)
    } else if let Some(stripped) = ttl.strip_suffix('d') {
        scaled_secs(stripped, 24 * 3600)
    } else {
        Ok(humantime::parse_duration(ttl)?)
    }
}

fn parse_positive(name: &str, value: &str) -> Result<Duration> {
    let d = parse_ttl(value).with_context(|| format!("invalid duration for {name}: {value:?}"))?;
    if d.is_zero() {
        return Err(anyhow!("{name} must be greater than zero"));
    }
    Ok(d)
}

pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.server.port == 0 {
        return Err(anyhow!("Invalid port"));
    }
    config.server.socket_addrs()?;
    if config.upstream.base_url.is_empty() {
        return Err(anyhow!("upstream.base_url required"));
    }
    parse_positive("server.request_timeout", &config.server.request_timeout)?;
    parse_positive("upstream.timeout", &config.upstream.timeout)?;
    parse_positive("cache.ttl", &config.cache.ttl)?;
    if let Some(interval) = &config.cache.sweep_interval {
        parse_positive("cache.sweep_interval", interval)?;
    }
    if config.rate_limit.enabled {
        if config.rate_limit.requests == 0 {
            return Err(anyhow!("rate_limit.requests must be greater than zero"));
        }
        parse_positive("rate_limit.window", &config.rate_limit.window)?;
    }
    if let Some(public) = &config.assets.public_host {
        if !rewrite::rewrite_is_stable(&config.assets.upstream_host, public) {
            return Err(anyhow!(
                "assets.public_host must not contain or overlap assets.upstream_host"
            ));
        }
    }
    Ok(())
}
