//! Gateway configuration (env-driven).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use protogate_detect::SharedProtocol;
use protogate_gateway::balancer::DEFAULT_STICKY_CACHE_SIZE;
use protogate_gateway::{BridgeConfig, StickyKeySource, Strategy};

const DEFAULT_BIND_ADDR: &str = "[::]:61613";
const DEFAULT_PROTOCOLS: &str = "tls,amqp,mqtt,openwire,stomp,http";

/// Where TLS connections go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsSetting {
    Passthrough,
    Terminate { cert_file: PathBuf, key_file: PathBuf },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// One listener per address.
    pub bind_addrs: Vec<SocketAddr>,

    /// Enabled protocols in priority order.
    pub protocols: Vec<SharedProtocol>,

    pub default_virtual_host: Option<String>,

    pub strategy: Strategy,

    pub sticky_key: StickyKeySource,

    pub idle_timeout: Duration,

    pub connect_timeout: Duration,

    pub connect_attempts: usize,

    pub max_handshake_bytes: usize,

    pub bridge: BridgeConfig,

    pub max_connections: usize,

    pub tls: TlsSetting,

    /// Discovery document to watch, if any.
    pub discovery_file: Option<PathBuf>,

    pub discovery_poll_interval: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let bind_addrs = var("GATEWAY_BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
            .split(',')
            .map(|addr| {
                addr.trim()
                    .parse::<SocketAddr>()
                    .with_context(|| format!("GATEWAY_BIND_ADDR: invalid address {addr:?}"))
            })
            .collect::<Result<Vec<_>>>()?;

        let protocols = var("GATEWAY_PROTOCOLS")
            .unwrap_or_else(|| DEFAULT_PROTOCOLS.to_string())
            .split(',')
            .map(|name| {
                protogate_detect::builtin(name)
                    .with_context(|| format!("GATEWAY_PROTOCOLS: unknown protocol {name:?}"))
            })
            .collect::<Result<Vec<_>>>()?;
        if protocols.is_empty() {
            bail!("GATEWAY_PROTOCOLS must name at least one protocol.");
        }

        let default_virtual_host = var("GATEWAY_DEFAULT_VIRTUAL_HOST");

        let cache_size = parse_number(&var, "GATEWAY_STICKY_CACHE_SIZE", DEFAULT_STICKY_CACHE_SIZE)?;
        let strategy_name = var("GATEWAY_LB_STRATEGY").unwrap_or_else(|| "round-robin".to_string());
        let strategy = match Strategy::parse(&strategy_name) {
            Some(Strategy::Sticky { .. }) => {
                let fallback_name =
                    var("GATEWAY_STICKY_FALLBACK").unwrap_or_else(|| "random".to_string());
                let fallback = match Strategy::parse(&fallback_name) {
                    Some(Strategy::Sticky { .. }) | None => bail!(
                        "GATEWAY_STICKY_FALLBACK must be random or round-robin, got {fallback_name:?}."
                    ),
                    Some(fallback) => fallback,
                };
                Strategy::sticky(fallback, cache_size.max(1))
            }
            Some(strategy) => strategy,
            None => bail!(
                "GATEWAY_LB_STRATEGY must be random, round-robin or sticky, got {strategy_name:?}."
            ),
        };

        let sticky_key = match var("GATEWAY_STICKY_KEY") {
            Some(raw) => StickyKeySource::parse(&raw).with_context(|| {
                format!("GATEWAY_STICKY_KEY must be remote-address or virtual-host-user, got {raw:?}.")
            })?,
            None => StickyKeySource::default(),
        };

        let idle_timeout = Duration::from_millis(parse_number(&var, "GATEWAY_IDLE_TIMEOUT_MS", 10_000)?);
        let connect_timeout =
            Duration::from_millis(parse_number(&var, "GATEWAY_CONNECT_TIMEOUT_MS", 2_000)?);
        let connect_attempts = parse_number(&var, "GATEWAY_CONNECT_ATTEMPTS", 3usize)?.max(1);
        let max_handshake_bytes = parse_number(&var, "GATEWAY_MAX_HANDSHAKE_BYTES", 65_536usize)?;
        let bridge = BridgeConfig {
            buffer_size: parse_number(&var, "GATEWAY_RELAY_BUFFER_BYTES", 16_384usize)?.max(512),
            half_close_grace: Duration::from_millis(parse_number(
                &var,
                "GATEWAY_HALF_CLOSE_GRACE_MS",
                5_000,
            )?),
        };
        let max_connections = parse_number(&var, "GATEWAY_MAX_CONNECTIONS", 10_000usize)?.max(1);

        let tls = match var("GATEWAY_TLS_MODE").as_deref().map(str::to_ascii_lowercase) {
            None => TlsSetting::Passthrough,
            Some(mode) if mode == "passthrough" => TlsSetting::Passthrough,
            Some(mode) if mode == "terminate" => TlsSetting::Terminate {
                cert_file: var("GATEWAY_TLS_CERT_FILE")
                    .map(PathBuf::from)
                    .context("GATEWAY_TLS_CERT_FILE is required when GATEWAY_TLS_MODE=terminate.")?,
                key_file: var("GATEWAY_TLS_KEY_FILE")
                    .map(PathBuf::from)
                    .context("GATEWAY_TLS_KEY_FILE is required when GATEWAY_TLS_MODE=terminate.")?,
            },
            Some(mode) => bail!("GATEWAY_TLS_MODE must be passthrough or terminate, got {mode:?}."),
        };

        let discovery_file = var("GATEWAY_DISCOVERY_FILE").map(PathBuf::from);
        let discovery_poll_interval =
            Duration::from_millis(parse_number(&var, "GATEWAY_DISCOVERY_POLL_MS", 2_000u64)?.max(50));

        let log_level = var("GATEWAY_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            bind_addrs,
            protocols,
            default_virtual_host,
            strategy,
            sticky_key,
            idle_timeout,
            connect_timeout,
            connect_attempts,
            max_handshake_bytes,
            bridge,
            max_connections,
            tls,
            discovery_file,
            discovery_poll_interval,
            log_level,
        })
    }
}

fn parse_number<T, F>(var: &F, name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    var(name)
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{name} must be a non-negative integer."))
        .map(|v| v.unwrap_or(default))
}
