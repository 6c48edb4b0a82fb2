//! Configuration module for Wallet Guardian
//!
//! Every tunable is read from the environment once at startup.
//! Addresses and chain metadata come from utils/constants.rs.

use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::models::errors::{AppError, AppResult, ErrorCode};
use crate::utils::constants::{
    build_alchemy_url, get_chain_name, get_public_rpc_fallback, SUPPORTED_CHAIN_IDS,
};

/// RPC endpoints for one chain (primary first, then fallbacks)
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
}

impl ChainConfig {
    /// Alchemy key from the environment. The key is never logged.
    fn get_alchemy_key() -> Option<String> {
        std::env::var("ALCHEMY_API_KEY")
            .ok()
            .filter(|k| !k.is_empty() && k != "YOUR_API_KEY")
    }

    /// Resolve endpoints: `RPC_URL_<chain>` override, then Alchemy, then public fallback
    pub fn resolve(chain_id: u64) -> Option<ChainConfig> {
        if !SUPPORTED_CHAIN_IDS.contains(&chain_id) {
            return None;
        }

        let mut rpc_urls = Vec::new();
        if let Ok(url) = std::env::var(format!("RPC_URL_{}", chain_id)) {
            if !url.is_empty() {
                rpc_urls.push(url);
            }
        }
        if let Some(url) = Self::get_alchemy_key().and_then(|k| build_alchemy_url(chain_id, &k)) {
            rpc_urls.push(url);
        }
        if let Some(url) = get_public_rpc_fallback(chain_id) {
            rpc_urls.push(url.to_string());
        }

        Some(ChainConfig {
            chain_id,
            name: get_chain_name(chain_id).to_string(),
            rpc_urls,
        })
    }

    pub fn has_alchemy() -> bool {
        Self::get_alchemy_key().is_some()
    }
}

/// Pre-simulation backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimBackendKind {
    /// eth_call + eth_estimateGas against the chain's RPC
    Rpc,
    /// Local REVM execution over chain state fetched on demand
    Revm,
}

impl FromStr for SimBackendKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rpc" => Ok(Self::Rpc),
            "revm" => Ok(Self::Revm),
            other => Err(AppError::new(
                ErrorCode::ConfigInvalidValue,
                format!("SIM_BACKEND must be rpc or revm, got {}", other),
            )),
        }
    }
}

/// Retry policy for outbound calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_millis(2000),
        }
    }
}

/// Service configuration
#[derive(Debug, Clone)]
pub struct GuardianConfig {
    pub host: String,
    pub port: u16,
    /// Per-probe timeout
    pub probe_timeout: Duration,
    /// Extra time past the longest probe timeout before a session is closed
    pub session_grace: Duration,
    /// Max wait for a slow stream consumer before the session is torn down
    pub stream_send_timeout: Duration,
    pub evidence_ttl_secs: u64,
    /// How long expired evidence is kept for stale fallback
    pub evidence_stale_retention: Duration,
    pub evidence_cache_capacity: usize,
    pub rate_limit_ip_per_min: u32,
    pub rate_limit_user_per_min: u32,
    pub idempotency_ttl: Duration,
    /// How long a duplicate submission waits for an in-flight claim
    pub idempotency_wait: Duration,
    pub sim_backend: SimBackendKind,
    pub retry: RetryConfig,
    /// Blocks scanned back for Approval logs
    pub approval_lookback_blocks: u64,
    /// Optional JSON file with extra flagged counterparties
    pub labels_path: Option<PathBuf>,
    /// Shared KV store; in-memory store when absent
    pub redis_url: Option<String>,
    /// How long persisted scan records are kept
    pub scan_retention: Duration,
    /// Peers whose forwarding and `X-User-Id` headers are believed
    pub trusted_proxies: Vec<IpAddr>,
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            probe_timeout: Duration::from_millis(5000),
            session_grace: Duration::from_millis(1000),
            stream_send_timeout: Duration::from_millis(10_000),
            evidence_ttl_secs: 300,
            evidence_stale_retention: Duration::from_secs(86_400),
            evidence_cache_capacity: 10_000,
            rate_limit_ip_per_min: 10,
            rate_limit_user_per_min: 20,
            idempotency_ttl: Duration::from_secs(300),
            idempotency_wait: Duration::from_millis(15_000),
            sim_backend: SimBackendKind::Rpc,
            retry: RetryConfig::default(),
            approval_lookback_blocks: 500_000,
            labels_path: None,
            redis_url: None,
            scan_retention: Duration::from_secs(30 * 86_400),
            trusted_proxies: Vec::new(),
        }
    }
}

impl GuardianConfig {
    /// Load from environment variables, falling back to defaults
    pub fn from_env() -> AppResult<Self> {
        let d = Self::default();

        let config = Self {
            host: std::env::var("GUARDIAN_HOST").unwrap_or(d.host),
            port: env_parse("GUARDIAN_PORT", d.port)?,
            probe_timeout: Duration::from_millis(env_parse("PROBE_TIMEOUT_MS", 5000u64)?),
            session_grace: Duration::from_millis(env_parse("SESSION_GRACE_MS", 1000u64)?),
            stream_send_timeout: Duration::from_millis(env_parse(
                "STREAM_SEND_TIMEOUT_MS",
                10_000u64,
            )?),
            evidence_ttl_secs: env_parse("EVIDENCE_TTL_SECS", d.evidence_ttl_secs)?,
            evidence_stale_retention: Duration::from_secs(env_parse(
                "EVIDENCE_STALE_RETENTION_SECS",
                86_400u64,
            )?),
            evidence_cache_capacity: env_parse(
                "EVIDENCE_CACHE_CAPACITY",
                d.evidence_cache_capacity,
            )?,
            rate_limit_ip_per_min: env_parse("RATE_LIMIT_IP_PER_MIN", d.rate_limit_ip_per_min)?,
            rate_limit_user_per_min: env_parse(
                "RATE_LIMIT_USER_PER_MIN",
                d.rate_limit_user_per_min,
            )?,
            idempotency_ttl: Duration::from_secs(env_parse("IDEMPOTENCY_TTL_SECS", 300u64)?),
            idempotency_wait: Duration::from_millis(env_parse("IDEMPOTENCY_WAIT_MS", 15_000u64)?),
            sim_backend: match std::env::var("SIM_BACKEND") {
                Ok(v) if !v.is_empty() => v.parse()?,
                _ => d.sim_backend,
            },
            retry: RetryConfig {
                max_attempts: env_parse("RETRY_MAX_ATTEMPTS", d.retry.max_attempts)?,
                base_delay: Duration::from_millis(env_parse("RETRY_BASE_MS", 250u64)?),
                max_delay: Duration::from_millis(env_parse("RETRY_MAX_MS", 2000u64)?),
            },
            approval_lookback_blocks: env_parse(
                "APPROVAL_LOOKBACK_BLOCKS",
                d.approval_lookback_blocks,
            )?,
            labels_path: std::env::var("GUARDIAN_LABELS_PATH")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
            redis_url: std::env::var("REDIS_URL").ok().filter(|u| !u.is_empty()),
            scan_retention: Duration::from_secs(env_parse(
                "SCAN_RETENTION_SECS",
                d.scan_retention.as_secs(),
            )?),
            trusted_proxies: parse_proxy_list(
                &std::env::var("TRUSTED_PROXIES").unwrap_or_default(),
            ),
        };

        config.validate()?;

        if ChainConfig::has_alchemy() {
            info!("🔑 ALCHEMY_API_KEY configured (key hidden)");
        } else {
            warn!("ALCHEMY_API_KEY not set; approval and transfer evidence will be unavailable");
        }

        Ok(config)
    }

    /// Reject values that would break invariants downstream
    pub fn validate(&self) -> AppResult<()> {
        if self.probe_timeout.is_zero() {
            return Err(invalid("PROBE_TIMEOUT_MS must be > 0"));
        }
        if self.evidence_ttl_secs == 0 {
            return Err(invalid("EVIDENCE_TTL_SECS must be > 0"));
        }
        if self.rate_limit_ip_per_min == 0 || self.rate_limit_user_per_min == 0 {
            return Err(invalid("rate limits must be > 0"));
        }
        if self.scan_retention.is_zero() {
            return Err(invalid("SCAN_RETENTION_SECS must be > 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("RETRY_MAX_ATTEMPTS must be >= 1"));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(invalid("RETRY_BASE_MS must not exceed RETRY_MAX_MS"));
        }
        Ok(())
    }

    /// Hard deadline for a session, measured from its start
    pub fn session_deadline(&self) -> Duration {
        self.probe_timeout + self.session_grace
    }
}

fn invalid(msg: &str) -> AppError {
    AppError::new(ErrorCode::ConfigInvalidValue, msg)
}

/// Comma-separated IPs; bad entries are skipped with a warning
pub fn parse_proxy_list(raw: &str) -> Vec<IpAddr> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match entry.parse::<IpAddr>() {
            Ok(ip) => Some(ip),
            Err(_) => {
                warn!("⚠️ TRUSTED_PROXIES entry {:?} is not an IP, skipping", entry);
                None
            }
        })
        .collect()
}

/// Unparseable values fall back to the default
fn env_parse<T: FromStr>(key: &str, default: T) -> AppResult<T> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => match raw.trim().parse::<T>() {
            Ok(value) => Ok(value),
            Err(_) => {
                warn!("⚠️ {} has invalid value {:?}, using default", key, raw);
                Ok(default)
            }
        },
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = GuardianConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rate_limit_ip_per_min, 10);
        assert_eq!(config.rate_limit_user_per_min, 20);
        assert_eq!(config.idempotency_ttl, Duration::from_secs(300));
        assert_eq!(config.session_deadline(), Duration::from_millis(6000));
    }

    #[test]
    fn test_sim_backend_parse() {
        assert_eq!("REVM".parse::<SimBackendKind>().unwrap(), SimBackendKind::Revm);
        assert_eq!("rpc".parse::<SimBackendKind>().unwrap(), SimBackendKind::Rpc);
        let err = "tenderly".parse::<SimBackendKind>().unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigInvalidValue);
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut config = GuardianConfig::default();
        config.retry.base_delay = Duration::from_secs(5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_proxy_list_skips_bad_entries() {
        let proxies = parse_proxy_list(" 10.0.0.1, nope ,::1,");
        assert_eq!(
            proxies,
            vec!["10.0.0.1".parse::<IpAddr>().unwrap(), "::1".parse().unwrap()]
        );
        assert!(parse_proxy_list("").is_empty());
        assert!(GuardianConfig::default().trusted_proxies.is_empty());
    }

    #[test]
    fn test_chain_resolution() {
        assert!(ChainConfig::resolve(999).is_none());
        let eth = ChainConfig::resolve(1).unwrap();
        assert_eq!(eth.name, "Ethereum");
        assert!(eth
            .rpc_urls
            .iter()
            .any(|u| u == "https://eth.llamarpc.com"));
    }
}
