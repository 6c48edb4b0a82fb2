//! Constants Module - Single Source of Truth
//!
//! Chain metadata, probe weights, evidence TTLs and well-known addresses.
//! Other modules import from here instead of hardcoding values.

use alloy_primitives::{address, b256, Address, B256, U256};

// ============================================
// APPLICATION CONSTANTS
// ============================================

/// Application name
pub const APP_NAME: &str = "WalletGuardian";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// User-Agent for outbound HTTP requests
pub const USER_AGENT: &str = concat!("WalletGuardian/", env!("CARGO_PKG_VERSION"));

// ============================================
// RPC CONSTANTS
// ============================================

/// Default timeout for a single RPC request (seconds)
pub const DEFAULT_RPC_TIMEOUT_SECS: u64 = 10;

/// Gas limit used when simulating remediation calls
pub const SIMULATION_GAS_LIMIT: u64 = 1_000_000;

// ============================================
// CHAIN IDS
// ============================================

/// Ethereum Mainnet
pub const CHAIN_ID_ETHEREUM: u64 = 1;
/// BNB Smart Chain
pub const CHAIN_ID_BSC: u64 = 56;
/// Polygon
pub const CHAIN_ID_POLYGON: u64 = 137;
/// Arbitrum One
pub const CHAIN_ID_ARBITRUM: u64 = 42161;
/// Optimism
pub const CHAIN_ID_OPTIMISM: u64 = 10;
/// Base
pub const CHAIN_ID_BASE: u64 = 8453;

/// All supported EVM chain IDs
pub const SUPPORTED_CHAIN_IDS: [u64; 6] = [
    CHAIN_ID_ETHEREUM,
    CHAIN_ID_BSC,
    CHAIN_ID_POLYGON,
    CHAIN_ID_ARBITRUM,
    CHAIN_ID_OPTIMISM,
    CHAIN_ID_BASE,
];

/// Check if chain ID is supported
#[inline]
pub fn is_chain_supported(chain_id: u64) -> bool {
    SUPPORTED_CHAIN_IDS.contains(&chain_id)
}

/// Public RPC used when no Alchemy key is configured, and as failover target
pub fn get_public_rpc_fallback(chain_id: u64) -> Option<&'static str> {
    match chain_id {
        CHAIN_ID_ETHEREUM => Some("https://eth.llamarpc.com"),
        CHAIN_ID_BSC => Some("https://bsc-dataseed.binance.org"),
        CHAIN_ID_POLYGON => Some("https://polygon-rpc.com"),
        CHAIN_ID_ARBITRUM => Some("https://arb1.arbitrum.io/rpc"),
        CHAIN_ID_OPTIMISM => Some("https://mainnet.optimism.io"),
        CHAIN_ID_BASE => Some("https://mainnet.base.org"),
        _ => None,
    }
}

/// Alchemy subdomain for a chain
pub fn get_alchemy_subdomain(chain_id: u64) -> Option<&'static str> {
    match chain_id {
        CHAIN_ID_ETHEREUM => Some("eth-mainnet"),
        CHAIN_ID_BSC => Some("bnb-mainnet"),
        CHAIN_ID_POLYGON => Some("polygon-mainnet"),
        CHAIN_ID_ARBITRUM => Some("arb-mainnet"),
        CHAIN_ID_OPTIMISM => Some("opt-mainnet"),
        CHAIN_ID_BASE => Some("base-mainnet"),
        _ => None,
    }
}

/// Build Alchemy URL for a chain
pub fn build_alchemy_url(chain_id: u64, api_key: &str) -> Option<String> {
    get_alchemy_subdomain(chain_id)
        .map(|subdomain| format!("https://{}.g.alchemy.com/v2/{}", subdomain, api_key))
}

/// Chain display name
pub fn get_chain_name(chain_id: u64) -> &'static str {
    match chain_id {
        CHAIN_ID_ETHEREUM => "Ethereum",
        CHAIN_ID_BSC => "BNB Smart Chain",
        CHAIN_ID_POLYGON => "Polygon",
        CHAIN_ID_ARBITRUM => "Arbitrum One",
        CHAIN_ID_OPTIMISM => "Optimism",
        CHAIN_ID_BASE => "Base",
        _ => "Unknown",
    }
}

// ============================================
// PROBES
// ============================================

pub const PROBE_APPROVAL_EXPOSURE: &str = "approval_exposure";
pub const PROBE_COUNTERPARTY_REPUTATION: &str = "counterparty_reputation";
pub const PROBE_MIXER_EXPOSURE: &str = "mixer_exposure";

/// Aggregate weights; sum to 1.0
pub const WEIGHT_APPROVAL_EXPOSURE: f64 = 0.45;
pub const WEIGHT_COUNTERPARTY_REPUTATION: f64 = 0.35;
pub const WEIGHT_MIXER_EXPOSURE: f64 = 0.20;

/// Score added per unlimited / limited allowance
pub const SCORE_PER_UNLIMITED_APPROVAL: f64 = 25.0;
pub const SCORE_PER_LIMITED_APPROVAL: f64 = 10.0;
/// Score added per flagged counterparty
pub const SCORE_PER_FLAGGED_COUNTERPARTY: f64 = 40.0;
/// First mixer interaction, then each further one
pub const SCORE_FIRST_MIXER_INTERACTION: f64 = 70.0;
pub const SCORE_EXTRA_MIXER_INTERACTION: f64 = 15.0;

/// Allowances at or above 2^255 are treated as unlimited
pub fn unlimited_allowance_threshold() -> U256 {
    U256::from(1u8) << 255
}

/// ERC-20 `Approval(address,address,uint256)` topic
pub const APPROVAL_EVENT_TOPIC: B256 =
    b256!("8c5be1e5ebec7d5bd14f71427d1e84f3dd0314c0f7b2291e5b200ac8c7c3b925");

// ============================================
// CONFIDENCE
// ============================================

/// Evidence younger than this share of its TTL counts as fully fresh
pub const FRESHNESS_FULL_FRACTION: f64 = 0.5;
/// Freshness at exactly the TTL boundary
pub const FRESHNESS_AT_TTL: f64 = 0.75;
/// Freshness of stale-fallback evidence
pub const FRESHNESS_STALE: f64 = 0.5;
/// Lower bound for a non-failed session's confidence
pub const MIN_CONFIDENCE: f64 = 0.5;

// ============================================
// KNOWN ADDRESSES
// ============================================

/// Known mixer pool contracts (Tornado Cash, Ethereum mainnet)
pub const KNOWN_MIXERS: [(Address, &str); 5] = [
    (address!("722122dF12D4e14e13Ac3b6895a86e84145b6967"), "Tornado Cash: Router"),
    (address!("12D66f87A04A9E220743712cE6d9bB1B5616B8Fc"), "Tornado Cash: 0.1 ETH"),
    (address!("47CE0C6eD5B0Ce3d3A51fdb1C52DC66a7c3c2936"), "Tornado Cash: 1 ETH"),
    (address!("910Cbd523D972eb0a6f4cAe4618aD62622b39DbF"), "Tornado Cash: 10 ETH"),
    (address!("A160cdAB225685dA1d56aa342Ad8841c3b53f291"), "Tornado Cash: 100 ETH"),
];

/// Look up a mixer label
pub fn mixer_label(addr: &Address) -> Option<&'static str> {
    KNOWN_MIXERS
        .iter()
        .find(|(mixer, _)| mixer == addr)
        .map(|(_, label)| *label)
}

/// Built-in flagged counterparties, extended by GUARDIAN_LABELS_PATH
pub const DEFAULT_FLAGGED_COUNTERPARTIES: [(Address, &str); 1] = [(
    address!("098B716B8Aaf21512996dC57EB0615e2383E2f96"),
    "Ronin Bridge Exploiter",
)];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weights_sum_to_one() {
        let sum = WEIGHT_APPROVAL_EXPOSURE + WEIGHT_COUNTERPARTY_REPUTATION + WEIGHT_MIXER_EXPOSURE;
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_mixer_lookup() {
        let router = KNOWN_MIXERS[0].0;
        assert_eq!(mixer_label(&router), Some("Tornado Cash: Router"));
        assert_eq!(mixer_label(&Address::ZERO), None);
    }

    #[test]
    fn test_chain_support() {
        assert!(is_chain_supported(1));
        assert!(!is_chain_supported(999));
        assert_eq!(
            build_alchemy_url(CHAIN_ID_BASE, "k").as_deref(),
            Some("https://base-mainnet.g.alchemy.com/v2/k")
        );
    }

    #[test]
    fn test_unlimited_threshold() {
        assert!(U256::MAX >= unlimited_allowance_threshold());
        assert!(U256::from(10u64).pow(U256::from(30u64)) < unlimited_allowance_threshold());
    }
}
