//! RPC Client Module - Multi-Chain JSON-RPC with failover
//!
//! 1. Ordered endpoint list per chain (override, Alchemy, public fallback)
//! 2. Exponential backoff with jitter, configurable via RetryConfig
//! 3. Reverts are classified as non-retryable and never fail over
//! 4. Gzip compression and User-Agent header on every request
//! 5. Batch requests (max 50 per batch)
//! 6. Per-call provenance: endpoint reached and a request id

use alloy_primitives::U256;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_ENCODING, USER_AGENT};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::models::{AppError, AppResult, ChainConfig, ErrorCode, RetryConfig};
use crate::utils::constants::{DEFAULT_RPC_TIMEOUT_SECS, USER_AGENT as USER_AGENT_CONST};
use crate::utils::telemetry::ScanTelemetry;

/// Maximum batch size per JSON-RPC batch request
pub const MAX_BATCH_SIZE: usize = 50;

/// Jitter percentage applied to each backoff delay
pub const RETRY_JITTER_PERCENT: u64 = 20;

/// Backoff before retry `attempt` (1-based): base * 2^(attempt-1), capped, ±20% jitter
pub fn backoff_delay(attempt: u32, retry: &RetryConfig) -> Duration {
    let base_ms = retry.base_delay.as_millis() as u64;
    let max_ms = retry.max_delay.as_millis() as u64;
    let exp = attempt.saturating_sub(1).min(20);
    let capped = base_ms.saturating_mul(1u64 << exp).min(max_ms);

    let jitter_range = (capped * RETRY_JITTER_PERCENT) / 100;
    let jitter: i64 = if jitter_range > 0 {
        rand::thread_rng().gen_range(-(jitter_range as i64)..=(jitter_range as i64))
    } else {
        0
    };
    Duration::from_millis((capped as i64 + jitter).max(0) as u64)
}

/// Where a call was answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcCallMeta {
    /// Endpoint host (API key stripped)
    pub endpoint: String,
    pub request_id: String,
}

/// Batch JSON-RPC response item
#[derive(Debug, Clone, Deserialize)]
pub struct BatchResponseItem<T> {
    pub result: Option<T>,
    pub error: Option<RpcError>,
    pub id: u64,
}

/// RPC Provider with retry logic and endpoint failover
#[derive(Clone)]
pub struct RpcProvider {
    /// Primary first
    urls: Vec<String>,
    client: reqwest::Client,
    chain_id: u64,
    retry: RetryConfig,
    telemetry: Option<Arc<ScanTelemetry>>,
}

impl RpcProvider {
    pub fn new(chain: &ChainConfig, retry: RetryConfig) -> AppResult<Self> {
        if chain.rpc_urls.is_empty() {
            return Err(AppError::new(
                ErrorCode::ConfigInvalidValue,
                format!("No RPC endpoint configured for chain {}", chain.chain_id),
            ));
        }
        Ok(Self {
            urls: chain.rpc_urls.clone(),
            client: Self::build_client()?,
            chain_id: chain.chain_id,
            retry,
            telemetry: None,
        })
    }

    pub fn with_telemetry(mut self, telemetry: Arc<ScanTelemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Build HTTP client with gzip and User-Agent
    fn build_client() -> AppResult<reqwest::Client> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_CONST));
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));

        reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(DEFAULT_RPC_TIMEOUT_SECS))
            .gzip(true)
            .build()
            .map_err(|e| AppError::internal(format!("Failed to build HTTP client: {}", e)))
    }

    /// Execute JSON-RPC call with retry and failover
    pub async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> AppResult<T> {
        self.call_with_meta(method, params).await.map(|(value, _)| value)
    }

    /// Like `call`, also reporting which endpoint answered
    pub async fn call_with_meta<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> AppResult<(T, RpcCallMeta)> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let mut last_error = None;
        for (idx, url) in self.urls.iter().enumerate() {
            if idx > 0 {
                info!(
                    "🔄 Failing over {} to {} (chain {})",
                    method,
                    masked_url(url),
                    self.chain_id
                );
                if let Some(t) = &self.telemetry {
                    t.record_rpc_failover();
                }
            }
            match self.call_with_retry(url, &payload).await {
                Ok(result) => {
                    let meta = RpcCallMeta {
                        endpoint: masked_url(url),
                        request_id,
                    };
                    return Ok((result, meta));
                }
                Err(e) if !e.code.is_retryable() => return Err(e),
                Err(e) => {
                    warn!("⚠️ RPC {} failed on {}: {}", method, masked_url(url), e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            AppError::rpc_connection_failed(format!("All RPC endpoints failed for chain {}", self.chain_id))
        }))
    }

    /// Retry one endpoint with exponential backoff; non-retryable errors return at once
    async fn call_with_retry<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        payload: &serde_json::Value,
    ) -> AppResult<T> {
        let mut last_error = None;

        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                let delay = backoff_delay(attempt, &self.retry);
                debug!(
                    "⏳ Retry {}/{} after {}ms",
                    attempt + 1,
                    self.retry.max_attempts,
                    delay.as_millis()
                );
                if let Some(t) = &self.telemetry {
                    t.record_rpc_retry();
                }
                tokio::time::sleep(delay).await;
            }

            match self.execute_call::<T>(url, payload).await {
                Ok(result) => return Ok(result),
                Err(e) if !e.code.is_retryable() => return Err(e),
                Err(e) => {
                    if e.code == ErrorCode::RpcRateLimited {
                        warn!(
                            "⏳ Rate limited, backing off (attempt {}/{})",
                            attempt + 1,
                            self.retry.max_attempts
                        );
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| AppError::rpc_connection_failed("No attempt made")))
    }

    /// Execute single RPC call
    async fn execute_call<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        payload: &serde_json::Value,
    ) -> AppResult<T> {
        let response = self.client.post(url).json(payload).send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::rpc_timeout(format!("Request timed out: {}", masked_url(url)))
            } else {
                AppError::rpc_connection_failed(format!("Request failed: {}", masked_url(url)))
            }
        })?;

        let status = response.status();
        if status == 429 {
            return Err(AppError::rpc_rate_limited());
        }
        if !status.is_success() {
            return Err(AppError::new(
                ErrorCode::RpcError,
                format!("HTTP error: {}", status),
            ));
        }

        let json: RpcResponse<T> = response.json().await.map_err(|e| {
            AppError::new(
                ErrorCode::RpcInvalidResponse,
                format!("Failed to parse response: {}", e),
            )
        })?;

        if let Some(error) = json.error {
            return Err(error.into_app_error());
        }

        json.result
            .ok_or_else(|| AppError::new(ErrorCode::RpcInvalidResponse, "No result in response"))
    }

    /// eth_call at latest block
    pub async fn eth_call(&self, from: Option<&str>, to: &str, data: &str) -> AppResult<String> {
        let mut tx = serde_json::json!({ "to": to, "data": data });
        if let Some(from) = from {
            tx["from"] = serde_json::Value::String(from.to_string());
        }
        self.call::<String>("eth_call", serde_json::json!([tx, "latest"])).await
    }

    /// eth_estimateGas at latest block
    pub async fn estimate_gas(&self, from: &str, to: &str, data: &str) -> AppResult<u64> {
        let params = serde_json::json!([{ "from": from, "to": to, "data": data }, "latest"]);
        let hex_gas: String = self.call("eth_estimateGas", params).await?;
        parse_hex_u64(&hex_gas)
    }

    /// Get bytecode
    pub async fn get_code(&self, address: &str) -> AppResult<String> {
        let params = serde_json::json!([address, "latest"]);
        self.call::<String>("eth_getCode", params).await
    }

    pub async fn get_balance(&self, address: &str) -> AppResult<U256> {
        let hex_balance: String = self
            .call("eth_getBalance", serde_json::json!([address, "latest"]))
            .await?;
        parse_hex_u256(&hex_balance)
    }

    pub async fn get_transaction_count(&self, address: &str) -> AppResult<u64> {
        let hex_nonce: String = self
            .call("eth_getTransactionCount", serde_json::json!([address, "latest"]))
            .await?;
        parse_hex_u64(&hex_nonce)
    }

    /// Storage slot at latest block
    pub async fn get_storage_at(&self, address: &str, slot: U256) -> AppResult<U256> {
        let slot = format!("0x{}", hex::encode(slot.to_be_bytes::<32>()));
        let hex_word: String = self
            .call("eth_getStorageAt", serde_json::json!([address, slot, "latest"]))
            .await?;
        parse_hex_u256(&hex_word)
    }

    pub async fn block_number(&self) -> AppResult<u64> {
        let hex_block: String = self.call("eth_blockNumber", serde_json::json!([])).await?;
        parse_hex_u64(&hex_block)
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Primary endpoint (masked for logging)
    pub fn masked_url(&self) -> String {
        self.urls.first().map(|u| masked_url(u)).unwrap_or_default()
    }

    // ============================================
    // BATCH REQUESTS
    // ============================================

    /// Execute batch JSON-RPC calls in chunks of MAX_BATCH_SIZE against the primary endpoint.
    /// Results come back in request order.
    pub async fn batch_call<T: for<'de> Deserialize<'de>>(
        &self,
        requests: Vec<(&str, serde_json::Value)>,
    ) -> AppResult<Vec<AppResult<T>>> {
        if requests.is_empty() {
            return Ok(vec![]);
        }

        let mut all_results = Vec::with_capacity(requests.len());
        for chunk in requests.chunks(MAX_BATCH_SIZE) {
            let batch_payload: Vec<serde_json::Value> = chunk
                .iter()
                .enumerate()
                .map(|(idx, (method, params))| {
                    serde_json::json!({
                        "jsonrpc": "2.0",
                        "method": method,
                        "params": params,
                        "id": idx + 1
                    })
                })
                .collect();

            let items = self.execute_batch::<T>(&batch_payload).await?;
            all_results.extend(order_batch_replies(items, chunk.len())?);
        }

        Ok(all_results)
    }

    async fn execute_batch<T: for<'de> Deserialize<'de>>(
        &self,
        batch_payload: &[serde_json::Value],
    ) -> AppResult<Vec<BatchResponseItem<T>>> {
        let url = self
            .urls
            .first()
            .ok_or_else(|| AppError::rpc_connection_failed("No RPC endpoint"))?;
        let mut last_error = None;

        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt, &self.retry)).await;
            }

            match self.client.post(url).json(batch_payload).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status == 429 {
                        last_error = Some(AppError::rpc_rate_limited());
                        continue;
                    }
                    if !status.is_success() {
                        last_error = Some(AppError::new(
                            ErrorCode::RpcError,
                            format!("HTTP error: {}", status),
                        ));
                        continue;
                    }
                    return resp.json().await.map_err(|e| {
                        AppError::new(
                            ErrorCode::RpcInvalidResponse,
                            format!("Failed to parse batch response: {}", e),
                        )
                    });
                }
                Err(e) => {
                    last_error = Some(AppError::rpc_connection_failed(format!(
                        "Batch request failed: {}",
                        e.without_url()
                    )));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| AppError::rpc_connection_failed("Batch request failed")))
    }
}

/// Place batch replies at their request position (ids 1..=expected).
/// A missing, duplicated or unknown id fails the whole chunk.
pub fn order_batch_replies<T>(
    items: Vec<BatchResponseItem<T>>,
    expected: usize,
) -> AppResult<Vec<AppResult<T>>> {
    let mut slots: Vec<Option<AppResult<T>>> = (0..expected).map(|_| None).collect();

    for item in items {
        let index = usize::try_from(item.id)
            .ok()
            .and_then(|id| id.checked_sub(1))
            .filter(|index| *index < expected)
            .ok_or_else(|| {
                AppError::new(
                    ErrorCode::RpcInvalidResponse,
                    format!("Unexpected batch reply id {}", item.id),
                )
            })?;
        if slots[index].is_some() {
            return Err(AppError::new(
                ErrorCode::RpcInvalidResponse,
                format!("Duplicate batch reply id {}", item.id),
            ));
        }

        let reply = match item.error {
            Some(error) => Err(error.into_app_error()),
            None => item.result.ok_or_else(|| {
                AppError::new(
                    ErrorCode::RpcInvalidResponse,
                    format!("No result in response for id {}", item.id),
                )
            }),
        };
        slots[index] = Some(reply);
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.ok_or_else(|| {
                AppError::new(
                    ErrorCode::RpcInvalidResponse,
                    format!("Missing batch reply id {}", index + 1),
                )
            })
        })
        .collect()
}

/// Strip path and key from an endpoint URL
pub fn masked_url(url: &str) -> String {
    match url.split("/v2/").next() {
        Some(base) if url.contains("/v2/") => format!("{}/v2/***HIDDEN***", base),
        _ => url.to_string(),
    }
}

pub fn parse_hex_u64(value: &str) -> AppResult<u64> {
    u64::from_str_radix(value.trim_start_matches("0x"), 16).map_err(|_| {
        AppError::new(
            ErrorCode::RpcInvalidResponse,
            format!("Invalid hex quantity: {}", value),
        )
    })
}

pub fn parse_hex_u256(value: &str) -> AppResult<U256> {
    let digits = value.trim_start_matches("0x");
    let digits = if digits.is_empty() { "0" } else { digits };
    U256::from_str_radix(digits, 16).map_err(|_| {
        AppError::new(
            ErrorCode::RpcInvalidResponse,
            format!("Invalid hex word: {}", value),
        )
    })
}

/// JSON-RPC response structure
#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

/// JSON-RPC error structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl RpcError {
    /// HTTP 429 equivalent (-32005)
    pub fn is_rate_limit(&self) -> bool {
        self.code == -32005 || self.message.to_lowercase().contains("rate limit")
    }

    /// Geth reports reverts with code 3; other clients only in the message
    pub fn is_execution_reverted(&self) -> bool {
        self.code == 3 || self.message.to_lowercase().contains("execution reverted")
    }

    /// Decoded `Error(string)` payload, if present
    pub fn revert_reason(&self) -> Option<String> {
        let data = self.data.as_ref()?.as_str()?;
        let bytes = hex::decode(data.trim_start_matches("0x")).ok()?;
        alloy_sol_types::decode_revert_reason(&bytes)
    }

    pub fn into_app_error(self) -> AppError {
        if self.is_execution_reverted() {
            let reason = self.revert_reason().unwrap_or_else(|| self.message.clone());
            AppError::execution_reverted(reason)
        } else if self.is_rate_limit() {
            AppError::rpc_rate_limited()
        } else {
            AppError::new(
                ErrorCode::RpcError,
                format!("RPC error: {} (code: {})", self.message, self.code),
            )
        }
    }
}

/// Per-chain providers built from configuration
#[derive(Clone, Default)]
pub struct RpcManager {
    providers: HashMap<u64, RpcProvider>,
}

impl RpcManager {
    pub fn new(
        chain_ids: &[u64],
        retry: RetryConfig,
        telemetry: Option<Arc<ScanTelemetry>>,
    ) -> Self {
        let mut providers = HashMap::new();

        for &chain_id in chain_ids {
            let Some(chain) = ChainConfig::resolve(chain_id) else {
                continue;
            };
            match RpcProvider::new(&chain, retry) {
                Ok(provider) => {
                    let provider = match &telemetry {
                        Some(t) => provider.with_telemetry(t.clone()),
                        None => provider,
                    };
                    info!(
                        "✅ Initialized RPC for {} ({})",
                        chain.name,
                        provider.masked_url()
                    );
                    providers.insert(chain_id, provider);
                }
                Err(e) => warn!("⚠️ Failed to initialize RPC for chain {}: {}", chain_id, e),
            }
        }

        Self { providers }
    }

    pub fn get(&self, chain_id: u64) -> AppResult<&RpcProvider> {
        self.providers
            .get(&chain_id)
            .ok_or_else(|| AppError::unsupported_chain(chain_id))
    }

    pub fn is_supported(&self, chain_id: u64) -> bool {
        self.providers.contains_key(&chain_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_capped() {
        let retry = RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        };
        let first = backoff_delay(1, &retry).as_millis();
        assert!((80..=120).contains(&first));
        let late = backoff_delay(10, &retry).as_millis();
        assert!(late <= 360);
    }

    #[test]
    fn test_masked_url() {
        assert_eq!(
            masked_url("https://eth-mainnet.g.alchemy.com/v2/secret"),
            "https://eth-mainnet.g.alchemy.com/v2/***HIDDEN***"
        );
        assert_eq!(masked_url("https://eth.llamarpc.com"), "https://eth.llamarpc.com");
    }

    #[test]
    fn test_rpc_error_classification() {
        let rate_limit = RpcError {
            code: -32005,
            message: "Rate limit exceeded".to_string(),
            data: None,
        };
        assert_eq!(rate_limit.into_app_error().code, ErrorCode::RpcRateLimited);

        let reverted = RpcError {
            code: 3,
            message: "execution reverted".to_string(),
            data: None,
        };
        let err = reverted.into_app_error();
        assert_eq!(err.code, ErrorCode::RpcExecutionReverted);
        assert!(!err.code.is_retryable());
    }

    #[test]
    fn test_revert_reason_decoding() {
        // Error("nope")
        let data = "0x08c379a0\
            0000000000000000000000000000000000000000000000000000000000000020\
            0000000000000000000000000000000000000000000000000000000000000004\
            6e6f706500000000000000000000000000000000000000000000000000000000";
        let err = RpcError {
            code: 3,
            message: "execution reverted: nope".to_string(),
            data: Some(serde_json::Value::String(data.to_string())),
        };
        assert!(err.revert_reason().unwrap().contains("nope"));
    }

    fn reply(id: u64, result: &str) -> BatchResponseItem<String> {
        BatchResponseItem {
            result: Some(result.to_string()),
            error: None,
            id,
        }
    }

    #[test]
    fn test_batch_replies_follow_request_ids() {
        let items = vec![reply(3, "c"), reply(1, "a"), reply(2, "b")];
        let ordered: Vec<String> = order_batch_replies(items, 3)
            .unwrap()
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(ordered, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_batch_missing_reply_is_rejected() {
        // the node answered ids 1 and 3 only
        let err = order_batch_replies(vec![reply(1, "a"), reply(3, "c")], 3).unwrap_err();
        assert_eq!(err.code, ErrorCode::RpcInvalidResponse);
        assert!(err.message.contains("id 2"));
    }

    #[test]
    fn test_batch_duplicate_or_unknown_id_is_rejected() {
        let dup = order_batch_replies(vec![reply(1, "a"), reply(1, "a")], 2).unwrap_err();
        assert_eq!(dup.code, ErrorCode::RpcInvalidResponse);
        let unknown = order_batch_replies(vec![reply(1, "a"), reply(9, "z")], 2).unwrap_err();
        assert_eq!(unknown.code, ErrorCode::RpcInvalidResponse);
    }

    #[test]
    fn test_batch_item_error_stays_per_item() {
        let failed = BatchResponseItem::<String> {
            result: None,
            error: Some(RpcError {
                code: -32000,
                message: "header not found".to_string(),
                data: None,
            }),
            id: 2,
        };
        let ordered = order_batch_replies(vec![reply(1, "a"), failed], 2).unwrap();
        assert!(ordered[0].is_ok());
        assert_eq!(ordered[1].as_ref().unwrap_err().code, ErrorCode::RpcError);
    }

    #[test]
    fn test_parse_hex_u256() {
        assert_eq!(parse_hex_u256("0x").unwrap(), U256::ZERO);
        assert_eq!(
            parse_hex_u256("0x0000000000000000000000000000000000000000000000000000000000000001")
                .unwrap(),
            U256::from(1)
        );
        assert!(parse_hex_u256("0xgg").is_err());
    }

    #[test]
    fn test_parse_hex_u64() {
        assert_eq!(parse_hex_u64("0x5208").unwrap(), 21_000);
        assert!(parse_hex_u64("0xzz").is_err());
    }
}
