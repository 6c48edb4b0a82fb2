//! Chain data sources for probe evidence
//!
//! `ChainDataSource` is the seam probes fetch through. The Alchemy-backed
//! implementation uses standard JSON-RPC for approvals and the Transfers API
//! (`alchemy_getAssetTransfers`) for counterparty history.
//!
//! Compute Unit Costs:
//! - eth_getLogs: 75 CU
//! - eth_call (batched): 26 CU each
//! - alchemy_getAssetTransfers: 120 CU

use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info};

use super::rpc::{RpcCallMeta, RpcManager};
use crate::models::{
    AppError, AppResult, ApprovalRecord, ErrorCode, FlowDirection, Provenance,
};
use crate::utils::constants::{unlimited_allowance_threshold, APPROVAL_EVENT_TOPIC};
use crate::utils::decoder::{address_topic, decode_allowance, encode_allowance, topic_to_address};

/// Data plus where it came from
#[derive(Debug, Clone)]
pub struct Sourced<T> {
    pub data: T,
    pub provenance: Provenance,
}

impl<T> Sourced<T> {
    fn from_meta(data: T, provider: &str, method: &str, meta: RpcCallMeta) -> Self {
        Self {
            data,
            provenance: Provenance {
                provider: format!("{} ({})", provider, meta.endpoint),
                method: method.to_string(),
                request_id: meta.request_id,
            },
        }
    }
}

/// One transfer touching the subject
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub counterparty: Address,
    pub direction: FlowDirection,
    pub tx_hash: String,
}

/// Evidence backend used by probes and remediation
#[async_trait]
pub trait ChainDataSource: Send + Sync {
    fn name(&self) -> &str;

    /// Outstanding non-zero ERC-20 allowances granted by `owner`
    async fn approvals(&self, owner: Address, chain_id: u64)
        -> AppResult<Sourced<Vec<ApprovalRecord>>>;

    /// Inbound and outbound transfers of `address`
    async fn transfers(&self, address: Address, chain_id: u64)
        -> AppResult<Sourced<Vec<TransferRecord>>>;
}

// ============================================
// TRANSFERS API TYPES
// ============================================

/// Transfer category filter
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferCategory {
    External,
    Internal,
    Erc20,
    Erc721,
    Erc1155,
}

/// Asset transfer entry
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetTransfer {
    pub hash: String,
    pub from: String,
    pub to: Option<String>,
    pub category: String,
}

/// Response from alchemy_getAssetTransfers
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetTransfersResponse {
    pub transfers: Vec<AssetTransfer>,
    pub page_key: Option<String>,
}

/// Log entry from eth_getLogs
#[derive(Debug, Clone, Deserialize)]
pub struct LogEntry {
    pub address: String,
    pub topics: Vec<String>,
}

// ============================================
// ALCHEMY DATA SOURCE
// ============================================

/// Max transfers requested per direction
const MAX_TRANSFERS: u32 = 1000;

pub struct AlchemyDataSource {
    rpc: RpcManager,
    lookback_blocks: u64,
}

impl AlchemyDataSource {
    pub fn new(rpc: RpcManager, lookback_blocks: u64) -> Self {
        Self {
            rpc,
            lookback_blocks,
        }
    }

    async fn asset_transfers(
        &self,
        chain_id: u64,
        address: Address,
        direction: FlowDirection,
    ) -> AppResult<(Vec<TransferRecord>, RpcCallMeta)> {
        let provider = self.rpc.get(chain_id)?;
        let mut params = serde_json::json!({
            "category": [
                TransferCategory::External,
                TransferCategory::Internal,
                TransferCategory::Erc20,
                TransferCategory::Erc721,
                TransferCategory::Erc1155,
            ],
            "fromBlock": "0x0",
            "toBlock": "latest",
            "withMetadata": false,
            "excludeZeroValue": false,
            "maxCount": format!("0x{:x}", MAX_TRANSFERS),
        });
        let key = match direction {
            FlowDirection::Outbound => "fromAddress",
            FlowDirection::Inbound => "toAddress",
        };
        params[key] = serde_json::Value::String(address.to_string());

        let (response, meta): (AssetTransfersResponse, RpcCallMeta) = provider
            .call_with_meta("alchemy_getAssetTransfers", serde_json::json!([params]))
            .await
            .map_err(alchemy_error)?;

        let records = response
            .transfers
            .into_iter()
            .filter_map(|t| {
                let other = match direction {
                    FlowDirection::Outbound => t.to?,
                    FlowDirection::Inbound => t.from,
                };
                let counterparty = other.parse::<Address>().ok()?;
                Some(TransferRecord {
                    counterparty,
                    direction,
                    tx_hash: t.hash,
                })
            })
            .collect();

        Ok((records, meta))
    }
}

#[async_trait]
impl ChainDataSource for AlchemyDataSource {
    fn name(&self) -> &str {
        "alchemy"
    }

    async fn approvals(
        &self,
        owner: Address,
        chain_id: u64,
    ) -> AppResult<Sourced<Vec<ApprovalRecord>>> {
        let provider = self.rpc.get(chain_id)?;
        let head = provider.block_number().await?;
        let from_block = head.saturating_sub(self.lookback_blocks);

        let filter = serde_json::json!([{
            "fromBlock": format!("0x{:x}", from_block),
            "toBlock": "latest",
            "topics": [format!("0x{}", hex::encode(APPROVAL_EVENT_TOPIC)), address_topic(owner)],
        }]);
        let (logs, meta): (Vec<LogEntry>, RpcCallMeta) =
            provider.call_with_meta("eth_getLogs", filter).await?;

        // latest allowance is read on-chain, so only unique pairs matter
        let pairs: BTreeSet<(Address, Address)> = logs
            .iter()
            .filter_map(|log| {
                let token = log.address.parse::<Address>().ok()?;
                let spender = topic_to_address(log.topics.get(2)?)?;
                Some((token, spender))
            })
            .collect();
        debug!(
            "📜 {} approval pairs for {} on chain {}",
            pairs.len(),
            owner,
            chain_id
        );

        let owner_hex = owner.to_string();
        let requests: Vec<(&str, serde_json::Value)> = pairs
            .iter()
            .map(|(token, spender)| {
                let data = encode_allowance(owner, *spender);
                (
                    "eth_call",
                    serde_json::json!([
                        { "from": owner_hex, "to": token.to_string(), "data": format!("0x{}", hex::encode(&data)) },
                        "latest"
                    ]),
                )
            })
            .collect();
        let results = provider.batch_call::<String>(requests).await?;
        if results.len() != pairs.len() {
            return Err(AppError::new(
                ErrorCode::RpcInvalidResponse,
                format!("Expected {} allowance replies, got {}", pairs.len(), results.len()),
            ));
        }

        let threshold = unlimited_allowance_threshold();
        let approvals: Vec<ApprovalRecord> = pairs
            .into_iter()
            .zip(results)
            .filter_map(|((token, spender), result)| {
                let allowance = result.and_then(|hex| decode_allowance(&hex)).ok()?;
                (allowance > U256::ZERO).then(|| ApprovalRecord {
                    token,
                    spender,
                    allowance: allowance.to_string(),
                    unlimited: allowance >= threshold,
                })
            })
            .collect();

        info!(
            "🔐 {} outstanding approvals for {} on chain {}",
            approvals.len(),
            owner,
            chain_id
        );
        Ok(Sourced::from_meta(approvals, self.name(), "eth_getLogs+eth_call", meta))
    }

    async fn transfers(
        &self,
        address: Address,
        chain_id: u64,
    ) -> AppResult<Sourced<Vec<TransferRecord>>> {
        let (mut records, meta) = self
            .asset_transfers(chain_id, address, FlowDirection::Outbound)
            .await?;
        let (inbound, _) = self
            .asset_transfers(chain_id, address, FlowDirection::Inbound)
            .await?;
        records.extend(inbound);

        Ok(Sourced::from_meta(
            records,
            self.name(),
            "alchemy_getAssetTransfers",
            meta,
        ))
    }
}

/// Transfers API failures keep their retry class under an Alchemy code
fn alchemy_error(err: AppError) -> AppError {
    match err.code {
        ErrorCode::RpcError | ErrorCode::RpcInvalidResponse => {
            AppError::new(ErrorCode::AlchemyError, err.message)
        }
        _ => err,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_category_serialization() {
        let json = serde_json::to_string(&TransferCategory::Erc20).unwrap();
        assert_eq!(json, "\"erc20\"");
    }

    #[test]
    fn test_asset_transfers_deserialization() {
        let json = r#"{
            "transfers": [{
                "blockNum": "0x1",
                "hash": "0xabc",
                "from": "0x722122dF12D4e14e13Ac3b6895a86e84145b6967",
                "to": null,
                "value": 0.1,
                "asset": "ETH",
                "category": "external"
            }],
            "pageKey": null
        }"#;
        let response: AssetTransfersResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.transfers.len(), 1);
        assert!(response.transfers[0].to.is_none());
    }

    #[test]
    fn test_alchemy_error_mapping() {
        let err = alchemy_error(AppError::new(ErrorCode::RpcError, "boom"));
        assert_eq!(err.code, ErrorCode::AlchemyError);
        let timeout = alchemy_error(AppError::rpc_timeout("slow"));
        assert_eq!(timeout.code, ErrorCode::RpcTimeout);
    }
}
