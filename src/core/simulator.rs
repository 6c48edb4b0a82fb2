//! Transaction Pre-Simulator
//!
//! Read-only execution of a remediation candidate before it is proposed for signing.
//! Two backends:
//! - `RpcSimulationBackend`: eth_call + eth_estimateGas against live chain state
//! - `RevmSimulationBackend`: local REVM run over chain state fetched on demand
//!
//! A revert is a valid result (`willSucceed: false`). Only an unreachable backend
//! is an error.

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use async_trait::async_trait;
use chrono::Utc;
use revm::{
    db::CacheDB,
    primitives::{
        AccountInfo, BlockEnv, Bytecode, CfgEnvWithHandlerCfg, EVMError, EnvWithHandlerCfg,
        ExecutionResult, SpecId, TxEnv, TxKind, KECCAK_EMPTY,
    },
    DatabaseRef, Evm,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::core::probes::{contribution_from, decode_payload, ProbeSet};
use crate::core::risk_score::weighted_score;
use crate::models::{
    ActionType, AppError, AppResult, ApprovalExposure, ErrorCode, RemediationCandidate,
    RiskContribution, SimulationResult,
};
use crate::providers::RpcManager;
use crate::utils::cache::EvidenceCache;
use crate::utils::constants::{PROBE_APPROVAL_EXPOSURE, SIMULATION_GAS_LIMIT};
use crate::utils::decoder::encode_revoke;
use crate::utils::telemetry::ScanTelemetry;

/// One call of a simulated batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimCall {
    pub from: Address,
    pub to: Address,
    pub data: Bytes,
}

/// Outcome of one simulated call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutcome {
    pub success: bool,
    pub gas_used: u64,
    pub revert_reason: Option<String>,
}

impl CallOutcome {
    pub fn reverted(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            gas_used: 0,
            revert_reason: Some(reason.into()),
        }
    }
}

#[async_trait]
pub trait SimulationBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Execute `call` without committing state. Err means the backend itself failed.
    async fn simulate_call(&self, chain_id: u64, call: &SimCall) -> AppResult<CallOutcome>;
}

// ============================================
// RPC BACKEND
// ============================================

pub struct RpcSimulationBackend {
    rpc: RpcManager,
}

impl RpcSimulationBackend {
    pub fn new(rpc: RpcManager) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl SimulationBackend for RpcSimulationBackend {
    fn name(&self) -> &'static str {
        "rpc"
    }

    async fn simulate_call(&self, chain_id: u64, call: &SimCall) -> AppResult<CallOutcome> {
        let provider = self.rpc.get(chain_id)?;
        let from = format!("0x{}", hex::encode(call.from));
        let to = format!("0x{}", hex::encode(call.to));
        let data = format!("0x{}", hex::encode(&call.data));

        match provider.eth_call(Some(&from), &to, &data).await {
            Ok(_) => {}
            Err(e) if e.code == ErrorCode::RpcExecutionReverted => {
                return Ok(CallOutcome::reverted(e.message));
            }
            Err(e) => return Err(unavailable(self.name(), e)),
        }

        match provider.estimate_gas(&from, &to, &data).await {
            Ok(gas_used) => Ok(CallOutcome {
                success: true,
                gas_used,
                revert_reason: None,
            }),
            // state moved between the two calls
            Err(e) if e.code == ErrorCode::RpcExecutionReverted => {
                Ok(CallOutcome::reverted(e.message))
            }
            Err(e) => Err(unavailable(self.name(), e)),
        }
    }
}

// ============================================
// REVM BACKEND
// ============================================

/// One account as the chain reports it at the latest block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountState {
    pub balance: U256,
    pub nonce: u64,
    pub code: Bytes,
}

impl AccountState {
    fn into_info(self) -> AccountInfo {
        if self.code.is_empty() {
            return AccountInfo {
                balance: self.balance,
                nonce: self.nonce,
                code_hash: KECCAK_EMPTY,
                code: None,
            };
        }
        let code = Bytecode::new_raw(self.code);
        AccountInfo {
            balance: self.balance,
            nonce: self.nonce,
            code_hash: code.hash_slow(),
            code: Some(code),
        }
    }
}

/// Chain state reads for local execution
#[async_trait]
pub trait ChainState: Send + Sync {
    async fn account(&self, chain_id: u64, address: Address) -> AppResult<AccountState>;

    async fn storage(&self, chain_id: u64, address: Address, slot: U256) -> AppResult<U256>;
}

#[async_trait]
impl ChainState for RpcManager {
    async fn account(&self, chain_id: u64, address: Address) -> AppResult<AccountState> {
        let provider = self.get(chain_id)?;
        let address = format!("0x{}", hex::encode(address));
        let (balance, nonce, hex_code) = tokio::try_join!(
            provider.get_balance(&address),
            provider.get_transaction_count(&address),
            provider.get_code(&address),
        )?;
        let code = hex::decode(hex_code.trim_start_matches("0x")).map_err(|e| {
            AppError::new(ErrorCode::RpcInvalidResponse, format!("Invalid bytecode: {}", e))
        })?;
        Ok(AccountState {
            balance,
            nonce,
            code: Bytes::from(code),
        })
    }

    async fn storage(&self, chain_id: u64, address: Address, slot: U256) -> AppResult<U256> {
        self.get(chain_id)?
            .get_storage_at(&format!("0x{}", hex::encode(address)), slot)
            .await
    }
}

/// revm database that reads accounts and slots from the chain on first touch.
/// Sits under a `CacheDB`, so each one is fetched at most once per simulation.
struct ChainStateDb {
    state: Arc<dyn ChainState>,
    chain_id: u64,
    handle: Handle,
}

impl DatabaseRef for ChainStateDb {
    type Error = AppError;

    fn basic_ref(&self, address: Address) -> Result<Option<AccountInfo>, Self::Error> {
        let account = self
            .handle
            .block_on(self.state.account(self.chain_id, address))?;
        Ok(Some(account.into_info()))
    }

    fn code_by_hash_ref(&self, code_hash: B256) -> Result<Bytecode, Self::Error> {
        // code arrives with its account in basic_ref and is kept by CacheDB
        if code_hash == KECCAK_EMPTY {
            return Ok(Bytecode::default());
        }
        Err(AppError::internal(format!(
            "bytecode {} was not loaded with its account",
            code_hash
        )))
    }

    fn storage_ref(&self, address: Address, index: U256) -> Result<U256, Self::Error> {
        self.handle
            .block_on(self.state.storage(self.chain_id, address, index))
    }

    fn block_hash_ref(&self, number: u64) -> Result<B256, Self::Error> {
        Ok(keccak256(number.to_string().as_bytes()))
    }
}

pub struct RevmSimulationBackend {
    state: Arc<dyn ChainState>,
}

impl RevmSimulationBackend {
    pub fn new(state: Arc<dyn ChainState>) -> Self {
        Self { state }
    }

    /// Run `call` over `db`. Only the caller is overridden (funded for gas); every
    /// other account and slot comes from the underlying database.
    pub fn execute<ExtDB>(
        chain_id: u64,
        call: &SimCall,
        db: &mut CacheDB<ExtDB>,
    ) -> AppResult<CallOutcome>
    where
        ExtDB: DatabaseRef<Error = AppError>,
    {
        db.insert_account_info(
            call.from,
            AccountInfo {
                balance: U256::from(100_000_000_000_000_000_000u128), // 100 ETH for gas
                nonce: 0,
                code_hash: KECCAK_EMPTY,
                code: None,
            },
        );

        let tx_env = TxEnv {
            caller: call.from,
            gas_limit: SIMULATION_GAS_LIMIT,
            gas_price: U256::from(1_000_000_000u64),
            transact_to: TxKind::Call(call.to),
            value: U256::ZERO,
            data: call.data.clone(),
            // skip the nonce check; the funded caller is synthetic
            nonce: None,
            chain_id: Some(chain_id),
            ..Default::default()
        };

        let block_env = BlockEnv {
            number: U256::from(19_000_000u64),
            timestamp: U256::from(Utc::now().timestamp().max(0) as u64),
            gas_limit: U256::from(30_000_000u64),
            basefee: U256::from(1_000_000_000u64),
            ..Default::default()
        };

        let cfg = CfgEnvWithHandlerCfg::new_with_spec_id(Default::default(), SpecId::CANCUN);
        let env = EnvWithHandlerCfg::new_with_cfg_env(cfg, block_env, tx_env);

        let mut evm = Evm::builder()
            .with_db(&mut *db)
            .with_env_with_handler_cfg(env)
            .build();
        let result = evm.transact();
        drop(evm);

        match result {
            Ok(result_and_state) => Ok(match result_and_state.result {
                ExecutionResult::Success { gas_used, .. } => CallOutcome {
                    success: true,
                    gas_used,
                    revert_reason: None,
                },
                ExecutionResult::Revert { gas_used, output } => CallOutcome {
                    success: false,
                    gas_used,
                    revert_reason: Some(revert_reason(&output)),
                },
                ExecutionResult::Halt { reason, gas_used } => CallOutcome {
                    success: false,
                    gas_used,
                    revert_reason: Some(format!("halted: {:?}", reason)),
                },
            }),
            Err(EVMError::Database(e)) => Err(unavailable("revm", e)),
            Err(e) => Err(AppError::simulation_unavailable(format!(
                "EVM error: {:?}",
                e
            ))),
        }
    }
}

/// Decoded `Error(string)`/`Panic(uint256)`, else the raw revert data
pub fn revert_reason(output: &[u8]) -> String {
    alloy_sol_types::decode_revert_reason(output)
        .filter(|reason| !reason.trim().is_empty())
        .unwrap_or_else(|| format!("reverted: 0x{}", hex::encode(output)))
}

#[async_trait]
impl SimulationBackend for RevmSimulationBackend {
    fn name(&self) -> &'static str {
        "revm"
    }

    async fn simulate_call(&self, chain_id: u64, call: &SimCall) -> AppResult<CallOutcome> {
        let target = self
            .state
            .account(chain_id, call.to)
            .await
            .map_err(|e| unavailable(self.name(), e))?;
        if target.code.is_empty() {
            return Ok(CallOutcome::reverted(format!("no contract code at {}", call.to)));
        }

        let db = ChainStateDb {
            state: self.state.clone(),
            chain_id,
            handle: Handle::current(),
        };
        let call = call.clone();
        // revm reads state synchronously; block a pool thread, not the runtime
        tokio::task::spawn_blocking(move || {
            let mut db = CacheDB::new(db);
            db.insert_account_info(call.to, target.into_info());
            Self::execute(chain_id, &call, &mut db)
        })
        .await
        .map_err(|e| AppError::simulation_unavailable(format!("simulation task failed: {}", e)))?
    }
}

fn unavailable(backend: &str, e: AppError) -> AppError {
    AppError::with_source(
        ErrorCode::SimulationBackendUnavailable,
        format!("Simulation backend {} unavailable", backend),
        e,
    )
}

// ============================================
// PRE-SIMULATOR
// ============================================

/// Calls to simulate plus the predicted score change
#[derive(Debug, Clone)]
pub struct RemediationPlan {
    pub calls: Vec<SimCall>,
    pub score_delta: f64,
}

/// Plans and simulates remediation candidates
pub struct PreSimulator {
    backend: Arc<dyn SimulationBackend>,
    probes: ProbeSet,
    cache: EvidenceCache,
    telemetry: Arc<ScanTelemetry>,
}

impl PreSimulator {
    pub fn new(
        backend: Arc<dyn SimulationBackend>,
        probes: ProbeSet,
        cache: EvidenceCache,
        telemetry: Arc<ScanTelemetry>,
    ) -> Self {
        Self {
            backend,
            probes,
            cache,
            telemetry,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Current contributions rebuilt from cached evidence
    fn cached_contributions(
        &self,
        candidate: &RemediationCandidate,
    ) -> AppResult<BTreeMap<String, RiskContribution>> {
        let mut contributions = BTreeMap::new();
        for probe in self.probes.iter() {
            if let Some(evidence) =
                self.cache
                    .get_any(probe.name(), &candidate.subject_address, candidate.chain_id)
            {
                let stale = evidence.is_stale();
                let contribution = contribution_from(probe.as_ref(), evidence, stale)?;
                contributions.insert(probe.name().to_string(), contribution);
            }
        }
        Ok(contributions)
    }

    /// Resolve spenders and compute the score change of revoking them
    pub async fn plan(&self, candidate: &RemediationCandidate) -> AppResult<RemediationPlan> {
        match candidate.action_type {
            ActionType::RevokeApproval => self.plan_revoke(candidate).await,
        }
    }

    async fn plan_revoke(&self, candidate: &RemediationCandidate) -> AppResult<RemediationPlan> {
        let approvals_probe = self.probes.get(PROBE_APPROVAL_EXPOSURE).ok_or_else(|| {
            AppError::internal("approval exposure probe is not registered")
        })?;

        let mut contributions = self.cached_contributions(candidate)?;
        if !contributions.contains_key(PROBE_APPROVAL_EXPOSURE) {
            let fresh = approvals_probe
                .evaluate(candidate.subject_address, candidate.chain_id)
                .await
                .map_err(|e| unavailable("evidence", e))?;
            contributions.insert(PROBE_APPROVAL_EXPOSURE.to_string(), fresh);
        }
        let before = weighted_score(&contributions);

        let approvals = &contributions[PROBE_APPROVAL_EXPOSURE];
        let exposure: ApprovalExposure = decode_payload(&approvals.evidence.raw)?;
        let (revoked, remaining): (Vec<_>, Vec<_>) =
            exposure.approvals.into_iter().partition(|a| {
                a.token == candidate.target_contract
                    && candidate.spender.map_or(true, |s| s == a.spender)
            });

        let spenders: Vec<Address> = match candidate.spender {
            Some(spender) => vec![spender],
            None => revoked.iter().map(|a| a.spender).collect(),
        };
        let calls = spenders
            .into_iter()
            .map(|spender| SimCall {
                from: candidate.subject_address,
                to: candidate.target_contract,
                data: encode_revoke(spender),
            })
            .collect();

        let mut after_evidence = approvals.evidence.clone();
        after_evidence.raw = serde_json::to_value(ApprovalExposure {
            approvals: remaining,
        })?;
        let stale = approvals.from_stale_evidence;
        let after_contribution = contribution_from(approvals_probe.as_ref(), after_evidence, stale)?;
        let mut after = contributions.clone();
        after.insert(PROBE_APPROVAL_EXPOSURE.to_string(), after_contribution);

        let score_delta = match (before, weighted_score(&after)) {
            (Some(before), Some(after)) => before - after,
            _ => 0.0,
        };
        debug!(
            revoked = revoked.len(),
            score_delta, "📋 Remediation planned"
        );

        Ok(RemediationPlan { calls, score_delta })
    }

    /// Read-only execution of the candidate. Backend outages are errors; reverts are results.
    pub async fn simulate(&self, candidate: &RemediationCandidate) -> AppResult<SimulationResult> {
        let plan = self.plan(candidate).await?;

        if plan.calls.is_empty() {
            info!(
                target_contract = %candidate.target_contract,
                "🤷 Nothing to revoke for this contract"
            );
            self.telemetry.record_simulation(false);
            return Ok(SimulationResult {
                will_succeed: false,
                estimated_gas: 0,
                score_delta: 0.0,
                simulated_at: Utc::now(),
                revert_reason: Some(format!(
                    "no outstanding approval on {}",
                    candidate.target_contract
                )),
                calls: 0,
            });
        }

        let mut estimated_gas = 0u64;
        let mut revert_reason = None;
        for call in &plan.calls {
            let outcome = self.backend.simulate_call(candidate.chain_id, call).await?;
            estimated_gas = estimated_gas.saturating_add(outcome.gas_used);
            if !outcome.success {
                revert_reason = outcome.revert_reason.or(Some("reverted".to_string()));
                break;
            }
        }
        let will_succeed = revert_reason.is_none();
        self.telemetry.record_simulation(will_succeed);

        if will_succeed {
            info!(
                backend = self.backend.name(),
                gas = estimated_gas,
                score_delta = plan.score_delta,
                "🧪 Simulation passed"
            );
        } else {
            warn!(
                backend = self.backend.name(),
                reason = revert_reason.as_deref().unwrap_or_default(),
                "🧪 Simulation predicts failure"
            );
        }

        Ok(SimulationResult {
            will_succeed,
            estimated_gas,
            score_delta: if will_succeed { plan.score_delta } else { 0.0 },
            simulated_at: Utc::now(),
            revert_reason,
            calls: plan.calls.len(),
        })
    }
}
