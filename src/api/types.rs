//! API Request/Response Types

use serde::{Deserialize, Serialize};

use crate::models::{ActionType, AppError, AppResult, RemediationCandidate, ScanRecord};
use crate::utils::cache::CacheStats;
use crate::utils::telemetry::TelemetryStats;
use crate::utils::decoder::parse_address;

/// API Response wrapper
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
    pub request_id: String,
    pub latency_ms: f64,
    pub timestamp: i64,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T, request_id: impl Into<String>, latency_ms: f64) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            request_id: request_id.into(),
            latency_ms,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

impl ApiResponse<()> {
    pub fn error(error: ApiError, request_id: impl Into<String>, latency_ms: f64) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            request_id: request_id.into(),
            latency_ms,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// API Error
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl From<&AppError> for ApiError {
    fn from(err: &AppError) -> Self {
        Self {
            code: err.code_str().to_string(),
            message: err.message.clone(),
            retry_after_secs: None,
        }
    }
}

// ============================================
// Scan
// ============================================

fn default_chain_id() -> u64 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequest {
    pub subject_address: String,
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
}

// ============================================
// Remediation
// ============================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemediationRequest {
    pub idempotency_key: String,
    pub subject_address: String,
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    pub action_type: String,
    pub target_contract: String,
    #[serde(default)]
    pub spender: Option<String>,
}

impl RemediationRequest {
    /// Validate addresses and action type
    pub fn into_candidate(self) -> AppResult<RemediationCandidate> {
        let action_type = match self.action_type.as_str() {
            "revoke_approval" => ActionType::RevokeApproval,
            other => {
                return Err(AppError::bad_request(format!(
                    "Unsupported actionType: {}",
                    other
                )))
            }
        };
        Ok(RemediationCandidate {
            idempotency_key: self.idempotency_key,
            subject_address: parse_address(&self.subject_address)?,
            action_type,
            target_contract: parse_address(&self.target_contract)?,
            chain_id: self.chain_id,
            spender: self.spender.as_deref().map(parse_address).transpose()?,
        })
    }
}

// ============================================
// Health & Stats
// ============================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub store_backend: String,
    pub store_reachable: bool,
    pub probes: Vec<String>,
    pub simulation_backend: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub telemetry: TelemetryStats,
    pub evidence_cache: CacheStats,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestScanResponse {
    pub record: ScanRecord,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ErrorCode;

    fn request() -> RemediationRequest {
        RemediationRequest {
            idempotency_key: "k".to_string(),
            subject_address: format!("0x{}", "11".repeat(20)),
            chain_id: 1,
            action_type: "revoke_approval".to_string(),
            target_contract: format!("0x{}", "22".repeat(20)),
            spender: None,
        }
    }

    #[test]
    fn test_remediation_request_into_candidate() {
        let candidate = request().into_candidate().unwrap();
        assert_eq!(candidate.action_type, ActionType::RevokeApproval);
        assert!(candidate.spender.is_none());
    }

    #[test]
    fn test_remediation_request_rejects_unknown_action() {
        let mut req = request();
        req.action_type = "transfer_all".to_string();
        assert_eq!(
            req.into_candidate().unwrap_err().code,
            ErrorCode::ApiBadRequest
        );
    }

    #[test]
    fn test_remediation_request_rejects_bad_address() {
        let mut req = request();
        req.target_contract = "0x1234".to_string();
        assert_eq!(
            req.into_candidate().unwrap_err().code,
            ErrorCode::TokenInvalidAddress
        );
    }

    #[test]
    fn test_scan_request_defaults_chain() {
        let req: ScanRequest =
            serde_json::from_str(r#"{"subjectAddress":"0xabc"}"#).unwrap();
        assert_eq!(req.chain_id, 1);
    }
}
