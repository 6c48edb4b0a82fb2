//! Centralized Error Handling Module
//!
//! Every failure carries a unique error code so logs and API responses can be
//! correlated without parsing messages.
//!
//! Error codes follow pattern: CATEGORY_SPECIFIC_ERROR
//! - SCAN_xxx / PROBE_xxx: scan session errors
//! - RPC_xxx: RPC-related errors
//! - SIM_xxx: Simulation errors
//! - API_xxx: API errors
//! - CFG_xxx: Configuration errors
//! - STORE_xxx: shared state store errors

use std::fmt;

/// Application-wide error type
#[derive(Debug)]
pub struct AppError {
    /// Unique error code for logging/monitoring
    pub code: ErrorCode,
    /// Human-readable message
    pub message: String,
    /// Optional underlying error
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl AppError {
    /// Create a new AppError
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Create AppError with source error
    pub fn with_source(
        code: ErrorCode,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Get error code as string (for logging)
    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Unique error codes for monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // ============================================
    // Scan Errors
    // ============================================
    /// A probe did not answer within its timeout
    ProbeTimeout,
    /// A probe failed while gathering evidence
    ProbeError,
    /// No probe reported, or the caller cancelled
    SessionFailed,

    // ============================================
    // RPC Errors
    // ============================================
    /// RPC connection failed
    RpcConnectionFailed,
    /// RPC request timeout
    RpcTimeout,
    /// RPC rate limited (HTTP 429)
    RpcRateLimited,
    /// RPC returned error response
    RpcError,
    /// eth_call / eth_estimateGas reverted
    RpcExecutionReverted,
    /// Invalid RPC response
    RpcInvalidResponse,

    // ============================================
    // Simulation Errors
    // ============================================
    /// Simulation backend unreachable; idempotency key stays unclaimed
    SimulationBackendUnavailable,

    // ============================================
    // API Errors
    // ============================================
    /// Invalid request format
    ApiBadRequest,
    /// Rate limit exceeded
    RateLimited,
    /// Same idempotency key reused for a different candidate
    IdempotencyConflict,
    /// Another submission holds the claim and has not finished yet
    ClaimInProgress,
    /// Internal server error
    ApiInternalError,
    /// Resource not found
    ApiNotFound,

    // ============================================
    // Configuration Errors
    // ============================================
    /// Invalid configuration value
    ConfigInvalidValue,
    /// Unsupported chain ID
    ConfigUnsupportedChain,
    /// Missing API key
    ConfigMissingApiKey,

    // ============================================
    // Address Errors
    // ============================================
    /// Invalid wallet or contract address
    TokenInvalidAddress,

    // ============================================
    // Store / External Service Errors
    // ============================================
    /// Shared KV store unreachable
    StoreUnavailable,
    /// Alchemy API error
    AlchemyError,
    /// External service timeout
    ExternalTimeout,

    // ============================================
    // Generic Errors
    // ============================================
    /// Unknown error
    Unknown,
}

impl ErrorCode {
    /// Get string representation of error code
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProbeTimeout => "PROBE_TIMEOUT",
            Self::ProbeError => "PROBE_ERROR",
            Self::SessionFailed => "SCAN_SESSION_FAILED",

            Self::RpcConnectionFailed => "RPC_CONNECTION_FAILED",
            Self::RpcTimeout => "RPC_TIMEOUT",
            Self::RpcRateLimited => "RPC_RATE_LIMITED",
            Self::RpcError => "RPC_ERROR",
            Self::RpcExecutionReverted => "RPC_EXECUTION_REVERTED",
            Self::RpcInvalidResponse => "RPC_INVALID_RESPONSE",

            Self::SimulationBackendUnavailable => "SIM_BACKEND_UNAVAILABLE",

            Self::ApiBadRequest => "API_BAD_REQUEST",
            Self::RateLimited => "API_RATE_LIMITED",
            Self::IdempotencyConflict => "API_IDEMPOTENCY_CONFLICT",
            Self::ClaimInProgress => "API_CLAIM_IN_PROGRESS",
            Self::ApiInternalError => "API_INTERNAL_ERROR",
            Self::ApiNotFound => "API_NOT_FOUND",

            Self::ConfigInvalidValue => "CFG_INVALID_VALUE",
            Self::ConfigUnsupportedChain => "CFG_UNSUPPORTED_CHAIN",
            Self::ConfigMissingApiKey => "CFG_MISSING_API_KEY",

            Self::TokenInvalidAddress => "INVALID_ADDRESS",

            Self::StoreUnavailable => "STORE_UNAVAILABLE",
            Self::AlchemyError => "ALCHEMY_ERROR",
            Self::ExternalTimeout => "EXTERNAL_TIMEOUT",

            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    /// Get HTTP status code for API responses
    pub fn http_status(&self) -> u16 {
        match self {
            Self::ApiBadRequest
            | Self::TokenInvalidAddress
            | Self::ConfigInvalidValue
            | Self::ConfigUnsupportedChain => 400,
            Self::ApiNotFound => 404,
            Self::ClaimInProgress => 409,
            Self::IdempotencyConflict => 422,
            Self::RateLimited => 429,
            Self::SimulationBackendUnavailable | Self::StoreUnavailable => 503,
            _ => 500,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RpcTimeout
                | Self::RpcRateLimited
                | Self::RpcConnectionFailed
                | Self::RpcError
                | Self::ExternalTimeout
                | Self::AlchemyError
        )
    }
}

// ============================================
// Convenience constructors
// ============================================

impl AppError {
    /// RPC connection failed
    pub fn rpc_connection_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::RpcConnectionFailed, msg)
    }

    /// RPC timeout
    pub fn rpc_timeout(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::RpcTimeout, msg)
    }

    /// RPC rate limited
    pub fn rpc_rate_limited() -> Self {
        Self::new(ErrorCode::RpcRateLimited, "Rate limited (HTTP 429)")
    }

    /// Execution reverted on the node
    pub fn execution_reverted(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::RpcExecutionReverted, msg)
    }

    /// Probe failed
    pub fn probe_error(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProbeError, msg)
    }

    /// Simulation backend outage
    pub fn simulation_unavailable(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::SimulationBackendUnavailable, msg)
    }

    /// Shared store unreachable
    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::StoreUnavailable, msg)
    }

    /// Admission rejected
    pub fn rate_limited(bucket: &str, retry_after_secs: u64) -> Self {
        Self::new(
            ErrorCode::RateLimited,
            format!(
                "Rate limit exceeded for {} bucket. Retry after {} seconds",
                bucket, retry_after_secs
            ),
        )
    }

    /// Invalid address
    pub fn invalid_address(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::TokenInvalidAddress, msg)
    }

    /// Unsupported chain
    pub fn unsupported_chain(chain_id: u64) -> Self {
        Self::new(
            ErrorCode::ConfigUnsupportedChain,
            format!("Unsupported chain_id: {}", chain_id),
        )
    }

    /// Missing API key
    pub fn missing_api_key(key_name: &str) -> Self {
        Self::new(
            ErrorCode::ConfigMissingApiKey,
            format!("Missing API key: {}", key_name),
        )
    }

    /// API bad request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::ApiBadRequest, msg)
    }

    /// Not found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::ApiNotFound, msg)
    }

    /// API internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::ApiInternalError, msg)
    }
}

// ============================================
// Result type alias
// ============================================

/// Application Result type
pub type AppResult<T> = Result<T, AppError>;

// ============================================
// Conversion from common error types
// ============================================

impl From<eyre::Report> for AppError {
    fn from(err: eyre::Report) -> Self {
        Self::new(ErrorCode::Unknown, err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::with_source(ErrorCode::Unknown, "IO error", err)
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::new(ErrorCode::ExternalTimeout, "Request timeout")
        } else if err.is_connect() {
            Self::new(ErrorCode::RpcConnectionFailed, "Connection failed")
        } else {
            Self::new(ErrorCode::Unknown, err.to_string())
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::with_source(ErrorCode::RpcInvalidResponse, "JSON parse error", err)
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        Self::with_source(ErrorCode::StoreUnavailable, "Redis error", err)
    }
}
