//! Error taxonomy: extension error payloads mapped to typed errors, plus client-side failures.

use serde_json::Value;

use crate::wire::MessageEncodeError;

/// Sentinel payload: permission not granted for the requested operation.
pub const NOT_GRANTED: &str = "NOT_GRANTED";
/// Sentinel payload: requested account does not exist.
pub const NOT_FOUND: &str = "NOT_FOUND";
/// Sentinel payload: caller supplied malformed parameters.
pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
/// Tag of a `[tag, causes]` payload wrapping a failed chain operation.
pub const CHAIN_OPERATION_TAG: &str = "chainOperation";
/// Prefix of a plain chain error string; stripped before use.
pub const CHAIN_ERROR_PREFIX: &str = "chainOrigin:";

const UNKNOWN_MESSAGE: &str = "An unknown error occurred. Please try again or report it";

/// Error reported by the extension, after mapping its raw payload.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WalletError {
    #[error("{}", UNKNOWN_MESSAGE)]
    Unknown,
    #[error("Permission Not Granted")]
    NotGranted,
    #[error("Account Not Found. Try connect again")]
    NotFound,
    #[error("Some of the parameters you provided are invalid")]
    InvalidParams,
    #[error("{}", chain_operation_message(.causes))]
    ChainOperation { causes: Vec<Value> },
    #[error("{message}")]
    ChainGeneric { message: String },
}

/// Discriminant of [`WalletError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WalletErrorKind {
    Unknown,
    NotGranted,
    NotFound,
    InvalidParams,
    ChainOperation,
    ChainGeneric,
}

impl WalletError {
    /// Map an error-envelope payload. Exact sentinels win over the
    /// `[tag, causes]` form, which wins over the prefixed string form;
    /// everything else is `Unknown`.
    pub fn from_payload(payload: &Value) -> Self {
        match payload {
            Value::String(s) if s == NOT_GRANTED => return WalletError::NotGranted,
            Value::String(s) if s == NOT_FOUND => return WalletError::NotFound,
            Value::String(s) if s == INVALID_PARAMS => return WalletError::InvalidParams,
            _ => {}
        }
        if let Some(causes) = chain_operation_causes(payload) {
            return WalletError::ChainOperation { causes };
        }
        if let Some(rest) = payload
            .as_str()
            .and_then(|s| s.strip_prefix(CHAIN_ERROR_PREFIX))
        {
            return WalletError::ChainGeneric {
                message: rest.to_owned(),
            };
        }
        WalletError::Unknown
    }

    pub fn kind(&self) -> WalletErrorKind {
        match self {
            WalletError::Unknown => WalletErrorKind::Unknown,
            WalletError::NotGranted => WalletErrorKind::NotGranted,
            WalletError::NotFound => WalletErrorKind::NotFound,
            WalletError::InvalidParams => WalletErrorKind::InvalidParams,
            WalletError::ChainOperation { .. } => WalletErrorKind::ChainOperation,
            WalletError::ChainGeneric { .. } => WalletErrorKind::ChainGeneric,
        }
    }

    /// Stable error name. `Unknown` is the base error and carries the base name.
    pub fn name(&self) -> &'static str {
        match self {
            WalletError::Unknown => "WalletError",
            WalletError::NotGranted => "NotGrantedWalletError",
            WalletError::NotFound => "NotFoundWalletError",
            WalletError::InvalidParams => "InvalidParamsWalletError",
            WalletError::ChainOperation { .. } => "ChainOperationError",
            WalletError::ChainGeneric { .. } => "ChainGenericError",
        }
    }

    /// Cause records of a failed chain operation; empty for every other kind.
    pub fn causes(&self) -> &[Value] {
        match self {
            WalletError::ChainOperation { causes } => causes,
            _ => &[],
        }
    }
}

fn chain_operation_causes(payload: &Value) -> Option<Vec<Value>> {
    let items = payload.as_array()?;
    if items.len() != 2 || items[0].as_str() != Some(CHAIN_OPERATION_TAG) {
        return None;
    }
    let causes = items[1].as_array()?;
    if causes.is_empty() {
        return None;
    }
    Some(causes.clone())
}

fn chain_operation_message(causes: &[Value]) -> String {
    match causes
        .last()
        .and_then(|c| c.get("id"))
        .and_then(Value::as_str)
    {
        Some(id) => format!("Chain operation failed: {id}"),
        None => "Chain operation failed".to_owned(),
    }
}

/// Failure of a client call.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The extension answered with an error envelope.
    #[error(transparent)]
    Wallet(#[from] WalletError),
    /// Response of the wrong kind or shape for the pending request.
    #[error("Invalid response received")]
    InvalidResponse,
    /// Page channel closed; no response can arrive.
    #[error("page channel disconnected")]
    Disconnected,
    /// The bus overflowed while this request was pending; its reply may be lost.
    #[error("page channel lagged, {skipped} messages dropped")]
    Lagged { skipped: u64 },
    #[error(transparent)]
    Encode(#[from] MessageEncodeError),
}

impl BridgeError {
    /// The mapped extension error, if this is one.
    pub fn wallet_error(&self) -> Option<&WalletError> {
        match self {
            BridgeError::Wallet(e) => Some(e),
            _ => None,
        }
    }
}
