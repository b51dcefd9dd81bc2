//! Page-level wire protocol: envelope kinds, request/response payloads, permission.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Uncorrelated request payload used by the availability probe.
pub const PING: &str = "PING";
/// Uncorrelated response payload the relay answers a ping with.
pub const PONG: &str = "PONG";

/// Envelope kind. Every message on the page channel carries one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageMessageType {
    Request,
    Response,
    #[serde(rename = "error")]
    ErrorResponse,
}

/// Envelope exchanged on the page channel. Without `req_id` it is a broadcast
/// (ping/pong only); with it, it belongs to exactly one in-flight request.
///
/// The payload stays raw JSON until the receiver knows which shape it expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageMessage {
    #[serde(rename = "type")]
    pub kind: PageMessageType,
    pub payload: Value,
    #[serde(rename = "reqId", default, skip_serializing_if = "Option::is_none")]
    pub req_id: Option<String>,
}

impl PageMessage {
    pub fn request(payload: Value, req_id: Option<String>) -> Self {
        Self {
            kind: PageMessageType::Request,
            payload,
            req_id,
        }
    }

    pub fn response(payload: Value, req_id: Option<String>) -> Self {
        Self {
            kind: PageMessageType::Response,
            payload,
            req_id,
        }
    }

    pub fn error(payload: Value, req_id: Option<String>) -> Self {
        Self {
            kind: PageMessageType::ErrorResponse,
            payload,
            req_id,
        }
    }

    /// Uncorrelated `PING` request.
    pub fn ping() -> Self {
        Self::request(Value::from(PING), None)
    }

    /// Uncorrelated `PONG` response.
    pub fn pong() -> Self {
        Self::response(Value::from(PONG), None)
    }

    /// True for an uncorrelated response carrying the pong sentinel.
    pub fn is_pong(&self) -> bool {
        self.kind == PageMessageType::Response
            && self.req_id.is_none()
            && self.payload.as_str() == Some(PONG)
    }

    /// True for an uncorrelated request carrying the ping sentinel.
    pub fn is_ping(&self) -> bool {
        self.kind == PageMessageType::Request
            && self.req_id.is_none()
            && self.payload.as_str() == Some(PING)
    }
}

/// Target network for a permission request: a well-known name or a custom endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Network {
    Named(String),
    Custom { name: String, rpc: String },
}

/// Metadata the page presents to the wallet when asking for permission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

/// Granted connection record. Equality only looks at `pkh` and `rpc`; two
/// records that differ in `public_key` alone compare equal.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub pkh: String,
    pub rpc: String,
    #[serde(rename = "publicKey", default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

impl PartialEq for Permission {
    fn eq(&self, other: &Self) -> bool {
        self.pkh == other.pkh && self.rpc == other.rpc
    }
}

/// Compare two optional permissions; `None` equals only `None`.
pub fn permissions_equal(a: Option<&Permission>, b: Option<&Permission>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Correlated request payloads. Tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DAppRequest {
    #[serde(rename = "GET_CURRENT_PERMISSION_REQUEST")]
    GetCurrentPermission,
    #[serde(rename = "PERMISSION_REQUEST")]
    Permission {
        network: Network,
        #[serde(rename = "appMeta")]
        app_meta: AppMetadata,
        force: bool,
    },
    #[serde(rename = "OPERATION_REQUEST")]
    Operation {
        #[serde(rename = "sourcePkh")]
        source_pkh: String,
        #[serde(rename = "opParams")]
        op_params: Value,
    },
    #[serde(rename = "SIGN_REQUEST")]
    Sign {
        #[serde(rename = "sourcePkh")]
        source_pkh: String,
        payload: String,
    },
    #[serde(rename = "BROADCAST_REQUEST")]
    Broadcast {
        #[serde(rename = "signedOpBytes")]
        signed_op_bytes: String,
    },
}

/// Kind of a request or response, without its fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DAppMessageKind {
    GetCurrentPermission,
    Permission,
    Operation,
    Sign,
    Broadcast,
}

impl DAppRequest {
    pub fn kind(&self) -> DAppMessageKind {
        match self {
            DAppRequest::GetCurrentPermission => DAppMessageKind::GetCurrentPermission,
            DAppRequest::Permission { .. } => DAppMessageKind::Permission,
            DAppRequest::Operation { .. } => DAppMessageKind::Operation,
            DAppRequest::Sign { .. } => DAppMessageKind::Sign,
            DAppRequest::Broadcast { .. } => DAppMessageKind::Broadcast,
        }
    }

    /// Response kind the extension must answer this request with.
    pub fn expected_response(&self) -> DAppMessageKind {
        self.kind()
    }
}

/// Correlated response payloads, one per request kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DAppResponse {
    #[serde(rename = "GET_CURRENT_PERMISSION_RESPONSE")]
    GetCurrentPermission { permission: Option<Permission> },
    #[serde(rename = "PERMISSION_RESPONSE")]
    Permission {
        pkh: String,
        rpc: String,
        #[serde(rename = "publicKey", default)]
        public_key: Option<String>,
    },
    #[serde(rename = "OPERATION_RESPONSE")]
    Operation {
        #[serde(rename = "opHash")]
        op_hash: String,
    },
    #[serde(rename = "SIGN_RESPONSE")]
    Sign { signature: String },
    #[serde(rename = "BROADCAST_RESPONSE")]
    Broadcast {
        #[serde(rename = "opHash")]
        op_hash: String,
    },
}

impl DAppResponse {
    pub fn kind(&self) -> DAppMessageKind {
        match self {
            DAppResponse::GetCurrentPermission { .. } => DAppMessageKind::GetCurrentPermission,
            DAppResponse::Permission { .. } => DAppMessageKind::Permission,
            DAppResponse::Operation { .. } => DAppMessageKind::Operation,
            DAppResponse::Sign { .. } => DAppMessageKind::Sign,
            DAppResponse::Broadcast { .. } => DAppMessageKind::Broadcast,
        }
    }
}
