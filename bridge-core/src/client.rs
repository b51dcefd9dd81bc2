//! Page-facing API: WalletClient wraps the correlator, probe and watchers.

use std::sync::Arc;

use serde_json::Value;

use crate::channel::{PageChannel, SourceId};
use crate::config::ClientConfig;
use crate::correlator::Correlator;
use crate::error::BridgeError;
use crate::probe;
use crate::protocol::{AppMetadata, DAppRequest, DAppResponse, Network, Permission};
use crate::watcher::{self, WatchHandle};

struct Inner {
    correlator: Correlator,
    config: ClientConfig,
}

/// Handle to the wallet extension for one page context. Cheap to clone; all
/// clones share one dispatcher. Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct WalletClient {
    inner: Arc<Inner>,
}

impl WalletClient {
    pub fn new(channel: PageChannel, source: SourceId) -> Self {
        Self::with_config(channel, source, ClientConfig::default())
    }

    pub fn with_config(channel: PageChannel, source: SourceId, config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                correlator: Correlator::spawn(channel, source),
                config,
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn source(&self) -> SourceId {
        self.inner.correlator.source()
    }

    /// True if the relay answers a ping within the probe timeout.
    pub async fn is_available(&self) -> bool {
        probe::probe(&self.inner.correlator, self.inner.config.probe_timeout()).await
    }

    /// Call `callback` whenever availability flips. Starts from "unavailable",
    /// so the first successful probe fires it with `true`.
    pub fn on_availability_change<C>(&self, callback: C) -> WatchHandle
    where
        C: FnMut(bool) + Send + 'static,
    {
        let client = self.clone();
        watcher::spawn_availability_watcher(
            move || {
                let client = client.clone();
                async move { client.is_available().await }
            },
            self.inner.config.availability_schedule(),
            callback,
        )
    }

    /// Call `callback` whenever the granted permission changes (by `pkh`/`rpc`).
    /// Failed polls are skipped.
    pub fn on_permission_change<C>(&self, callback: C) -> WatchHandle
    where
        C: FnMut(Option<Permission>) + Send + 'static,
    {
        let client = self.clone();
        watcher::spawn_permission_watcher(
            move || {
                let client = client.clone();
                async move { client.get_current_permission().await }
            },
            self.inner.config.permission_schedule(),
            callback,
        )
    }

    pub async fn get_current_permission(&self) -> Result<Option<Permission>, BridgeError> {
        match self.send(DAppRequest::GetCurrentPermission).await? {
            DAppResponse::GetCurrentPermission { permission } => Ok(permission),
            _ => Err(BridgeError::InvalidResponse),
        }
    }

    /// Ask the wallet to connect this page. With `force`, the wallet asks again
    /// even if a permission already exists.
    pub async fn request_permission(
        &self,
        network: Network,
        app_meta: AppMetadata,
        force: bool,
    ) -> Result<Permission, BridgeError> {
        let request = DAppRequest::Permission {
            network,
            app_meta,
            force,
        };
        match self.send(request).await? {
            DAppResponse::Permission {
                pkh,
                rpc,
                public_key,
            } => Ok(Permission {
                pkh,
                rpc,
                public_key,
            }),
            _ => Err(BridgeError::InvalidResponse),
        }
    }

    /// Submit operation parameters for the wallet to forge, sign and inject.
    /// Returns the operation hash.
    pub async fn request_operation(
        &self,
        source_pkh: impl Into<String>,
        op_params: Value,
    ) -> Result<String, BridgeError> {
        let request = DAppRequest::Operation {
            source_pkh: source_pkh.into(),
            op_params,
        };
        match self.send(request).await? {
            DAppResponse::Operation { op_hash } => Ok(op_hash),
            _ => Err(BridgeError::InvalidResponse),
        }
    }

    /// Returns the signature over `payload`.
    pub async fn request_sign(
        &self,
        source_pkh: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<String, BridgeError> {
        let request = DAppRequest::Sign {
            source_pkh: source_pkh.into(),
            payload: payload.into(),
        };
        match self.send(request).await? {
            DAppResponse::Sign { signature } => Ok(signature),
            _ => Err(BridgeError::InvalidResponse),
        }
    }

    /// Inject already signed bytes. Returns the operation hash.
    pub async fn request_broadcast(
        &self,
        signed_op_bytes: impl Into<String>,
    ) -> Result<String, BridgeError> {
        let request = DAppRequest::Broadcast {
            signed_op_bytes: signed_op_bytes.into(),
        };
        match self.send(request).await? {
            DAppResponse::Broadcast { op_hash } => Ok(op_hash),
            _ => Err(BridgeError::InvalidResponse),
        }
    }

    async fn send(&self, request: DAppRequest) -> Result<DAppResponse, BridgeError> {
        self.inner.correlator.send(&request).await
    }
}
