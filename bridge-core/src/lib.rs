//! Page-side wallet bridge client.
//! Talks to a wallet extension over a shared page broadcast channel: correlated
//! requests, availability probing, and change watchers. Holds no key material.

pub mod channel;
pub mod client;
pub mod config;
pub mod correlator;
pub mod error;
pub mod probe;
pub mod protocol;
pub mod watcher;
pub mod wire;

#[cfg(test)]
mod mock;

pub use channel::{ChannelEvent, PageChannel, SourceId};
pub use client::WalletClient;
pub use config::{ClientConfig, ConfigError};
pub use correlator::Correlator;
pub use error::{BridgeError, WalletError, WalletErrorKind};
pub use protocol::{
    permissions_equal, AppMetadata, DAppMessageKind, DAppRequest, DAppResponse, Network,
    PageMessage, PageMessageType, Permission,
};
pub use watcher::WatchHandle;
pub use wire::{decode_message, encode_message, MessageDecodeError, MessageEncodeError};
