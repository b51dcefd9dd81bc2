//! Page-global broadcast bus. Every post reaches every subscriber; there is no
//! addressing, so receivers filter on the posting page context themselves.

use serde_json::Value;
use tokio::sync::broadcast;

use crate::protocol::PageMessage;
use crate::wire::{self, MessageEncodeError};

/// Default number of events buffered per subscriber before it lags.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Identity of one page context (tab) on the bus. Events are only accepted
/// from the context the receiver itself belongs to.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct SourceId(uuid::Uuid);

impl SourceId {
    /// Fresh random page context.
    pub fn new() -> Self {
        SourceId(uuid::Uuid::new_v4())
    }
}

impl Default for SourceId {
    fn default() -> Self {
        Self::new()
    }
}

/// One delivery on the bus: who posted it and the raw message data.
#[derive(Debug, Clone)]
pub struct ChannelEvent {
    pub source: SourceId,
    pub data: Value,
}

/// Cloneable handle to the shared bus. The page client and the relay hold clones.
#[derive(Debug, Clone)]
pub struct PageChannel {
    tx: broadcast::Sender<ChannelEvent>,
}

impl PageChannel {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Post raw data from `source`. Returns how many subscribers saw it.
    pub fn post(&self, source: SourceId, data: Value) -> usize {
        self.tx.send(ChannelEvent { source, data }).unwrap_or(0)
    }

    /// Encode and post an envelope from `source`.
    pub fn post_message(
        &self,
        source: SourceId,
        msg: &PageMessage,
    ) -> Result<usize, MessageEncodeError> {
        let data = wire::encode_message(msg)?;
        Ok(self.post(source, data))
    }

    /// Receive every event posted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for PageChannel {
    fn default() -> Self {
        Self::new()
    }
}
