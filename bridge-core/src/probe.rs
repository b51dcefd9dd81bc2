//! Availability probe: uncorrelated PING, answered by any PONG from the same page context.

use std::time::Duration;

use tracing::trace;

use crate::correlator::Correlator;
use crate::protocol::PageMessage;

/// Default time to wait for a pong.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Post a ping and wait up to `timeout` for a pong. Never errors: a closed
/// channel or an encode failure just means "not available".
pub async fn probe(correlator: &Correlator, timeout: Duration) -> bool {
    // Register before posting so an immediate pong is not missed.
    let Some(mut waiter) = correlator.register_probe() else {
        return false;
    };
    if correlator.post(&PageMessage::ping()).is_err() {
        return false;
    }
    let available = matches!(tokio::time::timeout(timeout, waiter.pong()).await, Ok(true));
    trace!(available, "probe finished");
    available
}
