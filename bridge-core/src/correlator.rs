//! Request/response correlation over the page bus.
//!
//! One dispatcher task per client subscribes to the bus, keeps only envelopes
//! posted from the client's own page context, and completes pending waiters:
//! correlated requests by `reqId`, availability probes by the uncorrelated pong.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::channel::{ChannelEvent, PageChannel, SourceId};
use crate::error::{BridgeError, WalletError};
use crate::protocol::{DAppRequest, DAppResponse, PageMessage, PageMessageType};
use crate::wire;

/// Length of a generated correlation id.
pub const REQ_ID_LEN: usize = 21;

type Reply = Result<Value, BridgeError>;

/// Pending completions, keyed by correlation id (requests) or local token (probes).
#[derive(Default)]
struct Waiters {
    requests: HashMap<String, oneshot::Sender<Reply>>,
    probes: HashMap<u64, oneshot::Sender<()>>,
    next_probe: u64,
    closed: bool,
}

fn lock(waiters: &Mutex<Waiters>) -> MutexGuard<'_, Waiters> {
    waiters.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fresh random correlation id.
pub fn new_req_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(REQ_ID_LEN)
        .map(char::from)
        .collect()
}

/// Correlates requests posted on the bus with the responses that come back.
/// Must be created inside a tokio runtime; dropping it stops the dispatcher.
pub struct Correlator {
    channel: PageChannel,
    source: SourceId,
    waiters: Arc<Mutex<Waiters>>,
    dispatcher: JoinHandle<()>,
}

impl Correlator {
    /// Subscribe to `channel` as page context `source` and start dispatching.
    pub fn spawn(channel: PageChannel, source: SourceId) -> Self {
        let waiters = Arc::new(Mutex::new(Waiters::default()));
        let rx = channel.subscribe();
        let dispatcher = tokio::spawn(dispatch(rx, source, CloseOnExit(waiters.clone())));
        Self {
            channel,
            source,
            waiters,
            dispatcher,
        }
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    /// Post `request` under a fresh correlation id and wait for its response.
    ///
    /// No timeout: with no reply this waits until the future is dropped, which
    /// also drops the registration. An error envelope is mapped through
    /// [`WalletError::from_payload`]; a reply of the wrong kind or shape is
    /// [`BridgeError::InvalidResponse`]. If the bus overflows while the request
    /// is pending, it fails with [`BridgeError::Lagged`].
    pub async fn send(&self, request: &DAppRequest) -> Result<DAppResponse, BridgeError> {
        let (tx, rx) = oneshot::channel();
        let req_id = {
            let mut w = lock(&self.waiters);
            if w.closed {
                return Err(BridgeError::Disconnected);
            }
            let id = loop {
                let id = new_req_id();
                if !w.requests.contains_key(&id) {
                    break id;
                }
            };
            w.requests.insert(id.clone(), tx);
            id
        };
        let _pending = PendingRequest {
            waiters: &self.waiters,
            req_id: &req_id,
        };

        let envelope = wire::encode_request(request, &req_id)?;
        trace!(req_id = %req_id, kind = ?request.kind(), "posting request");
        self.channel.post(self.source, envelope);

        let payload = rx.await.map_err(|_| BridgeError::Disconnected)??;
        let response = wire::decode_response(payload).map_err(|e| {
            debug!(req_id = %req_id, error = %e, "undecodable response payload");
            BridgeError::InvalidResponse
        })?;
        if response.kind() != request.expected_response() {
            debug!(
                req_id = %req_id,
                expected = ?request.expected_response(),
                got = ?response.kind(),
                "response kind mismatch"
            );
            return Err(BridgeError::InvalidResponse);
        }
        Ok(response)
    }

    /// Post an uncorrelated envelope from this page context.
    pub(crate) fn post(&self, msg: &PageMessage) -> Result<(), BridgeError> {
        self.channel.post_message(self.source, msg)?;
        Ok(())
    }

    /// Register a waiter completed by the next uncorrelated pong.
    /// `None` once the dispatcher has stopped.
    pub(crate) fn register_probe(&self) -> Option<ProbeWaiter> {
        let (tx, rx) = oneshot::channel();
        let mut w = lock(&self.waiters);
        if w.closed {
            return None;
        }
        let token = w.next_probe;
        w.next_probe = w.next_probe.wrapping_add(1);
        w.probes.insert(token, tx);
        Some(ProbeWaiter {
            waiters: self.waiters.clone(),
            token,
            rx: Some(rx),
        })
    }

    /// Number of correlated requests still waiting for a reply.
    pub fn in_flight(&self) -> usize {
        lock(&self.waiters).requests.len()
    }

    #[cfg(test)]
    pub(crate) fn probes_waiting(&self) -> usize {
        lock(&self.waiters).probes.len()
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

/// Removes the registry entry when `send` finishes or is dropped.
struct PendingRequest<'a> {
    waiters: &'a Mutex<Waiters>,
    req_id: &'a str,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        lock(self.waiters).requests.remove(self.req_id);
    }
}

/// Registered probe; deregisters itself exactly once, on drop.
pub(crate) struct ProbeWaiter {
    waiters: Arc<Mutex<Waiters>>,
    token: u64,
    rx: Option<oneshot::Receiver<()>>,
}

impl ProbeWaiter {
    /// Resolves `true` on pong, `false` if the dispatcher went away.
    pub(crate) async fn pong(&mut self) -> bool {
        match self.rx.take() {
            Some(rx) => rx.await.is_ok(),
            None => false,
        }
    }
}

impl Drop for ProbeWaiter {
    fn drop(&mut self) {
        lock(&self.waiters).probes.remove(&self.token);
    }
}

/// Marks the registry closed and fails every waiter when the dispatcher ends.
struct CloseOnExit(Arc<Mutex<Waiters>>);

impl Drop for CloseOnExit {
    fn drop(&mut self) {
        let mut w = lock(&self.0);
        w.closed = true;
        w.requests.clear();
        w.probes.clear();
    }
}

// The guard is an argument so it also fires if the task is aborted before its first poll.
async fn dispatch(
    mut rx: broadcast::Receiver<ChannelEvent>,
    source: SourceId,
    registry: CloseOnExit,
) {
    let waiters = &registry.0;
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                fail_pending(waiters, skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if event.source != source {
            trace!("ignoring message from another page context");
            continue;
        }
        let msg = match wire::decode_message(&event.data) {
            Ok(msg) => msg,
            Err(e) => {
                trace!(error = %e, "ignoring non-envelope message");
                continue;
            }
        };
        route(waiters, msg);
    }
    debug!("page channel closed; dispatcher stopped");
}

/// Fails every pending waiter: any of their replies may be among the dropped events.
fn fail_pending(waiters: &Mutex<Waiters>, skipped: u64) {
    let (requests, probes) = {
        let mut w = lock(waiters);
        let requests: Vec<_> = w.requests.drain().map(|(_, tx)| tx).collect();
        (requests, w.probes.drain().count())
    };
    warn!(
        skipped,
        failed_requests = requests.len(),
        failed_probes = probes,
        "page channel receiver lagged; messages dropped"
    );
    for tx in requests {
        let _ = tx.send(Err(BridgeError::Lagged { skipped }));
    }
}

fn route(waiters: &Mutex<Waiters>, msg: PageMessage) {
    if msg.is_pong() {
        let probes: Vec<_> = lock(waiters).probes.drain().map(|(_, tx)| tx).collect();
        for tx in probes {
            let _ = tx.send(());
        }
        return;
    }
    let Some(req_id) = msg.req_id else {
        return;
    };
    let reply = match msg.kind {
        PageMessageType::Response => Ok(msg.payload),
        PageMessageType::ErrorResponse => Err(WalletError::from_payload(&msg.payload).into()),
        PageMessageType::Request => return,
    };
    let tx = lock(waiters).requests.remove(&req_id);
    match tx {
        Some(tx) => {
            trace!(req_id = %req_id, "completing request");
            let _ = tx.send(reply);
        }
        None => trace!(req_id = %req_id, "no pending request for id"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FakeExtension, Reply as FakeReply};
    use crate::protocol::{DAppMessageKind, Permission};
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn req_ids_are_short_random_strings() {
        let a = new_req_id();
        let b = new_req_id();
        assert_eq!(a.len(), REQ_ID_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn resolves_matching_response() {
        let channel = PageChannel::new();
        let page = SourceId::new();
        let _ext = FakeExtension::spawn(&channel, page, |req| match req {
            DAppRequest::Sign { payload, .. } => {
                let signature = format!("sig:{payload}");
                FakeReply::Ok(json!({ "type": "SIGN_RESPONSE", "signature": signature }))
            }
            _ => FakeReply::Silent,
        });
        let correlator = Correlator::spawn(channel, page);
        let res = correlator
            .send(&DAppRequest::Sign {
                source_pkh: "tz1".into(),
                payload: "cafe".into(),
            })
            .await
            .unwrap();
        assert_eq!(
            res,
            DAppResponse::Sign {
                signature: "sig:cafe".into()
            }
        );
        assert_eq!(correlator.in_flight(), 0);
    }

    #[tokio::test]
    async fn mismatched_kind_is_invalid_response() {
        let channel = PageChannel::new();
        let page = SourceId::new();
        let _ext = FakeExtension::spawn(&channel, page, |_| {
            FakeReply::Ok(json!({ "type": "BROADCAST_RESPONSE", "opHash": "oo1" }))
        });
        let correlator = Correlator::spawn(channel, page);
        let err = correlator
            .send(&DAppRequest::GetCurrentPermission)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidResponse));
    }

    #[tokio::test]
    async fn garbage_payload_is_invalid_response() {
        let channel = PageChannel::new();
        let page = SourceId::new();
        let _ext = FakeExtension::spawn(&channel, page, |_| FakeReply::Ok(json!(17)));
        let correlator = Correlator::spawn(channel, page);
        let err = correlator
            .send(&DAppRequest::GetCurrentPermission)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidResponse));
    }

    #[tokio::test]
    async fn error_envelope_is_mapped() {
        let channel = PageChannel::new();
        let page = SourceId::new();
        let _ext = FakeExtension::spawn(&channel, page, |_| FakeReply::Err(json!("NOT_GRANTED")));
        let correlator = Correlator::spawn(channel, page);
        let err = correlator
            .send(&DAppRequest::Broadcast {
                signed_op_bytes: "00".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.wallet_error(), Some(&WalletError::NotGranted));
        assert_eq!(correlator.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_resolve_out_of_order() {
        let channel = PageChannel::new();
        let page = SourceId::new();
        // The first request is answered last.
        let _ext = FakeExtension::spawn_delayed(&channel, page, |req| match req {
            DAppRequest::Sign { payload, .. } if payload == "first" => (
                Duration::from_millis(300),
                FakeReply::Ok(json!({ "type": "SIGN_RESPONSE", "signature": "s-first" })),
            ),
            _ => (
                Duration::from_millis(10),
                FakeReply::Ok(json!({ "type": "SIGN_RESPONSE", "signature": "s-second" })),
            ),
        });
        let correlator = Correlator::spawn(channel, page);
        let first = DAppRequest::Sign {
            source_pkh: "tz1".into(),
            payload: "first".into(),
        };
        let second = DAppRequest::Sign {
            source_pkh: "tz1".into(),
            payload: "second".into(),
        };
        let (a, b) = tokio::join!(correlator.send(&first), correlator.send(&second));
        assert_eq!(
            a.unwrap(),
            DAppResponse::Sign {
                signature: "s-first".into()
            }
        );
        assert_eq!(
            b.unwrap(),
            DAppResponse::Sign {
                signature: "s-second".into()
            }
        );
    }

    #[tokio::test]
    async fn overlapping_requests_use_distinct_ids() {
        let channel = PageChannel::new();
        let page = SourceId::new();
        let mut spy = channel.subscribe();
        let correlator = Correlator::spawn(channel, page);

        let pending_a = correlator.send(&DAppRequest::GetCurrentPermission);
        let pending_b = correlator.send(&DAppRequest::GetCurrentPermission);
        tokio::pin!(pending_a);
        tokio::pin!(pending_b);
        // Poll both once so both are registered and posted.
        tokio::select! {
            biased;
            _ = &mut pending_a => unreachable!(),
            _ = &mut pending_b => unreachable!(),
            _ = tokio::task::yield_now() => {}
        }
        assert_eq!(correlator.in_flight(), 2);

        let a = wire::decode_message(&spy.recv().await.unwrap().data).unwrap();
        let b = wire::decode_message(&spy.recv().await.unwrap().data).unwrap();
        assert!(a.req_id.is_some());
        assert_ne!(a.req_id, b.req_id);
    }

    #[tokio::test]
    async fn ignores_other_page_contexts_and_stray_ids() {
        let channel = PageChannel::new();
        let page = SourceId::new();
        let other_tab = SourceId::new();
        let mut spy = channel.subscribe();
        let correlator = Correlator::spawn(channel.clone(), page);

        let request = DAppRequest::GetCurrentPermission;
        let pending = correlator.send(&request);
        tokio::pin!(pending);
        tokio::select! {
            biased;
            _ = &mut pending => unreachable!(),
            _ = tokio::task::yield_now() => {}
        }
        let posted = wire::decode_message(&spy.recv().await.unwrap().data).unwrap();
        let req_id = posted.req_id.unwrap();

        let granted = json!({
            "type": "GET_CURRENT_PERMISSION_RESPONSE",
            "permission": { "pkh": "tz1a", "rpc": "https://rpc" }
        });
        // Same id from another tab, a wrong id, and a missing id: all ignored.
        let stray = PageMessage::error(json!("NOT_FOUND"), Some(req_id.clone()));
        channel.post_message(other_tab, &stray).unwrap();
        let wrong_id = PageMessage::error(json!("NOT_FOUND"), Some("nope".into()));
        channel.post_message(page, &wrong_id).unwrap();
        let uncorrelated = PageMessage::response(granted.clone(), None);
        channel.post_message(page, &uncorrelated).unwrap();
        channel.post(page, json!("not an envelope"));
        channel.post_message(page, &PageMessage::response(granted, Some(req_id))).unwrap();

        let res = pending.await.unwrap();
        assert_eq!(
            res,
            DAppResponse::GetCurrentPermission {
                permission: Some(Permission {
                    pkh: "tz1a".into(),
                    rpc: "https://rpc".into(),
                    public_key: None,
                })
            }
        );
        assert_eq!(res.kind(), DAppMessageKind::GetCurrentPermission);
    }

    #[tokio::test]
    async fn dropped_send_deregisters() {
        let channel = PageChannel::new();
        let correlator = Correlator::spawn(channel, SourceId::new());
        {
            let pending = correlator.send(&DAppRequest::GetCurrentPermission);
            tokio::pin!(pending);
            tokio::select! {
                biased;
                _ = &mut pending => unreachable!(),
                _ = tokio::task::yield_now() => {}
            }
            assert_eq!(correlator.in_flight(), 1);
        }
        assert_eq!(correlator.in_flight(), 0);
    }

    #[tokio::test]
    async fn lagged_dispatcher_fails_pending_requests() {
        let channel = PageChannel::with_capacity(4);
        let page = SourceId::new();
        let other_tab = SourceId::new();
        let mut spy = channel.subscribe();
        let correlator = Correlator::spawn(channel.clone(), page);

        let request = DAppRequest::Sign {
            source_pkh: "tz1".into(),
            payload: "aa".into(),
        };
        let pending = correlator.send(&request);
        tokio::pin!(pending);
        tokio::select! {
            biased;
            _ = &mut pending => unreachable!(),
            _ = tokio::task::yield_now() => {}
        }
        let posted = wire::decode_message(&spy.recv().await.unwrap().data).unwrap();
        let mut probe = correlator.register_probe().unwrap();

        // The reply lands, then another tab's burst pushes it out of the buffer.
        let reply = PageMessage::response(
            json!({ "type": "SIGN_RESPONSE", "signature": "edsig" }),
            posted.req_id,
        );
        channel.post_message(page, &reply).unwrap();
        for i in 0..10 {
            channel.post(other_tab, json!(i));
        }

        let err = pending.await.unwrap_err();
        let BridgeError::Lagged { skipped } = err else {
            panic!("expected a lag error, got {err:?}");
        };
        assert!(skipped > 0);
        assert!(!probe.pong().await);
        drop(probe);
        assert_eq!(correlator.in_flight(), 0);
        assert_eq!(correlator.probes_waiting(), 0);

        // The dispatcher keeps serving after the overflow.
        let _ext = FakeExtension::spawn(&channel, page, |_| {
            FakeReply::Ok(json!({ "type": "SIGN_RESPONSE", "signature": "edsig2" }))
        });
        let res = correlator.send(&request).await.unwrap();
        assert_eq!(
            res,
            DAppResponse::Sign {
                signature: "edsig2".into()
            }
        );
    }

    #[tokio::test]
    async fn stopped_dispatcher_disconnects() {
        let channel = PageChannel::new();
        let mut correlator = Correlator::spawn(channel, SourceId::new());
        correlator.dispatcher.abort();
        let _ = (&mut correlator.dispatcher).await;
        let err = correlator
            .send(&DAppRequest::GetCurrentPermission)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Disconnected));
        assert!(correlator.register_probe().is_none());
    }
}
