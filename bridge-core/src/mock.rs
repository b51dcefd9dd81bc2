//! Scripted stand-in for the extension relay, used by unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::channel::{PageChannel, SourceId};
use crate::protocol::{DAppRequest, PageMessage, PageMessageType};
use crate::wire;

/// What the fake extension does with one correlated request.
pub(crate) enum Reply {
    Ok(Value),
    Err(Value),
    Silent,
}

/// Answers pings (while `available`) and correlated requests posted by `page`.
pub(crate) struct FakeExtension {
    available: Arc<AtomicBool>,
    requests: Arc<AtomicUsize>,
    pings: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl FakeExtension {
    pub(crate) fn spawn<H>(channel: &PageChannel, page: SourceId, handler: H) -> Self
    where
        H: Fn(&DAppRequest) -> Reply + Send + 'static,
    {
        Self::spawn_delayed(channel, page, move |req| (Duration::ZERO, handler(req)))
    }

    /// Like `spawn`, but each reply is posted after its own delay.
    pub(crate) fn spawn_delayed<H>(channel: &PageChannel, page: SourceId, handler: H) -> Self
    where
        H: Fn(&DAppRequest) -> (Duration, Reply) + Send + 'static,
    {
        let available = Arc::new(AtomicBool::new(true));
        let requests = Arc::new(AtomicUsize::new(0));
        let pings = Arc::new(AtomicUsize::new(0));
        let mut rx = channel.subscribe();
        let channel = channel.clone();
        let (avail, reqs, pings_seen) = (available.clone(), requests.clone(), pings.clone());
        let task = tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if event.source != page {
                    continue;
                }
                let Ok(msg) = wire::decode_message(&event.data) else {
                    continue;
                };
                if msg.kind != PageMessageType::Request {
                    continue;
                }
                if msg.is_ping() {
                    pings_seen.fetch_add(1, Ordering::SeqCst);
                    if avail.load(Ordering::SeqCst) {
                        let _ = channel.post_message(page, &PageMessage::pong());
                    }
                    continue;
                }
                if !avail.load(Ordering::SeqCst) {
                    continue;
                }
                let Ok(request) = serde_json::from_value::<DAppRequest>(msg.payload) else {
                    continue;
                };
                reqs.fetch_add(1, Ordering::SeqCst);
                let (delay, reply) = handler(&request);
                let reply = match reply {
                    Reply::Ok(v) => PageMessage::response(v, msg.req_id),
                    Reply::Err(v) => PageMessage::error(v, msg.req_id),
                    Reply::Silent => continue,
                };
                let channel = channel.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = channel.post_message(page, &reply);
                });
            }
        });
        Self {
            available,
            requests,
            pings,
            task,
        }
    }

    pub(crate) fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub(crate) fn requests_seen(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub(crate) fn pings_seen(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

impl Drop for FakeExtension {
    fn drop(&mut self) {
        self.task.abort();
    }
}
