//! etcd Watch streams.
//!
//! Each client stream gets a session task that reads create, cancel, and
//! progress requests. Every watch created on the stream owns one hub
//! subscription and one relay task moving events from the subscription
//! queue onto the shared outbound stream.
//!
//! ```text
//! client ──WatchRequest──► session ──subscribe──► WatchHub
//!    ▲                        │                      │ bounded queue
//!    │                        ▼                      ▼
//!    └───WatchResponse─── outbound ◄──────────── relay (per watch)
//! ```
//!
//! Cancelling a watch stops its relay before the subscription is removed,
//! so nothing is sent for a watch after its canceled response. Closing
//! the stream tears every watch down the same way.

use super::grpc::SharedState;
use super::proto::{self, watch_create_request::FilterType, watch_request::RequestUnion};
use crate::core::error::BlobKvError;
use crate::kv::{
    KeyRange, KvEvent, Revision, Subscription, SubscriptionId, SubscriptionSpec, WatchFilters,
};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::Status;
use tracing::{debug, warn};

/// Upper bound on events packed into one response.
pub const MAX_EVENTS_PER_RESPONSE: usize = 64;

/// Watch id etcd uses for stream-level responses.
pub const STREAM_WATCH_ID: i64 = -1;

const COMPACTED_REASON: &str = "etcdserver: mvcc: required revision has been compacted";

type Outbound = mpsc::Sender<Result<proto::WatchResponse, Status>>;
type RequestStream = Pin<Box<dyn Stream<Item = Result<proto::WatchRequest, Status>> + Send>>;

/// Stream of responses handed back to tonic.
pub type WatchResponseStream = ReceiverStream<Result<proto::WatchResponse, Status>>;

/// Watch service implementation.
#[derive(Clone, Debug)]
pub struct WatchService {
    state: SharedState,
}

impl WatchService {
    /// Create a new Watch service.
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Start a session for one client stream.
    pub fn open<S>(&self, requests: S) -> WatchResponseStream
    where
        S: Stream<Item = Result<proto::WatchRequest, Status>> + Send + 'static,
    {
        let (outbound, responses) = mpsc::channel(self.state.stream_buffer.max(1));
        let session = WatchSession {
            state: self.state.clone(),
            outbound,
            watches: HashMap::new(),
            next_watch_id: 1,
        };
        tokio::spawn(session.run(Box::pin(requests)));
        ReceiverStream::new(responses)
    }
}

/// The client went away.
#[derive(Debug)]
struct StreamClosed;

struct ActiveWatch {
    subscription: SubscriptionId,
    cancel: watch::Sender<bool>,
    relay: JoinHandle<RelayExit>,
}

/// How a relay finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayExit {
    /// Stopped by the session.
    Stopped,
    /// Sent the lagged cancel itself.
    Lagged,
    /// Its queue or the stream closed with nothing to report.
    Closed,
}

struct WatchSession {
    state: SharedState,
    outbound: Outbound,
    watches: HashMap<i64, ActiveWatch>,
    next_watch_id: i64,
}

impl WatchSession {
    async fn run(mut self, mut requests: RequestStream) {
        let mut shutdown_rx = self.state.shutdown_rx.clone();
        let outbound = self.outbound.clone();
        debug!("watch stream opened");

        loop {
            tokio::select! {
                _ = shutdown_signalled(&mut shutdown_rx) => {
                    debug!("watch stream closing for shutdown");
                    break;
                }
                _ = outbound.closed() => break,
                next = requests.next() => match next {
                    Some(Ok(request)) => {
                        if self.handle(request).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(status)) => {
                        debug!(%status, "watch stream receive error");
                        break;
                    }
                    None => break,
                },
            }
        }

        self.teardown().await;
        debug!("watch stream closed");
    }

    async fn handle(&mut self, request: proto::WatchRequest) -> Result<(), StreamClosed> {
        match request.request_union {
            Some(RequestUnion::CreateRequest(create)) => self.create(create).await,
            Some(RequestUnion::CancelRequest(cancel)) => self.cancel(cancel.watch_id).await,
            Some(RequestUnion::ProgressRequest(_)) => {
                let header = self.state.current_header();
                self.send(proto::WatchResponse {
                    header: Some(header),
                    watch_id: STREAM_WATCH_ID,
                    ..Default::default()
                })
                .await
            }
            None => Ok(()),
        }
    }

    async fn create(&mut self, create: proto::WatchCreateRequest) -> Result<(), StreamClosed> {
        let watch_id = match self.assign_id(create.watch_id) {
            Ok(id) => id,
            Err(err) => {
                debug!(watch_id = create.watch_id, "duplicate watch id");
                let header = self.state.current_header();
                return self
                    .send(proto::WatchResponse {
                        header: Some(header),
                        watch_id: STREAM_WATCH_ID,
                        created: true,
                        canceled: true,
                        cancel_reason: super::errors::etcd_message(&err),
                        ..Default::default()
                    })
                    .await;
            }
        };

        let spec = SubscriptionSpec::new(KeyRange::new(create.key, create.range_end))
            .with_filters(filters_from_wire(&create.filters));
        let hub = Arc::clone(self.state.store.hub());
        let subscription = hub.subscribe(spec);
        // Read after subscribing: every revision above the watermark is
        // published to this subscription.
        let start_after = self.state.store.revision();

        // History is not retained: anything at or below the watermark can
        // no longer be replayed.
        if create.start_revision > 0 && create.start_revision <= start_after {
            hub.unsubscribe(subscription.id);
            debug!(
                watch_id,
                start_revision = create.start_revision,
                "watch start revision already passed"
            );
            return self
                .send(proto::WatchResponse {
                    header: Some(self.state.response_header(start_after)),
                    watch_id,
                    created: true,
                    canceled: true,
                    compact_revision: start_after + 1,
                    cancel_reason: COMPACTED_REASON.to_string(),
                    ..Default::default()
                })
                .await;
        }

        let created = self
            .send(proto::WatchResponse {
                header: Some(self.state.response_header(start_after)),
                watch_id,
                created: true,
                ..Default::default()
            })
            .await;
        if created.is_err() {
            hub.unsubscribe(subscription.id);
            return created;
        }

        let (cancel, cancel_rx) = watch::channel(false);
        let id = subscription.id;
        let relay = Relay {
            watch_id,
            subscription,
            prev_kv: create.prev_kv,
            state: self.state.clone(),
            outbound: self.outbound.clone(),
        };
        let handle = tokio::spawn(relay.run(cancel_rx));
        self.watches.insert(
            watch_id,
            ActiveWatch {
                subscription: id,
                cancel,
                relay: handle,
            },
        );
        debug!(watch_id, subscription = id, "watch created");
        Ok(())
    }

    async fn cancel(&mut self, watch_id: i64) -> Result<(), StreamClosed> {
        let Some(active) = self.watches.remove(&watch_id) else {
            debug!(watch_id, "cancel for unknown watch");
            return Ok(());
        };
        if self.stop(active).await == RelayExit::Lagged {
            debug!(watch_id, "cancel for watch already canceled as lagged");
            return Ok(());
        }
        debug!(watch_id, "watch canceled");

        let header = self.state.current_header();
        self.send(proto::WatchResponse {
            header: Some(header),
            watch_id,
            canceled: true,
            ..Default::default()
        })
        .await
    }

    fn assign_id(&mut self, requested: i64) -> Result<i64, BlobKvError> {
        // A relay that ended on its own (overflow) frees its id.
        self.watches.retain(|_, active| !active.relay.is_finished());

        if requested == 0 {
            while self.watches.contains_key(&self.next_watch_id) {
                self.next_watch_id += 1;
            }
            let id = self.next_watch_id;
            self.next_watch_id += 1;
            return Ok(id);
        }
        if self.watches.contains_key(&requested) {
            return Err(BlobKvError::WatchIdExists {
                watch_id: requested,
            });
        }
        Ok(requested)
    }

    async fn stop(&self, active: ActiveWatch) -> RelayExit {
        let _ = active.cancel.send(true);
        self.state.store.hub().unsubscribe(active.subscription);
        match active.relay.await {
            Ok(exit) => exit,
            Err(e) => {
                warn!(error = %e, "watch relay task failed");
                RelayExit::Closed
            }
        }
    }

    async fn teardown(&mut self) {
        let watches: Vec<ActiveWatch> = self.watches.drain().map(|(_, w)| w).collect();
        for active in watches {
            self.stop(active).await;
        }
    }

    async fn send(&self, response: proto::WatchResponse) -> Result<(), StreamClosed> {
        self.outbound
            .send(Ok(response))
            .await
            .map_err(|_| StreamClosed)
    }
}

/// Moves events for one watch from its hub queue onto the stream.
struct Relay {
    watch_id: i64,
    subscription: Subscription,
    prev_kv: bool,
    state: SharedState,
    outbound: Outbound,
}

impl Relay {
    async fn run(mut self, mut cancel: watch::Receiver<bool>) -> RelayExit {
        loop {
            let first = tokio::select! {
                biased;
                _ = cancel.changed() => return RelayExit::Stopped,
                event = self.subscription.events.recv() => event,
            };

            let Some(first) = first else {
                return self.closed().await;
            };

            let mut batch = vec![first];
            while batch.len() < MAX_EVENTS_PER_RESPONSE {
                match self.subscription.events.try_recv() {
                    Ok(event) => batch.push(event),
                    Err(_) => break,
                }
            }

            let response = self.events_response(&batch);
            let sent = tokio::select! {
                biased;
                _ = cancel.changed() => return RelayExit::Stopped,
                sent = self.outbound.send(Ok(response)) => sent,
            };
            if sent.is_err() {
                debug!(watch_id = self.watch_id, "watch stream gone, dropping subscription");
                self.state.store.hub().unsubscribe(self.subscription.id);
                return RelayExit::Closed;
            }
        }
    }

    fn events_response(&self, batch: &[Arc<KvEvent>]) -> proto::WatchResponse {
        let revision: Revision = batch.last().map_or(0, |event| event.revision());
        proto::WatchResponse {
            header: Some(self.state.response_header(revision)),
            watch_id: self.watch_id,
            events: batch
                .iter()
                .map(|event| proto::Event::from_record(event, self.prev_kv))
                .collect(),
            ..Default::default()
        }
    }

    /// Queue closed without a cancel request: the hub dropped us.
    async fn closed(&self) -> RelayExit {
        let Some(missed) = self.subscription.missed.get() else {
            return RelayExit::Closed;
        };
        warn!(
            watch_id = self.watch_id,
            missed_from = missed,
            "watcher lagged, canceling"
        );
        let response = proto::WatchResponse {
            header: Some(self.state.current_header()),
            watch_id: self.watch_id,
            canceled: true,
            compact_revision: missed,
            cancel_reason: lagged_reason(missed),
            ..Default::default()
        };
        let _ = self.outbound.send(Ok(response)).await;
        RelayExit::Lagged
    }
}

/// Cancel reason sent to a watcher whose queue overflowed.
pub fn lagged_reason(missed: Revision) -> String {
    format!(
        "etcdserver: watcher lagged, missed events from revision {}; resynchronize",
        missed
    )
}

fn filters_from_wire(filters: &[i32]) -> WatchFilters {
    filters
        .iter()
        .filter_map(|raw| FilterType::try_from(*raw).ok())
        .fold(WatchFilters::empty(), |acc, filter| match filter {
            FilterType::Noput => acc | WatchFilters::NOPUT,
            FilterType::Nodelete => acc | WatchFilters::NODELETE,
        })
}

/// Resolves once shutdown is requested. Never resolves if the sender is
/// gone without having requested it.
async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filters_from_wire() {
        assert_eq!(filters_from_wire(&[]), WatchFilters::empty());
        assert_eq!(filters_from_wire(&[0]), WatchFilters::NOPUT);
        assert_eq!(
            filters_from_wire(&[0, 1]),
            WatchFilters::NOPUT | WatchFilters::NODELETE
        );
        // Unknown values are ignored.
        assert_eq!(filters_from_wire(&[7]), WatchFilters::empty());
    }

    #[test]
    fn test_lagged_reason() {
        assert_eq!(
            lagged_reason(42),
            "etcdserver: watcher lagged, missed events from revision 42; resynchronize"
        );
    }

    #[tokio::test]
    async fn test_shutdown_signalled_ignores_dropped_sender() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        let waited = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            shutdown_signalled(&mut rx),
        )
        .await;
        assert!(waited.is_err());

        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        shutdown_signalled(&mut rx).await;
    }
}
