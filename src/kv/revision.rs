//! Revision clock and commit sequencing.
//!
//! Revisions are handed out by [`RevisionClock::next`] as tickets. A
//! ticket is resolved exactly once: committed with the event it produced,
//! or aborted (explicitly or by being dropped) when the backend write
//! failed. Resolutions are applied in revision order, so the watch hub
//! sees events strictly ordered even though writes to different keys
//! finish in any order.
//!
//! The committed watermark is the highest revision below which every
//! issued ticket has been resolved. Aborted revisions are skipped, never
//! reissued. A committed mutation is only acknowledged once the watermark
//! reaches it, see [`RevisionClock::wait_committed`].

use super::record::KvEvent;
use super::watch::WatchHub;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::trace;

/// Global revision number. The first mutation gets revision 1.
pub type Revision = i64;

#[derive(Debug)]
struct ClockState {
    /// Next revision to hand out.
    next: Revision,
    /// Highest revision with every lower revision resolved.
    committed: Revision,
    /// Issued, not yet resolved.
    in_flight: BTreeSet<Revision>,
    /// Resolved but waiting on a lower in-flight revision.
    resolved: BTreeMap<Revision, Option<Arc<KvEvent>>>,
}

/// Snapshot of clock positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockStats {
    /// Last revision handed out.
    pub current: Revision,
    /// Committed watermark.
    pub committed: Revision,
    /// Tickets issued but not resolved.
    pub in_flight: usize,
}

/// Process-wide revision counter feeding the watch hub.
#[derive(Debug)]
pub struct RevisionClock {
    state: Mutex<ClockState>,
    hub: Arc<WatchHub>,
    /// Mirrors `ClockState::committed`; only written under the state lock.
    committed_tx: watch::Sender<Revision>,
}

impl RevisionClock {
    /// Create a clock starting at revision 1 that publishes into `hub`.
    pub fn new(hub: Arc<WatchHub>) -> Self {
        let (committed_tx, _) = watch::channel(0);
        Self {
            state: Mutex::new(ClockState {
                next: 1,
                committed: 0,
                in_flight: BTreeSet::new(),
                resolved: BTreeMap::new(),
            }),
            hub,
            committed_tx,
        }
    }

    /// Issue the next revision.
    ///
    /// Strictly greater than every revision issued before by this clock.
    pub fn next(self: &Arc<Self>) -> RevisionTicket {
        let mut state = self.state.lock();
        let revision = state.next;
        state.next += 1;
        state.in_flight.insert(revision);
        trace!(revision, "revision issued");
        RevisionTicket {
            clock: Arc::clone(self),
            revision,
            resolved: false,
        }
    }

    /// Make sure future revisions exceed `revision`.
    ///
    /// Called with revisions read back from storage, so a fresh process
    /// never stamps a key with a revision at or below the one it carries.
    pub fn witness(&self, revision: Revision) {
        let mut state = self.state.lock();
        if revision >= state.next {
            state.next = revision + 1;
            if state.in_flight.is_empty() {
                state.committed = revision;
                self.committed_tx.send_replace(revision);
            }
        }
    }

    /// Wait until the committed watermark reaches `revision`.
    ///
    /// Once this returns, the event for `revision` (if any) has been
    /// handed to the watch hub and every lower revision is resolved.
    pub async fn wait_committed(&self, revision: Revision) {
        let mut committed = self.committed_tx.subscribe();
        // The sender lives as long as the clock, so this cannot fail.
        let _ = committed.wait_for(|&rev| rev >= revision).await;
    }

    /// Last revision handed out.
    pub fn current(&self) -> Revision {
        self.state.lock().next - 1
    }

    /// Committed watermark.
    pub fn committed(&self) -> Revision {
        self.state.lock().committed
    }

    /// Get clock positions.
    pub fn stats(&self) -> ClockStats {
        let state = self.state.lock();
        ClockStats {
            current: state.next - 1,
            committed: state.committed,
            in_flight: state.in_flight.len(),
        }
    }

    /// Watch hub events are published into.
    pub fn hub(&self) -> &Arc<WatchHub> {
        &self.hub
    }

    fn resolve(&self, revision: Revision, event: Option<Arc<KvEvent>>) {
        let mut state = self.state.lock();
        if !state.in_flight.remove(&revision) {
            return;
        }
        state.resolved.insert(revision, event);

        // Release everything below the lowest unresolved revision. Holding
        // the clock lock while publishing keeps the hub in revision order.
        loop {
            let Some((&rev, _)) = state.resolved.first_key_value() else {
                break;
            };
            if state.in_flight.first().is_some_and(|&low| low < rev) {
                break;
            }
            let ready = state.resolved.remove(&rev).flatten();
            state.committed = state.committed.max(rev);
            if let Some(event) = ready {
                self.hub.publish(event);
            }
        }

        if state.in_flight.is_empty() {
            state.committed = state.next - 1;
        }
        self.committed_tx.send_replace(state.committed);
    }
}

/// A reserved revision that must be committed or aborted.
///
/// Dropping an unresolved ticket aborts it.
#[derive(Debug)]
#[must_use = "an unresolved ticket blocks later revisions until dropped"]
pub struct RevisionTicket {
    clock: Arc<RevisionClock>,
    revision: Revision,
    resolved: bool,
}

impl RevisionTicket {
    /// The reserved revision.
    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Mark the mutation durable and hand its event to the watch hub.
    pub fn commit(mut self, event: KvEvent) {
        debug_assert_eq!(event.revision(), self.revision);
        self.resolved = true;
        self.clock.resolve(self.revision, Some(Arc::new(event)));
    }

    /// Give the revision up without publishing anything.
    pub fn abort(mut self) {
        self.resolved = true;
        self.clock.resolve(self.revision, None);
    }
}

impl Drop for RevisionTicket {
    fn drop(&mut self) {
        if !self.resolved {
            trace!(revision = self.revision, "revision ticket dropped");
            self.clock.resolve(self.revision, None);
        }
    }
}
