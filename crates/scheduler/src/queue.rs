//! The work-item registry and pending queue.
//!
//! One mutex guards the registry, the FIFO of pending ids and the failure
//! ledger, so every enqueue, dequeue and status change is a single atomic
//! step. A work item is only ever dispatched by moving it from `Queued` to
//! `InFlight` under that lock, which is what keeps at most one compilation
//! per item outstanding.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use oopjit_common::{CompileMode, FailureReason, FunctionSnapshot, SourceHandle, Tier, WorkItemId, WorkItemStatus};
use oopjit_transport::CompileRequest;
use tracing::debug;

use crate::SchedulerError;
use crate::work_item::{CompiledEntry, WorkItem, WorkItemOutcome, WorkItemRequest};

/// What happened to an item after a failed compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Back in the queue for its single automatic retry.
    Requeued(CompileMode),
    Terminal(FailureReason),
}

#[derive(Debug, Default)]
struct QueueState {
    items: HashMap<WorkItemId, WorkItem>,
    pending: VecDeque<WorkItemId>,
    next_id: u64,
    closed: bool,
    failed_sources: HashSet<(SourceHandle, Tier)>,
}

impl QueueState {
    fn insert(&mut self, request: WorkItemRequest) -> WorkItemId {
        self.next_id = self.next_id.saturating_add(1);
        let id = WorkItemId(self.next_id);
        self.items.insert(id, WorkItem::new(id, request));
        id
    }

    fn item_mut(&mut self, id: WorkItemId) -> Result<&mut WorkItem, SchedulerError> {
        self.items.get_mut(&id).ok_or(SchedulerError::UnknownItem(id))
    }

    fn remove_pending(&mut self, id: WorkItemId) {
        self.pending.retain(|pending| *pending != id);
    }

    /// Remembers a terminally failed background item so later background
    /// requests for the same source and tier are declined.
    fn record_failure(&mut self, id: WorkItemId) {
        let Some(item) = self.items.get(&id) else {
            return;
        };
        if item.mode() != CompileMode::Background {
            return;
        }
        let key = (item.source(), item.tier());
        debug!(work_item = %id, source = %key.0, tier = %key.1, "Recorded failed source");
        self.failed_sources.insert(key);
    }
}

#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    settled: Condvar,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new item in `Created`.
    pub fn register(&self, request: WorkItemRequest) -> Result<WorkItemId, SchedulerError> {
        let mut state = self.state();
        if state.closed {
            return Err(SchedulerError::ShutDown);
        }
        Ok(state.insert(request))
    }

    /// Drops an item that was never queued.
    pub fn forget(&self, id: WorkItemId) {
        let mut state = self.state();
        if state.items.get(&id).is_some_and(|item| item.status() == WorkItemStatus::Created) {
            state.items.remove(&id);
        }
    }

    /// What admission needs to know about an item about to be queued.
    /// Fails the same way [`Self::enqueue`] would.
    pub fn admission_view(&self, id: WorkItemId) -> Result<(Arc<FunctionSnapshot>, Tier, bool), SchedulerError> {
        let state = self.state();
        if state.closed {
            return Err(SchedulerError::ShutDown);
        }
        let item = state.items.get(&id).ok_or(SchedulerError::UnknownItem(id))?;
        match item.status() {
            WorkItemStatus::Created => Ok((Arc::clone(item.snapshot()), item.tier(), item.is_speculative())),
            status if status.is_active() => Err(SchedulerError::AlreadyQueued(id)),
            status => Err(SchedulerError::InvalidTransition {
                id,
                from: status,
                to: WorkItemStatus::Queued,
            }),
        }
    }

    /// Appends a `Created` item to the pending queue.
    pub fn enqueue(&self, id: WorkItemId, mode: CompileMode) -> Result<(), SchedulerError> {
        let mut state = self.state();
        if state.closed {
            return Err(SchedulerError::ShutDown);
        }
        let item = state.item_mut(id)?;
        if item.status().is_active() {
            return Err(SchedulerError::AlreadyQueued(id));
        }
        item.transition(WorkItemStatus::Queued)?;
        item.set_mode(mode);
        state.pending.push_back(id);
        Ok(())
    }

    /// Takes the oldest queued background item and marks it `InFlight`.
    ///
    /// Foreground items stay in place for the thread that blocks on them.
    pub fn take_next(&self) -> Option<CompileRequest> {
        let mut state = self.state();
        let QueueState { items, pending, .. } = &mut *state;
        let position = pending.iter().position(|id| {
            items
                .get(id)
                .is_some_and(|item| item.status() == WorkItemStatus::Queued && item.mode() == CompileMode::Background)
        })?;
        let id = pending.remove(position)?;
        let item = items.get_mut(&id)?;
        item.transition(WorkItemStatus::InFlight).ok()?;
        Some(item.compile_request())
    }

    /// Takes one specific queued item out of the pending queue and marks it
    /// `InFlight`.
    pub fn take(&self, id: WorkItemId) -> Result<CompileRequest, SchedulerError> {
        let mut state = self.state();
        let item = state.item_mut(id)?;
        item.transition(WorkItemStatus::InFlight)?;
        let request = item.compile_request();
        state.remove_pending(id);
        Ok(request)
    }

    /// Completes an in-flight item.
    ///
    /// A queued full-tier child is promoted to a new, independent item in the
    /// pending queue and its id returned. Queued baseline items for the same
    /// source become `Superseded` once a full-tier item completes.
    pub fn on_succeeded(&self, id: WorkItemId, entry: CompiledEntry) -> Result<Option<WorkItemId>, SchedulerError> {
        let mut state = self.state();
        let item = state.item_mut(id)?;
        item.transition(WorkItemStatus::Completed)?;
        item.attach_outcome(entry);
        let source = item.source();
        let tier = item.tier();
        let child = item.take_queued_full_tier();

        if tier == Tier::Full {
            let QueueState { items, pending, .. } = &mut *state;
            pending.retain(|pending_id| {
                let Some(other) = items.get_mut(pending_id) else {
                    return false;
                };
                let stale = other.source() == source
                    && other.tier() == Tier::Baseline
                    && other.mode() == CompileMode::Background;
                if stale && other.transition(WorkItemStatus::Superseded).is_ok() {
                    debug!(work_item = %pending_id, by = %id, "Superseded by full tier");
                    return false;
                }
                true
            });
        }

        let promoted = match child {
            Some(child) if !state.closed => {
                let child_id = state.insert(*child);
                let item = state.item_mut(child_id)?;
                item.transition(WorkItemStatus::Queued)?;
                state.pending.push_back(child_id);
                debug!(work_item = %id, child = %child_id, "Promoted queued full-tier item");
                Some(child_id)
            }
            _ => None,
        };

        drop(state);
        self.settled.notify_all();
        Ok(promoted)
    }

    /// Fails an in-flight item, or sends it back for its one retry when the
    /// failure is transient.
    ///
    /// A background item goes to the back of the pending queue; a foreground
    /// item is left `Queued` for its caller to take again.
    pub fn on_failed(&self, id: WorkItemId, reason: FailureReason) -> Result<FailureDisposition, SchedulerError> {
        let mut state = self.state();
        let closed = state.closed;
        let item = state.item_mut(id)?;
        if item.status() != WorkItemStatus::InFlight {
            return Err(SchedulerError::InvalidTransition {
                id,
                from: item.status(),
                to: WorkItemStatus::Failed(reason),
            });
        }

        if reason.is_retryable() && !closed && item.use_transient_retry() {
            item.transition(WorkItemStatus::Queued)?;
            let mode = item.mode();
            if mode == CompileMode::Background {
                state.pending.push_back(id);
            }
            debug!(work_item = %id, "Requeued after transient failure");
            return Ok(FailureDisposition::Requeued(mode));
        }

        item.transition(WorkItemStatus::Failed(reason))?;
        state.record_failure(id);
        drop(state);
        self.settled.notify_all();
        Ok(FailureDisposition::Terminal(reason))
    }

    /// Closes the queue and fails every queued or in-flight item with
    /// `Cancelled`. Returns the ids it cancelled.
    pub fn cancel_all(&self) -> Vec<WorkItemId> {
        let mut state = self.state();
        state.closed = true;
        state.pending.clear();

        let active: Vec<WorkItemId> = state
            .items
            .values()
            .filter(|item| item.status().is_active())
            .map(WorkItem::id)
            .collect();
        for id in &active {
            let cancelled = state
                .item_mut(*id)
                .and_then(|item| item.transition(WorkItemStatus::Failed(FailureReason::Cancelled)));
            match cancelled {
                Ok(()) => state.record_failure(*id),
                Err(err) => debug!(%err, "Failed to cancel work item"),
            }
        }

        drop(state);
        self.settled.notify_all();
        active
    }

    pub fn status(&self, id: WorkItemId) -> Option<WorkItemStatus> {
        self.state().items.get(&id).map(WorkItem::status)
    }

    /// Removes a terminal item and returns what it produced. Items that are
    /// not terminal yet stay where they are.
    pub fn take_outcome(&self, id: WorkItemId) -> Result<WorkItemOutcome, SchedulerError> {
        let mut state = self.state();
        let item = state.items.get(&id).ok_or(SchedulerError::UnknownItem(id))?;
        let status = item.status();
        if !status.is_terminal() {
            return Err(SchedulerError::InvalidTransition {
                id,
                from: status,
                to: status,
            });
        }
        state
            .items
            .remove(&id)
            .and_then(WorkItem::into_outcome)
            .ok_or(SchedulerError::UnknownItem(id))
    }

    /// Blocks until the item is terminal or `timeout` passes. Returns the
    /// status it was last seen in. A timeout too large to represent as a
    /// deadline waits without bound.
    pub fn wait_terminal(&self, id: WorkItemId, timeout: Duration) -> Option<WorkItemStatus> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state();
        loop {
            let status = state.items.get(&id).map(WorkItem::status)?;
            if status.is_terminal() {
                return Some(status);
            }
            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Some(status);
                    }
                    self.settled
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self.settled.wait(state).unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    pub fn previously_failed(&self, source: SourceHandle, tier: Tier) -> bool {
        self.state().failed_sources.contains(&(source, tier))
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn pending_len(&self) -> usize {
        self.state().pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.state()
            .items
            .values()
            .filter(|item| item.status() == WorkItemStatus::InFlight)
            .count()
    }

    /// Items still registered, terminal ones included.
    pub fn len(&self) -> usize {
        self.state().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().items.is_empty()
    }
}
