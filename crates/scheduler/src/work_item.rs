//! Work items and their lifecycle.
//!
//! An item moves `Created -> Queued -> InFlight` and ends in exactly one of
//! `Completed`, `Failed` or `Superseded`. A transient failure sends an
//! in-flight item back to `Queued`. Any other move is rejected with
//! [`SchedulerError::InvalidTransition`].

use std::sync::Arc;

use bytes::Bytes;
use oopjit_common::{
    CompileMode, FailureReason, FunctionSnapshot, SourceHandle, Tier, WorkItemId, WorkItemKind, WorkItemStatus,
};
use oopjit_transport::CompileRequest;
use tracing::trace;

use crate::SchedulerError;
use crate::installer::InstalledCode;

/// What a caller asks to have compiled. Becomes a [`WorkItem`] once
/// registered with a queue.
#[derive(Debug, Clone)]
pub struct WorkItemRequest {
    pub snapshot: Arc<FunctionSnapshot>,
    pub tier: Tier,
    pub kind: WorkItemKind,
    /// Subject to the speculation budget when queued in the background.
    pub speculative: bool,
    pub queued_full_tier: Option<Box<WorkItemRequest>>,
}

impl WorkItemRequest {
    pub fn function(snapshot: Arc<FunctionSnapshot>, tier: Tier) -> Self {
        Self {
            snapshot,
            tier,
            kind: WorkItemKind::Function,
            speculative: false,
            queued_full_tier: None,
        }
    }

    pub fn loop_body(snapshot: Arc<FunctionSnapshot>, tier: Tier, loop_number: u32) -> Self {
        Self {
            kind: WorkItemKind::LoopBody { loop_number },
            ..Self::function(snapshot, tier)
        }
    }

    pub fn speculative(mut self) -> Self {
        self.speculative = true;
        self
    }

    /// Attaches a full-tier request that is queued once this one completes.
    pub fn with_full_tier_child(mut self, child: WorkItemRequest) -> Self {
        self.queued_full_tier = Some(Box::new(child));
        self
    }

    pub fn source(&self) -> SourceHandle {
        self.snapshot.function
    }
}

/// Installed code for a completed work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledEntry {
    pub work_item: WorkItemId,
    pub code: InstalledCode,
    pub relocations: Bytes,
    pub deopt: Bytes,
}

impl CompiledEntry {
    pub fn entry_address(&self) -> usize {
        self.code.entry_address
    }

    pub fn code_size(&self) -> usize {
        self.code.code_size
    }
}

/// What is left of a terminal work item once the caller consumes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkItemOutcome {
    Compiled(CompiledEntry),
    Failed(FailureReason),
    Superseded,
}

#[derive(Debug)]
pub struct WorkItem {
    id: WorkItemId,
    tier: Tier,
    kind: WorkItemKind,
    mode: CompileMode,
    status: WorkItemStatus,
    snapshot: Arc<FunctionSnapshot>,
    speculative: bool,
    queued_full_tier: Option<Box<WorkItemRequest>>,
    transient_retry_used: bool,
    outcome: Option<CompiledEntry>,
}

impl WorkItem {
    pub(crate) fn new(id: WorkItemId, request: WorkItemRequest) -> Self {
        Self {
            id,
            tier: request.tier,
            kind: request.kind,
            mode: CompileMode::Background,
            status: WorkItemStatus::Created,
            snapshot: request.snapshot,
            speculative: request.speculative,
            queued_full_tier: request.queued_full_tier,
            transient_retry_used: false,
            outcome: None,
        }
    }

    pub fn id(&self) -> WorkItemId {
        self.id
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn kind(&self) -> WorkItemKind {
        self.kind
    }

    pub fn mode(&self) -> CompileMode {
        self.mode
    }

    pub fn status(&self) -> WorkItemStatus {
        self.status
    }

    pub fn source(&self) -> SourceHandle {
        self.snapshot.function
    }

    pub fn snapshot(&self) -> &Arc<FunctionSnapshot> {
        &self.snapshot
    }

    pub fn is_speculative(&self) -> bool {
        self.speculative
    }

    pub fn has_queued_full_tier(&self) -> bool {
        self.queued_full_tier.is_some()
    }

    pub(crate) fn set_mode(&mut self, mode: CompileMode) {
        self.mode = mode;
    }

    pub(crate) fn take_queued_full_tier(&mut self) -> Option<Box<WorkItemRequest>> {
        self.queued_full_tier.take()
    }

    pub(crate) fn attach_outcome(&mut self, entry: CompiledEntry) {
        self.outcome = Some(entry);
    }

    /// Marks the one automatic retry as spent. Returns `false` if it already
    /// was.
    pub(crate) fn use_transient_retry(&mut self) -> bool {
        !std::mem::replace(&mut self.transient_retry_used, true)
    }

    pub(crate) fn compile_request(&self) -> CompileRequest {
        CompileRequest {
            work_item: self.id,
            tier: self.tier,
            kind: self.kind,
            snapshot: Arc::clone(&self.snapshot),
        }
    }

    pub(crate) fn into_outcome(self) -> Option<WorkItemOutcome> {
        match self.status {
            WorkItemStatus::Completed => self.outcome.map(WorkItemOutcome::Compiled),
            WorkItemStatus::Failed(reason) => Some(WorkItemOutcome::Failed(reason)),
            WorkItemStatus::Superseded => Some(WorkItemOutcome::Superseded),
            WorkItemStatus::Created | WorkItemStatus::Queued | WorkItemStatus::InFlight => None,
        }
    }

    /// Moves the item along the lifecycle, rejecting any edge the state
    /// machine does not have. Terminal states are never left.
    pub(crate) fn transition(&mut self, to: WorkItemStatus) -> Result<(), SchedulerError> {
        use WorkItemStatus::*;
        let allowed = match (self.status, to) {
            (Created, Queued) | (Queued, InFlight) => true,
            (InFlight, Completed) | (InFlight, Failed(_)) => true,
            // Transient failure goes back to the queue
            (InFlight, Queued) => true,
            (Queued, Failed(FailureReason::Cancelled)) => true,
            (Queued, Superseded) => true,
            _ => false,
        };
        if !allowed {
            return Err(SchedulerError::InvalidTransition {
                id: self.id,
                from: self.status,
                to,
            });
        }
        trace!(work_item = %self.id, from = %self.status, %to, "Work item transition");
        self.status = to;
        if matches!(to, Failed(_) | Superseded) {
            // An unpromoted child dies with its parent
            self.queued_full_tier = None;
        }
        Ok(())
    }
}
