use oopjit_common::{FailureReason, WorkItemId, WorkItemStatus};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Work item {0} is already queued")]
    AlreadyQueued(WorkItemId),
    #[error("Work item {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: WorkItemId,
        from: WorkItemStatus,
        to: WorkItemStatus,
    },
    #[error("Unknown work item {0}")]
    UnknownItem(WorkItemId),
    #[error("Scheduler has been shut down")]
    ShutDown,
    #[error("Failed to spawn compiler worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("Compilation of {id} failed: {reason}")]
    Compilation { id: WorkItemId, reason: FailureReason },
}

impl SchedulerError {
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::AlreadyQueued(_) => FailureReason::AlreadyQueued,
            Self::InvalidTransition { .. } | Self::UnknownItem(_) | Self::Spawn(_) => FailureReason::InvalidState,
            Self::ShutDown => FailureReason::Cancelled,
            Self::Compilation { reason, .. } => *reason,
        }
    }
}

/// Failure to make generated code executable.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("Out of executable memory: requested {requested} bytes, {available} available")]
    OutOfExecutableMemory { requested: usize, available: usize },
    #[error("Failed to map executable memory: {0}")]
    Map(#[source] std::io::Error),
    #[error("Failed to protect executable memory: {0}")]
    Protect(#[source] std::io::Error),
    #[error("Refusing to install empty code")]
    EmptyCode,
    #[error("Entry offset {entry_offset} outside {code_size} bytes of code")]
    EntryOutOfRange { entry_offset: usize, code_size: usize },
    #[error("Unknown code allocation {0}")]
    UnknownAllocation(u64),
}

impl InstallError {
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::OutOfExecutableMemory { .. } | Self::Map(_) | Self::Protect(_) => FailureReason::OutOfMemory,
            Self::EmptyCode | Self::EntryOutOfRange { .. } => FailureReason::CodegenAborted,
            Self::UnknownAllocation(_) => FailureReason::InvalidState,
        }
    }
}
