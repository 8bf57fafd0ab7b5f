use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Stable identity of a work item. Never reused within a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkItemId(pub u64);

impl Display for WorkItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque reference to the function or loop being compiled. Not owned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceHandle(pub u64);

impl Display for SourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fn@{:#x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    Baseline,
    Full,
}

impl Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Baseline => write!(f, "baseline"),
            Self::Full => write!(f, "full"),
        }
    }
}

/// Whether the requester blocks for the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompileMode {
    Foreground,
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkItemKind {
    Function,
    LoopBody { loop_number: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkItemStatus {
    Created,
    Queued,
    InFlight,
    Completed,
    Failed(FailureReason),
    /// Replaced by a newer request for the same source before it ran.
    Superseded,
}

impl WorkItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_) | Self::Superseded)
    }

    /// Queued or in flight.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::InFlight)
    }
}

impl Display for WorkItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Queued => write!(f, "Queued"),
            Self::InFlight => write!(f, "InFlight"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed(reason) => write!(f, "Failed({reason:?})"),
            Self::Superseded => write!(f, "Superseded"),
        }
    }
}

/// Normalized failure kinds. Every lower-level error is mapped onto one of
/// these before it reaches the scheduler.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error,
)]
pub enum FailureReason {
    #[error("Out of memory while building or installing the request")]
    OutOfMemory,
    #[error("Transient transport failure")]
    TransientTransportError,
    #[error("Compilation server is unavailable")]
    ServerUnavailable,
    #[error("Work item is already queued")]
    AlreadyQueued,
    #[error("Operation is invalid in the current state")]
    InvalidState,
    #[error("Cancelled by shutdown")]
    Cancelled,
    #[error("Code generator aborted the compilation")]
    CodegenAborted,
}

/// Wire status code for a successful call.
pub const STATUS_OK: u32 = 0;

impl From<FailureReason> for u32 {
    fn from(value: FailureReason) -> u32 {
        match value {
            FailureReason::OutOfMemory => 1,
            FailureReason::TransientTransportError => 2,
            FailureReason::ServerUnavailable => 3,
            FailureReason::AlreadyQueued => 4,
            FailureReason::InvalidState => 5,
            FailureReason::Cancelled => 6,
            FailureReason::CodegenAborted => 7,
        }
    }
}

impl FailureReason {
    /// Decodes a wire status code. [`STATUS_OK`] yields `None`; codes this
    /// side does not know are treated as transient.
    pub fn from_status_code(code: u32) -> Option<Self> {
        match code {
            STATUS_OK => None,
            1 => Some(Self::OutOfMemory),
            3 => Some(Self::ServerUnavailable),
            4 => Some(Self::AlreadyQueued),
            5 => Some(Self::InvalidState),
            6 => Some(Self::Cancelled),
            7 => Some(Self::CodegenAborted),
            _ => Some(Self::TransientTransportError),
        }
    }

    /// Only transport hiccups earn an automatic resubmission.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientTransportError)
    }

    pub fn all() -> impl Iterator<Item = FailureReason> {
        [
            Self::OutOfMemory,
            Self::TransientTransportError,
            Self::ServerUnavailable,
            Self::AlreadyQueued,
            Self::InvalidState,
            Self::Cancelled,
            Self::CodegenAborted,
        ]
        .into_iter()
    }
}
