use oopjit_arena::ArenaError;
use oopjit_common::{FailureReason, SnapshotError};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error on compile channel: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to encode or decode message: {0}")]
    Codec(#[from] bincode::Error),
    #[error("Frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: u32 },
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),
    #[error("Arena error: {0}")]
    Arena(#[from] ArenaError),
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("Not connected to a compile server")]
    NotConnected,
    #[error("Compile server process has exited")]
    ServerExited,
    #[error("Compile server not reachable after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("Remote call failed: {0}")]
    Remote(FailureReason),
    #[error("Session was closed while the request was in flight")]
    StaleResponse,
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl TransportError {
    /// The normalized failure kind the scheduler reacts to.
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::Io(_)
            | Self::Codec(_)
            | Self::FrameTooLarge { .. }
            | Self::UnexpectedReply(_)
            | Self::Snapshot(_)
            | Self::Runtime(_) => FailureReason::TransientTransportError,
            Self::Arena(err) if err.is_out_of_memory() => FailureReason::OutOfMemory,
            Self::Arena(_) => FailureReason::TransientTransportError,
            Self::NotConnected | Self::ServerExited | Self::RetriesExhausted { .. } => {
                FailureReason::ServerUnavailable
            }
            Self::Remote(reason) => *reason,
            Self::StaleResponse => FailureReason::Cancelled,
        }
    }
}
