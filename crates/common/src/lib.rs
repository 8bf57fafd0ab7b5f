pub mod config;
pub mod snapshot;
pub mod types;

pub use config::{
    AdmissionConfig, ArenaConfig, ConfigError, JitConfig, SchedulerConfig, ServerConfig,
    TransportConfig,
};
pub use snapshot::{BytecodeInfo, FunctionSnapshot, ProfileSnapshot, SnapshotError};
pub use types::{
    CompileMode, FailureReason, STATUS_OK, SourceHandle, Tier, WorkItemId, WorkItemKind,
    WorkItemStatus,
};
