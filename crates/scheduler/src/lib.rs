//! Work-item lifecycle and background compilation.
//!
//! The [`Scheduler`] registers compilation requests as [`WorkItem`]s, admits
//! background requests against the speculation budget, dispatches them to a
//! [`CompilationTransport`](oopjit_transport::CompilationTransport) from a
//! pool of compiler threads and publishes the results through a
//! [`CodeInstaller`].

pub mod admission;
mod error;
pub mod installer;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod scheduler;
pub mod work_item;

pub use admission::{AdmissionPolicy, DeclineReason};
pub use error::{InstallError, SchedulerError};
pub use installer::{AllocationId, CodeInstaller, ExecutableHint, ExecutableMemoryInstaller, InstalledCode};
pub use metrics::{MetricsSnapshot, SchedulerMetrics};
pub use pool::WorkerPool;
pub use queue::{FailureDisposition, WorkQueue};
pub use scheduler::{Scheduler, SubmitOutcome};
pub use work_item::{CompiledEntry, WorkItem, WorkItemOutcome, WorkItemRequest};
