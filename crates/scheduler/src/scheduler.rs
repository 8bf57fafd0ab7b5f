use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use oopjit_common::{CompileMode, FailureReason, JitConfig, SchedulerConfig, WorkItemId, WorkItemStatus};
use oopjit_transport::{CompilationTransport, CompileResult, TransportError};
use tracing::{debug, info, warn};

use crate::admission::{AdmissionPolicy, DeclineReason};
use crate::installer::{CodeInstaller, ExecutableHint};
use crate::metrics::{MetricsSnapshot, SchedulerMetrics};
use crate::pool::{Job, WorkerPool};
use crate::queue::{FailureDisposition, WorkQueue};
use crate::work_item::{CompiledEntry, WorkItemOutcome, WorkItemRequest};
use crate::SchedulerError;

/// Result of handing a background request to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted(WorkItemId),
    Declined(DeclineReason),
}

/// Drives work items from the queue through a transport and installs the
/// results.
///
/// Background items are dispatched by the worker pool; foreground items are
/// compiled on the thread that asks for them. Dropping the scheduler shuts it
/// down.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    queue: WorkQueue,
    admission: AdmissionPolicy,
    metrics: SchedulerMetrics,
    transport: Arc<dyn CompilationTransport>,
    installer: Arc<dyn CodeInstaller>,
    pool: Mutex<Option<WorkerPool>>,
    config: SchedulerConfig,
    this: Weak<SchedulerInner>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.inner.queue.pending_len())
            .field("in_flight", &self.inner.queue.in_flight_len())
            .field("metrics", &self.inner.metrics.snapshot())
            .finish()
    }
}

impl Scheduler {
    pub fn new(
        config: &JitConfig,
        transport: Arc<dyn CompilationTransport>,
        installer: Arc<dyn CodeInstaller>,
    ) -> Result<Self, SchedulerError> {
        let pool = WorkerPool::start(config.scheduler.worker_threads)?;
        info!(
            workers = pool.num_workers(),
            hybrid_foreground = config.scheduler.hybrid_foreground,
            "Starting JIT scheduler"
        );
        let inner = Arc::new_cyclic(|this| SchedulerInner {
            queue: WorkQueue::new(),
            admission: AdmissionPolicy::new(config.admission.clone()),
            metrics: SchedulerMetrics::default(),
            transport,
            installer,
            pool: Mutex::new(Some(pool)),
            config: config.scheduler.clone(),
            this: this.clone(),
        });
        Ok(Self { inner })
    }

    /// Registers a request without queueing it.
    pub fn register(&self, request: WorkItemRequest) -> Result<WorkItemId, SchedulerError> {
        self.inner.queue.register(request)
    }

    /// Queues a registered item for background compilation, subject to
    /// admission. A declined item stays registered in `Created`.
    pub fn enqueue(&self, id: WorkItemId) -> Result<SubmitOutcome, SchedulerError> {
        self.inner.enqueue_background(id)
    }

    /// Registers and queues a background request. A declined request is not
    /// kept.
    pub fn submit(&self, request: WorkItemRequest) -> Result<SubmitOutcome, SchedulerError> {
        let id = self.inner.queue.register(request)?;
        let outcome = self.inner.enqueue_background(id);
        if !matches!(outcome, Ok(SubmitOutcome::Accepted(_))) {
            self.inner.queue.forget(id);
        }
        outcome
    }

    /// Compiles `request` on the calling thread and returns the installed
    /// entry point.
    ///
    /// A transient failure is retried once before giving up. On error the
    /// caller keeps interpreting.
    pub fn compile_foreground(&self, request: WorkItemRequest) -> Result<CompiledEntry, SchedulerError> {
        let inner = &self.inner;
        let id = inner.queue.register(request)?;
        inner.queue.enqueue(id, CompileMode::Foreground)?;
        inner.metrics.inc_enqueued();

        // Queued again only for the one transient retry
        while inner.queue.status(id) == Some(WorkItemStatus::Queued) {
            if let Err(err) = inner.dispatch(id) {
                debug!(work_item = %id, %err, "Foreground dispatch stopped");
                break;
            }
        }

        match inner.queue.take_outcome(id)? {
            WorkItemOutcome::Compiled(entry) => Ok(entry),
            WorkItemOutcome::Failed(reason) => Err(SchedulerError::Compilation { id, reason }),
            WorkItemOutcome::Superseded => Err(SchedulerError::Compilation {
                id,
                reason: FailureReason::Cancelled,
            }),
        }
    }

    pub fn status(&self, id: WorkItemId) -> Option<WorkItemStatus> {
        self.inner.queue.status(id)
    }

    /// Blocks until `id` is terminal or `timeout` passes.
    pub fn wait(&self, id: WorkItemId, timeout: Duration) -> Option<WorkItemStatus> {
        self.inner.queue.wait_terminal(id, timeout)
    }

    /// Consumes a terminal item. Installed code now belongs to the caller.
    pub fn take_outcome(&self, id: WorkItemId) -> Result<WorkItemOutcome, SchedulerError> {
        self.inner.queue.take_outcome(id)
    }

    /// Destroys a terminal item and frees any code it installed. A promoted
    /// full-tier child lives on as its own item.
    pub fn release(&self, id: WorkItemId) -> Result<(), SchedulerError> {
        if let WorkItemOutcome::Compiled(entry) = self.inner.queue.take_outcome(id)? {
            self.free_code(&entry);
        }
        Ok(())
    }

    /// Frees code previously handed out by [`Self::take_outcome`] or
    /// [`Self::compile_foreground`].
    pub fn free_code(&self, entry: &CompiledEntry) {
        self.inner.free_installed(entry);
    }

    /// Starts a new speculation budget epoch.
    pub fn begin_epoch(&self) {
        self.inner.admission.begin_epoch();
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.queue.pending_len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.inner.queue.in_flight_len()
    }

    /// Cancels every queued and in-flight item, disconnects the transport
    /// and joins the workers. Later calls do nothing.
    pub fn shutdown(&self) {
        let pool = self.inner.pool().take();
        let Some(pool) = pool else {
            return;
        };
        let cancelled = self.inner.queue.cancel_all();
        self.inner.metrics.add_cancelled(u64::try_from(cancelled.len()).unwrap_or(u64::MAX));
        self.inner.transport.disconnect();
        drop(pool);
        info!(cancelled = cancelled.len(), "JIT scheduler shut down");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl SchedulerInner {
    fn pool(&self) -> MutexGuard<'_, Option<WorkerPool>> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue_background(&self, id: WorkItemId) -> Result<SubmitOutcome, SchedulerError> {
        let (snapshot, tier, speculative) = self.queue.admission_view(id)?;
        if self.queue.previously_failed(snapshot.function, tier) {
            self.metrics.inc_declined();
            return Ok(SubmitOutcome::Declined(DeclineReason::PreviouslyFailed));
        }
        if let Err(reason) = self.admission.admit(&snapshot, speculative) {
            debug!(work_item = %id, %reason, "Declined background compilation");
            self.metrics.inc_declined();
            return Ok(SubmitOutcome::Declined(reason));
        }

        let pending = self.queue.pending_len();
        if let Err(err) = self.queue.enqueue(id, CompileMode::Background) {
            self.admission.refund(&snapshot, speculative);
            return Err(err);
        }
        self.metrics.inc_enqueued();

        if self.config.hybrid_foreground && pending > self.config.hybrid_foreground_queue_threshold {
            debug!(work_item = %id, pending, "Queue is long, compiling on the calling thread");
            self.dispatch(id)?;
        } else {
            self.schedule_dispatch();
        }
        Ok(SubmitOutcome::Accepted(id))
    }

    /// Asks a worker to dispatch the next pending background item.
    fn schedule_dispatch(&self) {
        let weak = self.this.clone();
        let job: Job = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.dispatch_next();
            }
        });
        let pool = self.pool();
        if let Some(pool) = pool.as_ref() {
            if pool.execute(job).is_err() {
                debug!("Worker pool closed, dispatch dropped");
            }
        }
    }

    fn dispatch_next(&self) {
        let Some(request) = self.queue.take_next() else {
            return;
        };
        self.metrics.inc_dispatched();
        let id = request.work_item;
        let hint = ExecutableHint {
            tier: request.tier,
            kind: request.kind,
        };
        debug!(work_item = %id, tier = %request.tier, "Dispatching work item");

        let weak = self.this.clone();
        self.transport.submit_async(
            request,
            Box::new(move |result| {
                let Some(inner) = weak.upgrade() else {
                    debug!(work_item = %id, "Scheduler gone, dropping result");
                    return;
                };
                inner.reconcile_later(id, hint, result);
            }),
        );
    }

    /// Completions run on a worker ahead of new dispatches, or inline once
    /// the pool is gone.
    fn reconcile_later(&self, id: WorkItemId, hint: ExecutableHint, result: Result<CompileResult, TransportError>) {
        let weak = self.this.clone();
        let job: Job = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.reconcile(id, hint, result);
            }
        });
        let rejected = match self.pool().as_ref() {
            Some(pool) => pool.execute_priority(job).err(),
            None => Some(job),
        };
        if let Some(job) = rejected {
            job();
        }
    }

    /// Compiles one specific queued item on the calling thread.
    fn dispatch(&self, id: WorkItemId) -> Result<(), SchedulerError> {
        let request = self.queue.take(id)?;
        self.metrics.inc_dispatched();
        let hint = ExecutableHint {
            tier: request.tier,
            kind: request.kind,
        };
        let result = self.transport.submit(request);
        self.reconcile(id, hint, result);
        Ok(())
    }

    fn reconcile(&self, id: WorkItemId, hint: ExecutableHint, result: Result<CompileResult, TransportError>) {
        let compiled = match result {
            Ok(compiled) => compiled,
            Err(err) => {
                debug!(work_item = %id, %err, "Compilation failed");
                return self.fail(id, err.reason());
            }
        };

        if self.queue.status(id) != Some(WorkItemStatus::InFlight) {
            debug!(work_item = %id, "Discarding late result");
            return;
        }

        let entry_offset = usize::try_from(compiled.entry_offset).unwrap_or(usize::MAX);
        let installed = match self.installer.install(&compiled.code, entry_offset, hint) {
            Ok(installed) => installed,
            Err(err) => {
                warn!(work_item = %id, %err, "Failed to install code");
                return self.fail(id, err.reason());
            }
        };
        let entry = CompiledEntry {
            work_item: id,
            code: installed,
            relocations: compiled.relocations,
            deopt: compiled.deopt,
        };

        match self.queue.on_succeeded(id, entry.clone()) {
            Ok(promoted) => {
                self.metrics.inc_completed();
                self.admission.record_native_code(entry.code_size());
                debug!(work_item = %id, code_size = entry.code_size(), "Work item completed");
                if let Some(child) = promoted {
                    self.metrics.inc_enqueued();
                    debug!(work_item = %child, "Queued promoted full-tier item");
                    self.schedule_dispatch();
                }
            }
            Err(err) => {
                // Cancelled while we were installing
                debug!(work_item = %id, %err, "Discarding late result");
                if let Err(err) = self.installer.free(installed.allocation) {
                    warn!(work_item = %id, %err, "Failed to free discarded code");
                }
            }
        }
    }

    fn fail(&self, id: WorkItemId, reason: FailureReason) {
        match self.queue.on_failed(id, reason) {
            Ok(FailureDisposition::Requeued(mode)) => {
                self.metrics.inc_retried();
                if mode == CompileMode::Background {
                    self.schedule_dispatch();
                }
            }
            Ok(FailureDisposition::Terminal(reason)) => {
                self.metrics.inc_failed();
                debug!(work_item = %id, %reason, "Work item failed");
            }
            Err(err) => debug!(work_item = %id, %err, "Discarding late failure"),
        }
    }

    fn free_installed(&self, entry: &CompiledEntry) {
        match self.installer.free(entry.code.allocation) {
            Ok(()) => self.admission.release_native_code(entry.code_size()),
            Err(err) => warn!(work_item = %entry.work_item, %err, "Failed to free installed code"),
        }
    }
}
