#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::indexing_slicing)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use oopjit_common::{
    AdmissionConfig, BytecodeInfo, FailureReason, FunctionSnapshot, JitConfig, SchedulerConfig, SourceHandle, Tier,
    WorkItemId, WorkItemStatus,
};
use oopjit_scheduler::{
    AllocationId, CodeInstaller, DeclineReason, ExecutableHint, ExecutableMemoryInstaller, InstallError,
    InstalledCode, Scheduler, SchedulerError, SubmitOutcome, WorkItemOutcome, WorkItemRequest,
};
use oopjit_transport::{
    CompilationTransport, CompileRequest, CompileResult, CompletionCallback, InProcessTransport, StubCodeGenerator,
    TransportError,
};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct MockState {
    failures: Mutex<VecDeque<FailureReason>>,
    in_flight: Mutex<HashSet<WorkItemId>>,
    overlapped: AtomicBool,
    submitted: AtomicU64,
    disconnects: AtomicU64,
    delay: Duration,
    /// Compilations of this source block while `hold` is set.
    held_source: Option<SourceHandle>,
    hold: AtomicBool,
}

impl MockState {
    fn compile(&self, request: CompileRequest) -> Result<CompileResult, TransportError> {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        if !self.in_flight.lock().unwrap().insert(request.work_item) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        thread::sleep(self.delay);
        if self.held_source == Some(request.snapshot.function) {
            let deadline = Instant::now() + WAIT;
            while self.hold.load(Ordering::SeqCst) && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
        }
        self.in_flight.lock().unwrap().remove(&request.work_item);

        if let Some(reason) = self.failures.lock().unwrap().pop_front() {
            return Err(TransportError::Remote(reason));
        }
        Ok(CompileResult {
            work_item: request.work_item,
            code: Bytes::from_static(&[0x90, 0x90, 0xc3]),
            relocations: Bytes::new(),
            deopt: Bytes::from(format!("{}:{}", request.work_item, request.tier)),
            entry_offset: 0,
        })
    }
}

/// Answers on its own thread unless `inline_async` is set.
struct MockTransport {
    state: Arc<MockState>,
    inline_async: bool,
    connected: AtomicBool,
}

impl MockTransport {
    fn new(state: MockState) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(state),
            inline_async: false,
            connected: AtomicBool::new(true),
        })
    }

    fn inline(state: MockState) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(state),
            inline_async: true,
            connected: AtomicBool::new(true),
        })
    }

    fn fail_with(&self, reasons: &[FailureReason]) {
        self.state.failures.lock().unwrap().extend(reasons.iter().copied());
    }
}

impl CompilationTransport for MockTransport {
    fn submit(&self, request: CompileRequest) -> Result<CompileResult, TransportError> {
        self.state.compile(request)
    }

    fn submit_async(&self, request: CompileRequest, on_complete: CompletionCallback) {
        if self.inline_async {
            on_complete(self.state.compile(request));
            return;
        }
        let state = Arc::clone(&self.state);
        thread::spawn(move || on_complete(state.compile(request)));
    }

    fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct RecordingInstaller {
    next: AtomicU64,
    live: Mutex<HashSet<u64>>,
    installs: AtomicU64,
}

impl RecordingInstaller {
    fn live(&self) -> usize {
        self.live.lock().unwrap().len()
    }
}

impl CodeInstaller for RecordingInstaller {
    fn install(&self, code: &[u8], entry_offset: usize, _hint: ExecutableHint) -> Result<InstalledCode, InstallError> {
        let id = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        self.live.lock().unwrap().insert(id);
        self.installs.fetch_add(1, Ordering::SeqCst);
        Ok(InstalledCode {
            allocation: AllocationId(id),
            entry_address: 0x10_0000 * usize::try_from(id).unwrap() + entry_offset,
            code_size: code.len(),
        })
    }

    fn free(&self, allocation: AllocationId) -> Result<(), InstallError> {
        if self.live.lock().unwrap().remove(&allocation.0) {
            Ok(())
        } else {
            Err(InstallError::UnknownAllocation(allocation.0))
        }
    }
}

fn config(worker_threads: usize) -> JitConfig {
    JitConfig {
        scheduler: SchedulerConfig {
            worker_threads,
            ..Default::default()
        },
        admission: AdmissionConfig {
            speculation_cap: 100,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn snapshot(source: u64, byte_code_count: u32) -> Arc<FunctionSnapshot> {
    Arc::new(
        FunctionSnapshot::new(SourceHandle(source), format!("fn_{source}")).with_bytecode(BytecodeInfo {
            byte_code_count,
            byte_code_length: byte_code_count * 3,
            ..Default::default()
        }),
    )
}

fn baseline(source: u64) -> WorkItemRequest {
    WorkItemRequest::function(snapshot(source, 10), Tier::Baseline)
}

fn accepted(outcome: Result<SubmitOutcome, SchedulerError>) -> WorkItemId {
    match outcome.unwrap() {
        SubmitOutcome::Accepted(id) => id,
        SubmitOutcome::Declined(reason) => panic!("declined: {reason}"),
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn test_background_items_compile_and_install() {
    let transport = MockTransport::new(MockState::default());
    let installer = Arc::new(RecordingInstaller::default());
    let scheduler = Scheduler::new(&config(3), transport.clone(), installer.clone()).unwrap();

    let ids: Vec<WorkItemId> = (0..8).map(|i| accepted(scheduler.submit(baseline(i)))).collect();
    for id in &ids {
        assert_eq!(scheduler.wait(*id, WAIT), Some(WorkItemStatus::Completed));
    }
    assert_eq!(installer.live(), 8);

    for id in &ids {
        let WorkItemOutcome::Compiled(entry) = scheduler.take_outcome(*id).unwrap() else {
            panic!("expected compiled code");
        };
        assert_eq!(entry.work_item, *id);
        assert_eq!(entry.code_size(), 3);
        assert_eq!(entry.deopt, Bytes::from(format!("{id}:baseline")));
        scheduler.free_code(&entry);
    }
    assert_eq!(installer.live(), 0);
    assert_eq!(scheduler.status(ids[0]), None);

    let metrics = scheduler.metrics();
    assert_eq!(metrics.enqueued, 8);
    assert_eq!(metrics.dispatched, 8);
    assert_eq!(metrics.completed, 8);
    assert_eq!(metrics.failed, 0);
}

#[test]
fn test_at_most_one_compilation_per_item() {
    let transport = MockTransport::new(MockState {
        delay: Duration::from_millis(20),
        ..Default::default()
    });
    let installer = Arc::new(RecordingInstaller::default());
    let scheduler = Scheduler::new(&config(4), transport.clone(), installer).unwrap();

    let ids: Vec<WorkItemId> = (0..6).map(|i| accepted(scheduler.submit(baseline(i)))).collect();
    for id in &ids {
        let err = scheduler.enqueue(*id).unwrap_err();
        assert_eq!(err.reason(), FailureReason::AlreadyQueued);
    }
    for id in &ids {
        assert_eq!(scheduler.wait(*id, WAIT), Some(WorkItemStatus::Completed));
        // A finished item can't go around again
        assert!(scheduler.enqueue(*id).is_err());
    }

    assert!(!transport.state.overlapped.load(Ordering::SeqCst));
    assert_eq!(transport.state.submitted.load(Ordering::SeqCst), 6);
}

#[test]
fn test_transient_failure_is_retried_once() {
    let transport = MockTransport::new(MockState::default());
    let scheduler = Scheduler::new(&config(1), transport.clone(), Arc::new(RecordingInstaller::default())).unwrap();

    transport.fail_with(&[FailureReason::TransientTransportError]);
    let id = accepted(scheduler.submit(baseline(1)));
    assert_eq!(scheduler.wait(id, WAIT), Some(WorkItemStatus::Completed));
    assert_eq!(scheduler.metrics().retried, 1);

    transport.fail_with(&[
        FailureReason::TransientTransportError,
        FailureReason::TransientTransportError,
    ]);
    let id = accepted(scheduler.submit(baseline(2)));
    assert_eq!(
        scheduler.wait(id, WAIT),
        Some(WorkItemStatus::Failed(FailureReason::TransientTransportError))
    );
    assert_eq!(scheduler.metrics().retried, 2);
    assert_eq!(scheduler.metrics().failed, 1);
    assert_eq!(transport.state.submitted.load(Ordering::SeqCst), 4);
}

#[test]
fn test_failed_source_is_declined_in_background() {
    let transport = MockTransport::new(MockState::default());
    let scheduler = Scheduler::new(&config(1), transport.clone(), Arc::new(RecordingInstaller::default())).unwrap();

    transport.fail_with(&[FailureReason::CodegenAborted]);
    let id = accepted(scheduler.submit(baseline(9)));
    assert_eq!(
        scheduler.wait(id, WAIT),
        Some(WorkItemStatus::Failed(FailureReason::CodegenAborted))
    );
    assert_eq!(scheduler.metrics().retried, 0);

    assert_eq!(
        scheduler.submit(baseline(9)).unwrap(),
        SubmitOutcome::Declined(DeclineReason::PreviouslyFailed)
    );
    // Only the failed tier is blocked
    accepted(scheduler.submit(WorkItemRequest::function(snapshot(9, 10), Tier::Full)));
    // The foreground path still compiles it
    assert!(scheduler.compile_foreground(baseline(9)).is_ok());
}

#[test]
fn test_speculative_requests_respect_budget() {
    let transport = MockTransport::new(MockState::default());
    let scheduler = Scheduler::new(&config(1), transport, Arc::new(RecordingInstaller::default())).unwrap();

    let request = |source| WorkItemRequest::function(snapshot(source, 60), Tier::Baseline).speculative();
    accepted(scheduler.submit(request(1)));
    assert_eq!(
        scheduler.submit(request(2)).unwrap(),
        SubmitOutcome::Declined(DeclineReason::OverBudget)
    );

    scheduler.begin_epoch();
    accepted(scheduler.submit(request(2)));
    assert_eq!(scheduler.metrics().declined, 1);
}

#[test]
fn test_failed_enqueue_does_not_spend_budget() {
    let transport = MockTransport::new(MockState::default());
    let scheduler = Scheduler::new(&config(1), transport, Arc::new(RecordingInstaller::default())).unwrap();

    let request = |source| WorkItemRequest::function(snapshot(source, 40), Tier::Baseline).speculative();
    let id = scheduler.register(request(1)).unwrap();
    accepted(scheduler.enqueue(id));
    // Admitted against the budget, then rejected by the queue
    assert!(scheduler.enqueue(id).is_err());

    // 40 + 50 still fits under the cap of 100
    let larger = WorkItemRequest::function(snapshot(2, 50), Tier::Baseline).speculative();
    accepted(scheduler.submit(larger));
}

#[test]
fn test_declined_registered_item_stays_created() {
    let transport = MockTransport::new(MockState::default());
    let scheduler = Scheduler::new(&config(1), transport, Arc::new(RecordingInstaller::default())).unwrap();

    let oversized = WorkItemRequest::function(snapshot(1, 200_000), Tier::Baseline);
    let id = scheduler.register(oversized).unwrap();
    assert_eq!(
        scheduler.enqueue(id).unwrap(),
        SubmitOutcome::Declined(DeclineReason::FunctionTooLarge)
    );
    assert_eq!(scheduler.status(id), Some(WorkItemStatus::Created));
}

#[test]
fn test_foreground_compile() {
    let transport = MockTransport::new(MockState::default());
    let installer = Arc::new(RecordingInstaller::default());
    let scheduler = Scheduler::new(&config(1), transport.clone(), installer.clone()).unwrap();

    let entry = scheduler.compile_foreground(baseline(1)).unwrap();
    assert_eq!(entry.code_size(), 3);
    assert_eq!(installer.live(), 1);
    assert_eq!(scheduler.status(entry.work_item), None);

    transport.fail_with(&[FailureReason::TransientTransportError]);
    scheduler.compile_foreground(baseline(2)).unwrap();
    assert_eq!(scheduler.metrics().retried, 1);

    transport.fail_with(&[FailureReason::ServerUnavailable]);
    let err = scheduler.compile_foreground(baseline(3)).unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::Compilation {
            reason: FailureReason::ServerUnavailable,
            ..
        }
    ));
    assert_eq!(installer.live(), 2);

    scheduler.free_code(&entry);
    assert_eq!(installer.live(), 1);
}

#[test]
fn test_tier_promotion_queues_full_tier() {
    let transport = MockTransport::new(MockState::default());
    let installer = Arc::new(RecordingInstaller::default());
    let scheduler = Scheduler::new(&config(2), transport, installer.clone()).unwrap();

    let request = baseline(4).with_full_tier_child(WorkItemRequest::function(snapshot(4, 10), Tier::Full));
    let parent = accepted(scheduler.submit(request));
    assert_eq!(scheduler.wait(parent, WAIT), Some(WorkItemStatus::Completed));
    scheduler.release(parent).unwrap();

    wait_until(|| scheduler.metrics().completed == 2);
    assert_eq!(installer.installs.load(Ordering::SeqCst), 2);
    // The parent's code is gone, the child's is still installed
    assert_eq!(installer.live(), 1);
}

#[test]
fn test_shutdown_cancels_outstanding_items() {
    let transport = MockTransport::new(MockState {
        delay: Duration::from_millis(100),
        ..Default::default()
    });
    let installer = Arc::new(RecordingInstaller::default());
    let scheduler = Scheduler::new(&config(1), transport.clone(), installer.clone()).unwrap();

    let ids: Vec<WorkItemId> = (0..5).map(|i| accepted(scheduler.submit(baseline(i)))).collect();
    wait_until(|| transport.state.submitted.load(Ordering::SeqCst) >= 1);

    scheduler.shutdown();
    for id in &ids {
        assert_eq!(
            scheduler.status(*id),
            Some(WorkItemStatus::Failed(FailureReason::Cancelled))
        );
    }
    assert_eq!(scheduler.metrics().cancelled, 5);
    assert!(!transport.is_connected());

    let err = scheduler.submit(baseline(10)).unwrap_err();
    assert_eq!(err.reason(), FailureReason::Cancelled);

    // Idempotent
    scheduler.shutdown();
    assert_eq!(transport.state.disconnects.load(Ordering::SeqCst), 1);

    // The in-flight result arrives late and is dropped
    thread::sleep(Duration::from_millis(200));
    assert_eq!(installer.installs.load(Ordering::SeqCst), 0);
    assert_eq!(scheduler.metrics().completed, 0);
}

#[test]
fn test_hybrid_foreground_compiles_inline_when_backlogged() {
    let transport = MockTransport::inline(MockState {
        held_source: Some(SourceHandle(1)),
        hold: AtomicBool::new(true),
        ..Default::default()
    });
    let config = JitConfig {
        scheduler: SchedulerConfig {
            worker_threads: 1,
            hybrid_foreground: true,
            hybrid_foreground_queue_threshold: 0,
        },
        ..Default::default()
    };
    let scheduler = Scheduler::new(&config, transport.clone(), Arc::new(RecordingInstaller::default())).unwrap();

    // Keep the only worker busy
    let blocked = accepted(scheduler.submit(baseline(1)));
    wait_until(|| transport.state.submitted.load(Ordering::SeqCst) == 1);

    let queued = accepted(scheduler.submit(baseline(2)));
    assert_eq!(scheduler.status(queued), Some(WorkItemStatus::Queued));

    // Backlog over the threshold: compiled before submit returns
    let inline = accepted(scheduler.submit(baseline(3)));
    assert_eq!(scheduler.status(inline), Some(WorkItemStatus::Completed));
    assert_eq!(scheduler.status(queued), Some(WorkItemStatus::Queued));

    transport.state.hold.store(false, Ordering::SeqCst);
    assert_eq!(scheduler.wait(blocked, WAIT), Some(WorkItemStatus::Completed));
    assert_eq!(scheduler.wait(queued, WAIT), Some(WorkItemStatus::Completed));
}

#[test]
fn test_install_failure_fails_item() {
    struct FullInstaller;

    impl CodeInstaller for FullInstaller {
        fn install(&self, code: &[u8], _: usize, _: ExecutableHint) -> Result<InstalledCode, InstallError> {
            Err(InstallError::OutOfExecutableMemory {
                requested: code.len(),
                available: 0,
            })
        }

        fn free(&self, allocation: AllocationId) -> Result<(), InstallError> {
            Err(InstallError::UnknownAllocation(allocation.0))
        }
    }

    let transport = MockTransport::new(MockState::default());
    let scheduler = Scheduler::new(&config(1), transport, Arc::new(FullInstaller)).unwrap();
    let id = accepted(scheduler.submit(baseline(1)));
    assert_eq!(
        scheduler.wait(id, WAIT),
        Some(WorkItemStatus::Failed(FailureReason::OutOfMemory))
    );
}

#[test]
fn test_in_process_pipeline_end_to_end() {
    let config = config(2);
    let transport = Arc::new(InProcessTransport::with_generator(Arc::new(StubCodeGenerator), &config).unwrap());
    let installer = Arc::new(ExecutableMemoryInstaller::new(1 << 20));
    let scheduler = Scheduler::new(&config, transport.clone(), installer.clone()).unwrap();

    let entry = scheduler
        .compile_foreground(WorkItemRequest::function(snapshot(1, 42), Tier::Full))
        .unwrap();
    assert!(entry.deopt.ends_with(b":full:fn_1"));

    #[cfg(all(unix, any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        #[expect(unsafe_code, reason = "calling the stub the pipeline installed")]
        let value = unsafe {
            let ptr = std::ptr::with_exposed_provenance::<u8>(entry.entry_address());
            let function: extern "C" fn() -> u32 = std::mem::transmute(ptr);
            function()
        };
        assert_eq!(value, 42);
    }

    let id = accepted(scheduler.submit(WorkItemRequest::loop_body(snapshot(2, 7), Tier::Baseline, 0)));
    assert_eq!(scheduler.wait(id, WAIT), Some(WorkItemStatus::Completed));
    scheduler.release(id).unwrap();
    assert_eq!(installer.allocations(), 1);

    scheduler.free_code(&entry);
    assert_eq!(installer.allocations(), 0);

    scheduler.shutdown();
    assert!(!transport.is_connected());
}
