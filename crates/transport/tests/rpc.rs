#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use std::net::SocketAddr;
use std::process::Command;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use oopjit_common::{
    BytecodeInfo, FailureReason, FunctionSnapshot, JitConfig, SourceHandle, Tier, TransportConfig, WorkItemId,
    WorkItemKind,
};
use oopjit_transport::wire::RequestHeader;
use oopjit_transport::{
    CodeGenerator, CodegenError, CompilationTransport, CompileRequest, CompileServer, CompileService, CompiledOutput,
    ProcessHandle, RpcTransport, StubCodeGenerator, TransportError,
};
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use uuid::Uuid;

struct SlowGenerator(Duration);

impl CodeGenerator for SlowGenerator {
    fn generate(&self, header: &RequestHeader, snapshot: &FunctionSnapshot) -> Result<CompiledOutput, CodegenError> {
        std::thread::sleep(self.0);
        StubCodeGenerator.generate(header, snapshot)
    }
}

struct TestServer {
    addr: SocketAddr,
    service: Arc<CompileService>,
    _runtime: Runtime,
}

fn start_server(generator: Arc<dyn CodeGenerator>, config: &JitConfig) -> TestServer {
    start_server_at(generator, config, "127.0.0.1:0".parse().unwrap())
}

fn start_server_at(generator: Arc<dyn CodeGenerator>, config: &JitConfig, addr: SocketAddr) -> TestServer {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let listener = runtime.block_on(TcpListener::bind(addr)).unwrap();
    let addr = listener.local_addr().unwrap();
    let service = Arc::new(CompileService::new(generator, config.arena.max_arena_bytes));
    let server = CompileServer::new(Arc::clone(&service), &config.transport);
    runtime.spawn(server.serve(listener));
    TestServer {
        addr,
        service,
        _runtime: runtime,
    }
}

fn quick_config() -> JitConfig {
    JitConfig {
        transport: TransportConfig {
            initial_retry_delay_ms: 1,
            max_retry_delay_ms: 5,
            max_connect_attempts: 3,
            process_poll_interval_ms: 1,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn unused_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

fn request(id: u64, byte_code_count: u32) -> CompileRequest {
    let inlinee = Arc::new(FunctionSnapshot::new(SourceHandle(100 + id), "helper"));
    let snapshot = FunctionSnapshot::new(SourceHandle(id), "hot")
        .with_bytecode(BytecodeInfo {
            byte_code_count,
            ..Default::default()
        })
        .with_inlinee(inlinee);
    CompileRequest {
        work_item: WorkItemId(id),
        tier: Tier::Full,
        kind: WorkItemKind::Function,
        snapshot: Arc::new(snapshot),
    }
}

#[test]
fn test_submit_over_rpc() {
    let config = quick_config();
    let server = start_server(Arc::new(StubCodeGenerator), &config);
    let transport = RpcTransport::new(&config).unwrap();
    transport
        .connect_rpc_server(ProcessHandle::current(), server.addr, Uuid::new_v4())
        .unwrap();
    assert!(transport.is_connected());

    let result = transport.submit(request(7, 42)).unwrap();

    assert_eq!(result.work_item, WorkItemId(7));
    assert!(result.code_size() > 0);
    assert_eq!(result.entry_offset, 0);
    assert_eq!(&result.deopt[..], b"#7:full:hot");
    #[cfg(target_arch = "x86_64")]
    assert_eq!(&result.code[..], &[0xb8, 42, 0, 0, 0, 0xc3]);
}

#[test]
fn test_connect_and_disconnect_are_idempotent() {
    let config = quick_config();
    let server = start_server(Arc::new(StubCodeGenerator), &config);
    let transport = RpcTransport::new(&config).unwrap();
    let connection_id = Uuid::new_v4();

    transport
        .connect_rpc_server(ProcessHandle::current(), server.addr, connection_id)
        .unwrap();
    transport
        .connect_rpc_server(ProcessHandle::current(), server.addr, connection_id)
        .unwrap();
    assert_eq!(server.service.contexts().live_thread_contexts(), 1);
    assert_eq!(server.service.contexts().live_script_contexts(), 1);

    transport.disconnect();
    transport.disconnect();

    assert!(!transport.is_connected());
    assert_eq!(server.service.contexts().live_thread_contexts(), 0);
    assert_eq!(server.service.contexts().live_script_contexts(), 0);

    let err = transport.submit(request(1, 1)).unwrap_err();
    assert!(matches!(err, TransportError::NotConnected));
    assert_eq!(err.reason(), FailureReason::ServerUnavailable);
}

#[test]
fn test_unreachable_server_is_bounded() {
    let transport = RpcTransport::new(&quick_config()).unwrap();
    let started = Instant::now();

    let err = transport
        .connect_rpc_server(ProcessHandle::current(), unused_addr(), Uuid::new_v4())
        .unwrap_err();

    assert!(matches!(err, TransportError::RetriesExhausted { attempts: 3 }));
    assert_eq!(err.reason(), FailureReason::ServerUnavailable);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_exited_server_fails_fast() {
    let mut config = quick_config();
    config.transport.initial_retry_delay_ms = 10_000;
    config.transport.max_retry_delay_ms = 10_000;
    config.transport.max_connect_attempts = 10;
    let transport = RpcTransport::new(&config).unwrap();

    let mut child = Command::new("true").spawn().unwrap();
    child.wait().unwrap();
    let started = Instant::now();
    let err = transport
        .connect_rpc_server(ProcessHandle::from_child(child), unused_addr(), Uuid::new_v4())
        .unwrap_err();

    assert!(matches!(err, TransportError::ServerExited));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn test_server_exit_interrupts_backoff() {
    let mut config = quick_config();
    config.transport.initial_retry_delay_ms = 30_000;
    config.transport.max_retry_delay_ms = 30_000;
    let transport = RpcTransport::new(&config).unwrap();

    let child = Command::new("sleep").arg("0.2").spawn().unwrap();
    let started = Instant::now();
    let err = transport
        .connect_rpc_server(ProcessHandle::from_child(child), unused_addr(), Uuid::new_v4())
        .unwrap_err();

    assert!(matches!(err, TransportError::ServerExited));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn test_async_submit_reports_to_callback() {
    let config = quick_config();
    let server = start_server(Arc::new(StubCodeGenerator), &config);
    let transport = RpcTransport::new(&config).unwrap();
    transport
        .connect_rpc_server(ProcessHandle::current(), server.addr, Uuid::new_v4())
        .unwrap();

    let (tx, rx) = mpsc::channel();
    for id in 1..=4 {
        let tx = tx.clone();
        transport.submit_async(
            request(id, 3),
            Box::new(move |result| tx.send(result.map(|r| r.work_item)).unwrap()),
        );
    }

    let mut done: Vec<_> = (0..4)
        .map(|_| rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap())
        .collect();
    done.sort();
    assert_eq!(done, (1..=4).map(WorkItemId).collect::<Vec<_>>());
}

#[test]
fn test_response_after_disconnect_is_discarded() {
    let config = quick_config();
    let server = start_server(Arc::new(SlowGenerator(Duration::from_millis(500))), &config);
    let transport = RpcTransport::new(&config).unwrap();
    transport
        .connect_rpc_server(ProcessHandle::current(), server.addr, Uuid::new_v4())
        .unwrap();

    let (tx, rx) = mpsc::channel();
    transport.submit_async(
        request(9, 1),
        Box::new(move |result| tx.send(result).unwrap()),
    );
    std::thread::sleep(Duration::from_millis(100));
    transport.disconnect();

    let err = rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap_err();
    assert!(matches!(err, TransportError::StaleResponse));
    assert_eq!(err.reason(), FailureReason::Cancelled);
}

#[test]
fn test_shutdown_request_stops_server() {
    let config = quick_config();
    let server = start_server(Arc::new(StubCodeGenerator), &config);
    let transport = RpcTransport::new(&config).unwrap();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime
        .block_on(transport.session().request_server_shutdown(server.addr, Uuid::new_v4()))
        .unwrap();

    // The accept loop is gone; connecting now exhausts the retries
    std::thread::sleep(Duration::from_millis(50));
    let err = transport
        .connect_rpc_server(ProcessHandle::current(), server.addr, Uuid::new_v4())
        .unwrap_err();
    assert_eq!(err.reason(), FailureReason::ServerUnavailable);
}

#[test]
fn test_disconnect_cancels_pending_reconnect() {
    let mut config = quick_config();
    config.transport.initial_retry_delay_ms = 5;
    config.transport.max_retry_delay_ms = 10;
    config.transport.max_connect_attempts = 100;
    let addr = unused_addr();
    let transport = RpcTransport::new(&config).unwrap();

    // Nothing listens yet, but the target is remembered for later submits
    transport
        .connect_rpc_server(ProcessHandle::current(), addr, Uuid::new_v4())
        .unwrap_err();
    let (tx, rx) = mpsc::channel();
    transport.submit_async(
        request(11, 1),
        Box::new(move |result| tx.send(result).unwrap()),
    );
    std::thread::sleep(Duration::from_millis(20));
    transport.disconnect();
    let server = start_server_at(Arc::new(StubCodeGenerator), &config, addr);

    let err = rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap_err();
    assert!(matches!(err, TransportError::StaleResponse));
    assert_eq!(err.reason(), FailureReason::Cancelled);
    assert!(!transport.is_connected());
    assert_eq!(server.service.contexts().live_thread_contexts(), 0);
    assert_eq!(server.service.contexts().live_script_contexts(), 0);

    // An explicit connect after the disconnect still works
    transport
        .connect_rpc_server(ProcessHandle::current(), addr, Uuid::new_v4())
        .unwrap();
    assert!(transport.is_connected());
    assert_eq!(server.service.contexts().live_thread_contexts(), 1);
}

#[test]
fn test_dropping_transport_releases_server_contexts() {
    let config = quick_config();
    let server = start_server(Arc::new(StubCodeGenerator), &config);
    let transport = RpcTransport::new(&config).unwrap();
    transport
        .connect_rpc_server(ProcessHandle::current(), server.addr, Uuid::new_v4())
        .unwrap();
    transport.submit(request(12, 2)).unwrap();
    assert_eq!(server.service.contexts().live_thread_contexts(), 1);

    drop(transport);

    assert_eq!(server.service.contexts().live_thread_contexts(), 0);
    assert_eq!(server.service.contexts().live_script_contexts(), 0);
}
