//! Client side of the out-of-process transport.
//!
//! [`RpcTransport`] drives a [`TransportSession`] from blocking callers. A
//! request captures the session generation when it is submitted; if the
//! transport is disconnected before the request connects or before its reply
//! is decoded, the request fails with [`TransportError::StaleResponse`] and
//! any contexts it opened on the way are released.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use oopjit_common::JitConfig;
use tokio::runtime::Runtime;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::marshal::{build_codegen_request, decode_codegen_reply};
use crate::process::ProcessHandle;
use crate::session::TransportSession;
use crate::{CompilationTransport, CompileRequest, CompileResult, CompletionCallback, TransportError};

#[derive(Debug, Clone)]
struct RpcTarget {
    process: ProcessHandle,
    addr: SocketAddr,
    connection_id: Uuid,
}

/// Transport to a compile server running in another process.
///
/// Owns a small tokio runtime for the network side; the blocking entry
/// points must be called from plain threads, not from inside a runtime.
pub struct RpcTransport {
    runtime: Option<Runtime>,
    session: Arc<TransportSession>,
    target: Mutex<Option<RpcTarget>>,
    arena_capacity: usize,
}

impl std::fmt::Debug for RpcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcTransport")
            .field("session", &self.session)
            .field("arena_capacity", &self.arena_capacity)
            .finish()
    }
}

impl RpcTransport {
    pub fn new(config: &JitConfig) -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("oopjit-rpc")
            .enable_all()
            .build()?;
        Ok(Self {
            runtime: Some(runtime),
            session: Arc::new(TransportSession::new(config.transport.clone())),
            target: Mutex::new(None),
            arena_capacity: config.arena.max_arena_bytes,
        })
    }

    fn runtime(&self) -> Result<&Runtime, TransportError> {
        self.runtime
            .as_ref()
            .ok_or_else(|| TransportError::Runtime("transport runtime is gone".to_string()))
    }

    fn target(&self) -> MutexGuard<'_, Option<RpcTarget>> {
        self.target.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session(&self) -> &Arc<TransportSession> {
        &self.session
    }

    /// Connects to the server at `addr` hosted by `process`.
    ///
    /// The target is remembered even when connecting fails, so a later
    /// submit tries again. Connecting twice with the same `connection_id` is
    /// a no-op.
    pub fn connect_rpc_server(
        &self,
        process: ProcessHandle,
        addr: SocketAddr,
        connection_id: Uuid,
    ) -> Result<(), TransportError> {
        *self.target() = Some(RpcTarget {
            process: process.clone(),
            addr,
            connection_id,
        });
        self.runtime()?
            .block_on(self.session.connect(&process, addr, connection_id))
    }

    /// Forgets the target and closes the session. Requests still connecting
    /// or waiting for a reply fail as stale. Safe to call any number of
    /// times.
    pub fn disconnect_rpc_server(&self) {
        let had_target = self.target().take().is_some();
        if let Ok(runtime) = self.runtime() {
            runtime.block_on(self.session.disconnect());
        }
        if had_target {
            debug!("RPC transport disconnected");
        }
    }
}

/// Runs one request against the session, connecting first if a target is
/// known but the session is down.
///
/// `generation` is the session generation observed at submission.
async fn dispatch(
    session: Arc<TransportSession>,
    generation: u64,
    target: Option<RpcTarget>,
    request: CompileRequest,
    arena_capacity: usize,
) -> Result<CompileResult, TransportError> {
    let connection = match session.connection() {
        Some(connection) => connection,
        None => {
            let target = target.ok_or(TransportError::NotConnected)?;
            session
                .connect_at(generation, &target.process, target.addr, target.connection_id)
                .await?;
            session.connection().ok_or(TransportError::NotConnected)?
        }
    };

    let wire = build_codegen_request(
        &request,
        connection.thread_context_id,
        connection.script_context_id,
        arena_capacity,
    )?;
    let reply = match session.call(&connection, wire).await {
        Ok(reply) => reply,
        Err(err) if connection.process.has_exited() => {
            warn!(work_item = %request.work_item, %err, "Compile server died during a call");
            session.teardown().await;
            return Err(TransportError::ServerExited);
        }
        Err(err) => return Err(err),
    };

    // The session may have been torn down or replaced while we waited
    if session.generation() != generation || session.connection_id() != Some(connection.connection_id) {
        debug!(work_item = %request.work_item, "Discarding response for a closed session");
        return Err(TransportError::StaleResponse);
    }
    decode_codegen_reply(request.work_item, reply)
}

impl CompilationTransport for RpcTransport {
    fn submit(&self, request: CompileRequest) -> Result<CompileResult, TransportError> {
        let target = self.target().clone();
        let generation = self.session.generation();
        self.runtime()?.block_on(dispatch(
            Arc::clone(&self.session),
            generation,
            target,
            request,
            self.arena_capacity,
        ))
    }

    fn submit_async(&self, request: CompileRequest, on_complete: CompletionCallback) {
        let runtime = match self.runtime() {
            Ok(runtime) => runtime,
            Err(err) => return on_complete(Err(err)),
        };
        let session = Arc::clone(&self.session);
        let target = self.target().clone();
        let generation = session.generation();
        let arena_capacity = self.arena_capacity;
        runtime.spawn(async move {
            on_complete(dispatch(session, generation, target, request, arena_capacity).await);
        });
    }

    fn disconnect(&self) {
        self.disconnect_rpc_server();
    }

    fn is_connected(&self) -> bool {
        self.session.is_connected()
    }
}

impl Drop for RpcTransport {
    fn drop(&mut self) {
        // Blocking is not allowed inside another runtime; the server reaps
        // the contexts once this process exits
        if tokio::runtime::Handle::try_current().is_ok() {
            debug!("RPC transport dropped inside a runtime, skipping context cleanup");
        } else {
            self.disconnect_rpc_server();
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
