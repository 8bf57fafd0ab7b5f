//! Transport that runs the compile service inside the calling process.
//!
//! Used when no compile server was spawned and in tests. Contexts are opened
//! once at construction and closed on disconnect or drop; calls run
//! synchronously, so `submit_async` completes before it returns.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use oopjit_common::JitConfig;
use tracing::debug;
use uuid::Uuid;

use crate::codegen::CodeGenerator;
use crate::marshal::{build_codegen_request, decode_codegen_reply};
use crate::server::CompileService;
use crate::session::remote_failure;
use crate::wire::{ClientMessage, ServerMessage};
use crate::{CompilationTransport, CompileRequest, CompileResult, CompletionCallback, TransportError};

#[derive(Debug, Clone, Copy)]
struct Contexts {
    thread_context_id: u64,
    script_context_id: u64,
}

/// Calls the [`CompileService`] on the calling thread.
///
/// Requests still go through the relocatable arena so the in-process and
/// remote paths exercise the same marshaling.
#[derive(Debug)]
pub struct InProcessTransport {
    service: Arc<CompileService>,
    connection_id: Uuid,
    contexts: Mutex<Option<Contexts>>,
    arena_capacity: usize,
}

impl InProcessTransport {
    pub fn new(service: Arc<CompileService>, arena_capacity: usize) -> Result<Self, TransportError> {
        let connection_id = Uuid::new_v4();
        let thread_context_id = match service.handle(connection_id, ClientMessage::InitializeThreadContext) {
            ServerMessage::ThreadContextInitialized { thread_context_id } => thread_context_id,
            other => return Err(remote_failure(other)),
        };
        let script_context_id = match service.handle(
            connection_id,
            ClientMessage::InitializeScriptContext { thread_context_id },
        ) {
            ServerMessage::ScriptContextInitialized { script_context_id } => script_context_id,
            other => return Err(remote_failure(other)),
        };
        debug!(%connection_id, thread_context_id, script_context_id, "In-process transport ready");
        Ok(Self {
            service,
            connection_id,
            contexts: Mutex::new(Some(Contexts {
                thread_context_id,
                script_context_id,
            })),
            arena_capacity,
        })
    }

    pub fn with_generator(generator: Arc<dyn CodeGenerator>, config: &JitConfig) -> Result<Self, TransportError> {
        let capacity = config.arena.max_arena_bytes;
        Self::new(Arc::new(CompileService::new(generator, capacity)), capacity)
    }

    pub fn service(&self) -> &Arc<CompileService> {
        &self.service
    }

    fn contexts(&self) -> MutexGuard<'_, Option<Contexts>> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CompilationTransport for InProcessTransport {
    fn submit(&self, request: CompileRequest) -> Result<CompileResult, TransportError> {
        let contexts = (*self.contexts()).ok_or(TransportError::NotConnected)?;
        let wire = build_codegen_request(
            &request,
            contexts.thread_context_id,
            contexts.script_context_id,
            self.arena_capacity,
        )?;
        let reply = self
            .service
            .handle(self.connection_id, ClientMessage::RemoteCodeGen(wire));
        decode_codegen_reply(request.work_item, reply)
    }

    fn submit_async(&self, request: CompileRequest, on_complete: CompletionCallback) {
        on_complete(self.submit(request));
    }

    fn disconnect(&self) {
        let Some(contexts) = self.contexts().take() else {
            return;
        };
        let close = ClientMessage::CleanupThreadContext {
            thread_context_id: contexts.thread_context_id,
        };
        if let ServerMessage::Status { code } = self.service.handle(self.connection_id, close) {
            debug!(connection_id = %self.connection_id, code, "In-process transport disconnected");
        }
    }

    fn is_connected(&self) -> bool {
        self.contexts().is_some()
    }
}

impl Drop for InProcessTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}
