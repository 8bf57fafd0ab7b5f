use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use oopjit_common::{FailureReason, STATUS_OK};
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::context::ServerContextManager;
use crate::codegen::CodeGenerator;
use crate::marshal::{build_codegen_response, unmarshal_snapshot};
use crate::wire::{ClientMessage, CodeGenRequest, ServerMessage};

/// Handles decoded client messages. Shared by the TCP server and the
/// in-process transport, so both paths run the same checks and the same
/// failure translation.
pub struct CompileService {
    contexts: ServerContextManager,
    generator: Arc<dyn CodeGenerator>,
    arena_capacity: usize,
}

impl std::fmt::Debug for CompileService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompileService")
            .field("contexts", &self.contexts)
            .field("arena_capacity", &self.arena_capacity)
            .finish()
    }
}

impl CompileService {
    pub fn new(generator: Arc<dyn CodeGenerator>, arena_capacity: usize) -> Self {
        Self {
            contexts: ServerContextManager::new(),
            generator,
            arena_capacity,
        }
    }

    pub fn contexts(&self) -> &ServerContextManager {
        &self.contexts
    }

    /// Runs one call for `connection_id` and always produces a reply.
    ///
    /// Failures, including a panic inside the code generator, become a
    /// [`ServerMessage::Status`] carrying the failure's status code.
    pub fn handle(&self, connection_id: Uuid, message: ClientMessage) -> ServerMessage {
        let name = message.name();
        let outcome = catch_unwind(AssertUnwindSafe(|| self.dispatch(connection_id, message)));
        match outcome {
            Ok(Ok(reply)) => reply,
            Ok(Err(reason)) => {
                debug!(%connection_id, call = name, ?reason, "Server call failed");
                ServerMessage::Status {
                    code: u32::from(reason),
                }
            }
            Err(_) => {
                error!(%connection_id, call = name, "Server call panicked");
                ServerMessage::Status {
                    code: u32::from(FailureReason::CodegenAborted),
                }
            }
        }
    }

    fn dispatch(&self, connection_id: Uuid, message: ClientMessage) -> Result<ServerMessage, FailureReason> {
        match message {
            ClientMessage::Hello { client_pid, .. } => {
                debug!(%connection_id, client_pid, "Client connected");
                self.contexts.register_client(connection_id, client_pid);
                Ok(ServerMessage::HelloAck {
                    server_pid: std::process::id(),
                })
            }
            ClientMessage::InitializeThreadContext => {
                let thread_context_id = self.contexts.register_thread_context(connection_id);
                Ok(ServerMessage::ThreadContextInitialized { thread_context_id })
            }
            ClientMessage::InitializeScriptContext { thread_context_id } => {
                let script_context_id = self
                    .contexts
                    .register_script_context(connection_id, thread_context_id)?;
                Ok(ServerMessage::ScriptContextInitialized { script_context_id })
            }
            ClientMessage::RemoteCodeGen(request) => self.remote_codegen(connection_id, request),
            ClientMessage::CleanupScriptContext { script_context_id } => {
                self.contexts
                    .close_script_context(connection_id, script_context_id)?;
                Ok(ServerMessage::Status { code: STATUS_OK })
            }
            ClientMessage::CleanupThreadContext { thread_context_id } => {
                self.contexts
                    .close_thread_context(connection_id, thread_context_id)?;
                Ok(ServerMessage::Status { code: STATUS_OK })
            }
            ClientMessage::Shutdown => Ok(ServerMessage::Status { code: STATUS_OK }),
        }
    }

    fn remote_codegen(&self, connection_id: Uuid, request: CodeGenRequest) -> Result<ServerMessage, FailureReason> {
        self.contexts.check_alive(
            connection_id,
            request.thread_context_id,
            request.script_context_id,
        )?;

        let snapshot = unmarshal_snapshot(request.blob).map_err(|err| {
            warn!(%connection_id, work_item = %request.header.work_item, %err, "Rejecting malformed request");
            err.reason()
        })?;

        let output = self
            .generator
            .generate(&request.header, &snapshot)
            .map_err(|err| {
                debug!(work_item = %request.header.work_item, %err, "Code generation failed");
                err.reason()
            })?;

        let response = build_codegen_response(&output, self.arena_capacity).map_err(|err| err.reason())?;
        self.contexts
            .record_code(request.script_context_id, u64::from(response.code_size));
        debug!(
            work_item = %request.header.work_item,
            tier = %request.header.tier,
            code_size = response.code_size,
            "Generated code"
        );
        Ok(ServerMessage::CodeGen(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::{CodegenError, CompiledOutput, StubCodeGenerator};
    use crate::marshal::{build_codegen_request, decode_codegen_reply};
    use crate::wire::RequestHeader;
    use crate::CompileRequest;
    use oopjit_common::{FunctionSnapshot, SourceHandle, Tier, WorkItemId, WorkItemKind};

    struct PanickingGenerator;

    impl CodeGenerator for PanickingGenerator {
        fn generate(&self, _: &RequestHeader, _: &FunctionSnapshot) -> Result<CompiledOutput, CodegenError> {
            panic!("register allocator blew up");
        }
    }

    fn request(work_item: u64) -> CompileRequest {
        CompileRequest {
            work_item: WorkItemId(work_item),
            tier: Tier::Baseline,
            kind: WorkItemKind::Function,
            snapshot: Arc::new(FunctionSnapshot::new(SourceHandle(1), "f")),
        }
    }

    fn open_contexts(service: &CompileService, connection_id: Uuid) -> (u64, u64) {
        let ServerMessage::ThreadContextInitialized { thread_context_id } =
            service.handle(connection_id, ClientMessage::InitializeThreadContext)
        else {
            panic!("expected thread context");
        };
        let ServerMessage::ScriptContextInitialized { script_context_id } = service.handle(
            connection_id,
            ClientMessage::InitializeScriptContext { thread_context_id },
        ) else {
            panic!("expected script context");
        };
        (thread_context_id, script_context_id)
    }

    #[test]
    fn test_codegen_against_live_contexts() {
        let service = CompileService::new(Arc::new(StubCodeGenerator), 1 << 16);
        let connection_id = Uuid::new_v4();
        let (thread, script) = open_contexts(&service, connection_id);

        let wire = build_codegen_request(&request(1), thread, script, 1 << 16).unwrap();
        let reply = service.handle(connection_id, ClientMessage::RemoteCodeGen(wire));
        let result = decode_codegen_reply(WorkItemId(1), reply).unwrap();

        assert!(result.code_size() > 0);
        assert!(service.contexts().code_bytes(script).unwrap() > 0);
    }

    #[test]
    fn test_codegen_against_closed_context_is_invalid_state() {
        let service = CompileService::new(Arc::new(StubCodeGenerator), 1 << 16);
        let connection_id = Uuid::new_v4();
        let (thread, script) = open_contexts(&service, connection_id);
        service.handle(
            connection_id,
            ClientMessage::CleanupThreadContext {
                thread_context_id: thread,
            },
        );

        let wire = build_codegen_request(&request(2), thread, script, 1 << 16).unwrap();
        let reply = service.handle(connection_id, ClientMessage::RemoteCodeGen(wire));
        assert_eq!(
            reply,
            ServerMessage::Status {
                code: u32::from(FailureReason::InvalidState)
            }
        );
    }

    #[test]
    fn test_generator_panic_becomes_status() {
        let service = CompileService::new(Arc::new(PanickingGenerator), 1 << 16);
        let connection_id = Uuid::new_v4();
        let (thread, script) = open_contexts(&service, connection_id);

        let wire = build_codegen_request(&request(3), thread, script, 1 << 16).unwrap();
        let reply = service.handle(connection_id, ClientMessage::RemoteCodeGen(wire));
        assert_eq!(
            reply,
            ServerMessage::Status {
                code: u32::from(FailureReason::CodegenAborted)
            }
        );
        // The service keeps serving after a panic
        assert!(matches!(
            service.handle(connection_id, ClientMessage::InitializeThreadContext),
            ServerMessage::ThreadContextInitialized { .. }
        ));
    }
}
