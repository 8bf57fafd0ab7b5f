//! Boundary between the scheduler and the code generator.
//!
//! A [`CompilationTransport`] either calls the [`CompileService`] directly
//! ([`InProcessTransport`]) or talks to a separate compile server over TCP
//! ([`RpcTransport`]). Both paths marshal the request through the relocatable
//! arena and normalize every failure into a [`TransportError`] whose
//! [`TransportError::reason`] is all the scheduler ever looks at.

use std::sync::Arc;

use bytes::Bytes;
use oopjit_common::{FunctionSnapshot, Tier, WorkItemId, WorkItemKind};

pub mod codegen;
mod error;
pub mod in_process;
pub mod marshal;
pub mod process;
pub mod rpc;
pub mod server;
pub mod session;
pub mod wire;

pub use codegen::{CodeGenerator, CodegenError, CompiledOutput, StubCodeGenerator};
pub use error::TransportError;
pub use in_process::InProcessTransport;
pub use process::ProcessHandle;
pub use rpc::RpcTransport;
pub use server::{CompileServer, CompileService, ServerContextManager};
pub use session::{Connection, SessionState, TransportSession};

/// What the scheduler hands to a transport for one dispatch.
#[derive(Debug, Clone)]
pub struct CompileRequest {
    pub work_item: WorkItemId,
    pub tier: Tier,
    pub kind: WorkItemKind,
    pub snapshot: Arc<FunctionSnapshot>,
}

/// Compiled code for one request, relocated into this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileResult {
    pub work_item: WorkItemId,
    pub code: Bytes,
    pub relocations: Bytes,
    pub deopt: Bytes,
    /// Entry point, relative to the start of `code`.
    pub entry_offset: u64,
}

impl CompileResult {
    pub fn code_size(&self) -> usize {
        self.code.len()
    }
}

pub type CompletionCallback =
    Box<dyn FnOnce(Result<CompileResult, TransportError>) + Send + 'static>;

/// A channel to a code generator, local or remote.
pub trait CompilationTransport: Send + Sync {
    /// Compiles `request`, blocking the calling thread until the result or a
    /// failure is available.
    fn submit(&self, request: CompileRequest) -> Result<CompileResult, TransportError>;

    /// Starts compiling `request` and reports the outcome to `on_complete`.
    fn submit_async(&self, request: CompileRequest, on_complete: CompletionCallback);

    /// Tears the channel down. Calling it on a disconnected transport is a
    /// no-op.
    fn disconnect(&self);

    fn is_connected(&self) -> bool;
}
