//! Request and response bodies as relocatable blobs.
//!
//! Response layout: the root chunk holds three `(pointer, length)` pairs for
//! the code buffer, the relocation table and the deoptimization record, in
//! that order. Each buffer lives in its own no-fixup chunk; an empty buffer
//! is a null pointer with length zero.

use std::sync::Arc;

use bytes::Bytes;
use oopjit_arena::{ArenaError, GraphView, POINTER_SIZE, RelocatableArena, RelocatedBlob, SerializedBlob, flatten_graph};
use oopjit_common::{FailureReason, FunctionSnapshot, WorkItemId};

use crate::codegen::CompiledOutput;
use crate::wire::{CodeGenRequest, CodeGenResponse, RequestHeader, ServerMessage};
use crate::{CompileRequest, CompileResult, TransportError};

const OUTPUT_PARTS: usize = 3;
const PART_SIZE: usize = 2 * POINTER_SIZE;

pub fn marshal_snapshot(snapshot: &FunctionSnapshot, arena_capacity: usize) -> Result<SerializedBlob, TransportError> {
    Ok(flatten_graph(snapshot, arena_capacity)?)
}

pub fn unmarshal_snapshot(blob: SerializedBlob) -> Result<Arc<FunctionSnapshot>, TransportError> {
    let relocated = blob.relocate()?;
    let root = GraphView::new(&relocated).root()?;
    Ok(FunctionSnapshot::from_view(root)?)
}

pub fn marshal_output(output: &CompiledOutput, arena_capacity: usize) -> Result<SerializedBlob, TransportError> {
    let mut arena = RelocatableArena::new(arena_capacity);
    let root = arena.allocate(OUTPUT_PARTS * PART_SIZE)?;

    let parts = [&output.code, &output.relocations, &output.deopt];
    for (index, part) in parts.into_iter().enumerate() {
        let slot = index * PART_SIZE;
        let len = u64::try_from(part.len()).map_err(|_| ArenaError::OutOfMemory {
            requested: part.len(),
            available: 0,
        })?;
        arena.write_u64(root, slot + POINTER_SIZE, len)?;
        if part.is_empty() {
            continue;
        }
        let chunk = arena.allocate_no_fixup(part.len())?;
        arena.write_bytes(chunk, 0, part)?;
        arena.write_pointer(root, slot, chunk, 0)?;
    }

    #[cfg(debug_assertions)]
    arena.verify_all_pointers()?;

    Ok(arena.finalize()?)
}

pub fn unmarshal_output(blob: SerializedBlob) -> Result<(Bytes, Bytes, Bytes), TransportError> {
    let relocated = blob.relocate()?;
    let code = read_part(&relocated, 0)?;
    let relocations = read_part(&relocated, 1)?;
    let deopt = read_part(&relocated, 2)?;
    Ok((code, relocations, deopt))
}

fn read_part(relocated: &RelocatedBlob, index: usize) -> Result<Bytes, TransportError> {
    let slot = index * PART_SIZE;
    let len = usize::try_from(relocated.read_u64(slot + POINTER_SIZE)?)
        .map_err(|_| ArenaError::CorruptBlob(format!("part {index} length overflows")))?;
    match relocated.follow(slot)? {
        Some(offset) => Ok(Bytes::copy_from_slice(relocated.slice(offset, len)?)),
        None if len == 0 => Ok(Bytes::new()),
        None => Err(ArenaError::CorruptBlob(format!("part {index} has length {len} but no data")).into()),
    }
}

/// Builds the wire request for a dispatch against the given contexts.
pub fn build_codegen_request(
    request: &CompileRequest,
    thread_context_id: u64,
    script_context_id: u64,
    arena_capacity: usize,
) -> Result<CodeGenRequest, TransportError> {
    Ok(CodeGenRequest {
        thread_context_id,
        script_context_id,
        header: RequestHeader {
            work_item: request.work_item,
            tier: request.tier,
            kind: request.kind,
        },
        blob: marshal_snapshot(&request.snapshot, arena_capacity)?,
    })
}

/// Builds the success reply for generated code.
pub fn build_codegen_response(output: &CompiledOutput, arena_capacity: usize) -> Result<CodeGenResponse, TransportError> {
    let code_size = u32::try_from(output.code.len()).map_err(|_| ArenaError::OutOfMemory {
        requested: output.code.len(),
        available: 0,
    })?;
    Ok(CodeGenResponse {
        status: oopjit_common::STATUS_OK,
        entry_offset: output.entry_offset,
        code_size,
        blob: marshal_output(output, arena_capacity)?,
    })
}

/// Turns the reply to a `RemoteCodeGen` call into a result.
///
/// Anything short of a complete, consistent response is an error; partial
/// results never reach the caller.
pub fn decode_codegen_reply(work_item: WorkItemId, reply: ServerMessage) -> Result<CompileResult, TransportError> {
    let response = match reply {
        ServerMessage::CodeGen(response) => response,
        ServerMessage::Status { code } => {
            return Err(match FailureReason::from_status_code(code) {
                Some(reason) => TransportError::Remote(reason),
                None => TransportError::UnexpectedReply("success status without code".to_string()),
            });
        }
        other => return Err(TransportError::UnexpectedReply(format!("{other:?}"))),
    };
    if let Some(reason) = FailureReason::from_status_code(response.status) {
        return Err(TransportError::Remote(reason));
    }

    let (code, relocations, deopt) = unmarshal_output(response.blob)?;
    let code_size = usize::try_from(response.code_size).unwrap_or(usize::MAX);
    if code.len() != code_size {
        return Err(TransportError::UnexpectedReply(format!(
            "code size {} does not match the {} bytes received",
            response.code_size,
            code.len()
        )));
    }
    let entry_in_range = usize::try_from(response.entry_offset).is_ok_and(|entry| entry < code_size.max(1));
    if !entry_in_range {
        return Err(TransportError::UnexpectedReply(format!(
            "entry offset {} outside {code_size} bytes of code",
            response.entry_offset
        )));
    }

    Ok(CompileResult {
        work_item,
        code,
        relocations,
        deopt,
        entry_offset: response.entry_offset,
    })
}
