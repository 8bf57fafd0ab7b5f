//! Relocatable native-code-data arena.
//!
//! A request's transitive data (bytecode metadata, profile data, inlining
//! trees) is carved into fixed-offset chunks. Every pointer from one chunk
//! into another is recorded as a fixup, so the result can be flattened into a
//! position-independent [`SerializedBlob`] and later patched against any base
//! address with [`SerializedBlob::relocate`] or [`SerializedBlob::apply_to`].

mod arena;
mod blob;
mod error;
pub mod graph;

pub use arena::{Chunk, ChunkHandle, ChunkKind, FixupEntry, RelocatableArena};
pub use blob::{BlobFixup, ChunkRecord, RelocatedBlob, SerializedBlob};
pub use error::ArenaError;
pub use graph::{GraphNode, GraphView, NodeView, flatten_graph};

/// Width of every pointer-shaped slot on the wire, independent of the host.
pub const POINTER_SIZE: usize = 8;

/// Marks a not-yet-finalized slot as a logical pointer into the arena.
///
/// The low 48 bits carry the logical target offset.
pub(crate) const ARENA_TAG: u64 = 0xA7E4 << 48;
pub(crate) const OFFSET_MASK: u64 = (1 << 48) - 1;

/// Rounds `size` up to the pointer width.
pub fn align_to_pointer(size: usize) -> Option<usize> {
    size.checked_add(POINTER_SIZE - 1)
        .map(|s| s & !(POINTER_SIZE - 1))
}

pub(crate) fn to_u64(value: usize) -> u64 {
    // usize is at most 64 bits on every supported target
    u64::try_from(value).unwrap_or(u64::MAX)
}

pub(crate) fn to_usize(value: u64) -> Result<usize, ArenaError> {
    usize::try_from(value).map_err(|_| ArenaError::CorruptBlob(format!("offset {value:#x} exceeds host address width")))
}

pub(crate) fn read_u64_at(bytes: &[u8], offset: usize) -> Option<u64> {
    let end = offset.checked_add(POINTER_SIZE)?;
    let slot: [u8; POINTER_SIZE] = bytes.get(offset..end)?.try_into().ok()?;
    Some(u64::from_le_bytes(slot))
}

pub(crate) fn write_u64_at(bytes: &mut [u8], offset: usize, value: u64) -> Option<()> {
    let end = offset.checked_add(POINTER_SIZE)?;
    bytes
        .get_mut(offset..end)?
        .copy_from_slice(&value.to_le_bytes());
    Some(())
}
