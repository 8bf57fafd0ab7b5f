#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArenaError {
    #[error("Arena out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },
    #[error("Arena is sealed, no further allocation is allowed")]
    Sealed,
    #[error("Unknown chunk {0}")]
    UnknownChunk(u32),
    #[error("Offset {offset} is out of range for chunk {chunk} ({len} bytes)")]
    OutOfRange { chunk: u32, offset: usize, len: usize },
    #[error("Pointer slot at offset {offset} in chunk {chunk} is not pointer-aligned")]
    Misaligned { chunk: u32, offset: usize },
    #[error("Chunk {0} was allocated without fixup support")]
    NoFixupChunk(u32),
    #[error("Pointer slot at offset {offset} in chunk {chunk} has no matching fixup")]
    MissingFixup { chunk: u32, offset: usize },
    #[error("Slot at offset {offset} in chunk {chunk} holds a pointer outside the arena")]
    ForeignPointer { chunk: u32, offset: usize },
    #[error("Pointer {pointer:#x} does not resolve inside the blob")]
    DanglingPointer { pointer: u64 },
    #[error("Read of {len} bytes at offset {offset} is outside the blob")]
    BlobOutOfRange { offset: usize, len: usize },
    #[error("Destination of {actual} bytes cannot hold a blob of {needed} bytes")]
    DestinationTooSmall { needed: usize, actual: usize },
    #[error("Corrupt blob: {0}")]
    CorruptBlob(String),
}

impl ArenaError {
    /// Whether the error came from exhausting the backing store.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}
