//! Chunked bump allocator with explicit fixup bookkeeping.
//!
//! Chunks are addressed by [`ChunkHandle`] (an allocation index), never by raw
//! address. A chunk's logical offset is the sum of the aligned lengths of all
//! chunks allocated before it, which is exactly where its bytes land in the
//! finalized blob.

use tracing::trace;

use crate::blob::{BlobFixup, ChunkRecord, SerializedBlob};
use crate::{ARENA_TAG, ArenaError, OFFSET_MASK, POINTER_SIZE, align_to_pointer, read_u64_at, to_u64, write_u64_at};

/// Index of a chunk inside its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkHandle(u32);

impl ChunkHandle {
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Whether a chunk may hold pointers into the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Scalars and pointer slots. Every slot is checked by verification.
    Pointers,
    /// Raw bytes (code, payloads) that never carry a pointer.
    NoFixup,
}

/// A pointer-sized slot that must be rewritten once the arena is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixupEntry {
    /// Offset of the slot relative to the start of its chunk.
    pub addr_offset: usize,
    /// Logical offset (target chunk offset + inner offset) the slot points at.
    pub target_total_offset: usize,
}

#[derive(Debug)]
pub struct Chunk {
    index: u32,
    offset: usize,
    kind: ChunkKind,
    data: Vec<u8>,
    fixups: Vec<FixupEntry>,
}

impl Chunk {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn kind(&self) -> ChunkKind {
        self.kind
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn fixups(&self) -> &[FixupEntry] {
        &self.fixups
    }

    fn check_slot(&self, byte_offset: usize) -> Result<(), ArenaError> {
        if byte_offset % POINTER_SIZE != 0 {
            return Err(ArenaError::Misaligned {
                chunk: self.index,
                offset: byte_offset,
            });
        }
        match byte_offset.checked_add(POINTER_SIZE) {
            Some(end) if end <= self.data.len() => Ok(()),
            _ => Err(ArenaError::OutOfRange {
                chunk: self.index,
                offset: byte_offset,
                len: self.data.len(),
            }),
        }
    }
}

/// Bump allocator for one compilation request.
///
/// Exclusively owned by the thread building the request. Once
/// [`RelocatableArena::finalize`] has run the arena is sealed and every
/// further mutation fails with [`ArenaError::Sealed`].
#[derive(Debug)]
pub struct RelocatableArena {
    chunks: Vec<Chunk>,
    used: usize,
    capacity: usize,
    sealed: bool,
}

impl RelocatableArena {
    /// Creates an arena that can hold at most `capacity` bytes of chunks.
    pub fn new(capacity: usize) -> Self {
        Self {
            chunks: Vec::new(),
            used: 0,
            capacity,
            sealed: false,
        }
    }

    /// Allocates a zeroed chunk of `align(size, POINTER_SIZE)` bytes.
    ///
    /// A zero-sized request still gets one pointer-sized slot so that every
    /// chunk has a distinct, in-range logical offset.
    pub fn allocate(&mut self, size: usize) -> Result<ChunkHandle, ArenaError> {
        self.allocate_kind(size, ChunkKind::Pointers)
    }

    /// Allocates a chunk for raw bytes that never hold arena pointers.
    pub fn allocate_no_fixup(&mut self, size: usize) -> Result<ChunkHandle, ArenaError> {
        self.allocate_kind(size, ChunkKind::NoFixup)
    }

    fn allocate_kind(&mut self, size: usize, kind: ChunkKind) -> Result<ChunkHandle, ArenaError> {
        if self.sealed {
            return Err(ArenaError::Sealed);
        }
        let available = self.capacity.saturating_sub(self.used);
        let out_of_memory = ArenaError::OutOfMemory {
            requested: size,
            available,
        };
        let len = align_to_pointer(size.max(1)).ok_or(out_of_memory.clone())?;
        if len > available {
            return Err(out_of_memory);
        }
        let index = u32::try_from(self.chunks.len()).map_err(|_| out_of_memory.clone())?;

        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|_| out_of_memory)?;
        data.resize(len, 0);

        self.chunks.push(Chunk {
            index,
            offset: self.used,
            kind,
            data,
            fixups: Vec::new(),
        });
        self.used = self.used.saturating_add(len);
        Ok(ChunkHandle(index))
    }

    pub fn chunk(&self, handle: ChunkHandle) -> Result<&Chunk, ArenaError> {
        self.chunks
            .get(to_index(handle))
            .ok_or(ArenaError::UnknownChunk(handle.0))
    }

    fn chunk_mut(&mut self, handle: ChunkHandle) -> Result<&mut Chunk, ArenaError> {
        if self.sealed {
            return Err(ArenaError::Sealed);
        }
        self.chunks
            .get_mut(to_index(handle))
            .ok_or(ArenaError::UnknownChunk(handle.0))
    }

    /// Logical offset of a chunk in the arena's address space.
    pub fn offset_of(&self, handle: ChunkHandle) -> Result<usize, ArenaError> {
        self.chunk(handle).map(Chunk::offset)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Bytes handed out so far.
    pub fn used(&self) -> usize {
        self.used
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Copies `bytes` into the chunk at `byte_offset`.
    pub fn write_bytes(
        &mut self,
        handle: ChunkHandle,
        byte_offset: usize,
        bytes: &[u8],
    ) -> Result<(), ArenaError> {
        let chunk = self.chunk_mut(handle)?;
        let len = chunk.data.len();
        let out_of_range = ArenaError::OutOfRange {
            chunk: handle.0,
            offset: byte_offset,
            len,
        };
        let end = byte_offset
            .checked_add(bytes.len())
            .ok_or(out_of_range.clone())?;
        chunk
            .data
            .get_mut(byte_offset..end)
            .ok_or(out_of_range)?
            .copy_from_slice(bytes);
        Ok(())
    }

    pub fn write_u32(
        &mut self,
        handle: ChunkHandle,
        byte_offset: usize,
        value: u32,
    ) -> Result<(), ArenaError> {
        self.write_bytes(handle, byte_offset, &value.to_le_bytes())
    }

    pub fn write_u64(
        &mut self,
        handle: ChunkHandle,
        byte_offset: usize,
        value: u64,
    ) -> Result<(), ArenaError> {
        self.write_bytes(handle, byte_offset, &value.to_le_bytes())
    }

    /// Writes a logical pointer to `target + inner` without recording a fixup.
    ///
    /// The caller must cover the slot with [`Self::record_fixup`] or
    /// [`Self::record_pointer_array`] before finalizing; verification reports
    /// the slot otherwise.
    pub fn store_pointer(
        &mut self,
        handle: ChunkHandle,
        byte_offset: usize,
        target: ChunkHandle,
        inner: usize,
    ) -> Result<(), ArenaError> {
        let target_total_offset = self.target_offset(target, inner)?;
        let chunk = self.chunk_mut(handle)?;
        if chunk.kind == ChunkKind::NoFixup {
            return Err(ArenaError::NoFixupChunk(handle.0));
        }
        chunk.check_slot(byte_offset)?;
        let tagged = ARENA_TAG | (to_u64(target_total_offset) & OFFSET_MASK);
        write_u64_at(&mut chunk.data, byte_offset, tagged).ok_or(ArenaError::OutOfRange {
            chunk: handle.0,
            offset: byte_offset,
            len: chunk.data.len(),
        })
    }

    /// Writes a pointer to `target + inner` and records its fixup.
    pub fn write_pointer(
        &mut self,
        handle: ChunkHandle,
        byte_offset: usize,
        target: ChunkHandle,
        inner: usize,
    ) -> Result<(), ArenaError> {
        self.store_pointer(handle, byte_offset, target, inner)?;
        self.record_fixup(handle, byte_offset, target, inner)
    }

    /// Records that the slot at `byte_offset` of `handle` points at
    /// `target + inner`.
    ///
    /// Recording the same slot twice replaces the earlier entry, so each slot
    /// has at most one fixup.
    pub fn record_fixup(
        &mut self,
        handle: ChunkHandle,
        byte_offset: usize,
        target: ChunkHandle,
        inner: usize,
    ) -> Result<(), ArenaError> {
        let target_total_offset = self.target_offset(target, inner)?;
        let chunk = self.chunk_mut(handle)?;
        if chunk.kind == ChunkKind::NoFixup {
            return Err(ArenaError::NoFixupChunk(handle.0));
        }
        chunk.check_slot(byte_offset)?;
        push_fixup(&mut chunk.fixups, byte_offset, target_total_offset);
        Ok(())
    }

    /// Bulk form of [`Self::record_fixup`] for a chunk that is a dense array of
    /// pointers.
    ///
    /// Null slots are skipped. Every other slot must hold a logical pointer
    /// written by [`Self::store_pointer`]. Returns the number of fixups
    /// recorded.
    pub fn record_pointer_array(&mut self, handle: ChunkHandle) -> Result<usize, ArenaError> {
        let used = self.used;
        let chunk = self.chunk_mut(handle)?;
        if chunk.kind == ChunkKind::NoFixup {
            return Err(ArenaError::NoFixupChunk(handle.0));
        }
        let mut recorded = 0;
        for (slot, bytes) in chunk.data.chunks_exact(POINTER_SIZE).enumerate() {
            let byte_offset = slot.saturating_mul(POINTER_SIZE);
            let value = read_u64_at(bytes, 0).unwrap_or(0);
            if value == 0 {
                continue;
            }
            let foreign = ArenaError::ForeignPointer {
                chunk: handle.0,
                offset: byte_offset,
            };
            let target = decode_tagged(value).ok_or(foreign.clone())?;
            if target >= used {
                return Err(foreign);
            }
            push_fixup(&mut chunk.fixups, byte_offset, target);
            recorded += 1;
        }
        Ok(recorded)
    }

    /// Checks that the slot at `byte_offset` of `handle` has a fixup pointing
    /// at `target + inner`.
    pub fn verify_fixup_exists(
        &self,
        handle: ChunkHandle,
        byte_offset: usize,
        target: ChunkHandle,
        inner: usize,
    ) -> Result<(), ArenaError> {
        let target_total_offset = self.target_offset(target, inner)?;
        let chunk = self.chunk(handle)?;
        let found = chunk.fixups.iter().any(|fixup| {
            fixup.addr_offset == byte_offset && fixup.target_total_offset == target_total_offset
        });
        if found {
            Ok(())
        } else {
            Err(ArenaError::MissingFixup {
                chunk: handle.0,
                offset: byte_offset,
            })
        }
    }

    /// Checks every pointer slot of every fixup-capable chunk.
    ///
    /// A slot holding a logical pointer must have exactly the matching fixup.
    /// This catches pointers written directly into a chunk without being
    /// registered, which would otherwise dangle only after relocation.
    pub fn verify_all_pointers(&self) -> Result<(), ArenaError> {
        for chunk in self.chunks.iter().filter(|c| c.kind == ChunkKind::Pointers) {
            for (slot, bytes) in chunk.data.chunks_exact(POINTER_SIZE).enumerate() {
                let Some(target) = read_u64_at(bytes, 0).and_then(decode_tagged) else {
                    continue;
                };
                let byte_offset = slot.saturating_mul(POINTER_SIZE);
                let matched = chunk.fixups.iter().any(|fixup| {
                    fixup.addr_offset == byte_offset && fixup.target_total_offset == target
                });
                if !matched {
                    return Err(ArenaError::MissingFixup {
                        chunk: chunk.index,
                        offset: byte_offset,
                    });
                }
            }
        }
        Ok(())
    }

    /// Seals the arena and flattens it into a position-independent blob.
    ///
    /// Chunks are concatenated in allocation order. Each fixup slot is
    /// rewritten to hold its blob-relative target offset and the per-chunk
    /// fixup lists are flattened into absolute slot offsets.
    pub fn finalize(&mut self) -> Result<SerializedBlob, ArenaError> {
        if self.sealed {
            return Err(ArenaError::Sealed);
        }
        self.sealed = true;

        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(self.used)
            .map_err(|_| ArenaError::OutOfMemory {
                requested: self.used,
                available: 0,
            })?;
        let mut fixups = Vec::new();
        let mut chunks = Vec::with_capacity(self.chunks.len());

        for chunk in self.chunks.drain(..) {
            bytes.extend_from_slice(&chunk.data);
            chunks.push(ChunkRecord {
                index: chunk.index,
                offset: to_u64(chunk.offset),
                length: to_u64(chunk.data.len()),
            });
            for fixup in &chunk.fixups {
                let addr = chunk.offset.saturating_add(fixup.addr_offset);
                write_u64_at(&mut bytes, addr, to_u64(fixup.target_total_offset)).ok_or(
                    ArenaError::OutOfRange {
                        chunk: chunk.index,
                        offset: fixup.addr_offset,
                        len: chunk.data.len(),
                    },
                )?;
                fixups.push(BlobFixup {
                    addr_offset: to_u64(addr),
                    target_offset: to_u64(fixup.target_total_offset),
                });
            }
        }
        fixups.sort_unstable_by_key(|fixup| fixup.addr_offset);

        trace!(
            chunks = chunks.len(),
            bytes = bytes.len(),
            fixups = fixups.len(),
            "Arena finalized"
        );

        Ok(SerializedBlob {
            bytes,
            fixups,
            chunks,
        })
    }

    fn target_offset(&self, target: ChunkHandle, inner: usize) -> Result<usize, ArenaError> {
        let chunk = self.chunk(target)?;
        if inner >= chunk.data.len() {
            return Err(ArenaError::OutOfRange {
                chunk: target.0,
                offset: inner,
                len: chunk.data.len(),
            });
        }
        Ok(chunk.offset.saturating_add(inner))
    }
}

fn to_index(handle: ChunkHandle) -> usize {
    usize::try_from(handle.0).unwrap_or(usize::MAX)
}

fn decode_tagged(value: u64) -> Option<usize> {
    if value & !OFFSET_MASK != ARENA_TAG {
        return None;
    }
    usize::try_from(value & OFFSET_MASK).ok()
}

fn push_fixup(fixups: &mut Vec<FixupEntry>, addr_offset: usize, target_total_offset: usize) {
    match fixups.iter_mut().find(|f| f.addr_offset == addr_offset) {
        Some(existing) => existing.target_total_offset = target_total_offset,
        None => fixups.push(FixupEntry {
            addr_offset,
            target_total_offset,
        }),
    }
}
