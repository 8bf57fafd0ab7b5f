use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{ArenaError, POINTER_SIZE, read_u64_at, to_u64, to_usize, write_u64_at};

/// A fixup in blob coordinates: the slot at `addr_offset` must point at
/// `base + target_offset` once the blob lives at `base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobFixup {
    pub addr_offset: u64,
    pub target_offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub index: u32,
    pub offset: u64,
    pub length: u64,
}

/// Position-independent result of [`crate::RelocatableArena::finalize`].
///
/// Pointer slots hold blob-relative offsets until the blob is placed with
/// [`SerializedBlob::relocate`] or [`SerializedBlob::apply_to`]. Both consume
/// the blob, so a received blob is patched exactly once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedBlob {
    pub(crate) bytes: Vec<u8>,
    pub(crate) fixups: Vec<BlobFixup>,
    pub(crate) chunks: Vec<ChunkRecord>,
}

impl SerializedBlob {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn fixups(&self) -> &[BlobFixup] {
        &self.fixups
    }

    pub fn chunks(&self) -> &[ChunkRecord] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Checks a blob received from an untrusted peer before it is placed.
    ///
    /// Chunks must tile the byte range in order. Fixup slots must be
    /// pointer-aligned, in range, unique and sorted, and every target must
    /// land inside the blob.
    pub fn validate(&self) -> Result<(), ArenaError> {
        let len = to_u64(self.bytes.len());

        let mut expected_offset = 0u64;
        for chunk in &self.chunks {
            if chunk.offset != expected_offset {
                return Err(ArenaError::CorruptBlob(format!(
                    "chunk {} starts at {} instead of {expected_offset}",
                    chunk.index, chunk.offset
                )));
            }
            expected_offset = chunk.offset.saturating_add(chunk.length);
        }
        if expected_offset != len {
            return Err(ArenaError::CorruptBlob(format!(
                "chunks cover {expected_offset} bytes of a {len} byte blob"
            )));
        }

        let pointer_size = to_u64(POINTER_SIZE);
        let mut previous: Option<u64> = None;
        for fixup in &self.fixups {
            if fixup.addr_offset % pointer_size != 0 {
                return Err(ArenaError::CorruptBlob(format!(
                    "fixup slot {} is not pointer-aligned",
                    fixup.addr_offset
                )));
            }
            if fixup.addr_offset.saturating_add(pointer_size) > len {
                return Err(ArenaError::CorruptBlob(format!(
                    "fixup slot {} is outside the blob",
                    fixup.addr_offset
                )));
            }
            if fixup.target_offset >= len {
                return Err(ArenaError::CorruptBlob(format!(
                    "fixup at {} targets {} outside the blob",
                    fixup.addr_offset, fixup.target_offset
                )));
            }
            if previous.is_some_and(|prev| prev >= fixup.addr_offset) {
                return Err(ArenaError::CorruptBlob(format!(
                    "fixup slot {} is duplicated or out of order",
                    fixup.addr_offset
                )));
            }
            previous = Some(fixup.addr_offset);
        }
        Ok(())
    }

    /// Deferred placement: copies the blob into `dest`, which the caller will
    /// make live at `base_address`, and patches every fixup against it.
    pub fn apply_to(self, dest: &mut [u8], base_address: u64) -> Result<(), ArenaError> {
        self.validate()?;
        let needed = self.bytes.len();
        let actual = dest.len();
        let window = dest
            .get_mut(..needed)
            .ok_or(ArenaError::DestinationTooSmall { needed, actual })?;
        window.copy_from_slice(&self.bytes);
        patch(window, &self.fixups, base_address)
    }

    /// Moves the blob into storage it owns and patches it against that
    /// storage's own address.
    pub fn relocate(self) -> Result<RelocatedBlob, ArenaError> {
        self.validate()?;
        let mut storage = self.bytes.into_boxed_slice();
        let base = to_u64(storage.as_ptr().addr());
        patch(&mut storage, &self.fixups, base)?;
        trace!(
            base = format_args!("{base:#x}"),
            len = storage.len(),
            fixups = self.fixups.len(),
            "Blob relocated"
        );
        Ok(RelocatedBlob {
            storage,
            base,
            chunks: self.chunks,
        })
    }
}

fn patch(window: &mut [u8], fixups: &[BlobFixup], base_address: u64) -> Result<(), ArenaError> {
    for fixup in fixups {
        let addr = to_usize(fixup.addr_offset)?;
        let value = base_address.saturating_add(fixup.target_offset);
        write_u64_at(window, addr, value).ok_or(ArenaError::BlobOutOfRange {
            offset: addr,
            len: POINTER_SIZE,
        })?;
    }
    Ok(())
}

/// A blob patched in place to form a live pointer graph.
///
/// The heap storage never moves once relocated, so pointers stay valid when
/// the `RelocatedBlob` value itself is moved.
#[derive(Debug)]
pub struct RelocatedBlob {
    storage: Box<[u8]>,
    base: u64,
    chunks: Vec<ChunkRecord>,
}

impl RelocatedBlob {
    pub fn base_address(&self) -> u64 {
        self.base
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.storage
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub fn chunks(&self) -> &[ChunkRecord] {
        &self.chunks
    }

    pub fn slice(&self, offset: usize, len: usize) -> Result<&[u8], ArenaError> {
        offset
            .checked_add(len)
            .and_then(|end| self.storage.get(offset..end))
            .ok_or(ArenaError::BlobOutOfRange { offset, len })
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32, ArenaError> {
        let bytes: [u8; 4] = self
            .slice(offset, 4)?
            .try_into()
            .map_err(|_| ArenaError::BlobOutOfRange { offset, len: 4 })?;
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn read_u64(&self, offset: usize) -> Result<u64, ArenaError> {
        read_u64_at(&self.storage, offset).ok_or(ArenaError::BlobOutOfRange {
            offset,
            len: POINTER_SIZE,
        })
    }

    /// Reads the raw pointer stored in the slot at `offset`.
    pub fn read_pointer(&self, offset: usize) -> Result<u64, ArenaError> {
        if offset % POINTER_SIZE != 0 {
            return Err(ArenaError::CorruptBlob(format!(
                "pointer read at unaligned offset {offset}"
            )));
        }
        self.read_u64(offset)
    }

    /// Maps a live pointer back to a blob offset, rejecting anything that
    /// does not land inside this blob.
    pub fn resolve(&self, pointer: u64) -> Result<usize, ArenaError> {
        let dangling = ArenaError::DanglingPointer { pointer };
        let offset = pointer.checked_sub(self.base).ok_or(dangling.clone())?;
        let offset = usize::try_from(offset).map_err(|_| dangling.clone())?;
        if offset >= self.storage.len() {
            return Err(dangling);
        }
        Ok(offset)
    }

    /// Follows the pointer in the slot at `offset`. A null slot yields `None`.
    pub fn follow(&self, offset: usize) -> Result<Option<usize>, ArenaError> {
        match self.read_pointer(offset)? {
            0 => Ok(None),
            pointer => self.resolve(pointer).map(Some),
        }
    }
}
