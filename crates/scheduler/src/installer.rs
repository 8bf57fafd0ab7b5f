//! Publishing generated code into this process.
//!
//! [`ExecutableMemoryInstaller`] maps fresh pages read-write, copies the
//! code in, flips the pages to read-execute and flushes the instruction
//! cache. Each install gets its own mapping, released by [`CodeInstaller::free`]
//! or when the installer is dropped.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use oopjit_common::{Tier, WorkItemKind};
use tracing::{debug, trace};

use crate::InstallError;

/// Handle to one installed code allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocationId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstalledCode {
    pub allocation: AllocationId,
    pub entry_address: usize,
    pub code_size: usize,
}

/// What the code is for, so an installer can place it accordingly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutableHint {
    pub tier: Tier,
    pub kind: WorkItemKind,
}

pub trait CodeInstaller: Send + Sync {
    /// Makes `code` executable and returns where its entry point lives.
    fn install(&self, code: &[u8], entry_offset: usize, hint: ExecutableHint) -> Result<InstalledCode, InstallError>;

    fn free(&self, allocation: AllocationId) -> Result<(), InstallError>;
}

struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

#[expect(unsafe_code, reason = "a mapping is owned by exactly one installer entry")]
unsafe impl Send for Mapping {}

impl Mapping {
    #[cfg(unix)]
    fn map(len: usize) -> Result<Self, InstallError> {
        use libc::{MAP_ANON, MAP_PRIVATE, PROT_READ, PROT_WRITE};

        #[expect(unsafe_code, reason = "libc::mmap call for a fresh private mapping")]
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(InstallError::Map(std::io::Error::last_os_error()));
        }
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| InstallError::Map(std::io::Error::other("mmap returned null")))?;
        Ok(Self { ptr, len })
    }

    #[cfg(not(unix))]
    fn map(_len: usize) -> Result<Self, InstallError> {
        Err(InstallError::Map(std::io::Error::from(std::io::ErrorKind::Unsupported)))
    }

    fn write(&mut self, code: &[u8]) {
        let len = code.len().min(self.len);
        #[expect(unsafe_code, reason = "the mapping is writable and at least len bytes long")]
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), self.ptr.as_ptr(), len);
        }
    }

    #[cfg(unix)]
    fn make_executable(&self) -> Result<(), InstallError> {
        use libc::{PROT_EXEC, PROT_READ};

        #[expect(unsafe_code, reason = "libc::mprotect on a mapping we own")]
        let result = unsafe { libc::mprotect(self.ptr.as_ptr().cast(), self.len, PROT_READ | PROT_EXEC) };
        if result != 0 {
            return Err(InstallError::Protect(std::io::Error::last_os_error()));
        }
        flush_instruction_cache(self.ptr.as_ptr(), self.len);
        Ok(())
    }

    #[cfg(not(unix))]
    fn make_executable(&self) -> Result<(), InstallError> {
        Err(InstallError::Protect(std::io::Error::from(std::io::ErrorKind::Unsupported)))
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        #[cfg(unix)]
        #[expect(unsafe_code, reason = "libc::munmap of a mapping we own")]
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

#[cfg(target_arch = "aarch64")]
fn flush_instruction_cache(start: *mut u8, len: usize) {
    unsafe extern "C" {
        fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
    }
    #[expect(unsafe_code, reason = "compiler-rt cache maintenance over our own mapping")]
    unsafe {
        __clear_cache(start.cast(), start.wrapping_add(len).cast());
    }
}

#[cfg(not(target_arch = "aarch64"))]
fn flush_instruction_cache(_start: *mut u8, _len: usize) {
    // Coherent instruction cache
}

fn page_size() -> usize {
    #[cfg(unix)]
    {
        #[expect(unsafe_code, reason = "sysconf has no preconditions")]
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if let Ok(size) = usize::try_from(size) {
            if size.is_power_of_two() {
                return size;
            }
        }
    }
    4096
}

#[derive(Default)]
struct InstallerState {
    mappings: HashMap<AllocationId, Mapping>,
    used: usize,
}

/// Installs code into private executable mappings, bounded by a byte budget
/// counted in whole pages.
pub struct ExecutableMemoryInstaller {
    state: Mutex<InstallerState>,
    budget: usize,
    page_size: usize,
    next_allocation: AtomicU64,
}

impl std::fmt::Debug for ExecutableMemoryInstaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("ExecutableMemoryInstaller")
            .field("budget", &self.budget)
            .field("used", &state.used)
            .field("allocations", &state.mappings.len())
            .finish()
    }
}

impl ExecutableMemoryInstaller {
    pub fn new(budget: usize) -> Self {
        Self {
            state: Mutex::new(InstallerState::default()),
            budget,
            page_size: page_size(),
            next_allocation: AtomicU64::new(1),
        }
    }

    fn state(&self) -> MutexGuard<'_, InstallerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bytes of executable memory currently mapped.
    pub fn used(&self) -> usize {
        self.state().used
    }

    pub fn allocations(&self) -> usize {
        self.state().mappings.len()
    }

    fn round_to_pages(&self, len: usize) -> Option<usize> {
        let mask = self.page_size.checked_sub(1)?;
        Some(len.checked_add(mask)? & !mask)
    }
}

impl CodeInstaller for ExecutableMemoryInstaller {
    fn install(&self, code: &[u8], entry_offset: usize, hint: ExecutableHint) -> Result<InstalledCode, InstallError> {
        if code.is_empty() {
            return Err(InstallError::EmptyCode);
        }
        if entry_offset >= code.len() {
            return Err(InstallError::EntryOutOfRange {
                entry_offset,
                code_size: code.len(),
            });
        }

        let mut state = self.state();
        let available = self.budget.saturating_sub(state.used);
        let len = self
            .round_to_pages(code.len())
            .filter(|len| *len <= available)
            .ok_or(InstallError::OutOfExecutableMemory {
                requested: code.len(),
                available,
            })?;

        let mut mapping = Mapping::map(len)?;
        mapping.write(code);
        mapping.make_executable()?;

        let allocation = AllocationId(self.next_allocation.fetch_add(1, Ordering::Relaxed));
        let entry_address = mapping.ptr.as_ptr().expose_provenance().saturating_add(entry_offset);
        state.used = state.used.saturating_add(len);
        state.mappings.insert(allocation, mapping);
        trace!(allocation = allocation.0, tier = %hint.tier, code_size = code.len(), "Installed code");

        Ok(InstalledCode {
            allocation,
            entry_address,
            code_size: code.len(),
        })
    }

    fn free(&self, allocation: AllocationId) -> Result<(), InstallError> {
        let mut state = self.state();
        let mapping = state
            .mappings
            .remove(&allocation)
            .ok_or(InstallError::UnknownAllocation(allocation.0))?;
        state.used = state.used.saturating_sub(mapping.len);
        drop(state);
        drop(mapping);
        debug!(allocation = allocation.0, "Freed installed code");
        Ok(())
    }
}
