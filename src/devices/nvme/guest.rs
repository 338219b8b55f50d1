//! Guest memory translation boundary.
//!
//! The controller never touches guest memory directly: every PRP and queue
//! base address is resolved through `GuestMemory::translate`, which mirrors
//! the host VMM's `gpa_to_hva()` and is expected to range-check the access.
//! A real VMM backs this with its mmap'd guest RAM; tests back it with a
//! flat `Vec<u8>` arena.

use super::error::NvmeError;

/// A contiguous span of host-addressable memory that a PRP segment resolved
/// to. Scatter/gather code appends these into an iovec for the backend.
#[derive(Clone, Copy)]
pub struct GuestSlice {
    pub ptr: *mut u8,
    pub len: usize,
}

// SAFETY: GuestSlice is a plain (pointer, length) pair handed to a backend
// thread; the backend is trusted to only dereference it for the duration of
// the I/O, matching the lifetime guarantee GuestMemory::translate provides.
unsafe impl Send for GuestSlice {}

impl GuestSlice {
    /// Guest address immediately following this slice, used for coalescing
    /// adjacent PRP segments into a single iovec entry.
    pub fn end_gpa(&self, start_gpa: u64) -> u64 {
        start_gpa + self.len as u64
    }
}

/// Guest-physical to host-virtual translation, provided by the host VMM.
pub trait GuestMemory: Send + Sync {
    /// Translate `len` bytes starting at guest-physical address `gpa`.
    /// Must fail rather than panic on an unmapped or out-of-range access.
    fn translate(&self, gpa: u64, len: usize) -> Result<*mut u8, NvmeError>;
}

/// Flat-buffer `GuestMemory` used by unit and integration tests: guest
/// address 0 maps to the start of the backing `Vec<u8>`.
pub struct TestGuestMemory {
    ram: parking_lot::Mutex<Vec<u8>>,
}

impl TestGuestMemory {
    pub fn new(size: usize) -> Self {
        Self { ram: parking_lot::Mutex::new(vec![0u8; size]) }
    }

    pub fn len(&self) -> usize {
        self.ram.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read_at(&self, gpa: u64, len: usize) -> Vec<u8> {
        let ram = self.ram.lock();
        ram[gpa as usize..gpa as usize + len].to_vec()
    }

    pub fn write_at(&self, gpa: u64, data: &[u8]) {
        let mut ram = self.ram.lock();
        ram[gpa as usize..gpa as usize + data.len()].copy_from_slice(data);
    }
}

impl GuestMemory for TestGuestMemory {
    fn translate(&self, gpa: u64, len: usize) -> Result<*mut u8, NvmeError> {
        let mut ram = self.ram.lock();
        let start = gpa as usize;
        let end = start.checked_add(len).ok_or(NvmeError::GuestTranslation { gpa, len })?;
        if end > ram.len() {
            return Err(NvmeError::GuestTranslation { gpa, len });
        }
        Ok(ram[start..end].as_mut_ptr())
    }
}
