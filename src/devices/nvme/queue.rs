//! Submission/Completion queue pair state.
//!
//! Head/tail/busy live in atomics so the doorbell path and the executor
//! loop never need to take a lock just to advance a ring pointer; posting a
//! completion (which must also flip the phase bit) is the one operation
//! still protected by a per-CQ mutex.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

use super::cmd::{Command, Completion, CQE_SIZE, SQE_SIZE};
use super::guest::GuestMemory;
use crate::devices::nvme::error::NvmeError;

const ORD: Ordering = Ordering::SeqCst;

/// A Submission Queue. `qbase == 0` means the queue does not exist.
pub struct SubmissionQueue {
    qbase: AtomicU64,
    size: AtomicU32,
    head: AtomicU32,
    tail: AtomicU32,
    cqid: AtomicU16,
    qpriority: AtomicU8,
    /// Try-lock: only one executor thread may drain a given SQ at a time.
    busy: AtomicBool,
}

impl SubmissionQueue {
    pub fn new() -> Self {
        Self {
            qbase: AtomicU64::new(0),
            size: AtomicU32::new(0),
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            cqid: AtomicU16::new(0),
            qpriority: AtomicU8::new(0),
            busy: AtomicBool::new(false),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.qbase.load(ORD) != 0
    }

    pub fn configure(&self, qbase: u64, size: u32, cqid: u16, qpriority: u8) {
        self.qbase.store(qbase, ORD);
        self.size.store(size, ORD);
        self.head.store(0, ORD);
        self.tail.store(0, ORD);
        self.cqid.store(cqid, ORD);
        self.qpriority.store(qpriority, ORD);
        self.busy.store(false, ORD);
    }

    pub fn teardown(&self) {
        self.qbase.store(0, ORD);
        self.size.store(0, ORD);
        self.head.store(0, ORD);
        self.tail.store(0, ORD);
        self.busy.store(false, ORD);
    }

    pub fn cqid(&self) -> u16 {
        self.cqid.load(ORD)
    }

    pub fn size(&self) -> u32 {
        self.size.load(ORD)
    }

    pub fn head(&self) -> u32 {
        self.head.load(ORD)
    }

    pub fn set_tail_from_doorbell(&self, tail: u32) {
        self.tail.store(tail, ORD);
    }

    /// Try to acquire the drain lock for this queue; `false` means another
    /// thread is already draining it (the new doorbell write will be picked
    /// up by that thread's next tail read).
    pub fn try_acquire_busy(&self) -> bool {
        self.busy.compare_exchange(false, true, ORD, ORD).is_ok()
    }

    pub fn release_busy(&self) {
        self.busy.store(false, ORD);
    }

    /// Read and decode the command at `local_head`, translated through
    /// `mem` from this queue's base.
    pub fn read_command(&self, mem: &dyn GuestMemory, local_head: u32) -> Result<Command, NvmeError> {
        let gpa = self.qbase.load(ORD) + (local_head as u64) * SQE_SIZE as u64;
        let ptr = mem.translate(gpa, SQE_SIZE)?;
        let bytes = unsafe { std::slice::from_raw_parts(ptr, SQE_SIZE) };
        Ok(Command::from_bytes(bytes))
    }

    pub fn current_tail(&self) -> u32 {
        self.tail.load(ORD)
    }

    pub fn store_head(&self, head: u32) {
        self.head.store(head, ORD);
    }
}

impl Default for SubmissionQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A Completion Queue. `qbase == 0` means the queue does not exist.
pub struct CompletionQueue {
    qbase: AtomicU64,
    size: AtomicU32,
    /// Guarded together with the phase bit and tail index by `post_lock`.
    post_lock: parking_lot::Mutex<CqPostState>,
    head: AtomicU32,
    intr_vector: AtomicU16,
    inten: AtomicBool,
    intcoal: AtomicBool,
}

struct CqPostState {
    tail: u32,
    phase: bool,
}

impl CompletionQueue {
    pub fn new() -> Self {
        Self {
            qbase: AtomicU64::new(0),
            size: AtomicU32::new(0),
            post_lock: parking_lot::Mutex::new(CqPostState { tail: 0, phase: true }),
            head: AtomicU32::new(0),
            intr_vector: AtomicU16::new(0),
            inten: AtomicBool::new(false),
            intcoal: AtomicBool::new(false),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.qbase.load(ORD) != 0
    }

    pub fn configure(&self, qbase: u64, size: u32, vector: u16, inten: bool) {
        self.qbase.store(qbase, ORD);
        self.size.store(size, ORD);
        self.head.store(0, ORD);
        self.intr_vector.store(vector, ORD);
        self.inten.store(inten, ORD);
        self.intcoal.store(false, ORD);
        *self.post_lock.lock() = CqPostState { tail: 0, phase: true };
    }

    pub fn teardown(&self) {
        self.qbase.store(0, ORD);
        self.size.store(0, ORD);
        self.head.store(0, ORD);
        *self.post_lock.lock() = CqPostState { tail: 0, phase: true };
    }

    pub fn set_head_from_doorbell(&self, head: u32) {
        self.head.store(head, ORD);
    }

    pub fn vector(&self) -> u16 {
        self.intr_vector.load(ORD)
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.inten.load(ORD)
    }

    pub fn set_intcoal(&self, enabled: bool) {
        self.intcoal.store(enabled, ORD);
    }

    pub fn intcoal(&self) -> bool {
        self.intcoal.load(ORD)
    }

    /// Write one completion entry into the next CQ slot, toggling the
    /// phase bit on wrap. Returns `true` if an interrupt should be raised.
    pub fn post(
        &self,
        mem: &dyn GuestMemory,
        mut entry: Completion,
    ) -> Result<bool, NvmeError> {
        if !self.is_valid() {
            // The controller was reset while an in-flight I/O was still
            // completing; drop the completion silently (see design notes).
            return Ok(false);
        }

        let mut state = self.post_lock.lock();
        entry.phase = state.phase;

        let gpa = self.qbase.load(ORD) + (state.tail as u64) * CQE_SIZE as u64;
        let ptr = mem.translate(gpa, CQE_SIZE)?;
        let bytes = entry.to_bytes();
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, CQE_SIZE);
        }

        let size = self.size.load(ORD);
        state.tail = (state.tail + 1) % size;
        if state.tail == 0 {
            state.phase = !state.phase;
        }
        drop(state);

        Ok(self.inten.load(ORD))
    }
}

impl Default for CompletionQueue {
    fn default() -> Self {
        Self::new()
    }
}
