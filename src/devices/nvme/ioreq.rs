//! Fixed-size pool of I/O request descriptors, gated by a counting
//! semaphore, plus the interlock between outstanding I/O and controller
//! enablement (`CSTS.RDY` only goes high once `pending_ios == 0`).

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::error::NvmeError;
use super::guest::GuestSlice;

#[derive(Default)]
struct DrainState {
    done: bool,
    result: Option<Result<(), NvmeError>>,
}

/// Mutex+condvar pair a backend completion callback uses to hand control
/// back to the command-processing thread during a partial-I/O drain: the
/// thread blocks in `wait()` after submitting an intermediate batch, the
/// callback calls `signal()` once that batch lands, and the thread resumes
/// walking the PRP list for the next batch. Held behind an `Arc` (rather
/// than directly on `IoRequest`) so the 'static closure handed to the
/// backend can carry its own handle without borrowing the descriptor.
pub struct DrainGate {
    state: Mutex<DrainState>,
    drain_done: Condvar,
}

impl DrainGate {
    fn new() -> Self {
        Self { state: Mutex::new(DrainState::default()), drain_done: Condvar::new() }
    }

    /// Block until `signal` is called, then return its result.
    pub fn wait(&self) -> Result<(), NvmeError> {
        let mut state = self.state.lock();
        while !state.done {
            self.drain_done.wait(&mut state);
        }
        state.done = false;
        state.result.take().expect("drain gate signalled without a result")
    }

    pub fn signal(&self, result: Result<(), NvmeError>) {
        let mut state = self.state.lock();
        state.result = Some(result);
        state.done = true;
        self.drain_done.notify_one();
    }
}

/// Descriptor handed to the I/O executor for one in-flight command. Reused
/// across commands via the pool's free list.
pub struct IoRequest {
    pub sqid: u16,
    pub cid: u16,
    pub iov: Vec<GuestSlice>,
    /// Used by the async I/O path to drain and resume a transfer whose PRP
    /// list expands past `NVME_MAX_BLOCKIOVS` segments.
    pub drain_gate: Arc<DrainGate>,
}

impl IoRequest {
    fn new() -> Self {
        Self { sqid: 0, cid: 0, iov: Vec::new(), drain_gate: Arc::new(DrainGate::new()) }
    }

    fn reset(&mut self, sqid: u16, cid: u16) {
        self.sqid = sqid;
        self.cid = cid;
        self.iov.clear();
    }
}

struct Pool {
    free: Vec<Box<IoRequest>>,
    pending: usize,
    capacity: usize,
}

/// Counting-semaphore-gated pool of `IoRequest` descriptors.
pub struct IoRequestPool {
    state: Mutex<Pool>,
    available: Condvar,
}

impl IoRequestPool {
    pub fn new(capacity: usize) -> Self {
        let free = (0..capacity).map(|_| Box::new(IoRequest::new())).collect();
        Self { state: Mutex::new(Pool { free, pending: 0, capacity }), available: Condvar::new() }
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    pub fn pending(&self) -> usize {
        self.state.lock().pending
    }

    /// Acquire a descriptor, blocking until one is free. Takes `self` as an
    /// `Arc` so the returned handle can outlive the caller's stack frame —
    /// it is moved into the backend completion closure on the async path.
    pub fn acquire(self: &Arc<Self>, sqid: u16, cid: u16) -> PooledRequest {
        let mut state = self.state.lock();
        while state.free.is_empty() {
            self.available.wait(&mut state);
        }
        let mut req = state.free.pop().unwrap();
        req.reset(sqid, cid);
        state.pending += 1;
        drop(state);
        PooledRequest { pool: self.clone(), req: Some(req) }
    }

    fn release(&self, req: Box<IoRequest>) {
        let mut state = self.state.lock();
        state.free.push(req);
        state.pending -= 1;
        self.available.notify_one();
    }
}

/// RAII handle returned by `acquire`; returns the descriptor to the pool on
/// drop and decrements `pending_ios`.
pub struct PooledRequest {
    pool: Arc<IoRequestPool>,
    req: Option<Box<IoRequest>>,
}

impl std::ops::Deref for PooledRequest {
    type Target = IoRequest;
    fn deref(&self) -> &IoRequest {
        self.req.as_ref().unwrap()
    }
}

impl std::ops::DerefMut for PooledRequest {
    fn deref_mut(&mut self) -> &mut IoRequest {
        self.req.as_mut().unwrap()
    }
}

impl Drop for PooledRequest {
    fn drop(&mut self) {
        if let Some(req) = self.req.take() {
            self.pool.release(req);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release_tracks_pending_count() {
        let pool = Arc::new(IoRequestPool::new(2));
        assert_eq!(pool.pending(), 0);
        {
            let _a = pool.acquire(1, 1);
            assert_eq!(pool.pending(), 1);
            let _b = pool.acquire(1, 2);
            assert_eq!(pool.pending(), 2);
        }
        assert_eq!(pool.pending(), 0);
    }

    #[test]
    fn released_descriptor_is_reused() {
        let pool = Arc::new(IoRequestPool::new(1));
        {
            let mut req = pool.acquire(5, 9);
            req.iov.push(GuestSlice { ptr: std::ptr::null_mut(), len: 4 });
        }
        let req = pool.acquire(1, 1);
        assert!(req.iov.is_empty());
    }
}
