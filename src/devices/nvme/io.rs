//! I/O Submission Queue opcode dispatch: Flush, Write Zeroes, Read, Write.
//!
//! RAM-backed stores complete synchronously inline; a real `BlockBackend`
//! completes asynchronously through a callback that posts the completion
//! and re-checks the enable interlock. The callback holds the pooled
//! request descriptor and a `Weak<NvmeController>` (upgraded from the
//! controller's own self-reference) so it can outlive the call that
//! submitted it.

use std::sync::Arc;

use super::backend::BlockStore;
use super::cmd::{io_opc, Command};
use super::controller::{Disposition, NvmeController};
use super::error::{sc_generic, sct, NvmeError};
use super::prp;

fn completed(sct: u8, sc: u8) -> Disposition {
    Disposition::Completed { cdw0: 0, sct, sc }
}

fn ok() -> Disposition {
    completed(sct::GENERIC, sc_generic::SUCCESS)
}

fn err_status(e: &NvmeError) -> Disposition {
    let (sct, sc) = e.status_code();
    completed(sct, sc)
}

pub fn execute(ctrl: &NvmeController, sqid: u16, cmd: &Command) -> Disposition {
    if cmd.nsid != 1 {
        return err_status(&NvmeError::InvalidNamespaceOrFormat);
    }
    match cmd.opc {
        io_opc::FLUSH => flush(ctrl),
        io_opc::WRITE_ZEROES => write_zeroes(cmd),
        io_opc::READ => read_or_write(ctrl, sqid, cmd, Direction::Read),
        io_opc::WRITE => read_or_write(ctrl, sqid, cmd, Direction::Write),
        other => {
            log::debug!("nvme: unrecognized i/o opcode {other:#x}");
            completed(sct::GENERIC, sc_generic::INVALID_OPCODE)
        }
    }
}

fn flush(ctrl: &NvmeController) -> Disposition {
    match &ctrl.backend {
        BlockStore::Ram { .. } => ok(),
        BlockStore::Backend(backend) => {
            backend.flush(Box::new(|_| {}));
            ok()
        }
    }
}

fn byte_range(backend: &BlockStore, cmd: &Command) -> Result<(u64, usize), NvmeError> {
    let sector = backend.sector_size() as u64;
    let nblocks = cmd.nblocks() as u64;
    let byte_offset = cmd
        .lba()
        .checked_mul(sector)
        .ok_or(NvmeError::LbaOutOfRange { lba: cmd.lba(), nblocks: cmd.nblocks(), limit: 0 })?;
    let len = nblocks * sector;
    let limit = backend.size_bytes();
    if byte_offset.checked_add(len).map_or(true, |end| end > limit) {
        return Err(NvmeError::LbaOutOfRange {
            lba: cmd.lba(),
            nblocks: cmd.nblocks(),
            limit: limit / sector.max(1),
        });
    }
    Ok((byte_offset, len as usize))
}

/// Write Zeroes is a logged no-op: it always succeeds without a bounds
/// check or any actual write, since this emulator has no physical medium to
/// zero and no guest driver depends on the bytes actually landing.
fn write_zeroes(cmd: &Command) -> Disposition {
    log::debug!(
        "nvme: write zeroes lba={} nblocks={} (logged no-op)",
        cmd.lba(),
        cmd.nblocks()
    );
    ok()
}

#[derive(Clone, Copy)]
enum Direction {
    Read,
    Write,
}

fn read_or_write(ctrl: &NvmeController, sqid: u16, cmd: &Command, dir: Direction) -> Disposition {
    let (offset, len) = match byte_range(&ctrl.backend, cmd) {
        Ok(v) => v,
        Err(e) => return err_status(&e),
    };

    if let BlockStore::Ram { .. } = &ctrl.backend {
        let result = prp::walk(ctrl.mem.as_ref(), cmd.prp1, cmd.prp2, len);
        let segs = match result {
            Ok(r) => r,
            Err(e) => return err_status(&e),
        };
        let outcome = match dir {
            Direction::Read => ram_read_into(&ctrl.backend, offset, &segs.iov),
            Direction::Write => ram_write_from(&ctrl.backend, offset, &segs.iov),
        };
        return match outcome {
            Ok(()) => ok(),
            Err(e) => err_status(&e),
        };
    }

    // Async backend path: acquire a pooled descriptor and walk the PRP list
    // into batches of at most NVME_MAX_BLOCKIOVS segments. A transfer that
    // fits in one batch (the common case) goes straight to the deferred
    // completion below. A larger transfer is drained one batch at a time:
    // each intermediate batch is submitted to the backend and the command-
    // processing thread blocks on the descriptor's drain gate until that
    // batch's callback signals, then the iovec is reset and the walk
    // resumes where it left off. Only the final batch is left outstanding
    // when this function returns, so its callback is what posts the
    // command's completion.
    let mut pooled = ctrl.ioreqs.acquire(sqid, cmd.cid);
    let mut walker = prp::PrpWalk::new(cmd.prp1, cmd.prp2, len);
    let mut batch_offset = offset;

    loop {
        let batch = match walker.next_batch(ctrl.mem.as_ref()) {
            Ok(b) => b,
            Err(e) => return err_status(&e),
        };
        pooled.iov = batch.iov;

        if !walker.is_done() {
            if let Err(e) = drain_batch(ctrl, dir, batch_offset, &pooled.iov, &pooled.drain_gate) {
                return err_status(&e);
            }
            batch_offset += batch.bytes as u64;
            continue;
        }

        let cid = cmd.cid;
        let ctrl_sq = sqid;
        let backend_offset = batch_offset;
        let iov_for_call = pooled.iov.clone();
        let ctrl_handle = ctrl.self_ref.clone();

        let on_complete: Box<dyn FnOnce(Result<(), NvmeError>) + Send> = Box::new(move |res| {
            let (sct, sc) = match &res {
                Ok(()) => (sct::GENERIC, sc_generic::SUCCESS),
                Err(e) => e.status_code(),
            };
            if let Some(ctrl) = ctrl_handle.upgrade() {
                let cqid = ctrl.squeues[ctrl_sq as usize].cqid();
                ctrl.post_completion(ctrl_sq, cqid, cid, 0, sct, sc);
                drop(pooled);
                ctrl.maybe_finish_enable();
            } else {
                drop(pooled);
            }
        });

        match dir {
            Direction::Read => {
                if let BlockStore::Backend(b) = &ctrl.backend {
                    b.read(backend_offset, &iov_for_call, on_complete);
                }
            }
            Direction::Write => {
                if let BlockStore::Backend(b) = &ctrl.backend {
                    b.write(backend_offset, &iov_for_call, on_complete);
                }
            }
        }

        return Disposition::Deferred;
    }
}

/// Submit one non-final batch of a drained transfer to the backend and
/// block until its completion callback signals the descriptor's drain gate.
fn drain_batch(
    ctrl: &NvmeController,
    dir: Direction,
    offset: u64,
    iov: &[super::guest::GuestSlice],
    gate: &Arc<super::ioreq::DrainGate>,
) -> Result<(), NvmeError> {
    let signal_gate = gate.clone();
    let on_complete: Box<dyn FnOnce(Result<(), NvmeError>) + Send> =
        Box::new(move |res| signal_gate.signal(res));

    match dir {
        Direction::Read => {
            if let BlockStore::Backend(b) = &ctrl.backend {
                b.read(offset, iov, on_complete);
            }
        }
        Direction::Write => {
            if let BlockStore::Backend(b) = &ctrl.backend {
                b.write(offset, iov, on_complete);
            }
        }
    }

    gate.wait()
}

fn ram_read_into(
    backend: &BlockStore,
    offset: u64,
    iov: &[super::guest::GuestSlice],
) -> Result<(), NvmeError> {
    let mut off = offset;
    for seg in iov {
        let dst = unsafe { std::slice::from_raw_parts_mut(seg.ptr, seg.len) };
        backend.ram_read(off, dst)?;
        off += seg.len as u64;
    }
    Ok(())
}

fn ram_write_from(
    backend: &BlockStore,
    offset: u64,
    iov: &[super::guest::GuestSlice],
) -> Result<(), NvmeError> {
    let mut off = offset;
    for seg in iov {
        let slice = unsafe { std::slice::from_raw_parts(seg.ptr, seg.len) };
        backend.ram_write(off, slice)?;
        off += seg.len as u64;
    }
    Ok(())
}
