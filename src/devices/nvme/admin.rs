//! Admin Submission Queue opcode dispatch.

use super::cmd::{admin_opc, feature, Command};
use super::controller::{Disposition, NvmeController};
use super::error::{sc_generic, sc_specific, sct, NvmeError};
use super::identify::IDENTIFY_PAGE_SIZE;
use super::queue::{CompletionQueue, SubmissionQueue};

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

pub fn execute(ctrl: &NvmeController, cmd: &Command) -> Disposition {
    match cmd.opc {
        admin_opc::IDENTIFY => identify(ctrl, cmd),
        admin_opc::CREATE_IO_SQ => create_io_sq(ctrl, cmd),
        admin_opc::DELETE_IO_SQ => delete_io_sq(ctrl, cmd),
        admin_opc::CREATE_IO_CQ => create_io_cq(ctrl, cmd),
        admin_opc::DELETE_IO_CQ => delete_io_cq(ctrl, cmd),
        admin_opc::GET_LOG_PAGE => get_log_page(ctrl, cmd),
        admin_opc::SET_FEATURES => set_features(ctrl, cmd),
        admin_opc::GET_FEATURES => get_features(ctrl, cmd),
        admin_opc::ABORT => completed(sct::GENERIC, sc_generic::SUCCESS),
        admin_opc::ASYNC_EVENT_REQUEST => Disposition::NoCompletion,
        other => {
            log::debug!("nvme: unrecognized admin opcode {other:#x}, returning spurious success");
            ok()
        }
    }
}

fn write_prp_payload(ctrl: &NvmeController, cmd: &Command, data: &[u8]) -> Result<(), NvmeError> {
    let result = super::prp::walk(ctrl.mem.as_ref(), cmd.prp1, cmd.prp2, data.len())?;
    let mut off = 0usize;
    for seg in &result.iov {
        let n = seg.len.min(data.len() - off);
        unsafe {
            std::ptr::copy_nonoverlapping(data[off..off + n].as_ptr(), seg.ptr, n);
        }
        off += n;
    }
    Ok(())
}

/// Build the CNS 0x02 Active Namespace ID list: a page of little-endian u32
/// NSIDs terminated by a zero entry. This controller exposes exactly one
/// namespace, NSID 1.
fn active_namespace_list() -> Vec<u8> {
    let mut buf = vec![0u8; IDENTIFY_PAGE_SIZE];
    buf[0..4].copy_from_slice(&1u32.to_le_bytes());
    buf
}

fn identify(ctrl: &NvmeController, cmd: &Command) -> Disposition {
    let cns = cmd.cdw10 & 0xFF;
    let payload: Vec<u8> = match cns {
        0x00 => {
            if cmd.nsid != 1 {
                return err_status(&NvmeError::InvalidNamespaceOrFormat);
            }
            ctrl.identify_namespace_bytes()
        }
        0x01 => ctrl.identify_controller_bytes().to_vec(),
        0x02 => active_namespace_list(),
        0x11 => {
            // Namespace Identification Descriptor List: this controller has
            // no secondary namespace identifiers (EUI64/NGUID/UUID) to
            // report for its single namespace.
            return err_status(&NvmeError::InvalidNamespaceOrFormat);
        }
        _ => {
            return completed(sct::GENERIC, sc_generic::INVALID_FIELD);
        }
    };
    debug_assert_eq!(payload.len(), IDENTIFY_PAGE_SIZE);
    match write_prp_payload(ctrl, cmd, &payload) {
        Ok(()) => ok(),
        Err(e) => err_status(&e),
    }
}

fn create_io_cq(ctrl: &NvmeController, cmd: &Command) -> Disposition {
    let qid = (cmd.cdw10 & 0xFFFF) as u16;
    let qsize = ((cmd.cdw10 >> 16) & 0xFFFF) as u32 + 1;
    let pc = cmd.cdw11 & 1 != 0;
    let vector = ((cmd.cdw11 >> 16) & 0xFFFF) as u16;

    let num_cqueues = ctrl.inner.lock().num_cqueues;
    if qid == 0 || qid as u32 > num_cqueues {
        return completed(sct::COMMAND_SPECIFIC, sc_specific::INVALID_QUEUE_IDENTIFIER);
    }
    if !pc {
        return err_status(&NvmeError::NonContiguousCompletionQueue);
    }
    let cq: &CompletionQueue = &ctrl.cqueues[qid as usize];
    if cq.is_valid() {
        return completed(sct::COMMAND_SPECIFIC, sc_specific::INVALID_QUEUE_IDENTIFIER);
    }
    cq.configure(cmd.prp1, qsize, vector, cmd.cdw11 & 2 != 0);
    ok()
}

fn delete_io_cq(ctrl: &NvmeController, cmd: &Command) -> Disposition {
    let qid = (cmd.cdw10 & 0xFFFF) as u16;
    let num_cqueues = ctrl.inner.lock().num_cqueues;
    if qid == 0 || qid as u32 > num_cqueues || !ctrl.cqueues[qid as usize].is_valid() {
        return completed(sct::COMMAND_SPECIFIC, sc_specific::INVALID_QUEUE_IDENTIFIER);
    }
    for sq in &ctrl.squeues {
        if sq.is_valid() && sq.cqid() == qid {
            return completed(sct::COMMAND_SPECIFIC, sc_specific::INVALID_QUEUE_IDENTIFIER);
        }
    }
    ctrl.cqueues[qid as usize].teardown();
    ok()
}

fn create_io_sq(ctrl: &NvmeController, cmd: &Command) -> Disposition {
    let qid = (cmd.cdw10 & 0xFFFF) as u16;
    let qsize = ((cmd.cdw10 >> 16) & 0xFFFF) as u32 + 1;
    let pc = cmd.cdw11 & 1 != 0;
    let qprio = ((cmd.cdw11 >> 1) & 0x3) as u8;
    let cqid = ((cmd.cdw11 >> 16) & 0xFFFF) as u16;

    let (num_squeues, num_cqueues) = {
        let inner = ctrl.inner.lock();
        (inner.num_squeues, inner.num_cqueues)
    };
    if qid == 0 || qid as u32 > num_squeues {
        return completed(sct::COMMAND_SPECIFIC, sc_specific::INVALID_QUEUE_IDENTIFIER);
    }
    if !pc {
        return err_status(&NvmeError::NonContiguousQueue);
    }
    let sq: &SubmissionQueue = &ctrl.squeues[qid as usize];
    if sq.is_valid() || cqid as u32 > num_cqueues || !ctrl.cqueues[cqid as usize].is_valid() {
        return completed(sct::COMMAND_SPECIFIC, sc_specific::INVALID_QUEUE_IDENTIFIER);
    }
    sq.configure(cmd.prp1, qsize, cqid, qprio);
    ok()
}

fn delete_io_sq(ctrl: &NvmeController, cmd: &Command) -> Disposition {
    let qid = (cmd.cdw10 & 0xFFFF) as u16;
    let num_squeues = ctrl.inner.lock().num_squeues;
    if qid == 0 || qid as u32 > num_squeues || !ctrl.squeues[qid as usize].is_valid() {
        return completed(sct::COMMAND_SPECIFIC, sc_specific::INVALID_QUEUE_IDENTIFIER);
    }
    ctrl.squeues[qid as usize].teardown();
    ok()
}

/// Per-page-ID log buffer size served by Get Log Page. Real controllers
/// size these per-structure (the SMART/Health log is 512 bytes, Error
/// Information entries are 64 bytes each, ...); this emulator never
/// populates real telemetry, so every supported page is served as a single
/// zeroed 512-byte buffer.
const LOG_PAGE_SIZE: usize = 512;

fn get_log_page(ctrl: &NvmeController, cmd: &Command) -> Disposition {
    match cmd.cdw10 & 0xFF {
        0x01 | 0x02 | 0x03 => {
            let page = vec![0u8; LOG_PAGE_SIZE];
            match write_prp_payload(ctrl, cmd, &page) {
                Ok(()) => ok(),
                Err(e) => err_status(&e),
            }
        }
        _ => completed(sct::COMMAND_SPECIFIC, sc_specific::INVALID_LOG_PAGE),
    }
}

fn set_features(ctrl: &NvmeController, cmd: &Command) -> Disposition {
    match cmd.cdw10 & 0xFF {
        feature::NUMBER_OF_QUEUES => {
            let nsq = ((cmd.cdw11 & 0xFFFF) + 1).min(ctrl.max_queues());
            let ncq = (((cmd.cdw11 >> 16) & 0xFFFF) + 1).min(ctrl.max_queues());
            let mut inner = ctrl.inner.lock();
            inner.num_squeues = nsq;
            inner.num_cqueues = ncq;
            drop(inner);
            Disposition::Completed {
                cdw0: (nsq - 1) | ((ncq - 1) << 16),
                sct: sct::GENERIC,
                sc: sc_generic::SUCCESS,
            }
        }
        feature::ARBITRATION => ok(),
        // THR (cdw11[7:0]) / TIME (cdw11[15:8]): this controller has no
        // coalescing timer to program, just an enable flag toggled through
        // Interrupt Vector Configuration below, so accept and ignore.
        feature::INTERRUPT_COALESCING => ok(),
        feature::INTERRUPT_VECTOR_CONFIG => {
            let iv = (cmd.cdw11 & 0xFFFF) as u16;
            let cd = cmd.cdw11 & (1 << 16) != 0;
            for cq in &ctrl.cqueues {
                if cq.is_valid() && cq.vector() == iv {
                    cq.set_intcoal(cd);
                }
            }
            ok()
        }
        feature::TEMPERATURE_THRESHOLD => ok(),
        _ => completed(sct::GENERIC, sc_generic::INVALID_FIELD),
    }
}

fn get_features(ctrl: &NvmeController, cmd: &Command) -> Disposition {
    match cmd.cdw10 & 0xFF {
        feature::NUMBER_OF_QUEUES => {
            let inner = ctrl.inner.lock();
            let cdw0 = (inner.num_squeues - 1) | ((inner.num_cqueues - 1) << 16);
            Disposition::Completed { cdw0, sct: sct::GENERIC, sc: sc_generic::SUCCESS }
        }
        feature::ARBITRATION => completed(sct::GENERIC, sc_generic::SUCCESS),
        feature::INTERRUPT_COALESCING => ok(),
        feature::INTERRUPT_VECTOR_CONFIG => ok(),
        // THSEL (cdw11[21:20]): 0 selects the over-temperature threshold
        // (reported as 0xFFFF, meaning "no threshold"), 1 selects the
        // under-temperature threshold (reported as 0, "no threshold").
        feature::TEMPERATURE_THRESHOLD => match (cmd.cdw11 >> 20) & 0x3 {
            0 => Disposition::Completed { cdw0: 0xFFFF, sct: sct::GENERIC, sc: sc_generic::SUCCESS },
            1 => Disposition::Completed { cdw0: 0, sct: sct::GENERIC, sc: sc_generic::SUCCESS },
            _ => completed(sct::GENERIC, sc_generic::INVALID_FIELD),
        },
        _ => completed(sct::GENERIC, sc_generic::INVALID_FIELD),
    }
}
