//! Controller lifecycle state machine, MMIO dispatch, and the queue-pair
//! doorbell/drain loop that ties the register file to the Admin and I/O
//! executors.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::admin;
use super::backend::BlockStore;
use super::cmd::Command;
use super::config::{BackendSpec, NvmeOptions};
use super::error::NvmeError;
use super::guest::GuestMemory;
use super::identify::{build_controller_data, build_namespace_data};
use super::interrupt::InterruptSink;
use super::io;
use super::ioreq::IoRequestPool;
use super::queue::{CompletionQueue, SubmissionQueue};
use super::reg::{self, shn, shst, Aqa, Cap, Cc, Csts};

pub const PCI_VENDOR_ID: u16 = 0xFB5D;
pub const PCI_DEVICE_ID: u16 = 0x0A0A;
pub const PCI_CLASS_STORAGE: u8 = 0x01;
pub const PCI_SUBCLASS_NVM: u8 = 0x08;
pub const PCI_PROGIF_NVMHCI: u8 = 0x02;

/// What an executor did with a dispatched command.
pub enum Disposition {
    /// Post a completion with this status immediately.
    Completed { cdw0: u32, sct: u8, sc: u8 },
    /// A backend callback will post the completion later.
    Deferred,
    /// Never post a completion for this command (Async Event Request).
    NoCompletion,
}

pub(crate) struct Inner {
    pub cap: Cap,
    pub cc: Cc,
    pub csts: Csts,
    pub aqa: Aqa,
    pub asq: u64,
    pub acq: u64,
    pub num_squeues: u32,
    pub num_cqueues: u32,
}

pub struct NvmeController {
    pub opts: NvmeOptions,
    pub(crate) mem: Arc<dyn GuestMemory>,
    pub(crate) irq: Arc<dyn InterruptSink>,
    pub(crate) inner: Mutex<Inner>,
    pub(crate) squeues: Vec<SubmissionQueue>,
    pub(crate) cqueues: Vec<CompletionQueue>,
    pub(crate) ioreqs: Arc<IoRequestPool>,
    pub(crate) backend: BlockStore,
    pub(crate) ctrl_data: Vec<u8>,
    pub(crate) ns_data: parking_lot::RwLock<Vec<u8>>,
    max_queues: u32,
    doorbell_count: AtomicU32,
    /// Self-reference handed to backend completion closures so they can
    /// call back into the controller after its owner has moved on. Set
    /// once at construction via `Arc::new_cyclic`.
    pub(crate) self_ref: std::sync::Weak<NvmeController>,
}

impl NvmeController {
    pub fn new(
        opts: NvmeOptions,
        mem: Arc<dyn GuestMemory>,
        irq: Arc<dyn InterruptSink>,
        backend: Option<Box<dyn super::backend::BlockBackend>>,
    ) -> Result<Arc<Self>, NvmeError> {
        let max_queues = opts.max_queues;
        let sector_size = opts.sector_size;

        let store = match (&opts.backend, backend) {
            (_, Some(b)) => BlockStore::Backend(b),
            (Some(BackendSpec::Ram { megabytes }), None) => {
                BlockStore::new_ram(*megabytes, sector_size)
            }
            (Some(BackendSpec::Path(p)), None) => {
                return Err(NvmeError::InvalidConfig(format!(
                    "backend path '{p}' requires a BlockBackend supplied by the host"
                )));
            }
            (None, None) => BlockStore::new_ram(64, sector_size),
        };

        let ctrl_data =
            build_controller_data(PCI_VENDOR_ID, PCI_VENDOR_ID, &opts.serial_str(), 1);
        let ns_data = build_namespace_data(store.size_bytes(), store.sector_size());

        let squeues = (0..=max_queues).map(|_| SubmissionQueue::new()).collect();
        let cqueues = (0..=max_queues).map(|_| CompletionQueue::new()).collect();

        Ok(Arc::new_cyclic(|weak| Self {
            ioreqs: Arc::new(IoRequestPool::new(opts.io_slots as usize)),
            inner: Mutex::new(Inner {
                cap: Cap::new(opts.queue_size.min(u16::MAX as u32) as u16, 120),
                cc: Cc::default(),
                csts: Csts::default(),
                aqa: Aqa::default(),
                asq: 0,
                acq: 0,
                num_squeues: max_queues,
                num_cqueues: max_queues,
            }),
            squeues,
            cqueues,
            backend: store,
            ctrl_data,
            ns_data: parking_lot::RwLock::new(ns_data),
            opts,
            mem,
            irq,
            max_queues,
            doorbell_count: AtomicU32::new(0),
            self_ref: weak.clone(),
        }))
    }

    pub fn bar0_size(&self) -> usize {
        reg::offset::DOORBELL_BASE + 8 * (self.max_queues as usize + 1)
    }

    pub fn max_queues(&self) -> u32 {
        self.max_queues
    }

    // ---- MMIO entry points -------------------------------------------------

    pub fn mmio_read(&self, offset: usize, size: u8) -> u64 {
        if size != 4 {
            log::warn!("nvme: unsupported MMIO read size {size} at offset {offset:#x}");
        }
        if offset < reg::offset::DOORBELL_BASE {
            self.read_register(offset) as u64
        } else {
            0
        }
    }

    pub fn mmio_write(&self, offset: usize, size: u8, value: u64) {
        if size != 4 {
            log::warn!("nvme: unsupported MMIO write size {size} at offset {offset:#x}");
            return;
        }
        if offset < reg::offset::DOORBELL_BASE {
            self.write_register(offset, value as u32);
        } else {
            self.write_doorbell(offset, value as u32);
        }
    }

    fn read_register(&self, offset: usize) -> u32 {
        let inner = self.inner.lock();
        match offset {
            reg::offset::CAP_LO => inner.cap.to_raw() as u32,
            reg::offset::CAP_HI => (inner.cap.to_raw() >> 32) as u32,
            reg::offset::VS => reg::VS_1_3,
            reg::offset::CC => inner.cc.to_raw(),
            reg::offset::CSTS => inner.csts.to_raw(),
            reg::offset::AQA => (inner.aqa.asqs as u32) | ((inner.aqa.acqs as u32) << 16),
            reg::offset::ASQ_LO => inner.asq as u32,
            reg::offset::ASQ_HI => (inner.asq >> 32) as u32,
            reg::offset::ACQ_LO => inner.acq as u32,
            reg::offset::ACQ_HI => (inner.acq >> 32) as u32,
            _ => 0,
        }
    }

    fn write_register(&self, offset: usize, value: u32) {
        match offset {
            reg::offset::CC => self.write_cc(value),
            reg::offset::AQA => self.inner.lock().aqa = Aqa::from_raw(value),
            reg::offset::ASQ_LO => {
                let mut inner = self.inner.lock();
                inner.asq = (inner.asq & !0xFFFF_FFFF) | (value & !0xFFF) as u64;
            }
            reg::offset::ASQ_HI => {
                let mut inner = self.inner.lock();
                inner.asq = (inner.asq & 0xFFFF_FFFF) | ((value as u64) << 32);
            }
            reg::offset::ACQ_LO => {
                let mut inner = self.inner.lock();
                inner.acq = (inner.acq & !0xFFFF_FFFF) | (value & !0xFFF) as u64;
            }
            reg::offset::ACQ_HI => {
                let mut inner = self.inner.lock();
                inner.acq = (inner.acq & 0xFFFF_FFFF) | ((value as u64) << 32);
            }
            reg::offset::CAP_LO | reg::offset::CAP_HI | reg::offset::VS | reg::offset::CSTS => {
                log::debug!("nvme: ignoring write to read-only register {offset:#x}");
            }
            reg::offset::INTMS | reg::offset::INTMC | reg::offset::NSSR => {
                log::debug!("nvme: ignoring write to externally-managed register {offset:#x}");
            }
            _ => log::warn!("nvme: write to unknown register offset {offset:#x}"),
        }
    }

    fn write_doorbell(&self, offset: usize, value: u32) {
        let rel = offset - reg::offset::DOORBELL_BASE;
        let idx = (rel / 8) as u32;
        let is_sq = rel % 8 < 4;
        if idx > self.max_queues {
            log::warn!("nvme: doorbell write for out-of-range queue {idx}");
            return;
        }
        self.doorbell_count.fetch_add(1, Ordering::Relaxed);

        if is_sq {
            self.squeues[idx as usize].set_tail_from_doorbell(value);
            self.drain_sq(idx as usize);
        } else {
            self.cqueues[idx as usize].set_head_from_doorbell(value);
        }
    }

    // ---- Controller state machine ------------------------------------------

    fn write_cc(&self, value: u32) {
        let new_cc = Cc::from_raw(value);
        let mut inner = self.inner.lock();
        let was_enabled = inner.cc.en;

        if was_enabled && !new_cc.en {
            self.reset_locked(&mut inner);
            inner.cc = Cc {
                en: false,
                css: new_cc.css,
                mps: new_cc.mps,
                ams: new_cc.ams,
                shn: new_cc.shn,
                iosqes: new_cc.iosqes,
                iocqes: new_cc.iocqes,
            };
        } else if !was_enabled && new_cc.en {
            inner.cc = new_cc;
            self.enable_locked(&mut inner);
        } else {
            inner.cc = new_cc;
            if new_cc.shn != shn::NONE {
                inner.csts.shst = shst::COMPLETE;
            }
        }
    }

    fn reset_locked(&self, inner: &mut Inner) {
        for sq in &self.squeues {
            sq.teardown();
        }
        for cq in &self.cqueues {
            cq.teardown();
        }
        inner.csts = Csts::default();
        inner.num_squeues = self.max_queues;
        inner.num_cqueues = self.max_queues;
    }

    fn enable_locked(&self, inner: &mut Inner) {
        self.squeues[0].configure(inner.asq, inner.aqa.asq_entries(), 0, 0);
        self.cqueues[0].configure(inner.acq, inner.aqa.acq_entries(), 0, true);
        inner.csts.rdy = self.ioreqs.pending() == 0;
    }

    /// Called after an I/O completes and its request descriptor is
    /// released: if enablement was waiting on outstanding I/O to drain,
    /// finish it now. This and `enable_locked` are the two sides of the
    /// pending-I/O interlock described in the design notes.
    pub(crate) fn maybe_finish_enable(&self) {
        let mut inner = self.inner.lock();
        if inner.cc.en && !inner.csts.rdy && self.ioreqs.pending() == 0 {
            inner.csts.rdy = true;
        }
    }

    // ---- Queue pair engine --------------------------------------------------

    fn drain_sq(&self, idx: usize) {
        let sq = &self.squeues[idx];
        if !sq.try_acquire_busy() {
            return;
        }

        let mut head = sq.head();
        let tail = sq.current_tail();
        let size = sq.size();
        if size == 0 {
            sq.release_busy();
            return;
        }

        let mut h = head;
        while h != tail {
            match sq.read_command(self.mem.as_ref(), h) {
                Ok(cmd) => self.dispatch(idx as u16, sq.cqid(), &cmd),
                Err(e) => log::warn!("nvme: failed to read command from sq{idx}: {e}"),
            }
            h = (h + 1) % size;
        }
        head = h;
        sq.store_head(head);
        sq.release_busy();
    }

    fn dispatch(&self, sqid: u16, cqid: u16, cmd: &Command) {
        let disposition =
            if sqid == 0 { admin::execute(self, cmd) } else { io::execute(self, sqid, cmd) };

        match disposition {
            Disposition::Completed { cdw0, sct, sc } => {
                self.post_completion(sqid, cqid, cmd.cid, cdw0, sct, sc);
            }
            Disposition::Deferred => {}
            Disposition::NoCompletion => {}
        }
    }

    pub(crate) fn post_completion(
        &self,
        sqid: u16,
        cqid: u16,
        cid: u16,
        cdw0: u32,
        sct: u8,
        sc: u8,
    ) {
        let cq = &self.cqueues[cqid as usize];
        let sqhd = self.squeues[sqid as usize].head() as u16;
        let entry = super::cmd::Completion { cdw0, sqhd, sqid, cid, sct, sc, phase: false };
        match cq.post(self.mem.as_ref(), entry) {
            Ok(true) if cq.interrupts_enabled() => self.irq.signal(cq.vector()),
            Ok(_) => {}
            Err(e) => log::warn!("nvme: failed to post completion on cq{cqid}: {e}"),
        }
    }

    pub fn identify_controller_bytes(&self) -> &[u8] {
        &self.ctrl_data
    }

    pub fn identify_namespace_bytes(&self) -> Vec<u8> {
        self.ns_data.read().clone()
    }
}
