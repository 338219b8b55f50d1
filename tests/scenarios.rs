//! End-to-end scenarios exercising the controller through its MMIO surface
//! only, the way a guest driver would: program the admin queue, ring
//! doorbells, read completions back out of guest memory.

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use nvme_emu::devices::nvme::backend::{BlockBackend, MemBlockBackend};
use nvme_emu::devices::nvme::cmd::{admin_opc, io_opc, Completion, CQE_SIZE, SQE_SIZE};
use nvme_emu::devices::nvme::config::NvmeOptions;
use nvme_emu::devices::nvme::error::NvmeError;
use nvme_emu::devices::nvme::guest::{GuestSlice, TestGuestMemory};
use nvme_emu::devices::nvme::interrupt::RecordingInterruptSink;
use nvme_emu::devices::nvme::reg;
use nvme_emu::devices::nvme::NvmeController;
use nvme_emu::memory::PAGE_SIZE;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

const ASQ_BASE: u64 = PAGE_SIZE as u64 * 1;
const ACQ_BASE: u64 = PAGE_SIZE as u64 * 2;
const DATA_BASE: u64 = PAGE_SIZE as u64 * 16;

fn make_controller(
    ram_pages: usize,
) -> (Arc<NvmeController>, Arc<TestGuestMemory>, Arc<RecordingInterruptSink>) {
    init_logging();
    let opts = NvmeOptions::parse("maxq=4,qsz=64,ioslots=4").unwrap();
    let mem = Arc::new(TestGuestMemory::new(PAGE_SIZE * ram_pages));
    let irq = Arc::new(RecordingInterruptSink::new());
    let backend = Box::new(MemBlockBackend::new(4 * 1024 * 1024, 512));
    let ctrl = NvmeController::new(opts, mem.clone(), irq.clone(), Some(backend)).unwrap();
    (ctrl, mem, irq)
}

fn enable(ctrl: &NvmeController, asqs: u32, acqs: u32) {
    let aqa = (asqs - 1) | ((acqs - 1) << 16);
    ctrl.mmio_write(reg::offset::AQA, 4, aqa as u64);
    ctrl.mmio_write(reg::offset::ASQ_LO, 4, ASQ_BASE);
    ctrl.mmio_write(reg::offset::ASQ_HI, 4, 0);
    ctrl.mmio_write(reg::offset::ACQ_LO, 4, ACQ_BASE);
    ctrl.mmio_write(reg::offset::ACQ_HI, 4, 0);
    ctrl.mmio_write(reg::offset::CC, 4, 0x1); // EN=1, default CSS/MPS/AMS/SHN
    assert_eq!(ctrl.mmio_read(reg::offset::CSTS, 4) & 1, 1, "controller did not become ready");
}

fn write_admin_sqe(
    mem: &TestGuestMemory,
    slot: u32,
    opc: u8,
    cid: u16,
    nsid: u32,
    prp1: u64,
    cdw10: u32,
    cdw11: u32,
) {
    let mut raw = [0u8; SQE_SIZE];
    raw[0] = opc;
    raw[2..4].copy_from_slice(&cid.to_le_bytes());
    raw[4..8].copy_from_slice(&nsid.to_le_bytes());
    raw[24..32].copy_from_slice(&prp1.to_le_bytes());
    raw[40..44].copy_from_slice(&cdw10.to_le_bytes());
    raw[44..48].copy_from_slice(&cdw11.to_le_bytes());
    mem.write_at(ASQ_BASE + slot as u64 * SQE_SIZE as u64, &raw);
}

fn write_io_sqe(mem: &TestGuestMemory, sq_base: u64, slot: u32, opc: u8, cid: u16, lba: u64, nblocks_minus1: u16, prp1: u64) {
    let mut raw = [0u8; SQE_SIZE];
    raw[0] = opc;
    raw[2..4].copy_from_slice(&cid.to_le_bytes());
    raw[4..8].copy_from_slice(&1u32.to_le_bytes()); // nsid = 1
    raw[24..32].copy_from_slice(&prp1.to_le_bytes());
    raw[40..44].copy_from_slice(&(lba as u32).to_le_bytes());
    raw[44..48].copy_from_slice(&((lba >> 32) as u32).to_le_bytes());
    raw[48..52].copy_from_slice(&(nblocks_minus1 as u32).to_le_bytes());
    mem.write_at(sq_base + slot as u64 * SQE_SIZE as u64, &raw);
}

fn read_cqe(mem: &TestGuestMemory, cq_base: u64, slot: u32) -> (u16, u16, bool) {
    let raw = mem.read_at(cq_base + slot as u64 * CQE_SIZE as u64, CQE_SIZE);
    let status = u16::from_le_bytes(raw[14..16].try_into().unwrap());
    let cid = u16::from_le_bytes(raw[12..14].try_into().unwrap());
    (cid, (status >> 1) as u16 & 0xFF, status & 1 != 0)
}

#[test]
fn enable_and_identify_controller() {
    let (ctrl, mem, _irq) = make_controller(64);
    enable(&ctrl, 16, 16);

    write_admin_sqe(&mem, 0, admin_opc::IDENTIFY, 1, 1, DATA_BASE, 0x01, 0);
    ctrl.mmio_write(reg::offset::DOORBELL_BASE, 4, 1); // ASQ tail

    let (cid, sc, _phase) = read_cqe(&mem, ACQ_BASE, 0);
    assert_eq!(cid, 1);
    assert_eq!(sc, 0, "identify should succeed");

    let payload = mem.read_at(DATA_BASE, 24);
    let vid = u16::from_le_bytes(payload[0..2].try_into().unwrap());
    assert_eq!(vid, nvme_emu::devices::nvme::controller::PCI_VENDOR_ID);
}

#[test]
fn create_io_queues_then_single_block_read() {
    let (ctrl, mem, irq) = make_controller(64);
    enable(&ctrl, 16, 16);

    let io_cq_base = PAGE_SIZE as u64 * 3;
    let io_sq_base = PAGE_SIZE as u64 * 4;

    // Create I/O CQ 1, vector 0, interrupts enabled.
    write_admin_sqe(&mem, 0, admin_opc::CREATE_IO_CQ, 10, 0, io_cq_base, (63 << 16) | 1, 0x2 | 0x1);
    ctrl.mmio_write(reg::offset::DOORBELL_BASE, 4, 1);
    let (_, sc, _) = read_cqe(&mem, ACQ_BASE, 0);
    assert_eq!(sc, 0);

    // Create I/O SQ 1, bound to CQ 1.
    write_admin_sqe(&mem, 1, admin_opc::CREATE_IO_SQ, 11, 0, io_sq_base, (63 << 16) | 1, (1 << 16) | 1);
    ctrl.mmio_write(reg::offset::DOORBELL_BASE, 4, 2);
    let (_, sc, _) = read_cqe(&mem, ACQ_BASE, 1);
    assert_eq!(sc, 0);

    // Seed the backing store via a write, then read it back.
    let write_data_gpa = DATA_BASE;
    let read_data_gpa = DATA_BASE + PAGE_SIZE as u64;
    mem.write_at(write_data_gpa, &[0xCDu8; 512]);

    write_io_sqe(&mem, io_sq_base, 0, io_opc::WRITE, 100, 0, 0, write_data_gpa);
    let sq_doorbell = reg::offset::DOORBELL_BASE + 8; // queue 1, SQ half
    ctrl.mmio_write(sq_doorbell, 4, 1);

    write_io_sqe(&mem, io_sq_base, 1, io_opc::READ, 101, 0, 0, read_data_gpa);
    ctrl.mmio_write(sq_doorbell, 4, 2);

    let (cid0, sc0, _) = read_cqe(&mem, io_cq_base, 0);
    let (cid1, sc1, _) = read_cqe(&mem, io_cq_base, 1);
    assert_eq!((cid0, sc0), (100, 0));
    assert_eq!((cid1, sc1), (101, 0));
    assert_eq!(mem.read_at(read_data_gpa, 512), vec![0xCDu8; 512]);
    assert!(!irq.fired().is_empty(), "completions on an interrupt-enabled CQ should signal a vector");
}

#[test]
fn delete_nonexistent_queue_is_rejected() {
    let (ctrl, mem, _irq) = make_controller(64);
    enable(&ctrl, 16, 16);

    write_admin_sqe(&mem, 0, admin_opc::DELETE_IO_SQ, 5, 0, 0, 7, 0);
    ctrl.mmio_write(reg::offset::DOORBELL_BASE, 4, 1);
    let (_, sc, _) = read_cqe(&mem, ACQ_BASE, 0);
    assert_ne!(sc, 0, "deleting a queue that was never created must fail");
}

#[test]
fn disable_tears_down_queues_and_requires_full_reinit() {
    let (ctrl, mem, _irq) = make_controller(64);
    enable(&ctrl, 16, 16);

    let io_cq_base = PAGE_SIZE as u64 * 3;
    write_admin_sqe(&mem, 0, admin_opc::CREATE_IO_CQ, 20, 0, io_cq_base, (15 << 16) | 1, 0x1);
    ctrl.mmio_write(reg::offset::DOORBELL_BASE, 4, 1);
    let (_, sc, _) = read_cqe(&mem, ACQ_BASE, 0);
    assert_eq!(sc, 0);

    ctrl.mmio_write(reg::offset::CC, 4, 0x0); // EN=0
    assert_eq!(ctrl.mmio_read(reg::offset::CSTS, 4) & 1, 0);

    // Per spec, disabling resets both admin and I/O queues; the host must
    // fully reprogram AQA/ASQ/ACQ before re-enabling, same as first boot.
    enable(&ctrl, 16, 16);
    write_admin_sqe(&mem, 0, admin_opc::DELETE_IO_CQ, 21, 0, 0, 1, 0);
    ctrl.mmio_write(reg::offset::DOORBELL_BASE, 4, 1);
    let (_, sc, _) = read_cqe(&mem, ACQ_BASE, 0);
    assert_ne!(sc, 0, "I/O CQ from before the reset should be gone");
}

#[test]
fn completion_phase_bit_toggles_across_a_full_wrap() {
    let (ctrl, mem, _irq) = make_controller(64);
    enable(&ctrl, 4, 4); // 4-entry admin queues: easy to force a wrap

    for i in 0..5u16 {
        let slot = i as u32 % 4;
        let new_tail = (i as u32 + 1) % 4;
        write_admin_sqe(&mem, slot, admin_opc::GET_FEATURES, 200 + i, 0, 0, 0x01, 0);
        ctrl.mmio_write(reg::offset::DOORBELL_BASE, 4, new_tail as u64);
        let (cid, sc, phase) = read_cqe(&mem, ACQ_BASE, slot);
        assert_eq!(cid, 200 + i);
        assert_eq!(sc, 0);
        let expected_phase = i < 4;
        assert_eq!(phase, expected_phase, "phase bit should flip after the queue wraps");
    }
}

/// Minimal synchronous `BlockBackend` over a real file, standing in for a
/// host VMM that backs the namespace with a disk image on the filesystem
/// instead of guest RAM.
struct FileBlockBackend {
    file: parking_lot::Mutex<std::fs::File>,
    sector_size: u32,
    size_bytes: u64,
}

impl BlockBackend for FileBlockBackend {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    fn read(
        &self,
        byte_offset: u64,
        iov: &[GuestSlice],
        on_complete: Box<dyn FnOnce(Result<(), NvmeError>) + Send>,
    ) {
        let mut file = self.file.lock();
        let mut off = byte_offset;
        for seg in iov {
            let buf = unsafe { std::slice::from_raw_parts_mut(seg.ptr, seg.len) };
            if file.seek(SeekFrom::Start(off)).and_then(|_| file.read_exact(buf)).is_err() {
                on_complete(Err(NvmeError::BackendIo("tempfile read failed".into())));
                return;
            }
            off += seg.len as u64;
        }
        on_complete(Ok(()));
    }

    fn write(
        &self,
        byte_offset: u64,
        iov: &[GuestSlice],
        on_complete: Box<dyn FnOnce(Result<(), NvmeError>) + Send>,
    ) {
        let mut file = self.file.lock();
        let mut off = byte_offset;
        for seg in iov {
            let buf = unsafe { std::slice::from_raw_parts(seg.ptr, seg.len) };
            if file.seek(SeekFrom::Start(off)).and_then(|_| file.write_all(buf)).is_err() {
                on_complete(Err(NvmeError::BackendIo("tempfile write failed".into())));
                return;
            }
            off += seg.len as u64;
        }
        on_complete(Ok(()));
    }

    fn flush(&self, on_complete: Box<dyn FnOnce(Result<(), NvmeError>) + Send>) {
        let res = self
            .file
            .lock()
            .sync_all()
            .map_err(|e| NvmeError::BackendIo(format!("tempfile sync failed: {e}")));
        on_complete(res);
    }
}

#[test]
fn file_backed_backend_round_trips_via_tempfile() {
    init_logging();
    let size_bytes = 4 * 1024 * 1024u64;
    let mut tmp = tempfile::tempfile().expect("create scratch file");
    tmp.set_len(size_bytes).expect("size scratch file");
    let backend = Box::new(FileBlockBackend {
        file: parking_lot::Mutex::new(tmp),
        sector_size: 512,
        size_bytes,
    });

    let opts = NvmeOptions::parse("maxq=4,qsz=64,ioslots=4").unwrap();
    let mem = Arc::new(TestGuestMemory::new(PAGE_SIZE * 8));
    let irq = Arc::new(RecordingInterruptSink::new());
    let ctrl = NvmeController::new(opts, mem.clone(), irq, Some(backend)).unwrap();
    enable(&ctrl, 16, 16);

    mem.write_at(DATA_BASE, &[0x5Au8; 512]);
    let io_cq_base = PAGE_SIZE as u64 * 3;
    let io_sq_base = PAGE_SIZE as u64 * 4;
    write_admin_sqe(&mem, 0, admin_opc::CREATE_IO_CQ, 50, 0, io_cq_base, (15 << 16) | 1, 0x1);
    ctrl.mmio_write(reg::offset::DOORBELL_BASE, 4, 1);
    write_admin_sqe(&mem, 1, admin_opc::CREATE_IO_SQ, 51, 0, io_sq_base, (15 << 16) | 1, (1 << 16) | 1);
    ctrl.mmio_write(reg::offset::DOORBELL_BASE, 4, 2);

    write_io_sqe(&mem, io_sq_base, 0, io_opc::WRITE, 60, 3, 0, DATA_BASE);
    let sq_doorbell = reg::offset::DOORBELL_BASE + 8;
    ctrl.mmio_write(sq_doorbell, 4, 1);
    let (cid, sc, _) = read_cqe(&mem, io_cq_base, 0);
    assert_eq!((cid, sc), (60, 0), "write to file-backed namespace should succeed");

    let read_gpa = DATA_BASE + PAGE_SIZE as u64;
    write_io_sqe(&mem, io_sq_base, 1, io_opc::READ, 61, 3, 0, read_gpa);
    ctrl.mmio_write(sq_doorbell, 4, 2);
    let (cid, sc, _) = read_cqe(&mem, io_cq_base, 1);
    assert_eq!((cid, sc), (61, 0), "read from file-backed namespace should succeed");
    assert_eq!(mem.read_at(read_gpa, 512), vec![0x5Au8; 512]);
}

/// A write whose PRP list expands past `NVME_MAX_BLOCKIOVS` discrete
/// segments must drain what it has walked so far to the backend, block on
/// the descriptor's drain gate, and resume walking the rest of the list
/// rather than erroring out or silently truncating the transfer.
#[test]
fn large_transfer_drains_and_resumes_past_max_blockiovs() {
    use nvme_emu::devices::nvme::prp::NVME_MAX_BLOCKIOVS;

    let (ctrl, mem, _irq) = make_controller(2400);
    enable(&ctrl, 16, 16);

    let io_cq_base = PAGE_SIZE as u64 * 3;
    let io_sq_base = PAGE_SIZE as u64 * 4;
    write_admin_sqe(&mem, 0, admin_opc::CREATE_IO_CQ, 70, 0, io_cq_base, (63 << 16) | 1, 0x1);
    ctrl.mmio_write(reg::offset::DOORBELL_BASE, 4, 1);
    write_admin_sqe(&mem, 1, admin_opc::CREATE_IO_SQ, 71, 0, io_sq_base, (63 << 16) | 1, (1 << 16) | 1);
    ctrl.mmio_write(reg::offset::DOORBELL_BASE, 4, 2);
    let (_, sc, _) = read_cqe(&mem, ACQ_BASE, 1);
    assert_eq!(sc, 0);

    // One full PRP list page (512 entries, no chaining needed) of
    // non-contiguous data pages, plus prp1's own page, totals
    // NVME_MAX_BLOCKIOVS + 1 segments: one more than a single walk() batch
    // allows.
    let nlist_entries = NVME_MAX_BLOCKIOVS;
    let prp1 = PAGE_SIZE as u64 * 20;
    let list_gpa = PAGE_SIZE as u64 * 21;
    let data_region = PAGE_SIZE as u64 * 32;

    mem.write_at(prp1, &vec![0xEEu8; PAGE_SIZE]);
    for i in 0..nlist_entries {
        let data_gpa = data_region + (2 * i as u64) * PAGE_SIZE as u64;
        mem.write_at(list_gpa + (i * 8) as u64, &data_gpa.to_le_bytes());
        mem.write_at(data_gpa, &vec![(i % 256) as u8; PAGE_SIZE]);
    }

    let total_bytes = PAGE_SIZE * (nlist_entries + 1);
    let sector_size = 512usize;
    assert_eq!(total_bytes % sector_size, 0);
    let nblocks = total_bytes / sector_size;

    let mut raw = [0u8; SQE_SIZE];
    raw[0] = io_opc::WRITE;
    raw[2..4].copy_from_slice(&200u16.to_le_bytes());
    raw[4..8].copy_from_slice(&1u32.to_le_bytes());
    raw[24..32].copy_from_slice(&prp1.to_le_bytes());
    raw[32..40].copy_from_slice(&list_gpa.to_le_bytes());
    raw[48..52].copy_from_slice(&((nblocks - 1) as u32).to_le_bytes());
    mem.write_at(io_sq_base, &raw);

    let sq_doorbell = reg::offset::DOORBELL_BASE + 8;
    ctrl.mmio_write(sq_doorbell, 4, 1);
    let (cid, sc, _) = read_cqe(&mem, io_cq_base, 0);
    assert_eq!(
        (cid, sc),
        (200, 0),
        "a write spanning more than NVME_MAX_BLOCKIOVS segments should still complete"
    );

    // Read the same range back into a disjoint set of guest pages and check
    // every drained batch landed at the right backend offset.
    let read_prp1 = PAGE_SIZE as u64 * 1100;
    let read_list_gpa = PAGE_SIZE as u64 * 1101;
    let read_data_region = PAGE_SIZE as u64 * 1110;
    for i in 0..nlist_entries {
        let data_gpa = read_data_region + (2 * i as u64) * PAGE_SIZE as u64;
        mem.write_at(read_list_gpa + (i * 8) as u64, &data_gpa.to_le_bytes());
    }

    let mut raw = [0u8; SQE_SIZE];
    raw[0] = io_opc::READ;
    raw[2..4].copy_from_slice(&201u16.to_le_bytes());
    raw[4..8].copy_from_slice(&1u32.to_le_bytes());
    raw[24..32].copy_from_slice(&read_prp1.to_le_bytes());
    raw[32..40].copy_from_slice(&read_list_gpa.to_le_bytes());
    raw[48..52].copy_from_slice(&((nblocks - 1) as u32).to_le_bytes());
    mem.write_at(io_sq_base + SQE_SIZE as u64, &raw);
    ctrl.mmio_write(sq_doorbell, 4, 2);

    let (cid, sc, _) = read_cqe(&mem, io_cq_base, 1);
    assert_eq!((cid, sc), (201, 0));

    assert_eq!(mem.read_at(read_prp1, PAGE_SIZE), vec![0xEEu8; PAGE_SIZE]);
    for i in 0..nlist_entries {
        let data_gpa = read_data_region + (2 * i as u64) * PAGE_SIZE as u64;
        let expected = vec![(i % 256) as u8; PAGE_SIZE];
        assert_eq!(
            mem.read_at(data_gpa, PAGE_SIZE),
            expected,
            "segment {i} mismatched after drain-and-resume"
        );
    }
}

#[test]
fn completion_to_bytes_round_trips_fields() {
    let c = Completion { cdw0: 0xAABBCCDD, sqhd: 3, sqid: 2, cid: 77, sct: 1, sc: 9, phase: true };
    let bytes = c.to_bytes();
    assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 0xAABBCCDD);
    assert_eq!(u16::from_le_bytes(bytes[12..14].try_into().unwrap()), 77);
}
