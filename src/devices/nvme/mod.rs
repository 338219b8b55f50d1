//! Emulated NVMe PCIe storage controller.
//!
//! Laid out the way the platform's other MMIO devices are (`register file`
//! + `interrupt sink` + `command executor`), but split further because an
//! NVMe controller is, structurally, several cooperating state machines:
//! the register/doorbell front end (`reg`, `controller`), the queue pair
//! engine (`queue`), the scatter/gather walker (`prp`), the pooled I/O
//! descriptor allocator (`ioreq`), and the two command executors
//! (`admin`, `io`).

pub mod admin;
pub mod backend;
pub mod cmd;
pub mod config;
pub mod controller;
pub mod error;
pub mod guest;
pub mod identify;
pub mod interrupt;
pub mod io;
pub mod ioreq;
pub mod prp;
pub mod queue;
pub mod reg;

pub use config::{BackendSpec, NvmeOptions};
pub use controller::NvmeController;
pub use error::NvmeError;
pub use guest::GuestMemory;
pub use interrupt::InterruptSink;

use crate::devices::{Device, DeviceId, IoAccess};
use crate::memory::PhysAddr;

fn access_size(access: IoAccess) -> u8 {
    match access {
        IoAccess::Byte => 1,
        IoAccess::Word => 2,
        IoAccess::Dword => 4,
    }
}

/// Adapts `NvmeController`'s MMIO dispatch to the platform's device
/// framework; BAR0 is registered against this, not the controller
/// directly, so `NvmeController` stays free of PCI/BDF concerns.
pub struct NvmeDevice {
    base: PhysAddr,
    ctrl: std::sync::Arc<NvmeController>,
}

impl NvmeDevice {
    pub fn new(base: PhysAddr, ctrl: std::sync::Arc<NvmeController>) -> Self {
        Self { base, ctrl }
    }

    pub fn controller(&self) -> &std::sync::Arc<NvmeController> {
        &self.ctrl
    }
}

impl Device for NvmeDevice {
    fn id(&self) -> DeviceId {
        DeviceId::NVME
    }

    fn name(&self) -> &str {
        "nvme-emu"
    }

    fn reset(&mut self) {
        self.ctrl.mmio_write(reg::offset::CC, 4, 0);
    }

    fn handles_mmio(&self, addr: PhysAddr) -> bool {
        addr >= self.base && addr < self.base + self.ctrl.bar0_size() as u64
    }

    fn mmio_region(&self) -> Option<(PhysAddr, usize)> {
        Some((self.base, self.ctrl.bar0_size()))
    }

    fn mmio_read(&mut self, addr: PhysAddr, access: IoAccess) -> u32 {
        let offset = (addr - self.base) as usize;
        self.ctrl.mmio_read(offset, access_size(access)) as u32
    }

    fn mmio_write(&mut self, addr: PhysAddr, value: u32, access: IoAccess) {
        let offset = (addr - self.base) as usize;
        self.ctrl.mmio_write(offset, access_size(access), value as u64);
    }
}
