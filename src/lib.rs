//! nvme-emu - Emulated NVMe PCIe storage controller for a userspace VMM.
//!
//! Implements the register file, admin/I/O queue pairs, PRP scatter/gather
//! walking, and command executors of an NVMe 1.3 controller, addressed as a
//! single memory-mapped BAR0 region. A host VMM wires this up by:
//!
//! - implementing [`devices::nvme::GuestMemory`] against its own
//!   guest-physical-to-host-virtual translation,
//! - implementing [`devices::nvme::InterruptSink`] against its MSI-X
//!   delivery path (or using [`devices::nvme::interrupt::NullInterruptSink`]
//!   for tests),
//! - constructing an [`devices::nvme::NvmeController`] and wrapping it in a
//!   [`devices::nvme::NvmeDevice`] for registration with a
//!   [`devices::DeviceManager`].
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use nvme_emu::devices::nvme::{NvmeController, NvmeDevice, NvmeOptions};
//! use nvme_emu::devices::nvme::interrupt::NullInterruptSink;
//!
//! let opts = NvmeOptions::default();
//! let ctrl = NvmeController::new(opts, guest_memory, Arc::new(NullInterruptSink), None)?;
//! let device = NvmeDevice::new(0xFEB0_0000, ctrl);
//! ```

pub mod devices;
pub mod memory;

pub use devices::nvme::{GuestMemory, InterruptSink, NvmeController, NvmeError, NvmeOptions};

/// Crate version, exposed so embedding VMMs can report it alongside their
/// own in identify/diagnostic output.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
