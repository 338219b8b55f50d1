//! Block backing store.
//!
//! Mirrors the data model's tagged union: a RAM disk is handled specially
//! and synchronously by the I/O executor (see `io.rs`), while anything
//! backed by a real device or file goes through `BlockBackend`, whose
//! completions arrive asynchronously via callback. The two paths are kept
//! distinct rather than unified behind one polymorphic interface, because
//! the RAM path's synchronous completion under the executor's own lock is
//! exactly what makes it cheap.

use super::error::NvmeError;
use super::guest::GuestSlice;

/// An externally supplied block device or file, addressed in bytes.
pub trait BlockBackend: Send + Sync {
    fn sector_size(&self) -> u32;
    fn size_bytes(&self) -> u64;

    fn read(
        &self,
        byte_offset: u64,
        iov: &[GuestSlice],
        on_complete: Box<dyn FnOnce(Result<(), NvmeError>) + Send>,
    );

    fn write(
        &self,
        byte_offset: u64,
        iov: &[GuestSlice],
        on_complete: Box<dyn FnOnce(Result<(), NvmeError>) + Send>,
    );

    fn flush(&self, on_complete: Box<dyn FnOnce(Result<(), NvmeError>) + Send>);
}

/// Either an in-memory disk (handled inline by the executor) or a real
/// backend reached through `BlockBackend`.
pub enum BlockStore {
    Ram { buffer: parking_lot::Mutex<Vec<u8>>, sector_size: u32 },
    Backend(Box<dyn BlockBackend>),
}

impl BlockStore {
    pub fn new_ram(megabytes: u64, sector_size: u32) -> Self {
        let size = (megabytes * 1024 * 1024) as usize;
        BlockStore::Ram { buffer: parking_lot::Mutex::new(vec![0u8; size]), sector_size }
    }

    pub fn sector_size(&self) -> u32 {
        match self {
            BlockStore::Ram { sector_size, .. } => *sector_size,
            BlockStore::Backend(b) => b.sector_size(),
        }
    }

    pub fn size_bytes(&self) -> u64 {
        match self {
            BlockStore::Ram { buffer, .. } => buffer.lock().len() as u64,
            BlockStore::Backend(b) => b.size_bytes(),
        }
    }

    pub fn is_ram(&self) -> bool {
        matches!(self, BlockStore::Ram { .. })
    }

    /// Copy `len` bytes out of the RAM disk at `byte_offset` into `dst`.
    /// Only valid for the RAM variant; panics otherwise (callers branch on
    /// `is_ram()` first, mirroring the source's tagged dispatch).
    pub fn ram_read(&self, byte_offset: u64, dst: &mut [u8]) -> Result<(), NvmeError> {
        match self {
            BlockStore::Ram { buffer, .. } => {
                let buf = buffer.lock();
                let start = byte_offset as usize;
                let end = start + dst.len();
                if end > buf.len() {
                    return Err(NvmeError::LbaOutOfRange {
                        lba: byte_offset,
                        nblocks: 0,
                        limit: buf.len() as u64,
                    });
                }
                dst.copy_from_slice(&buf[start..end]);
                Ok(())
            }
            BlockStore::Backend(_) => unreachable!("ram_read called on a non-RAM backend"),
        }
    }

    pub fn ram_write(&self, byte_offset: u64, src: &[u8]) -> Result<(), NvmeError> {
        match self {
            BlockStore::Ram { buffer, .. } => {
                let mut buf = buffer.lock();
                let start = byte_offset as usize;
                let end = start + src.len();
                if end > buf.len() {
                    return Err(NvmeError::LbaOutOfRange {
                        lba: byte_offset,
                        nblocks: 0,
                        limit: buf.len() as u64,
                    });
                }
                buf[start..end].copy_from_slice(src);
                Ok(())
            }
            BlockStore::Backend(_) => unreachable!("ram_write called on a non-RAM backend"),
        }
    }
}

/// In-process `BlockBackend` used by tests and as a reference
/// implementation for a file-free block device: a plain byte buffer with
/// synchronous (immediate-callback) completion.
pub struct MemBlockBackend {
    data: parking_lot::Mutex<Vec<u8>>,
    sector_size: u32,
}

impl MemBlockBackend {
    pub fn new(size_bytes: usize, sector_size: u32) -> Self {
        Self { data: parking_lot::Mutex::new(vec![0u8; size_bytes]), sector_size }
    }
}

impl BlockBackend for MemBlockBackend {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn size_bytes(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn read(
        &self,
        byte_offset: u64,
        iov: &[GuestSlice],
        on_complete: Box<dyn FnOnce(Result<(), NvmeError>) + Send>,
    ) {
        let data = self.data.lock();
        let mut off = byte_offset as usize;
        for seg in iov {
            let end = off + seg.len;
            if end > data.len() {
                drop(data);
                on_complete(Err(NvmeError::BackendIo("read past end of backend".into())));
                return;
            }
            // SAFETY: seg.ptr/len was produced by a GuestMemory translation
            // sized exactly for this copy.
            unsafe {
                std::ptr::copy_nonoverlapping(data[off..end].as_ptr(), seg.ptr, seg.len);
            }
            off = end;
        }
        on_complete(Ok(()));
    }

    fn write(
        &self,
        byte_offset: u64,
        iov: &[GuestSlice],
        on_complete: Box<dyn FnOnce(Result<(), NvmeError>) + Send>,
    ) {
        let mut data = self.data.lock();
        let mut off = byte_offset as usize;
        for seg in iov {
            let end = off + seg.len;
            if end > data.len() {
                drop(data);
                on_complete(Err(NvmeError::BackendIo("write past end of backend".into())));
                return;
            }
            unsafe {
                std::ptr::copy_nonoverlapping(seg.ptr, data[off..end].as_mut_ptr(), seg.len);
            }
            off = end;
        }
        on_complete(Ok(()));
    }

    fn flush(&self, on_complete: Box<dyn FnOnce(Result<(), NvmeError>) + Send>) {
        on_complete(Ok(()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_round_trips_bytes() {
        let store = BlockStore::new_ram(1, 512);
        let data = vec![0xAB; 512];
        store.ram_write(512, &data).unwrap();
        let mut out = vec![0u8; 512];
        store.ram_read(512, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn ram_rejects_out_of_range() {
        let store = BlockStore::new_ram(1, 512);
        let data = vec![0u8; 512];
        assert!(store.ram_write(1024 * 1024, &data).is_err());
    }
}
