//! Persistent memory: a host file mapped directly into a guest-physical
//! range, advertised to the guest as a pmem-region. No virtqueue; the
//! guest reads and writes the mapped range directly once the VMM has
//! registered it as a KVM memory slot, so this backend's job is just
//! opening and mapping the file and reporting where it landed.
//!
//! The teacher has no equivalent device; grounded on `memory.rs`'s own
//! `GuestMemoryMmap::from_ranges` allocation pattern for the mmap
//! discipline, generalized from `vm-memory`'s mmap wrapper to a raw
//! `nix::sys::mman::mmap` call since this range is file-backed rather than
//! anonymous.

use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::sync::Arc;

use nix::sys::mman::{mmap, MapFlags, ProtFlags};
use thiserror::Error;

use crate::irq::IrqLine;
use crate::memory::GuestMemory;

use super::queue::Virtqueue;
use super::{VirtioDeviceBackend, DEVICE_ID_PMEM};

#[derive(Error, Debug)]
pub enum PmemError {
    #[error("failed to open pmem backing file {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to stat pmem backing file {path}: {source}")]
    Stat {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to mmap pmem backing file: {0}")]
    Mmap(#[source] nix::Error),
}

/// Guest page size assumed throughout (4 KiB, the only size this platform
/// configures the MMU for).
const GUEST_PAGE_SIZE: u64 = 4096;

fn round_up_to_page(len: u64) -> u64 {
    (len + GUEST_PAGE_SIZE - 1) / GUEST_PAGE_SIZE * GUEST_PAGE_SIZE
}

pub struct VirtioPmem {
    _file: File,
    host_addr: *mut u8,
    capacity: u64,
    /// Guest-physical base this range will be registered at; filled in by
    /// the caller once it has decided where "the top of guest RAM" is.
    guest_addr: u64,
}

// The mapping is only ever read through Bytes operations under this type's
// control; no other code holds a reference to `host_addr`.
unsafe impl Send for VirtioPmem {}

impl VirtioPmem {
    /// Open `path`, growing it to a page multiple if needed, and map it
    /// read-write shared so guest writes land on the host file.
    pub fn new(path: &str, guest_addr: u64) -> Result<Self, PmemError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| PmemError::Open { path: path.to_string(), source })?;

        let file_len = file
            .metadata()
            .map_err(|source| PmemError::Stat { path: path.to_string(), source })?
            .len();
        let capacity = round_up_to_page(file_len.max(1));
        if capacity != file_len {
            file.set_len(capacity)
                .map_err(|source| PmemError::Stat { path: path.to_string(), source })?;
        }

        let host_addr = unsafe {
            mmap(
                None,
                NonZeroUsize::new(capacity as usize).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file.as_fd(),
                0,
            )
            .map_err(PmemError::Mmap)?
        };

        Ok(Self { _file: file, host_addr: host_addr.as_ptr() as *mut u8, capacity, guest_addr })
    }

    /// `(host virtual address, size)` for the caller to register as a KVM
    /// user memory region at [`Self::guest_addr`].
    pub fn as_raw_parts(&self) -> (u64, u64) {
        (self.host_addr as u64, self.capacity)
    }

    pub fn guest_addr(&self) -> u64 {
        self.guest_addr
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

impl VirtioDeviceBackend for VirtioPmem {
    fn device_type(&self) -> u32 {
        DEVICE_ID_PMEM
    }

    fn device_features(&self) -> u64 {
        0
    }

    fn num_queues(&self) -> usize {
        0
    }

    fn queue_max_size(&self, _index: usize) -> u16 {
        0
    }

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        let capacity_le = self.capacity.to_le_bytes();
        if offset >= capacity_le.len() as u64 {
            return;
        }
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = capacity_le.get(offset as usize + i).copied().unwrap_or(0);
        }
    }

    fn write_config(&mut self, _offset: u64, _data: &[u8]) {}

    fn activate(&mut self, _memory: Arc<GuestMemory>, _irq: IrqLine, _driver_features: u64, _queues: &[Virtqueue]) {}

    fn queue_notify(&mut self, _memory: &GuestMemory, _queue_index: usize, _queues: &mut [Virtqueue]) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_file(tag: &str, len: u64) -> String {
        let path = std::env::temp_dir().join(format!("basalt-pmem-test-{tag}-{}", std::process::id()));
        let path = path.to_str().unwrap().to_string();
        std::fs::write(&path, vec![0u8; len as usize]).unwrap();
        path
    }

    #[test]
    fn test_capacity_rounds_up_to_page_size() {
        let path = scratch_file("round", 100);
        let pmem = VirtioPmem::new(&path, 0x1_0000_0000).unwrap();
        assert_eq!(pmem.capacity(), GUEST_PAGE_SIZE);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_capacity_already_page_aligned_is_unchanged() {
        let path = scratch_file("aligned", GUEST_PAGE_SIZE * 2);
        let pmem = VirtioPmem::new(&path, 0x1_0000_0000).unwrap();
        assert_eq!(pmem.capacity(), GUEST_PAGE_SIZE * 2);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_read_config_reports_capacity_little_endian() {
        let path = scratch_file("config", GUEST_PAGE_SIZE);
        let pmem = VirtioPmem::new(&path, 0x1_0000_0000).unwrap();
        let mut buf = [0u8; 8];
        pmem.read_config(0, &mut buf);
        assert_eq!(u64::from_le_bytes(buf), GUEST_PAGE_SIZE);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_mapped_range_is_writable() {
        let path = scratch_file("write", GUEST_PAGE_SIZE);
        let pmem = VirtioPmem::new(&path, 0x1_0000_0000).unwrap();
        unsafe {
            std::ptr::write(pmem.host_addr, 0xAB);
            assert_eq!(std::ptr::read(pmem.host_addr), 0xAB);
        }
        std::fs::remove_file(&path).ok();
    }
}
