//! Guest physical memory management and kernel/FDT loading for aarch64.
//!
//! Wraps `vm_memory::GuestMemoryMmap` the same way the teacher's
//! `boot/memory.rs` did, but the loaders layered on top target the ARM64
//! Image boot protocol and a flattened device tree instead of bzImage and
//! `boot_params`.
//!
//! # Memory layout
//!
//! ```text
//! DRAM_START (0x8000_0000) ┌─────────────────────┐
//!                          │ Image (kernel)      │  entry = DRAM_START + text_offset
//!                          │                     │
//!                          │ ... guest RAM ...   │
//!                          ├─────────────────────┤
//! DRAM_START + size - 2MiB │ Flattened device    │
//!                          │ tree (FDT_MAX_SIZE) │
//! DRAM_START + size        └─────────────────────┘
//! ```

use std::io::Read;
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::sync::Arc;

use nix::sys::mman::{mmap, MapFlags, ProtFlags};
use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemory as GuestMemoryTrait, GuestMemoryMmap};

/// Guest physical base address of DRAM on this platform.
pub const DRAM_START: u64 = 0x8000_0000;

/// Device tree is placed in the last 2MiB of guest RAM.
pub const FDT_MAX_SIZE: u64 = 2 * 1024 * 1024;

/// ARM64 Image header magic ("ARM\x64" read little-endian as a u32 at offset 0x38).
const ARM64_IMAGE_MAGIC: u32 = 0x644d_5241;

/// Fallback text_offset when the header's version predates the field's use.
const DEFAULT_TEXT_OFFSET: u64 = 0x8_0000;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("failed to allocate guest memory: {0}")]
    Allocation(#[source] std::io::Error),

    #[error("guest memory access out of bounds at {addr:#x} (len {len}): {source}")]
    OutOfBounds {
        addr: u64,
        len: usize,
        #[source]
        source: vm_memory::guest_memory::Error,
    },

    #[error("failed to read kernel image: {0}")]
    ReadKernel(#[source] std::io::Error),

    #[error("invalid ARM64 Image header: {0}")]
    InvalidImage(String),

    #[error("device tree ({size} bytes) does not fit in the reserved {max} byte region")]
    FdtTooLarge { size: usize, max: u64 },

    #[error("failed to mmap kernel image over guest memory: {0}")]
    Mmap(#[source] nix::Error),
}

/// Guest physical memory, a single region starting at [`DRAM_START`].
pub struct GuestMemory {
    inner: Arc<GuestMemoryMmap>,
    size: u64,
}

/// Result of loading the kernel image: where it ended up and where to jump.
#[derive(Debug, Clone, Copy)]
pub struct LoadedKernel {
    pub load_addr: u64,
    pub entry_addr: u64,
    pub size: u64,
}

impl GuestMemory {
    /// Allocate `size` bytes of guest RAM starting at [`DRAM_START`].
    pub fn new(size: u64) -> Result<Self, MemoryError> {
        let regions = vec![(GuestAddress(DRAM_START), size as usize)];
        let inner = GuestMemoryMmap::from_ranges(&regions).map_err(|e| {
            MemoryError::Allocation(std::io::Error::other(format!(
                "failed to create guest memory: {e}"
            )))
        })?;
        Ok(Self { inner: Arc::new(inner), size })
    }

    /// Host (virtual addr, size) pair for KVM memory-slot registration.
    pub fn as_raw_parts(&self) -> (u64, u64) {
        let region = self.inner.iter().next().expect("memory has no regions");
        (region.as_ptr() as u64, self.size)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Shared handle to the underlying `vm-memory` mapping, for APIs that
    /// speak `vm_memory::GuestMemory` directly (vhost-net's memory table).
    pub fn vm_memory_arc(&self) -> Arc<GuestMemoryMmap> {
        Arc::clone(&self.inner)
    }

    pub fn last_addr(&self) -> u64 {
        DRAM_START + self.size - 1
    }

    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.inner
            .write_slice(data, GuestAddress(addr))
            .map_err(|source| MemoryError::OutOfBounds {
                addr,
                len: data.len(),
                source,
            })
    }

    pub fn write_u32(&self, addr: u64, value: u32) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn write_u64(&self, addr: u64, value: u64) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), MemoryError> {
        self.inner
            .read_slice(data, GuestAddress(addr))
            .map_err(|source| MemoryError::OutOfBounds {
                addr,
                len: data.len(),
                source,
            })
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Get a host pointer to a guest range, for the few devices (pmem, the
    /// block device's iovecs) that need to hand raw memory to the kernel.
    pub fn get_host_ptr(&self, addr: u64, len: usize) -> Result<*mut u8, MemoryError> {
        let region = self
            .inner
            .iter()
            .next()
            .expect("memory has no regions");
        if addr < DRAM_START || addr + len as u64 > DRAM_START + self.size {
            return Err(MemoryError::OutOfBounds {
                addr,
                len,
                source: vm_memory::guest_memory::Error::InvalidGuestAddress(GuestAddress(addr)),
            });
        }
        let offset = (addr - DRAM_START) as isize;
        Ok(unsafe { region.as_ptr().offset(offset) })
    }

    /// Load an ARM64 Image kernel, returning where it was placed and its entry point.
    ///
    /// Image header layout (first 64 bytes), all little-endian:
    /// - offset 0x08: `text_offset` (u64), load offset from DRAM_START
    /// - offset 0x10: `image_size` (u64)
    /// - offset 0x38: magic, must equal [`ARM64_IMAGE_MAGIC`]
    pub fn load_kernel(&self, kernel_path: &str) -> Result<LoadedKernel, MemoryError> {
        let mut file = std::fs::File::open(kernel_path).map_err(MemoryError::ReadKernel)?;
        let file_len = file.metadata().map_err(MemoryError::ReadKernel)?.len();
        if file_len < 64 {
            return Err(MemoryError::InvalidImage("file too short for Image header".into()));
        }

        let mut header = [0u8; 64];
        file.read_exact(&mut header).map_err(MemoryError::ReadKernel)?;

        let magic = u32::from_le_bytes(header[0x38..0x3c].try_into().unwrap());
        if magic != ARM64_IMAGE_MAGIC {
            return Err(MemoryError::InvalidImage(format!(
                "bad magic {magic:#x}, expected {ARM64_IMAGE_MAGIC:#x}"
            )));
        }

        let mut text_offset = u64::from_le_bytes(header[0x08..0x10].try_into().unwrap());
        if text_offset == 0 {
            text_offset = DEFAULT_TEXT_OFFSET;
        }

        let load_addr = DRAM_START + text_offset;
        let host_ptr = self.get_host_ptr(load_addr, file_len as usize)?;

        // Map the image file directly over the anonymous guest-memory
        // mapping at `load_addr`, displacing it for the kernel's extent:
        // MAP_FIXED replaces whatever was there, MAP_PRIVATE keeps writes
        // (e.g. a guest patching its own image) from reaching the file.
        let addr = NonZeroUsize::new(host_ptr as usize)
            .ok_or_else(|| MemoryError::InvalidImage("load address is null".into()))?;
        let len = NonZeroUsize::new(file_len as usize)
            .ok_or_else(|| MemoryError::InvalidImage("kernel image is empty".into()))?;
        unsafe {
            mmap(
                Some(addr),
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_FIXED | MapFlags::MAP_PRIVATE,
                file.as_fd(),
                0,
            )
            .map_err(MemoryError::Mmap)?;
        }

        eprintln!(
            "[memory] loaded Image {} ({} bytes) at {:#x}, entry {:#x}",
            kernel_path, file_len, load_addr, load_addr
        );

        Ok(LoadedKernel {
            load_addr,
            entry_addr: load_addr,
            size: file_len,
        })
    }

    /// Write the flattened device tree blob into the reserved region at the
    /// top of RAM. Returns the guest physical address of the blob.
    pub fn load_fdt(&self, fdt_blob: &[u8]) -> Result<u64, MemoryError> {
        if fdt_blob.len() as u64 > FDT_MAX_SIZE {
            return Err(MemoryError::FdtTooLarge {
                size: fdt_blob.len(),
                max: FDT_MAX_SIZE,
            });
        }
        let fdt_addr = DRAM_START + self.size - FDT_MAX_SIZE;
        self.write(fdt_addr, fdt_blob)?;
        eprintln!(
            "[memory] loaded FDT ({} bytes) at {:#x}",
            fdt_blob.len(),
            fdt_addr
        );
        Ok(fdt_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_header(text_offset: u64, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; 64];
        buf[0x08..0x10].copy_from_slice(&text_offset.to_le_bytes());
        buf[0x10..0x18].copy_from_slice(&(buf.len() as u64 + payload.len() as u64).to_le_bytes());
        buf[0x38..0x3c].copy_from_slice(&ARM64_IMAGE_MAGIC.to_le_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn test_allocate() {
        let mem = GuestMemory::new(4096).unwrap();
        let (_, size) = mem.as_raw_parts();
        assert_eq!(size, 4096);
        assert_eq!(mem.last_addr(), DRAM_START + 4095);
    }

    #[test]
    fn test_write_read() {
        let mem = GuestMemory::new(4096).unwrap();
        mem.write(DRAM_START, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        mem.read(DRAM_START, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn test_load_kernel_default_text_offset() {
        let dir = std::env::temp_dir().join(format!("basalt-test-kernel-{}", std::process::id()));
        let path = dir.to_str().unwrap().to_string();
        std::fs::write(&path, image_header(0, b"payload")).unwrap();

        let mem = GuestMemory::new(16 * 1024 * 1024).unwrap();
        let loaded = mem.load_kernel(&path).unwrap();
        assert_eq!(loaded.load_addr, DRAM_START + DEFAULT_TEXT_OFFSET);
        assert_eq!(loaded.entry_addr, loaded.load_addr);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_load_kernel_explicit_text_offset() {
        let dir = std::env::temp_dir().join(format!("basalt-test-kernel2-{}", std::process::id()));
        let path = dir.to_str().unwrap().to_string();
        std::fs::write(&path, image_header(0x1000, b"x")).unwrap();

        let mem = GuestMemory::new(16 * 1024 * 1024).unwrap();
        let loaded = mem.load_kernel(&path).unwrap();
        assert_eq!(loaded.load_addr, DRAM_START + 0x1000);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_load_kernel_bad_magic() {
        let dir = std::env::temp_dir().join(format!("basalt-test-kernel3-{}", std::process::id()));
        let path = dir.to_str().unwrap().to_string();
        std::fs::write(&path, vec![0u8; 64]).unwrap();

        let mem = GuestMemory::new(16 * 1024 * 1024).unwrap();
        assert!(mem.load_kernel(&path).is_err());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_load_fdt_fits() {
        let mem = GuestMemory::new(16 * 1024 * 1024).unwrap();
        let blob = vec![0xAAu8; 1024];
        let addr = mem.load_fdt(&blob).unwrap();
        assert_eq!(addr, DRAM_START + 16 * 1024 * 1024 - FDT_MAX_SIZE);
    }

    #[test]
    fn test_load_fdt_too_large() {
        let mem = GuestMemory::new(16 * 1024 * 1024).unwrap();
        let blob = vec![0u8; (FDT_MAX_SIZE + 1) as usize];
        assert!(mem.load_fdt(&blob).is_err());
    }
}
