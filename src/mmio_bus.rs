//! MMIO dispatch bus and the deterministic device-address/IRQ allocator.
//!
//! The dispatch half (`MmioDevice`, `MmioDeviceEntry`, `MmioBus::read/write`)
//! is the teacher's `devices/mmio.rs` kept close to verbatim: an
//! address-sorted `Vec`, a linear scan for the owning device, 0xff-fill on
//! unmapped reads, and silent-drop on unmapped writes. Layered on top is the
//! allocator spec.md §4.4 requires and carbon has no equivalent of (carbon
//! hardcodes `VIRTIO_MMIO_BASE`/`VIRTIO_BLK_IRQ` as constants): simple
//! devices (UART, RTC) get one page each below `MMIO_START`, and VirtIO
//! devices get two pages plus the next free SPI once the "virtio phase"
//! begins, so every run of the VMM assigns the same addresses and IRQs for
//! the same device list.

/// Base of the MMIO device window, below DRAM.
pub const MMIO_START: u64 = 0x4000_0000;

/// First IRQ available for SPI-routed devices (after the 32 reserved PPIs/SGIs).
const FIRST_SPI: u32 = 33;

/// Size of a "simple" device's MMIO window (UART, RTC): one page.
pub const SIMPLE_DEVICE_SIZE: u64 = 0x1000;

/// Size of a VirtIO MMIO transport's window: two pages (low page for the
/// always-trapping register file, high page for the backed hot-path
/// registers), per spec.md §4.5.
pub const VIRTIO_DEVICE_SIZE: u64 = 0x2000;

/// Offset within the transport's register file at which the page-splitting
/// discipline cuts over from the always-trapping low page to the
/// memory-backed high page (virtio-mmio's `InterruptStatus` register).
/// Canonical home of this constant: `devices/virtio/mod.rs` references it
/// rather than redefining it, to keep the address-allocation math and the
/// register-file layout from drifting apart.
pub const INTERRUPT_STATUS_OFFSET: u64 = 0x060;

/// Size of the window actually registered on the bus for a VirtIO device:
/// from its (shifted) base through the end of the two-page region.
pub const VIRTIO_REGISTER_SIZE: u64 = VIRTIO_DEVICE_SIZE - (SIMPLE_DEVICE_SIZE - INTERRUPT_STATUS_OFFSET);

pub trait MmioDevice {
    fn read(&mut self, offset: u64, data: &mut [u8]);
    fn write(&mut self, offset: u64, data: &[u8]);
}

struct MmioDeviceEntry {
    base: u64,
    size: u64,
    device: Box<dyn MmioDevice>,
}

/// MMIO bus that routes accesses to registered devices.
pub struct MmioBus {
    devices: Vec<MmioDeviceEntry>,
    next_addr: u64,
    next_irq: u32,
    virtio_phase: bool,
}

impl MmioBus {
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            next_addr: MMIO_START,
            next_irq: FIRST_SPI,
            virtio_phase: false,
        }
    }

    /// Allocate a one-page window and an IRQ for a simple (non-VirtIO)
    /// device. Must be called before [`start_virtio_phase`].
    pub fn allocate(&mut self) -> (u64, u32) {
        assert!(!self.virtio_phase, "simple devices must be allocated before VirtIO devices");
        let addr = self.next_addr;
        self.next_addr += SIMPLE_DEVICE_SIZE;
        let irq = self.next_irq;
        self.next_irq += 1;
        (addr, irq)
    }

    /// Mark the end of simple-device allocation. All subsequent devices are
    /// VirtIO transports, allocated via [`allocate_virtio`].
    pub fn start_virtio_phase(&mut self) {
        self.virtio_phase = true;
    }

    /// Allocate a two-page window and an IRQ for a VirtIO MMIO transport.
    ///
    /// The returned address is shifted into the tail of the first page, per
    /// spec.md §4.4: `addr = page_start + (page_size − INTERRUPT_STATUS_OFFSET)`,
    /// so that `addr + INTERRUPT_STATUS_OFFSET` lands exactly on the start
    /// of the second page — the page the transport backs with a real memory
    /// region once the device reaches `DRIVER_OK`.
    pub fn allocate_virtio(&mut self) -> (u64, u32) {
        assert!(self.virtio_phase, "call start_virtio_phase() first");
        let page_start = self.next_addr;
        let addr = page_start + (SIMPLE_DEVICE_SIZE - INTERRUPT_STATUS_OFFSET);
        self.next_addr += VIRTIO_DEVICE_SIZE;
        let irq = self.next_irq;
        self.next_irq += 1;
        (addr, irq)
    }

    pub fn register(&mut self, base: u64, size: u64, device: Box<dyn MmioDevice>) {
        self.devices.push(MmioDeviceEntry { base, size, device });
        self.devices.sort_by_key(|e| e.base);
    }

    fn find_device(&mut self, addr: u64) -> Option<(&mut dyn MmioDevice, u64)> {
        for entry in &mut self.devices {
            if addr >= entry.base && addr < entry.base + entry.size {
                return Some((entry.device.as_mut(), addr - entry.base));
            }
        }
        None
    }

    pub fn read(&mut self, addr: u64, data: &mut [u8]) {
        if let Some((device, offset)) = self.find_device(addr) {
            device.read(offset, data);
        } else {
            for byte in data.iter_mut() {
                *byte = 0xff;
            }
        }
    }

    pub fn write(&mut self, addr: u64, data: &[u8]) {
        if let Some((device, offset)) = self.find_device(addr) {
            device.write(offset, data);
        }
    }
}

impl Default for MmioBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockDevice {
        value: u32,
    }

    impl MmioDevice for MockDevice {
        fn read(&mut self, offset: u64, data: &mut [u8]) {
            if offset == 0 && data.len() >= 4 {
                data[..4].copy_from_slice(&self.value.to_le_bytes());
            }
        }

        fn write(&mut self, offset: u64, data: &[u8]) {
            if offset == 0 && data.len() >= 4 {
                self.value = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
            }
        }
    }

    #[test]
    fn test_mmio_bus_dispatch() {
        let mut bus = MmioBus::new();
        bus.register(0x1000, 0x100, Box::new(MockDevice { value: 0x1234_5678 }));

        let mut data = [0u8; 4];
        bus.read(0x1000, &mut data);
        assert_eq!(u32::from_le_bytes(data), 0x1234_5678);

        bus.write(0x1000, &0xDEAD_BEEFu32.to_le_bytes());
        bus.read(0x1000, &mut data);
        assert_eq!(u32::from_le_bytes(data), 0xDEAD_BEEF);

        bus.read(0x9000, &mut data);
        assert_eq!(data, [0xff; 4]);
    }

    #[test]
    fn test_allocate_is_deterministic_and_disjoint() {
        let mut bus = MmioBus::new();
        let (uart_addr, uart_irq) = bus.allocate();
        let (rtc_addr, rtc_irq) = bus.allocate();
        assert_eq!(uart_addr, MMIO_START);
        assert_eq!(rtc_addr, MMIO_START + SIMPLE_DEVICE_SIZE);
        assert_eq!(uart_irq, FIRST_SPI);
        assert_eq!(rtc_irq, FIRST_SPI + 1);

        bus.start_virtio_phase();
        let first_virtio_page = rtc_addr + SIMPLE_DEVICE_SIZE;
        let (blk_addr, blk_irq) = bus.allocate_virtio();
        assert_eq!(blk_addr, first_virtio_page + (SIMPLE_DEVICE_SIZE - INTERRUPT_STATUS_OFFSET));
        assert_eq!(blk_addr + INTERRUPT_STATUS_OFFSET, first_virtio_page + SIMPLE_DEVICE_SIZE);
        assert_eq!(blk_irq, rtc_irq + 1);

        let (net_addr, _) = bus.allocate_virtio();
        assert_eq!(net_addr, blk_addr + VIRTIO_DEVICE_SIZE);
    }

    #[test]
    #[should_panic]
    fn test_allocate_after_virtio_phase_panics() {
        let mut bus = MmioBus::new();
        bus.start_virtio_phase();
        bus.allocate();
    }
}
