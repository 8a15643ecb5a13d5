//! PL031 real-time clock, MMIO-accessed.
//!
//! Replaces the teacher's `devices/cmos.rs` I/O-port CMOS RTC, which has no
//! aarch64 equivalent (no I/O ports). The philosophy is kept: return a
//! plausible, static-ish time and status so the kernel doesn't stall waiting
//! on the clock. PL031 register layout per ARM DDI 0224B.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::mmio_bus::MmioDevice;

mod regs {
    pub const DR: u64 = 0x000; // Data register (current time)
    pub const MR: u64 = 0x004; // Match register
    pub const LR: u64 = 0x008; // Load register
    pub const CR: u64 = 0x00c; // Control register
    pub const IMSC: u64 = 0x010; // Interrupt mask set/clear
    pub const RIS: u64 = 0x014; // Raw interrupt status
    pub const MIS: u64 = 0x018; // Masked interrupt status
    pub const ICR: u64 = 0x01c; // Interrupt clear register
    pub const PERIPH_ID0: u64 = 0xfe0;
    pub const PERIPH_ID1: u64 = 0xfe4;
    pub const PERIPH_ID2: u64 = 0xfe8;
    pub const PERIPH_ID3: u64 = 0xfec;
    pub const CELL_ID0: u64 = 0xff0;
    pub const CELL_ID1: u64 = 0xff4;
    pub const CELL_ID2: u64 = 0xff8;
    pub const CELL_ID3: u64 = 0xffc;
}

/// PL031 real-time clock.
pub struct Rtc {
    load_offset: i64,
    match_value: u32,
    enabled: bool,
    interrupt_mask: bool,
    interrupt_raised: bool,
    irq: u32,
}

impl Rtc {
    pub fn new(irq: u32) -> Self {
        Self {
            load_offset: 0,
            match_value: 0,
            enabled: true,
            interrupt_mask: false,
            interrupt_raised: false,
            irq,
        }
    }

    pub fn irq(&self) -> u32 {
        self.irq
    }

    fn now(&self) -> u32 {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        (secs + self.load_offset) as u32
    }

    pub fn has_pending_interrupt(&self) -> bool {
        self.interrupt_raised && self.interrupt_mask
    }

    fn read_reg(&mut self, offset: u64) -> u32 {
        match offset {
            regs::DR => self.now(),
            regs::MR => self.match_value,
            regs::LR => self.now(),
            regs::CR => self.enabled as u32,
            regs::IMSC => self.interrupt_mask as u32,
            regs::RIS => self.interrupt_raised as u32,
            regs::MIS => (self.interrupt_raised && self.interrupt_mask) as u32,
            regs::PERIPH_ID0 => 0x31,
            regs::PERIPH_ID1 => 0x10,
            regs::PERIPH_ID2 => 0x04,
            regs::PERIPH_ID3 => 0x00,
            regs::CELL_ID0 => 0x0d,
            regs::CELL_ID1 => 0xf0,
            regs::CELL_ID2 => 0x05,
            regs::CELL_ID3 => 0xb1,
            _ => 0,
        }
    }

    fn write_reg(&mut self, offset: u64, value: u32) {
        match offset {
            regs::MR => self.match_value = value,
            regs::LR => {
                let secs = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                self.load_offset = value as i64 - secs;
            }
            regs::CR => self.enabled = value & 0x1 != 0,
            regs::IMSC => self.interrupt_mask = value & 0x1 != 0,
            regs::ICR => self.interrupt_raised = false,
            _ => {}
        }
    }
}

impl MmioDevice for Rtc {
    fn read(&mut self, offset: u64, data: &mut [u8]) {
        let aligned = offset & !0x3;
        let value = self.read_reg(aligned).to_le_bytes();
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = value.get(i).copied().unwrap_or(0);
        }
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        let mut buf = [0u8; 4];
        let len = data.len().min(4);
        buf[..len].copy_from_slice(&data[..len]);
        self.write_reg(offset & !0x3, u32::from_le_bytes(buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_register_tracks_host_time() {
        let mut rtc = Rtc::new(34);
        let mut data = [0u8; 4];
        rtc.read(regs::DR, &mut data);
        let value = u32::from_le_bytes(data);
        let expected = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as u32;
        assert!(value.abs_diff(expected) <= 2);
    }

    #[test]
    fn test_identification_registers() {
        let mut rtc = Rtc::new(34);
        let mut data = [0u8; 4];
        rtc.read(regs::PERIPH_ID0, &mut data);
        assert_eq!(data[0], 0x31);
        rtc.read(regs::CELL_ID0, &mut data);
        assert_eq!(data[0], 0x0d);
    }

    #[test]
    fn test_interrupt_mask_and_clear() {
        let mut rtc = Rtc::new(34);
        rtc.write(regs::IMSC, &1u32.to_le_bytes());
        rtc.interrupt_raised = true;
        assert!(rtc.has_pending_interrupt());
        rtc.write(regs::ICR, &1u32.to_le_bytes());
        assert!(!rtc.has_pending_interrupt());
    }

    #[test]
    fn test_load_register_sets_offset() {
        let mut rtc = Rtc::new(34);
        let target: u32 = 1_700_000_000;
        rtc.write(regs::LR, &target.to_le_bytes());
        let mut data = [0u8; 4];
        rtc.read(regs::DR, &mut data);
        let value = u32::from_le_bytes(data);
        assert!(value.abs_diff(target) <= 2);
    }
}
