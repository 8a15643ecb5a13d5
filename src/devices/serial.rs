//! 16550A UART emulation, MMIO-accessed.
//!
//! Register layout, LSR/IIR bit meaning, and DLAB handling are kept from
//! the teacher's `devices/serial.rs` 8250 model (16550A is a superset);
//! access is MMIO instead of I/O ports since aarch64 has none. RX input is
//! added: the teacher's own doc comment says "input is not implemented for
//! milestone 1" — spec.md §4.10 requires it, fed by the event loop's stdin
//! source into a bounded 64-byte ring with an RDA (Received Data Available)
//! interrupt.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use crate::irq::IrqLine;
use crate::mmio_bus::MmioDevice;

mod regs {
    pub const THR_RBR: u64 = 0;
    pub const IER: u64 = 1;
    pub const IIR_FCR: u64 = 2;
    pub const LCR: u64 = 3;
    pub const MCR: u64 = 4;
    pub const LSR: u64 = 5;
    pub const MSR: u64 = 6;
    pub const SCR: u64 = 7;
}

mod lsr {
    pub const DR: u8 = 0x01;
    pub const THRE: u8 = 0x20;
    pub const TEMT: u8 = 0x40;
}

mod ier {
    pub const RDA: u8 = 0x01;
    pub const THRE: u8 = 0x02;
}

mod iir {
    pub const NO_INT: u8 = 0x01;
    pub const THRE: u8 = 0x02;
    pub const RDA: u8 = 0x04;
}

/// MCR loopback bit: when set, the DATA register's write side loops back
/// internally instead of reaching the host console.
const MCR_LOOP: u8 = 0x10;

/// Maximum number of bytes buffered between guest reads.
const RX_BUFFER_SIZE: usize = 64;

pub struct Serial {
    ier: u8,
    lcr: u8,
    mcr: u8,
    scr: u8,
    fcr: u8,
    dll: u8,
    dlh: u8,
    rx: VecDeque<u8>,
    thre_pending: bool,
    irq: u32,
}

impl Serial {
    pub fn new(irq: u32) -> Self {
        Self {
            ier: 0,
            lcr: 0,
            mcr: 0,
            scr: 0,
            fcr: 0,
            dll: 0,
            dlh: 0,
            rx: VecDeque::with_capacity(RX_BUFFER_SIZE),
            thre_pending: false,
            irq,
        }
    }

    pub fn irq(&self) -> u32 {
        self.irq
    }

    /// Feed a byte received from the host console into the RX buffer. Older
    /// bytes are dropped once the buffer is full, matching a real 16550A's
    /// FIFO-overrun behavior rather than blocking the event loop.
    pub fn enqueue_input(&mut self, byte: u8) {
        if self.rx.len() >= RX_BUFFER_SIZE {
            self.rx.pop_front();
        }
        self.rx.push_back(byte);
    }

    pub fn has_pending_interrupt(&self) -> bool {
        (self.ier & ier::RDA != 0 && !self.rx.is_empty()) || (self.ier & ier::THRE != 0 && self.thre_pending)
    }

    pub fn read(&mut self, offset: u64) -> u8 {
        let dlab = self.lcr & 0x80 != 0;
        match offset {
            regs::THR_RBR if dlab => self.dll,
            regs::THR_RBR => self.rx.pop_front().unwrap_or(0),
            regs::IER if dlab => self.dlh,
            regs::IER => self.ier,
            regs::IIR_FCR => {
                if self.ier & ier::RDA != 0 && !self.rx.is_empty() {
                    iir::RDA
                } else if self.ier & ier::THRE != 0 && self.thre_pending {
                    self.thre_pending = false;
                    iir::THRE
                } else {
                    iir::NO_INT
                }
            }
            regs::LCR => self.lcr,
            regs::MCR => self.mcr,
            regs::LSR => {
                let mut value = lsr::THRE | lsr::TEMT;
                if !self.rx.is_empty() {
                    value |= lsr::DR;
                }
                value
            }
            regs::MSR => 0xb0,
            regs::SCR => self.scr,
            _ => 0,
        }
    }

    /// Returns whether this write should raise the owning [`IrqLine`], i.e.
    /// a DATA-register write that enabled (or already had enabled) the
    /// THR-empty interrupt.
    pub fn write(&mut self, offset: u64, value: u8) -> bool {
        let dlab = self.lcr & 0x80 != 0;
        match offset {
            regs::THR_RBR if dlab => {
                self.dll = value;
                false
            }
            regs::THR_RBR => {
                if self.mcr & MCR_LOOP == 0 {
                    let _ = io::stdout().write_all(&[value]);
                    let _ = io::stdout().flush();
                }
                self.thre_pending = true;
                self.ier & ier::THRE != 0
            }
            regs::IER if dlab => {
                self.dlh = value;
                false
            }
            regs::IER => {
                self.ier = value;
                false
            }
            regs::IIR_FCR => {
                self.fcr = value;
                false
            }
            regs::LCR => {
                self.lcr = value;
                false
            }
            regs::MCR => {
                self.mcr = value;
                false
            }
            regs::SCR => {
                self.scr = value;
                false
            }
            _ => false,
        }
    }
}

impl MmioDevice for Serial {
    fn read(&mut self, offset: u64, data: &mut [u8]) {
        if let Some(byte) = data.first_mut() {
            *byte = Serial::read(self, offset);
        }
        for b in data.iter_mut().skip(1) {
            *b = 0;
        }
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        if let Some(&byte) = data.first() {
            let _ = Serial::write(self, offset, byte);
        }
    }
}

/// Shared handle to a [`Serial`], held both by the [`crate::mmio_bus::MmioBus`]
/// (as an [`MmioDevice`]) and by the event loop's stdin source, which calls
/// [`SharedSerial::feed_input`] and needs to trigger the RDA interrupt
/// outside of any guest-driven MMIO access.
#[derive(Clone)]
pub struct SharedSerial {
    inner: Arc<Mutex<Serial>>,
    irq: IrqLine,
}

impl SharedSerial {
    pub fn new(irq: IrqLine) -> Self {
        let gsi = irq.gsi();
        Self {
            inner: Arc::new(Mutex::new(Serial::new(gsi))),
            irq,
        }
    }

    /// Feed one byte read from the host console into the RX ring, raising
    /// the RDA interrupt if the guest has unmasked it.
    pub fn feed_input(&self, byte: u8) {
        let raise = {
            let mut serial = self.inner.lock().unwrap();
            serial.enqueue_input(byte);
            serial.has_pending_interrupt()
        };
        if raise {
            self.irq.trigger();
        }
    }
}

impl MmioDevice for SharedSerial {
    fn read(&mut self, offset: u64, data: &mut [u8]) {
        self.inner.lock().unwrap().read(offset, data);
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        let raise = match data.first() {
            Some(&byte) => self.inner.lock().unwrap().write(offset, byte),
            None => false,
        };
        if raise {
            self.irq.trigger();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsr_always_ready_to_transmit() {
        let mut serial = Serial::new(33);
        let lsr = serial.read(regs::LSR);
        assert_eq!(lsr & lsr::THRE, lsr::THRE);
        assert_eq!(lsr & lsr::TEMT, lsr::TEMT);
        assert_eq!(lsr & lsr::DR, 0);
    }

    #[test]
    fn test_scratch_register_roundtrip() {
        let mut serial = Serial::new(33);
        serial.write(regs::SCR, 0x42);
        assert_eq!(serial.read(regs::SCR), 0x42);
    }

    #[test]
    fn test_dlab_mode() {
        let mut serial = Serial::new(33);
        serial.write(regs::LCR, 0x80);
        serial.write(regs::THR_RBR, 0x01);
        serial.write(regs::IER, 0x00);
        assert_eq!(serial.read(regs::THR_RBR), 0x01);
        serial.write(regs::LCR, 0x00);
    }

    #[test]
    fn test_rx_buffer_and_interrupt() {
        let mut serial = Serial::new(33);
        serial.write(regs::IER, ier::RDA);
        assert!(!serial.has_pending_interrupt());

        serial.enqueue_input(b'a');
        assert!(serial.has_pending_interrupt());
        assert_eq!(serial.read(regs::LSR) & lsr::DR, lsr::DR);
        assert_eq!(serial.read(regs::IIR_FCR), iir::RDA);

        assert_eq!(serial.read(regs::THR_RBR), b'a');
        assert!(!serial.has_pending_interrupt());
        assert_eq!(serial.read(regs::IIR_FCR), iir::NO_INT);
    }

    #[test]
    fn test_rx_buffer_drops_oldest_when_full() {
        let mut serial = Serial::new(33);
        for i in 0..RX_BUFFER_SIZE + 4 {
            serial.enqueue_input(i as u8);
        }
        assert_eq!(serial.rx.len(), RX_BUFFER_SIZE);
        assert_eq!(serial.read(regs::THR_RBR), 4);
    }
}
