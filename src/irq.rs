//! Interrupt injection short-cut: an eventfd bound (by `vmm.rs`, via
//! `VmFd::register_irqfd`) to a GIC SPI. Device back-ends hold an
//! [`IrqLine`] and call [`IrqLine::trigger`] to raise a level interrupt
//! without the VMM being on the injection path.
//!
//! Carbon has no interrupt-fd mechanism (it drives the in-kernel
//! PIC/IOAPIC instead); this is grounded on the irqfd/kick-fd pattern used
//! throughout the rust-vmm ecosystem for MMIO-transport VirtIO devices.

use std::sync::Arc;

use vmm_sys_util::eventfd::EventFd;

/// A single GIC SPI, reachable by writing to its bound eventfd.
#[derive(Clone)]
pub struct IrqLine {
    gsi: u32,
    eventfd: Arc<EventFd>,
}

impl IrqLine {
    pub fn new(gsi: u32, eventfd: EventFd) -> Self {
        Self {
            gsi,
            eventfd: Arc::new(eventfd),
        }
    }

    pub fn gsi(&self) -> u32 {
        self.gsi
    }

    pub fn eventfd(&self) -> &EventFd {
        &self.eventfd
    }

    /// Raise the interrupt. Writing any nonzero value to a `KVM_IRQFD`
    /// eventfd asserts the bound GSI.
    pub fn trigger(&self) {
        if let Err(e) = self.eventfd.write(1) {
            eprintln!("[irq] failed to trigger gsi {}: {e}", self.gsi);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_increments_eventfd() {
        let efd = EventFd::new(0).unwrap();
        let raw = efd.try_clone().unwrap();
        let line = IrqLine::new(42, efd);
        line.trigger();
        assert_eq!(raw.read().unwrap(), 1);
        assert_eq!(line.gsi(), 42);
    }
}
