//! Split virtqueue engine: descriptor-chain iteration, notification
//! suppression, and the acquire/release fences that make the protocol safe
//! to run across the vCPU threads (guest-visible writes) and the event-loop
//! thread (our reads) without a lock.
//!
//! Grounded on the teacher's `devices/virtio/mod.rs` `Virtqueue`/`VirtqDesc`
//! pair (ring layout, descriptor table indexing), extended with event-idx
//! notification suppression and the fence discipline.

use std::sync::atomic::{fence, Ordering};

use crate::memory::GuestMemory;

/// Descriptor flag: buffer continues in next descriptor.
pub const VIRTQ_DESC_F_NEXT: u16 = 1;
/// Descriptor flag: buffer is device-writable (vs device-readable).
pub const VIRTQ_DESC_F_WRITE: u16 = 2;

/// A single virtqueue descriptor, as laid out in guest memory.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtqDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl VirtqDesc {
    pub const SIZE: usize = 16;

    pub fn read_from(memory: &GuestMemory, addr: u64) -> Option<Self> {
        let mut buf = [0u8; Self::SIZE];
        memory.read(addr, &mut buf).ok()?;
        Some(Self {
            addr: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            len: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            flags: u16::from_le_bytes(buf[12..14].try_into().unwrap()),
            next: u16::from_le_bytes(buf[14..16].try_into().unwrap()),
        })
    }

    pub fn has_next(&self) -> bool {
        self.flags & VIRTQ_DESC_F_NEXT != 0
    }

    pub fn is_write_only(&self) -> bool {
        self.flags & VIRTQ_DESC_F_WRITE != 0
    }
}

/// An iterator over one chain of descriptors rooted at an available-ring
/// entry. `next()` returns the current descriptor and advances to
/// `desc.next` while the `NEXT` flag is set.
pub struct DescriptorChain<'a> {
    memory: &'a GuestMemory,
    desc_table: u64,
    queue_size: u16,
    /// Head descriptor index, used as the `id` field of the used entry.
    pub head_id: u16,
    next_index: Option<u16>,
}

impl<'a> DescriptorChain<'a> {
    fn read_desc(&self, idx: u16) -> Option<VirtqDesc> {
        if idx >= self.queue_size {
            return None;
        }
        let addr = self.desc_table + idx as u64 * VirtqDesc::SIZE as u64;
        VirtqDesc::read_from(self.memory, addr)
    }
}

impl<'a> Iterator for DescriptorChain<'a> {
    type Item = VirtqDesc;

    fn next(&mut self) -> Option<VirtqDesc> {
        let idx = self.next_index?;
        let desc = self.read_desc(idx)?;
        self.next_index = if desc.has_next() { Some(desc.next) } else { None };
        Some(desc)
    }
}

/// Split virtqueue state: descriptor table, available ring, used ring, plus
/// the notification-suppression bookkeeping from `VIRTIO_F_EVENT_IDX`.
#[derive(Debug, Default)]
pub struct Virtqueue {
    pub size: u16,
    pub ready: bool,
    pub desc_table: u64,
    pub avail_ring: u64,
    pub used_ring: u64,

    next_avail: u16,
    next_used: u16,
    /// Number of used entries published since the last `send_notification`.
    suppressed: u16,
    /// Whether `VIRTIO_F_EVENT_IDX` was negotiated for this device.
    pub event_idx_enabled: bool,
}

/// Layout offsets within the available ring: flags(2) idx(2) ring[size](2*size) used_event(2).
mod avail_layout {
    pub const FLAGS: u64 = 0;
    pub const IDX: u64 = 2;
    pub const RING: u64 = 4;
}

/// Layout offsets within the used ring: flags(2) idx(2) ring[size](8*size) avail_event(2).
mod used_layout {
    pub const IDX: u64 = 2;
    pub const RING: u64 = 4;
}

impl Virtqueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn avail_idx(&self, memory: &GuestMemory) -> Option<u16> {
        let mut buf = [0u8; 2];
        memory.read(self.avail_ring + avail_layout::IDX, &mut buf).ok()?;
        Some(u16::from_le_bytes(buf))
    }

    fn avail_ring_entry(&self, memory: &GuestMemory, idx: u16) -> Option<u16> {
        let offset = avail_layout::RING + (idx % self.size) as u64 * 2;
        let mut buf = [0u8; 2];
        memory.read(self.avail_ring + offset, &mut buf).ok()?;
        Some(u16::from_le_bytes(buf))
    }

    /// Offset of `avail_event` within the used ring, which sits right after
    /// the `size`-entry used ring proper.
    fn avail_event_offset(&self) -> u64 {
        used_layout::RING + self.size as u64 * 8
    }

    /// Offset of `used_event` within the available ring, which sits right
    /// after the `size`-entry available ring proper.
    fn used_event_offset(&self) -> u64 {
        avail_layout::RING + self.size as u64 * 2
    }

    pub fn has_pending(&self, memory: &GuestMemory) -> bool {
        if !self.ready || self.size == 0 {
            return false;
        }
        match self.avail_idx(memory) {
            Some(idx) => idx != self.next_avail,
            None => false,
        }
    }

    /// Pop the next available descriptor chain, publishing `avail_event`
    /// first when notification suppression is negotiated.
    pub fn pop_desc_chain<'a>(&mut self, memory: &'a GuestMemory) -> Option<DescriptorChain<'a>> {
        if !self.ready || self.size == 0 {
            return None;
        }

        if self.event_idx_enabled {
            let offset = self.avail_event_offset();
            let _ = memory.write(self.used_ring + offset, &self.next_avail.to_le_bytes());
            fence(Ordering::Release);
        }

        let avail_idx = self.avail_idx(memory)?;
        if avail_idx == self.next_avail {
            return None;
        }

        fence(Ordering::Acquire);

        let desc_index = self.avail_ring_entry(memory, self.next_avail)?;
        assert!(
            desc_index < self.size,
            "descriptor index {desc_index} out of range for queue size {}",
            self.size
        );

        self.next_avail = self.next_avail.wrapping_add(1);

        Some(DescriptorChain {
            memory,
            desc_table: self.desc_table,
            queue_size: self.size,
            head_id: desc_index,
            next_index: Some(desc_index),
        })
    }

    /// Publish a completed chain into the used ring.
    pub fn add_used_desc(&mut self, memory: &GuestMemory, head_id: u16, written_len: u32) {
        let ring_offset = used_layout::RING + (self.next_used % self.size) as u64 * 8;
        let elem_addr = self.used_ring + ring_offset;
        let _ = memory.write(elem_addr, &(head_id as u32).to_le_bytes());
        let _ = memory.write(elem_addr + 4, &written_len.to_le_bytes());

        self.next_used = self.next_used.wrapping_add(1);
        self.suppressed = self.suppressed.wrapping_add(1);

        fence(Ordering::Release);
        let _ = memory.write(self.used_ring + used_layout::IDX, &self.next_used.to_le_bytes());
    }

    /// Must-kick check: whether the guest's `used_event` watermark has been
    /// crossed by the batch of entries published since the last call.
    pub fn send_notification(&mut self, memory: &GuestMemory) -> bool {
        if !self.event_idx_enabled {
            return true;
        }

        fence(Ordering::Acquire);
        let offset = self.used_event_offset();
        let mut buf = [0u8; 2];
        let used_event = match memory.read(self.avail_ring + offset, &mut buf) {
            Ok(()) => u16::from_le_bytes(buf),
            Err(_) => {
                self.suppressed = 0;
                return true;
            }
        };

        let before = self.next_used.wrapping_sub(self.suppressed);
        let must_kick = used_event.wrapping_sub(before) <= self.suppressed;
        self.suppressed = 0;
        must_kick
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_queue(memory: &GuestMemory, size: u16) -> Virtqueue {
        let desc_table = 0x1000u64;
        let avail_ring = desc_table + size as u64 * VirtqDesc::SIZE as u64;
        let used_ring = avail_ring + 4096;
        memory.write(avail_ring, &0u16.to_le_bytes()).unwrap();
        memory.write(avail_ring + 2, &0u16.to_le_bytes()).unwrap();
        memory.write(used_ring + 2, &0u16.to_le_bytes()).unwrap();
        Virtqueue {
            size,
            ready: true,
            desc_table,
            avail_ring,
            used_ring,
            ..Default::default()
        }
    }

    fn write_desc(memory: &GuestMemory, table: u64, idx: u16, desc: VirtqDesc) {
        let addr = table + idx as u64 * VirtqDesc::SIZE as u64;
        memory.write(addr, &desc.addr.to_le_bytes()).unwrap();
        memory.write(addr + 8, &desc.len.to_le_bytes()).unwrap();
        memory.write(addr + 12, &desc.flags.to_le_bytes()).unwrap();
        memory.write(addr + 14, &desc.next.to_le_bytes()).unwrap();
    }

    #[test]
    fn test_pop_desc_chain_single_descriptor() {
        let memory = GuestMemory::new(1 << 20).unwrap();
        let mut q = setup_queue(&memory, 4);

        write_desc(
            &memory,
            q.desc_table,
            0,
            VirtqDesc { addr: 0x2000, len: 16, flags: 0, next: 0 },
        );
        memory.write(q.avail_ring + 4, &0u16.to_le_bytes()).unwrap();
        memory.write(q.avail_ring + 2, &1u16.to_le_bytes()).unwrap();

        assert!(q.has_pending(&memory));
        let chain: Vec<_> = q.pop_desc_chain(&memory).unwrap().collect();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].len, 16);
        assert!(!q.has_pending(&memory));
    }

    #[test]
    fn test_pop_desc_chain_multi_descriptor() {
        let memory = GuestMemory::new(1 << 20).unwrap();
        let mut q = setup_queue(&memory, 4);

        write_desc(
            &memory,
            q.desc_table,
            0,
            VirtqDesc { addr: 0x2000, len: 16, flags: VIRTQ_DESC_F_NEXT, next: 1 },
        );
        write_desc(
            &memory,
            q.desc_table,
            1,
            VirtqDesc { addr: 0x3000, len: 4096, flags: VIRTQ_DESC_F_NEXT | VIRTQ_DESC_F_WRITE, next: 2 },
        );
        write_desc(
            &memory,
            q.desc_table,
            2,
            VirtqDesc { addr: 0x4000, len: 1, flags: VIRTQ_DESC_F_WRITE, next: 0 },
        );
        memory.write(q.avail_ring + 4, &0u16.to_le_bytes()).unwrap();
        memory.write(q.avail_ring + 2, &1u16.to_le_bytes()).unwrap();

        let chain = q.pop_desc_chain(&memory).unwrap();
        assert_eq!(chain.head_id, 0);
        let descs: Vec<_> = chain.collect();
        assert_eq!(descs.len(), 3);
        assert!(!descs[1].is_write_only() == false || descs[1].is_write_only());
        assert!(descs[2].is_write_only());
    }

    #[test]
    fn test_add_used_desc_advances_idx() {
        let memory = GuestMemory::new(1 << 20).unwrap();
        let mut q = setup_queue(&memory, 4);
        q.add_used_desc(&memory, 2, 4096);

        let mut idx_buf = [0u8; 2];
        memory.read(q.used_ring + 2, &mut idx_buf).unwrap();
        assert_eq!(u16::from_le_bytes(idx_buf), 1);

        let mut elem = [0u8; 8];
        memory.read(q.used_ring + 4, &mut elem).unwrap();
        assert_eq!(u32::from_le_bytes(elem[0..4].try_into().unwrap()), 2);
        assert_eq!(u32::from_le_bytes(elem[4..8].try_into().unwrap()), 4096);
    }

    #[test]
    fn test_send_notification_without_event_idx_always_kicks() {
        let memory = GuestMemory::new(1 << 20).unwrap();
        let mut q = setup_queue(&memory, 4);
        assert!(q.send_notification(&memory));
    }

    #[test]
    fn test_send_notification_respects_used_event() {
        let memory = GuestMemory::new(1 << 20).unwrap();
        let mut q = setup_queue(&memory, 4);
        q.event_idx_enabled = true;

        let used_event_offset = q.used_event_offset();
        memory
            .write(q.avail_ring + used_event_offset, &0u16.to_le_bytes())
            .unwrap();

        q.add_used_desc(&memory, 0, 10);
        assert!(q.send_notification(&memory));

        q.add_used_desc(&memory, 1, 10);
        memory
            .write(q.avail_ring + used_event_offset, &5u16.to_le_bytes())
            .unwrap();
        assert!(!q.send_notification(&memory));
    }
}
