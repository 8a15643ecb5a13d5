//! VirtIO net back ends: VMM-mediated tap I/O, and a vhost-net kernel
//! hand-off for the accelerated path.
//!
//! The tap path is new (the teacher has no net device at all); grounded on
//! `devices/tap.rs` (itself ported from `virt-do-lumper`'s
//! `devices/net/tap.rs`) for the host interface and on the `vhost` crate's
//! kernel backend for the accelerated variant, per spec §4.8.

use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use vhost::net::VhostNet as VhostNetBackend;
use vhost::vhost_kern::net::Net as VhostKernNet;
use vhost::vhost_kern::VhostKernBackend;
use vhost::{VhostBackend, VhostUserMemoryRegionInfo, VringConfigData};
use virtio_bindings::bindings::virtio_net::{
    VIRTIO_NET_F_CSUM, VIRTIO_NET_F_GUEST_CSUM, VIRTIO_NET_F_GUEST_TSO4, VIRTIO_NET_F_GUEST_TSO6,
    VIRTIO_NET_F_GUEST_UFO, VIRTIO_NET_F_HOST_TSO4, VIRTIO_NET_F_HOST_TSO6, VIRTIO_NET_F_HOST_UFO,
    VIRTIO_NET_F_MAC, VIRTIO_NET_F_MRG_RXBUF,
};
use vm_memory::GuestMemoryMmap;
use vmm_sys_util::eventfd::EventFd;

use crate::devices::tap::Tap;
use crate::irq::IrqLine;
use crate::memory::GuestMemory;

use super::queue::{Virtqueue, VIRTQ_DESC_F_WRITE};
use super::{VirtioDeviceBackend, DEVICE_ID_NET};

/// Size of the virtio-net header prepended to every frame (version-1, no
/// mergeable-rx-buffer extra field).
const VIRTIO_NET_HDR_SIZE: usize = 10;
const RX_QUEUE: usize = 0;
const TX_QUEUE: usize = 1;
const MAX_QUEUE_SIZE: u16 = 256;
const MAX_FRAME_SIZE: usize = 65562;

const OFFLOAD_FEATURES: u64 = (1 << VIRTIO_NET_F_CSUM)
    | (1 << VIRTIO_NET_F_GUEST_CSUM)
    | (1 << VIRTIO_NET_F_HOST_TSO4)
    | (1 << VIRTIO_NET_F_HOST_TSO6)
    | (1 << VIRTIO_NET_F_HOST_UFO)
    | (1 << VIRTIO_NET_F_GUEST_TSO4)
    | (1 << VIRTIO_NET_F_GUEST_TSO6)
    | (1 << VIRTIO_NET_F_GUEST_UFO)
    | (1 << VIRTIO_NET_F_MAC)
    | (1 << VIRTIO_NET_F_MRG_RXBUF);

/// Kernel-accelerated state: the tap handle stays around to be handed to
/// `set_backend`, the kick eventfds are what `queue_notify` pokes once the
/// kernel owns the data plane, and `net` is only populated once `activate`
/// has a guest memory handle to build the vhost device against.
struct VhostState {
    tap: Tap,
    net: Option<VhostKernNet<Arc<GuestMemoryMmap>>>,
    kick_fds: Vec<EventFd>,
}

enum Backend {
    /// VMM-mediated: the event loop reads/writes the tap fd directly and
    /// we walk descriptor chains by hand.
    Tap(Tap),
    /// Kernel-accelerated: once activated, the kernel moves frames and our
    /// queue/tap handlers only forward the kick.
    Vhost(VhostState),
}

pub struct VirtioNet {
    mac: [u8; 6],
    backend: Backend,
}

impl VirtioNet {
    pub fn new_tap_backed(if_name: &str, mac: [u8; 6]) -> std::io::Result<Self> {
        let tap = Tap::open_named(if_name).map_err(std::io::Error::other)?;
        Ok(Self { mac, backend: Backend::Tap(tap) })
    }

    pub fn new_vhost_backed(if_name: &str, mac: [u8; 6]) -> std::io::Result<Self> {
        let tap = Tap::open_named(if_name).map_err(std::io::Error::other)?;
        Ok(Self {
            mac,
            backend: Backend::Vhost(VhostState { tap, net: None, kick_fds: Vec::new() }),
        })
    }

    /// Fd the event loop should poll for tap readability (rx direction),
    /// `None` once the vhost kernel path owns the data plane.
    pub fn tap_rx_fd(&self) -> Option<i32> {
        match &self.backend {
            Backend::Tap(tap) => Some(tap.as_raw_fd()),
            Backend::Vhost(_) => None,
        }
    }

    /// Called by the event loop when the tap fd is readable: read one frame
    /// and deliver it into the next available rx descriptor chain.
    pub fn poll_tap_rx(&mut self, memory: &GuestMemory, queues: &mut [Virtqueue]) -> bool {
        let Backend::Tap(tap) = &mut self.backend else { return false };
        let Some(rx_queue) = queues.get_mut(RX_QUEUE) else { return false };
        let Some(chain) = rx_queue.pop_desc_chain(memory) else { return false };

        let head_id = chain.head_id;
        let descs: Vec<_> = chain.collect();
        let Some(desc) = descs.first() else { return false };
        if desc.flags & VIRTQ_DESC_F_WRITE == 0 {
            return false;
        }

        let mut frame = [0u8; MAX_FRAME_SIZE];
        let n = match tap.read(&mut frame) {
            Ok(n) => n,
            Err(_) => return false,
        };

        let written = n.min(desc.len as usize);
        let _ = memory.write(desc.addr, &frame[..written]);
        rx_queue.add_used_desc(memory, head_id, written as u32);
        true
    }

    /// Drive the tx queue: walk every available chain, strip the virtio-net
    /// header, and write the frame to the tap device.
    fn process_tx(&mut self, memory: &GuestMemory, queue: &mut Virtqueue) {
        let Backend::Tap(tap) = &mut self.backend else { return };

        while let Some(chain) = queue.pop_desc_chain(memory) {
            let head_id = chain.head_id;
            let mut frame = Vec::new();
            let mut skip = VIRTIO_NET_HDR_SIZE;
            for desc in chain {
                let mut buf = vec![0u8; desc.len as usize];
                if memory.read(desc.addr, &mut buf).is_err() {
                    continue;
                }
                if skip > 0 {
                    let drop_n = skip.min(buf.len());
                    skip -= drop_n;
                    frame.extend_from_slice(&buf[drop_n..]);
                } else {
                    frame.extend_from_slice(&buf);
                }
            }
            let _ = tap.write(&frame);
            queue.add_used_desc(memory, head_id, 0);
        }
    }
}

/// Config-space read for the 6-byte MAC field, factored out so it can be
/// exercised without a live tap device.
fn mac_config_read(mac: &[u8; 6], offset: u64, data: &mut [u8]) {
    if offset >= 6 {
        return;
    }
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = mac.get(offset as usize + i).copied().unwrap_or(0);
    }
}

impl VirtioDeviceBackend for VirtioNet {
    fn device_type(&self) -> u32 {
        DEVICE_ID_NET
    }

    fn device_features(&self) -> u64 {
        OFFLOAD_FEATURES
    }

    fn num_queues(&self) -> usize {
        2
    }

    fn queue_max_size(&self, _index: usize) -> u16 {
        MAX_QUEUE_SIZE
    }

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        mac_config_read(&self.mac, offset, data);
    }

    fn write_config(&mut self, _offset: u64, _data: &[u8]) {}

    fn activate(&mut self, memory: Arc<GuestMemory>, irq: IrqLine, driver_features: u64, queues: &[Virtqueue]) {
        match &mut self.backend {
            Backend::Tap(tap) => {
                let _ = tap.activate(driver_features, VIRTIO_NET_HDR_SIZE);
            }
            Backend::Vhost(state) => {
                if let Err(e) = activate_vhost(state, &memory, &irq, driver_features, queues) {
                    eprintln!("[virtio-net] vhost-net activation failed: {e}");
                }
            }
        }
    }

    fn queue_notify(&mut self, memory: &GuestMemory, queue_index: usize, queues: &mut [Virtqueue]) {
        match &mut self.backend {
            Backend::Tap(_) => {
                if queue_index == TX_QUEUE {
                    if let Some(queue) = queues.get_mut(TX_QUEUE) {
                        self.process_tx(memory, queue);
                    }
                }
            }
            Backend::Vhost(state) => {
                // The kernel backend owns the data plane; we only relay the
                // notification kick, which it reads off the eventfd itself.
                if let Some(kick) = state.kick_fds.get(queue_index) {
                    if let Err(e) = kick.write(1) {
                        eprintln!("[virtio-net] failed to kick vhost queue {queue_index}: {e}");
                    }
                }
            }
        }
    }

    fn poll(&mut self, memory: &GuestMemory, queues: &mut [Virtqueue]) -> bool {
        self.poll_tap_rx(memory, queues)
    }
}

/// Hand the tap fd, memory table, features, and ring addresses to the
/// in-kernel vhost-net device, per the activation sequence in
/// `vhost-device.rs`'s `VhostNet::activate` (set_owner, feature
/// negotiation, memory table, then per-queue num/addr/base/call/kick/
/// backend).
fn activate_vhost(
    state: &mut VhostState,
    memory: &Arc<GuestMemory>,
    irq: &IrqLine,
    driver_features: u64,
    queues: &[Virtqueue],
) -> Result<(), std::io::Error> {
    let net = VhostKernNet::<Arc<GuestMemoryMmap>>::new(memory.vm_memory_arc())
        .map_err(std::io::Error::other)?;

    net.set_owner().map_err(std::io::Error::other)?;
    let backend_features = net.get_features().map_err(std::io::Error::other)?;
    net.set_features(driver_features & backend_features)
        .map_err(std::io::Error::other)?;

    let (host_addr, size) = memory.as_raw_parts();
    let region = VhostUserMemoryRegionInfo {
        guest_phys_addr: crate::memory::DRAM_START,
        memory_size: size,
        userspace_addr: host_addr,
        mmap_offset: 0,
        mmap_handle: -1,
    };
    net.set_mem_table(&[region]).map_err(std::io::Error::other)?;

    state.kick_fds.clear();
    for (queue_index, queue) in queues.iter().enumerate() {
        let kick_fd = EventFd::new(0).map_err(std::io::Error::other)?;
        net.set_vring_num(queue_index, queue.size)
            .map_err(std::io::Error::other)?;
        let config_data = VringConfigData {
            queue_max_size: MAX_QUEUE_SIZE,
            queue_size: queue.size,
            flags: 0,
            desc_table_addr: queue.desc_table,
            used_ring_addr: queue.used_ring,
            avail_ring_addr: queue.avail_ring,
            log_addr: None,
        };
        net.set_vring_addr(queue_index, &config_data)
            .map_err(std::io::Error::other)?;
        net.set_vring_base(queue_index, 0)
            .map_err(std::io::Error::other)?;
        net.set_vring_call(queue_index, irq.eventfd())
            .map_err(std::io::Error::other)?;
        net.set_vring_kick(queue_index, &kick_fd)
            .map_err(std::io::Error::other)?;
        net.set_backend(queue_index, Some(&state.tap))
            .map_err(std::io::Error::other)?;
        state.kick_fds.push(kick_fd);
    }

    state.net = Some(net);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_exposed_via_config_space() {
        let mac = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];
        let mut buf = [0u8; 6];
        mac_config_read(&mac, 0, &mut buf);
        assert_eq!(buf, mac);
    }

    #[test]
    fn test_mac_config_read_out_of_range_is_untouched() {
        let mac = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];
        let mut buf = [0xffu8; 2];
        mac_config_read(&mac, 6, &mut buf);
        assert_eq!(buf, [0xff, 0xff]);
    }

    #[test]
    fn test_offload_features_include_mac_and_csum() {
        assert!(OFFLOAD_FEATURES & (1 << VIRTIO_NET_F_MAC) != 0);
        assert!(OFFLOAD_FEATURES & (1 << VIRTIO_NET_F_CSUM) != 0);
    }
}
