//! Virtual machine creation and memory/vCPU/GIC wiring for aarch64.
//!
//! Grounded on the teacher's `kvm/vm.rs` wrapper shape (`VmFd` holds the raw
//! `kvm_ioctls::VmFd` and exposes `set_user_memory_region`/`create_vcpu`),
//! with the x86 TSS/IRQ-chip/PIT initialization removed and replaced with
//! the aarch64 ordering constraint: vCPUs are created first, the GIC is
//! created once all of them exist (see `gic.rs`).

use super::{KvmError, VcpuFd};
use crate::gic::Gic;
use kvm_bindings::kvm_userspace_memory_region;
use kvm_ioctls::IoEventAddress;
use vmm_sys_util::eventfd::EventFd;

/// Wrapper around the KVM VM file descriptor.
pub struct VmFd {
    vm: kvm_ioctls::VmFd,
}

impl VmFd {
    pub fn new(vm: kvm_ioctls::VmFd) -> Self {
        Self { vm }
    }

    /// Register a guest memory region with KVM.
    ///
    /// # Safety
    ///
    /// The caller must ensure the host memory outlives the VM and that the
    /// region doesn't overlap any other registered slot.
    pub unsafe fn set_user_memory_region(
        &self,
        slot: u32,
        guest_addr: u64,
        memory_size: u64,
        userspace_addr: u64,
    ) -> Result<(), KvmError> {
        let region = kvm_userspace_memory_region {
            slot,
            guest_phys_addr: guest_addr,
            memory_size,
            userspace_addr,
            flags: 0,
        };
        unsafe {
            self.vm
                .set_user_memory_region(region)
                .map_err(KvmError::SetMemoryRegion)
        }
    }

    /// Create vCPU `id`, initializing it with the ARM64 generic target and
    /// PSCI 0.2 support so secondary vCPUs can be powered on via HVC.
    pub fn create_vcpu(&self, id: u64) -> Result<VcpuFd, KvmError> {
        let vcpu = self.vm.create_vcpu(id).map_err(KvmError::CreateVcpu)?;

        let mut kvi = kvm_bindings::kvm_vcpu_init::default();
        self.vm
            .get_preferred_target(&mut kvi)
            .map_err(KvmError::InitVcpu)?;

        VcpuFd::new(vcpu, id, kvi)
    }

    /// Create the GICv2 device. Must be called after every vCPU has been
    /// created (see module-level doc on `kvm/mod.rs`).
    pub fn create_gic(&self, num_vcpus: u32) -> Result<Gic, KvmError> {
        Gic::create(&self.vm, num_vcpus).map_err(KvmError::from)
    }

    /// Bind `eventfd` to GSI `gsi`: writes to the fd assert the interrupt
    /// without the VMM being on the injection path, the mechanism
    /// `irq.rs`'s `IrqLine::trigger` relies on.
    pub fn register_irqfd(&self, eventfd: &EventFd, gsi: u32) -> Result<(), KvmError> {
        self.vm
            .register_irqfd(eventfd, gsi)
            .map_err(KvmError::RegisterIrqfd)
    }

    /// Bind `eventfd` so that a guest MMIO write of `datamatch` to `addr`
    /// is consumed entirely in-kernel: KVM signals the fd without an exit
    /// to userspace. Used for the virtio queue-notify fast path (spec's
    /// notification short-cut), keyed on the queue index being written.
    pub fn register_ioevent(&self, eventfd: &EventFd, addr: u64, datamatch: u32) -> Result<(), KvmError> {
        self.vm
            .register_ioevent(eventfd, &IoEventAddress::Mmio(addr), datamatch)
            .map_err(KvmError::RegisterIoevent)
    }

    pub(crate) fn raw(&self) -> &kvm_ioctls::VmFd {
        &self.vm
    }
}
