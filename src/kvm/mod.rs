//! KVM (Kernel-based Virtual Machine) wrapper module, aarch64/GICv2 target.
//!
//! Ported from the teacher's `kvm/mod.rs`: same `KvmError` thiserror shape,
//! same `VmFd`/`VcpuFd` wrapper split, same `create_vm()` top-level entry
//! point. The x86-specific machinery (TSS/IRQ chip/PIT/CPUID/MSR setup) is
//! gone; aarch64 has no equivalent in-kernel legacy devices to initialize
//! before memory/vCPUs are set up.
//!
//! # VM Execution Model
//!
//! Unchanged from the teacher: the vCPU runs in a loop, KVM exits back to
//! the VMM on MMIO access, WFI (halt-equivalent), shutdown, or a system
//! event, and the VMM resumes the loop after handling the exit. On aarch64
//! there is no I/O-port exit kind; every device access is MMIO.
//!
//! # aarch64 vCPU-before-GIC ordering
//!
//! Unlike x86 (`create_irq_chip` before `create_vcpu`), aarch64 requires
//! vCPUs to be created *before* the GICv2 device: `KVM_CREATE_VCPU` fails
//! once the interrupt controller is initialized. See
//! `arch/arm64/kvm/arm.c`, `kvm_arch_vcpu_create`.

mod vcpu;
mod vm;

pub use vcpu::{MmioHandler, VcpuExit, VcpuFd};
pub use vm::VmFd;

use kvm_ioctls::Kvm;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KvmError {
    #[error("failed to open /dev/kvm: {0}")]
    OpenKvm(#[source] kvm_ioctls::Error),

    #[error("failed to create VM: {0}")]
    CreateVm(#[source] kvm_ioctls::Error),

    #[error("failed to create vCPU: {0}")]
    CreateVcpu(#[source] kvm_ioctls::Error),

    #[error("failed to initialize vCPU (PSCI/feature setup): {0}")]
    InitVcpu(#[source] kvm_ioctls::Error),

    #[error("failed to register guest memory region: {0}")]
    SetMemoryRegion(#[source] kvm_ioctls::Error),

    #[error("failed to get register {reg:#x}: {source}")]
    GetOneReg {
        reg: u64,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("failed to set register {reg:#x}: {source}")]
    SetOneReg {
        reg: u64,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("failed to list vCPU registers: {0}")]
    GetRegList(#[source] kvm_ioctls::Error),

    #[error("failed to run vCPU: {0}")]
    Run(#[source] kvm_ioctls::Error),

    #[error("GIC setup failed: {0}")]
    Gic(#[from] crate::gic::GicError),

    #[error("failed to register irqfd: {0}")]
    RegisterIrqfd(#[source] kvm_ioctls::Error),

    #[error("failed to get MP state: {0}")]
    GetMpState(#[source] kvm_ioctls::Error),

    #[error("failed to register ioeventfd: {0}")]
    RegisterIoevent(#[source] kvm_ioctls::Error),
}

/// Open `/dev/kvm` and create a new, empty VM. Memory, vCPUs, and the GIC
/// are set up afterward by `vmm.rs` in the aarch64-required order.
pub fn create_vm() -> Result<VmFd, KvmError> {
    let kvm = Kvm::new().map_err(KvmError::OpenKvm)?;
    let vm = kvm.create_vm().map_err(KvmError::CreateVm)?;
    Ok(VmFd::new(vm))
}
