//! GICv2 interrupt controller device creation, programming, and save/restore.
//!
//! Carbon has no equivalent (x86 uses the in-kernel PIC/IOAPIC via
//! `create_irq_chip`); this is grounded on
//! `other_examples/e14e61a6_...vm-aarch64.rs` (dragonball's
//! `dbs_arch::gic::create_gic` call and the vCPU-before-GIC creation
//! ordering) and `other_examples/ef60e20f_...aarch64-src-lib.rs` (crosvm's
//! GIC base/size constants and save/restore attribute loop), adapted to the
//! teacher's `KvmError`-wrapping idiom from `kvm/mod.rs`.

use kvm_bindings::{
    kvm_device_attr, KVM_DEV_ARM_VGIC_CTRL_INIT, KVM_DEV_ARM_VGIC_GRP_ADDR,
    KVM_DEV_ARM_VGIC_GRP_CTRL, KVM_DEV_ARM_VGIC_GRP_NR_IRQS, KVM_DEV_TYPE_ARM_VGIC_V2,
    KVM_VGIC_V2_ADDR_TYPE_CPU, KVM_VGIC_V2_ADDR_TYPE_DIST,
};
use kvm_ioctls::{DeviceFd, VmFd as KvmVmFd};
use thiserror::Error;

/// CPU interface MMIO base address. Address order below `MMIO_START` is
/// `[0, GIC_CPU) unused, GIC_CPU_BASE, GIC_DIST_BASE, MMIO_START`.
pub const GIC_CPU_BASE: u64 = crate::mmio_bus::MMIO_START - 0x10_000;
/// CPU interface MMIO region size.
pub const GIC_CPU_SIZE: u64 = 0x2000;
/// Distributor MMIO base address (immediately follows the CPU interface).
pub const GIC_DIST_BASE: u64 = GIC_CPU_BASE + GIC_CPU_SIZE;
/// Distributor MMIO region size.
pub const GIC_DIST_SIZE: u64 = 0x1000;

/// Number of SPIs supported. Must be > 32, < 1024, and a multiple of 32.
pub const GIC_NUM_IRQS: u32 = 96;

#[derive(Error, Debug)]
pub enum GicError {
    #[error("failed to create VGIC v2 device: {0}")]
    CreateDevice(#[source] kvm_ioctls::Error),

    #[error("failed to set VGIC device attribute (group {group}, attr {attr}): {source}")]
    SetAttr {
        group: u32,
        attr: u64,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("failed to get VGIC device attribute (group {group}, attr {attr}): {source}")]
    GetAttr {
        group: u32,
        attr: u64,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("failed to initialize VGIC control")]
    Init(#[source] kvm_ioctls::Error),
}

/// A created, initialized GICv2 device, ready for interrupt injection.
pub struct Gic {
    device: DeviceFd,
}

impl Gic {
    /// Create and initialize a GICv2 device.
    ///
    /// Must be called *after* all vCPUs have been created: on aarch64
    /// `KVM_CREATE_VCPU` fails once the IRQCHIP is already initialized
    /// (see `arch/arm64/kvm/arm.c`, `kvm_arch_vcpu_create`).
    pub fn create(vm: &KvmVmFd, num_vcpus: u32) -> Result<Self, GicError> {
        let mut device_config = kvm_bindings::kvm_create_device {
            type_: KVM_DEV_TYPE_ARM_VGIC_V2,
            fd: 0,
            flags: 0,
        };
        let device = vm
            .create_device(&mut device_config)
            .map_err(GicError::CreateDevice)?;

        let dist_attr = kvm_device_attr {
            group: KVM_DEV_ARM_VGIC_GRP_ADDR,
            attr: KVM_VGIC_V2_ADDR_TYPE_DIST as u64,
            addr: &GIC_DIST_BASE as *const u64 as u64,
            flags: 0,
        };
        unsafe { device.set_device_attr(&dist_attr) }.map_err(|source| GicError::SetAttr {
            group: KVM_DEV_ARM_VGIC_GRP_ADDR,
            attr: KVM_VGIC_V2_ADDR_TYPE_DIST as u64,
            source,
        })?;

        let cpu_attr = kvm_device_attr {
            group: KVM_DEV_ARM_VGIC_GRP_ADDR,
            attr: KVM_VGIC_V2_ADDR_TYPE_CPU as u64,
            addr: &GIC_CPU_BASE as *const u64 as u64,
            flags: 0,
        };
        unsafe { device.set_device_attr(&cpu_attr) }.map_err(|source| GicError::SetAttr {
            group: KVM_DEV_ARM_VGIC_GRP_ADDR,
            attr: KVM_VGIC_V2_ADDR_TYPE_CPU as u64,
            source,
        })?;

        let mut nr_irqs = GIC_NUM_IRQS;
        let nr_irqs_attr = kvm_device_attr {
            group: KVM_DEV_ARM_VGIC_GRP_NR_IRQS,
            attr: 0,
            addr: &mut nr_irqs as *mut u32 as u64,
            flags: 0,
        };
        unsafe { device.set_device_attr(&nr_irqs_attr) }.map_err(|source| GicError::SetAttr {
            group: KVM_DEV_ARM_VGIC_GRP_NR_IRQS,
            attr: 0,
            source,
        })?;

        let init_attr = kvm_device_attr {
            group: KVM_DEV_ARM_VGIC_GRP_CTRL,
            attr: KVM_DEV_ARM_VGIC_CTRL_INIT as u64,
            addr: 0,
            flags: 0,
        };
        unsafe { device.set_device_attr(&init_attr) }.map_err(GicError::Init)?;

        eprintln!(
            "[gic] GICv2 created for {num_vcpus} vCPU(s): dist={GIC_DIST_BASE:#x} cpu={GIC_CPU_BASE:#x} irqs={GIC_NUM_IRQS}"
        );

        Ok(Self { device })
    }

    /// Raw device fd, for setting up irqfd routing on the vCPU/devices side.
    pub fn device_fd(&self) -> &DeviceFd {
        &self.device
    }

    /// Save every distributor and per-vCPU CPU-interface register for
    /// snapshotting. Registers are 32 bits wide on GICv2; each saved value
    /// carries the attribute group/offset needed to restore it.
    pub fn save(&self, num_vcpus: u32) -> Result<Vec<GicRegister>, GicError> {
        let mut out = Vec::new();
        for &(offset, count) in DIST_OFFSETS {
            for i in 0..count {
                let attr = offset + i as u64 * 4;
                let value = self.get_dist_attr(attr)?;
                out.push(GicRegister { cpu: None, offset: attr, value });
            }
        }
        for cpu in 0..num_vcpus {
            for &offset in CPU_OFFSETS {
                let value = self.get_cpu_attr(cpu, offset)?;
                out.push(GicRegister {
                    cpu: Some(cpu),
                    offset,
                    value,
                });
            }
        }
        Ok(out)
    }

    /// Restore registers saved by [`save`]. Per spec, the CLEAR (`IC*`)
    /// registers are written before the corresponding SET (`IS*`) ones;
    /// otherwise a guest observing pending/active interrupts left over from
    /// the old state stalls.
    pub fn restore(&self, regs: &[GicRegister]) -> Result<(), GicError> {
        for &(base, count) in CLEAR_BEFORE_SET_OFFSETS {
            for i in 0..count {
                self.set_dist_attr(base + i as u64 * 4, 0xffff_ffff)?;
            }
        }
        for reg in regs {
            match reg.cpu {
                None => self.set_dist_attr(reg.offset, reg.value)?,
                Some(cpu) => self.set_cpu_attr(cpu, reg.offset, reg.value)?,
            }
        }
        Ok(())
    }

    fn get_dist_attr(&self, offset: u64) -> Result<u32, GicError> {
        let mut value: u32 = 0;
        let attr = kvm_device_attr {
            group: KVM_DEV_ARM_VGIC_GRP_DIST_REGS,
            attr: offset,
            addr: &mut value as *mut u32 as u64,
            flags: 0,
        };
        unsafe { self.device.get_device_attr(&attr) }.map_err(|source| GicError::GetAttr {
            group: KVM_DEV_ARM_VGIC_GRP_DIST_REGS,
            attr: offset,
            source,
        })?;
        Ok(value)
    }

    fn set_dist_attr(&self, offset: u64, value: u32) -> Result<(), GicError> {
        let mut value = value;
        let attr = kvm_device_attr {
            group: KVM_DEV_ARM_VGIC_GRP_DIST_REGS,
            attr: offset,
            addr: &mut value as *mut u32 as u64,
            flags: 0,
        };
        unsafe { self.device.set_device_attr(&attr) }.map_err(|source| GicError::SetAttr {
            group: KVM_DEV_ARM_VGIC_GRP_DIST_REGS,
            attr: offset,
            source,
        })
    }

    fn get_cpu_attr(&self, cpu: u32, offset: u64) -> Result<u32, GicError> {
        let mut value: u32 = 0;
        let encoded = ((cpu as u64) << KVM_DEV_ARM_VGIC_CPUID_SHIFT) | offset;
        let attr = kvm_device_attr {
            group: KVM_DEV_ARM_VGIC_GRP_CPU_REGS,
            attr: encoded,
            addr: &mut value as *mut u32 as u64,
            flags: 0,
        };
        unsafe { self.device.get_device_attr(&attr) }.map_err(|source| GicError::GetAttr {
            group: KVM_DEV_ARM_VGIC_GRP_CPU_REGS,
            attr: encoded,
            source,
        })?;
        Ok(value)
    }

    fn set_cpu_attr(&self, cpu: u32, offset: u64, value: u32) -> Result<(), GicError> {
        let mut value = value;
        let encoded = ((cpu as u64) << KVM_DEV_ARM_VGIC_CPUID_SHIFT) | offset;
        let attr = kvm_device_attr {
            group: KVM_DEV_ARM_VGIC_GRP_CPU_REGS,
            attr: encoded,
            addr: &mut value as *mut u32 as u64,
            flags: 0,
        };
        unsafe { self.device.set_device_attr(&attr) }.map_err(|source| GicError::SetAttr {
            group: KVM_DEV_ARM_VGIC_GRP_CPU_REGS,
            attr: encoded,
            source,
        })
    }
}

/// One saved GICv2 register: a distributor register (`cpu: None`) or a
/// per-vCPU CPU-interface register.
#[derive(Clone, Copy, Debug)]
pub struct GicRegister {
    cpu: Option<u32>,
    offset: u64,
    value: u32,
}

/// `KVM_DEV_ARM_VGIC_GRP_DIST_REGS`: distributor register group. Not
/// re-exported by every `kvm-bindings` version, so hardcoded against the
/// stable UAPI in `<linux/kvm.h>`, same approach as `kvm/vcpu.rs`'s core
/// register ids.
const KVM_DEV_ARM_VGIC_GRP_DIST_REGS: u32 = 3;
/// `KVM_DEV_ARM_VGIC_GRP_CPU_REGS`: per-vCPU CPU-interface register group.
const KVM_DEV_ARM_VGIC_GRP_CPU_REGS: u32 = 4;
/// Bit position the vCPU id is encoded at within a CPU-interface attr id.
const KVM_DEV_ARM_VGIC_CPUID_SHIFT: u64 = 32;

/// Distributor `(offset, word_count)` records covering the GICv2 register
/// file actually touched by a guest: control, the three 1-bit-per-irq
/// banks, the 8-bit priority/target banks, and the 2-bit config bank.
/// `GIC_NUM_IRQS` is 96, so word counts below are `96/32 = 3`,
/// `96/4 = 24`, and `96/16 = 6` respectively.
const DIST_OFFSETS: &[(u64, u32)] = &[
    (0x000, 1), // GICD_CTLR
    (0x100, 3), // GICD_ISENABLER
    (0x200, 3), // GICD_ISPENDR
    (0x300, 3), // GICD_ISACTIVER
    (0x400, 24), // GICD_IPRIORITYR
    (0x800, 24), // GICD_ITARGETSR
    (0xc00, 6), // GICD_ICFGR
];

/// `ICENABLER`/`ICPENDR`/`ICACTIVER` offsets, each the matching `IS*`
/// register's offset plus `0x80`. Writing all-ones clears every bank
/// before the saved `IS*` state is written back.
const CLEAR_BEFORE_SET_OFFSETS: &[(u64, u32)] = &[
    (0x100 + 0x80, 3),
    (0x200 + 0x80, 3),
    (0x300 + 0x80, 3),
];

/// CPU-interface register offsets saved/restored per vCPU.
const CPU_OFFSETS: &[u64] = &[0x00, 0x04, 0x08, 0x1c, 0xd0, 0xd4, 0xd8, 0xdc];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_well_formed() {
        assert!(GIC_NUM_IRQS > 32);
        assert!(GIC_NUM_IRQS < 1024);
        assert_eq!(GIC_NUM_IRQS % 32, 0);
        assert_eq!(GIC_DIST_SIZE, 0x1000);
        assert_eq!(GIC_CPU_SIZE, 0x2000);
        assert_eq!(GIC_DIST_BASE, GIC_CPU_BASE + GIC_CPU_SIZE);
        assert!(GIC_DIST_BASE + GIC_DIST_SIZE <= crate::mmio_bus::MMIO_START);
    }

    #[test]
    fn test_dist_offsets_cover_expected_irq_word_counts() {
        assert_eq!((GIC_NUM_IRQS / 32) as u32, 3);
        assert_eq!((GIC_NUM_IRQS / 4) as u32, 24);
        assert_eq!((GIC_NUM_IRQS / 16) as u32, 6);
        for &(_, count) in DIST_OFFSETS {
            assert!(count == 1 || count == 3 || count == 24 || count == 6);
        }
    }

    #[test]
    fn test_clear_before_set_offsets_match_is_plus_0x80() {
        for (&(is_offset, is_count), &(clear_offset, clear_count)) in
            [(0x100u64, 3u32), (0x200, 3), (0x300, 3)]
                .iter()
                .zip(CLEAR_BEFORE_SET_OFFSETS)
        {
            assert_eq!(clear_offset, is_offset + 0x80);
            assert_eq!(clear_count, is_count);
        }
    }
}
