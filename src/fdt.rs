//! Flattened device tree construction.
//!
//! No teacher file grounds this directly (carbon boots via ACPI/MPtable).
//! Grounded on the call shape in
//! `other_examples/e14e61a6_...vm-aarch64.rs` (`dbs_boot::fdt::create_fdt`)
//! and `other_examples/ef60e20f_...aarch64-src-lib.rs` (crosvm's
//! `fdt::create_fdt`), built here with the `vm-fdt` crate since neither
//! `dbs_boot` nor crosvm's in-tree fdt helper is a usable dependency.

use thiserror::Error;
use vm_fdt::FdtWriter;

use crate::gic::{GIC_CPU_BASE, GIC_CPU_SIZE, GIC_DIST_BASE, GIC_DIST_SIZE, GIC_NUM_IRQS};
use crate::memory::DRAM_START;

#[derive(Error, Debug)]
pub enum FdtError {
    #[error("failed to build device tree: {0}")]
    Build(#[source] vm_fdt::Error),
}

impl From<vm_fdt::Error> for FdtError {
    fn from(e: vm_fdt::Error) -> Self {
        FdtError::Build(e)
    }
}

/// A memory-mapped virtio-mmio transport to describe in the device tree.
pub struct VirtioMmioNode {
    pub base: u64,
    pub size: u64,
    pub irq: u32,
}

/// Everything the device tree needs to know about, gathered by `vmm.rs`
/// after the bus and devices have been assembled.
pub struct FdtConfig<'a> {
    pub mem_size: u64,
    pub cmdline: &'a str,
    pub num_vcpus: u32,
    pub vcpu_mpidrs: &'a [u64],
    pub virtio_devices: &'a [VirtioMmioNode],
    pub uart_base: Option<u64>,
    pub uart_irq: u32,
    pub rtc_base: Option<u64>,
    pub rtc_irq: u32,
}

const GIC_PHANDLE: u32 = 1;
/// SPI interrupt type, as used by the `interrupts` property convention.
const GIC_FDT_IRQ_TYPE_SPI: u32 = 0;
const IRQ_TYPE_LEVEL_HI: u32 = 4;

/// Build the flattened device tree blob describing this machine.
pub fn create_fdt(config: &FdtConfig) -> Result<Vec<u8>, FdtError> {
    let mut fdt = FdtWriter::new()?;

    let root = fdt.begin_node("")?;
    fdt.property_string("compatible", "linux,basalt-vmm")?;
    fdt.property_u32("#address-cells", 2)?;
    fdt.property_u32("#size-cells", 2)?;

    let chosen = fdt.begin_node("chosen")?;
    fdt.property_string("bootargs", config.cmdline)?;
    fdt.end_node(chosen)?;

    let cpus = fdt.begin_node("cpus")?;
    fdt.property_u32("#address-cells", 1)?;
    fdt.property_u32("#size-cells", 0)?;
    for (idx, mpidr) in config.vcpu_mpidrs.iter().enumerate() {
        let name = format!("cpu@{idx}");
        let cpu = fdt.begin_node(&name)?;
        fdt.property_string("device_type", "cpu")?;
        fdt.property_string("compatible", "arm,arm-v8")?;
        fdt.property_string("enable-method", "psci")?;
        fdt.property_u32("reg", (*mpidr & 0xff_ffff) as u32)?;
        fdt.end_node(cpu)?;
    }
    fdt.end_node(cpus)?;

    let memory = fdt.begin_node(&format!("memory@{DRAM_START:x}"))?;
    fdt.property_string("device_type", "memory")?;
    fdt.property_array_u64("reg", &[DRAM_START, config.mem_size])?;
    fdt.end_node(memory)?;

    let psci = fdt.begin_node("psci")?;
    fdt.property_string("compatible", "arm,psci-0.2")?;
    fdt.property_string("method", "hvc")?;
    fdt.end_node(psci)?;

    let timer = fdt.begin_node("timer")?;
    fdt.property_string("compatible", "arm,armv8-timer")?;
    fdt.property_u32("interrupt-parent", GIC_PHANDLE)?;
    // Secure/non-secure/virtual/hypervisor PPI timer interrupts, standard set.
    fdt.property_array_u32(
        "interrupts",
        &[
            1, 13, 0xf08, // secure
            1, 14, 0xf08, // non-secure
            1, 11, 0xf08, // virtual
            1, 10, 0xf08, // hypervisor
        ],
    )?;
    fdt.end_node(timer)?;

    let intc_name = format!("intc@{GIC_DIST_BASE:x}");
    let intc = fdt.begin_node(&intc_name)?;
    fdt.property_string("compatible", "arm,cortex-a15-gic")?;
    fdt.property_u32("#interrupt-cells", 3)?;
    fdt.property_null("interrupt-controller")?;
    fdt.property_phandle(GIC_PHANDLE)?;
    fdt.property_array_u64(
        "reg",
        &[GIC_DIST_BASE, GIC_DIST_SIZE, GIC_CPU_BASE, GIC_CPU_SIZE],
    )?;
    fdt.property_u32("num-irqs", GIC_NUM_IRQS)?;
    fdt.end_node(intc)?;

    if let Some(uart_base) = config.uart_base {
        let name = format!("uart@{uart_base:x}");
        let uart = fdt.begin_node(&name)?;
        fdt.property_string("compatible", "ns16550a")?;
        fdt.property_array_u64("reg", &[uart_base, 0x1000])?;
        fdt.property_u32("interrupt-parent", GIC_PHANDLE)?;
        fdt.property_array_u32(
            "interrupts",
            &[GIC_FDT_IRQ_TYPE_SPI, config.uart_irq - 32, IRQ_TYPE_LEVEL_HI],
        )?;
        fdt.property_u32("clock-frequency", 1_843_200)?;
        fdt.end_node(uart)?;

        let alias = fdt.begin_node("aliases")?;
        fdt.property_string("serial0", &name)?;
        fdt.end_node(alias)?;
    }

    if let Some(rtc_base) = config.rtc_base {
        let name = format!("rtc@{rtc_base:x}");
        let rtc = fdt.begin_node(&name)?;
        fdt.property_string("compatible", "arm,pl031")?;
        fdt.property_array_u64("reg", &[rtc_base, 0x1000])?;
        fdt.property_u32("interrupt-parent", GIC_PHANDLE)?;
        fdt.property_array_u32(
            "interrupts",
            &[GIC_FDT_IRQ_TYPE_SPI, config.rtc_irq - 32, IRQ_TYPE_LEVEL_HI],
        )?;
        fdt.end_node(rtc)?;
    }

    for dev in config.virtio_devices {
        let name = format!("virtio_mmio@{:x}", dev.base);
        let node = fdt.begin_node(&name)?;
        fdt.property_string("compatible", "virtio,mmio")?;
        fdt.property_array_u64("reg", &[dev.base, dev.size])?;
        fdt.property_u32("interrupt-parent", GIC_PHANDLE)?;
        fdt.property_array_u32(
            "interrupts",
            &[GIC_FDT_IRQ_TYPE_SPI, dev.irq - 32, IRQ_TYPE_LEVEL_HI],
        )?;
        fdt.end_node(node)?;
    }

    fdt.end_node(root)?;
    let blob = fdt.finish()?;
    Ok(blob)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_fdt_minimal() {
        let config = FdtConfig {
            mem_size: 128 * 1024 * 1024,
            cmdline: "console=ttyAMA0",
            num_vcpus: 1,
            vcpu_mpidrs: &[0x8000_0000],
            virtio_devices: &[],
            uart_base: Some(0x4000_0000),
            uart_irq: 33,
            rtc_base: Some(0x4000_1000),
            rtc_irq: 34,
        };
        let blob = create_fdt(&config).unwrap();
        assert!(!blob.is_empty());
        // FDT blobs begin with the 0xd00dfeed magic.
        assert_eq!(&blob[0..4], &0xd00d_feedu32.to_be_bytes());
    }

    #[test]
    fn test_create_fdt_with_virtio() {
        let devices = vec![VirtioMmioNode {
            base: 0x4000_2000,
            size: 0x200,
            irq: 40,
        }];
        let config = FdtConfig {
            mem_size: 64 * 1024 * 1024,
            cmdline: "console=ttyAMA0",
            num_vcpus: 2,
            vcpu_mpidrs: &[0, 1],
            virtio_devices: &devices,
            uart_base: None,
            uart_irq: 33,
            rtc_base: None,
            rtc_irq: 34,
        };
        let blob = create_fdt(&config).unwrap();
        assert!(!blob.is_empty());
    }
}
