//! basalt - a minimal aarch64/KVM virtual machine monitor.
//!
//! This VMM requires Linux with KVM support. It will not run on other platforms.

#[cfg(target_os = "linux")]
mod config;
#[cfg(target_os = "linux")]
mod control;
#[cfg(target_os = "linux")]
mod devices;
#[cfg(target_os = "linux")]
mod event_loop;
#[cfg(target_os = "linux")]
mod fdt;
#[cfg(target_os = "linux")]
mod gic;
#[cfg(target_os = "linux")]
mod irq;
#[cfg(target_os = "linux")]
mod kvm;
#[cfg(target_os = "linux")]
mod memory;
#[cfg(target_os = "linux")]
mod mmio_bus;
#[cfg(target_os = "linux")]
mod vmm;

use clap::Parser;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "basalt")]
#[command(about = "A minimal aarch64/KVM virtual machine monitor")]
struct Args {
    /// Path to the TOML machine configuration file
    #[arg(long)]
    config_path: String,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

#[cfg(target_os = "linux")]
fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    use config::Config;
    use vmm::Vmm;

    eprintln!("[vmm] basalt starting...");
    let config = Config::load(&args.config_path)?;
    eprintln!("[vmm] config loaded from {}", args.config_path);

    let machine = Vmm::boot(config)?;
    eprintln!("[vmm] machine booted, entering event loop");
    machine.run();

    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn run(_args: Args) -> Result<(), Box<dyn std::error::Error>> {
    Err("basalt requires Linux with KVM support. This platform is not supported.".into())
}
