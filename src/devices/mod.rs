//! Device emulation for the VMM.

mod rtc;
mod serial;
mod tap;
pub mod virtio;

pub use rtc::Rtc;
pub use serial::{SharedSerial, Serial};
pub use tap::{Tap, TapError};
pub use virtio::blk::VirtioBlk;
pub use virtio::net::VirtioNet;
pub use virtio::pmem::VirtioPmem;
pub use virtio::{SharedVirtioMmioTransport, VirtioMmioTransport};
