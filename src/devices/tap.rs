//! Linux TUN/TAP interface, used both by the VMM-mediated net backend and as
//! the host-side fd handed to `vhost-net`.
//!
//! Ported from `virt-do-lumper`'s `devices/net/tap.rs`, itself carried over
//! from Firecracker: open `/dev/net/tun`, `TUNSETIFF` with `IFF_TAP |
//! IFF_NO_PI | IFF_VNET_HDR`, then `TUNSETOFFLOAD`/`TUNSETVNETHDRSZ` to match
//! negotiated VirtIO offload features. lumper's `ifreq` binding (normally
//! bindgen-generated) is reproduced here by hand since this crate doesn't
//! vendor a `net_gen`-style bindings module.

use std::fs::File;
use std::io::{Error as IoError, Read, Result as IoResult, Write};
use std::os::raw::{c_char, c_short, c_uint, c_ulong};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use virtio_bindings::bindings::virtio_net::{VIRTIO_NET_F_CSUM, VIRTIO_NET_F_HOST_UFO};
use vmm_sys_util::ioctl::{ioctl_with_mut_ref, ioctl_with_ref, ioctl_with_val};
use vmm_sys_util::{ioctl_ioc_nr, ioctl_iow_nr};

const IFACE_NAME_MAX_LEN: usize = 16;

const IFF_TAP: c_uint = 2;
const IFF_NO_PI: c_uint = 4096;
const IFF_VNET_HDR: c_uint = 16384;

const TUN_F_CSUM: c_uint = 1;
const TUN_F_TSO4: c_uint = 2;
const TUN_F_TSO6: c_uint = 4;
const TUN_F_UFO: c_uint = 16;

const TUNTAP: c_uint = 84;
ioctl_iow_nr!(TUNSETIFF, TUNTAP, 202, ::std::os::raw::c_int);
ioctl_iow_nr!(TUNSETOFFLOAD, TUNTAP, 208, ::std::os::raw::c_uint);
ioctl_iow_nr!(TUNSETVNETHDRSZ, TUNTAP, 216, ::std::os::raw::c_int);

#[derive(Debug)]
pub enum TapError {
    InvalidIfName,
    Io(IoError),
    IoCtl(IoError),
}

impl std::fmt::Display for TapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TapError::InvalidIfName => write!(f, "interface name too long"),
            TapError::Io(e) => write!(f, "tap I/O error: {e}"),
            TapError::IoCtl(e) => write!(f, "tap ioctl failed: {e}"),
        }
    }
}

impl std::error::Error for TapError {}

/// Mirrors the kernel's `struct ifreq` closely enough for `TUNSETIFF` and
/// friends: a 16-byte interface name followed by a union we only ever use
/// as `ifr_flags`.
#[repr(C)]
#[derive(Copy, Clone)]
struct IfReq {
    ifr_name: [c_char; IFACE_NAME_MAX_LEN],
    ifr_flags: c_short,
    _pad: [u8; 22],
}

impl Default for IfReq {
    fn default() -> Self {
        Self {
            ifr_name: [0; IFACE_NAME_MAX_LEN],
            ifr_flags: 0,
            _pad: [0; 22],
        }
    }
}

/// Handle for a host TUN/TAP network interface.
///
/// Wraps the file descriptor; the kernel tears the interface down when the
/// fd is closed (on `Drop`).
#[derive(Debug)]
pub struct Tap {
    tap_file: File,
}

impl Tap {
    /// Open (creating if necessary) the named tap interface in persistent,
    /// no-packet-info, vnet-header mode.
    pub fn open_named(if_name: &str) -> Result<Self, TapError> {
        if if_name.len() >= IFACE_NAME_MAX_LEN {
            return Err(TapError::InvalidIfName);
        }
        let mut name_bytes = [0 as c_char; IFACE_NAME_MAX_LEN];
        for (dst, src) in name_bytes.iter_mut().zip(if_name.as_bytes()) {
            *dst = *src as c_char;
        }

        let fd = unsafe {
            libc::open(
                b"/dev/net/tun\0".as_ptr() as *const c_char,
                libc::O_RDWR | libc::O_NONBLOCK,
            )
        };
        if fd < 0 {
            return Err(TapError::Io(IoError::last_os_error()));
        }
        let tuntap = unsafe { File::from_raw_fd(fd) };

        let mut ifreq = IfReq {
            ifr_name: name_bytes,
            ifr_flags: (IFF_TAP | IFF_NO_PI | IFF_VNET_HDR) as c_short,
            _pad: [0; 22],
        };
        let ret = unsafe { ioctl_with_mut_ref(&tuntap, TUNSETIFF(), &mut ifreq) };
        if ret < 0 {
            return Err(TapError::IoCtl(IoError::last_os_error()));
        }

        Ok(Tap { tap_file: tuntap })
    }

    /// Propagate negotiated VirtIO net offload features to the tap device
    /// and tell the kernel the size of the virtio-net header we prepend.
    pub fn activate(&self, virtio_features: u64, virtio_header_size: usize) -> Result<(), TapError> {
        let mut flags: c_uint = 0;
        if virtio_features & (1 << VIRTIO_NET_F_CSUM) != 0 {
            flags |= TUN_F_CSUM;
        }
        if virtio_features & (1 << VIRTIO_NET_F_HOST_UFO) != 0 {
            flags |= TUN_F_UFO | TUN_F_TSO4 | TUN_F_TSO6;
        }

        let ret = unsafe { ioctl_with_val(self, TUNSETOFFLOAD(), flags as c_ulong) };
        if ret < 0 {
            return Err(TapError::IoCtl(IoError::last_os_error()));
        }

        let ret = unsafe { ioctl_with_ref(self, TUNSETVNETHDRSZ(), &(virtio_header_size as i32)) };
        if ret < 0 {
            return Err(TapError::IoCtl(IoError::last_os_error()));
        }

        Ok(())
    }
}

impl Read for Tap {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        self.tap_file.read(buf)
    }
}

impl Write for Tap {
    fn write(&mut self, buf: &[u8]) -> IoResult<usize> {
        self.tap_file.write(buf)
    }

    fn flush(&mut self) -> IoResult<()> {
        Ok(())
    }
}

impl AsRawFd for Tap {
    fn as_raw_fd(&self) -> RawFd {
        self.tap_file.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ifname_too_long_is_rejected() {
        let name = "a".repeat(IFACE_NAME_MAX_LEN);
        let err = Tap::open_named(&name).unwrap_err();
        assert!(matches!(err, TapError::InvalidIfName));
    }
}
