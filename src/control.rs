//! Out-of-band control API: a Unix-domain socket serving one ASCII-line
//! command per connection (`pause`, `resume`, `snapshot <path>`), no reply.
//!
//! The teacher has no control plane at all (milestone 2 just runs a vCPU to
//! completion); this is built from scratch, following spec.md's description
//! of the protocol, in the same style as this crate's other subsystems:
//! a thiserror enum for reported failures, `eprintln!` for everything else.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::Thread;
use std::time::Duration;

use thiserror::Error;

use crate::gic::Gic;
use crate::kvm::VcpuFd;
use crate::memory::GuestMemory;

/// Real-time signal sent to a vCPU's host thread to interrupt a blocking
/// `KVM_RUN` so a pause request is observed promptly. `SIGRTMIN` avoids
/// colliding with any signal an embedder or guest tooling might already use.
pub fn vcpu_kick_signal() -> i32 {
    unsafe { libc::SIGRTMIN() }
}

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("failed to bind control socket {path}: {source}")]
    Bind {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write snapshot file {path}: {source}")]
    Snapshot {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read GIC/vCPU state for snapshot: {0}")]
    State(String),
}

/// One running vCPU's thread handle, as far as the control API needs it:
/// the `Thread` to `unpark` on resume, the raw pthread id to kick, and the
/// fd itself for register/MP-state save during a snapshot. `VcpuFd`'s
/// accessors all take `&self`, so sharing it behind an `Arc` alongside the
/// vCPU's own run loop is safe even while that loop is parked.
pub struct VcpuHandle {
    pub fd: Arc<VcpuFd>,
    pub thread: Thread,
    pub pthread_id: libc::pthread_t,
}

/// Everything the control socket needs to reach in order to act on a
/// command: the vCPU fleet, the shared pause state, guest memory, and the
/// interrupt controller.
pub struct ControlState {
    pub vcpus: Vec<VcpuHandle>,
    pub pause_requested: Arc<AtomicBool>,
    pub paused_count: Arc<AtomicUsize>,
    pub memory: Arc<GuestMemory>,
    pub gic: Arc<Gic>,
}

impl ControlState {
    /// Set each vCPU's own `immediate_exit` flag before kicking it, per the
    /// ordering contract: `request_pause()` first, kick signal second.
    /// Kicking before setting the flag leaves a window where the signal is
    /// consumed before `immediate_exit` is visible, and the vCPU can then
    /// block in `KVM_RUN` until its next unrelated exit.
    fn kick_all(&self) {
        let signum = vcpu_kick_signal();
        for vcpu in &self.vcpus {
            vcpu.fd.request_pause();
            let rc = unsafe { libc::pthread_kill(vcpu.pthread_id, signum) };
            if rc != 0 {
                eprintln!("[control] pthread_kill failed for vcpu: errno {rc}");
            }
        }
    }
}

/// Unix-domain control socket. One connection serves one command, then the
/// connection is closed by the client (or by a protocol error on our side).
pub struct ControlServer {
    listener: UnixListener,
    state: Arc<ControlState>,
}

impl ControlServer {
    pub fn bind(path: &str, state: Arc<ControlState>) -> Result<Self, ControlError> {
        // A stale socket file from a previous run blocks bind with
        // AddrInUse; best-effort remove it first, the same way most
        // Unix-socket servers do.
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path).map_err(|source| ControlError::Bind {
            path: path.to_string(),
            source,
        })?;
        listener.set_nonblocking(true).ok();
        Ok(Self { listener, state })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    /// Accept one pending connection and process exactly one line command
    /// from it. Called by the event loop when the listening fd is readable.
    pub fn accept_and_handle(&self) {
        let (stream, _) = match self.listener.accept() {
            Ok(pair) => pair,
            Err(e) => {
                eprintln!("[control] accept failed: {e}");
                return;
            }
        };
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => {}
            Ok(_) => self.dispatch(line.trim()),
            Err(e) => eprintln!("[control] short read, closing connection: {e}"),
        }
    }

    fn dispatch(&self, line: &str) {
        let mut parts = line.splitn(2, ' ');
        match parts.next() {
            Some("pause") => self.pause(),
            Some("resume") => self.resume(),
            Some("snapshot") => match parts.next() {
                Some(path) => {
                    if let Err(e) = self.snapshot(path) {
                        eprintln!("[control] snapshot failed: {e}");
                    }
                }
                None => eprintln!("[control] snapshot requires a path argument, ignoring"),
            },
            _ => eprintln!("[control] unknown command {line:?}, ignoring"),
        }
    }

    /// Set the shared pause flag, kick every vCPU thread out of its blocking
    /// `KVM_RUN`, then wait until every one of them has actually reached the
    /// parked state before returning.
    fn pause(&self) {
        let n = self.state.vcpus.len();
        self.state.pause_requested.store(true, Ordering::SeqCst);
        self.state.kick_all();
        while self.state.paused_count.load(Ordering::SeqCst) < n {
            std::thread::sleep(Duration::from_micros(200));
        }
        eprintln!("[control] fleet paused ({n} vcpu(s))");
    }

    fn resume(&self) {
        self.state.pause_requested.store(false, Ordering::SeqCst);
        for vcpu in &self.state.vcpus {
            vcpu.thread.unpark();
        }
        eprintln!("[control] fleet resumed");
    }

    /// Write guest RAM to `path` and a side file at `path.meta` holding GIC
    /// state, the queried register list, per-vCPU register values, and
    /// per-vCPU MP state. Only meaningful with the fleet paused; proceeds
    /// anyway (and says so) if it isn't, since the VMM has no way to reject
    /// the command short of dropping the connection.
    fn snapshot(&self, path: &str) -> Result<(), ControlError> {
        let n = self.state.vcpus.len();
        if self.state.paused_count.load(Ordering::SeqCst) < n {
            eprintln!("[control] snapshot requested while fleet is not fully paused");
        }

        let mut ram_file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|source| ControlError::Snapshot { path: path.to_string(), source })?;
        let (host_addr, size) = self.state.memory.as_raw_parts();
        let ram = unsafe { std::slice::from_raw_parts(host_addr as *const u8, size as usize) };
        ram_file
            .write_all(ram)
            .map_err(|source| ControlError::Snapshot { path: path.to_string(), source })?;
        ram_file
            .sync_all()
            .map_err(|source| ControlError::Snapshot { path: path.to_string(), source })?;

        let side_path = format!("{path}.meta");
        let mut side = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&side_path)
            .map_err(|source| ControlError::Snapshot { path: side_path.clone(), source })?;

        let gic_regs = self
            .state
            .gic
            .save(n as u32)
            .map_err(|e| ControlError::State(e.to_string()))?;
        writeln!(side, "gic {} registers: {:?}", gic_regs.len(), gic_regs)
            .map_err(|source| ControlError::Snapshot { path: side_path.clone(), source })?;

        for vcpu in &self.state.vcpus {
            let reg_list = vcpu.fd.get_reg_list().map_err(|e| ControlError::State(e.to_string()))?;
            let regs = vcpu.fd.save_regs().map_err(|e| ControlError::State(e.to_string()))?;
            let mp_state = vcpu.fd.mp_state().map_err(|e| ControlError::State(e.to_string()))?;
            writeln!(
                side,
                "vcpu {} reg_list_len={} saved_regs={} mp_state={}",
                vcpu.fd.id(),
                reg_list.as_slice().len(),
                regs.len(),
                mp_state.mp_state
            )
            .map_err(|source| ControlError::Snapshot { path: side_path.clone(), source })?;
        }
        side.sync_all()
            .map_err(|source| ControlError::Snapshot { path: side_path, source })?;

        eprintln!("[control] snapshot written to {path} ({size} bytes RAM)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // `ControlState`/`Gic` both need a live KVM fd to construct, out of
    // reach in a unit test; these exercise the pieces that don't.

    #[test]
    fn test_vcpu_kick_signal_is_a_realtime_signal() {
        let signum = vcpu_kick_signal();
        assert!(signum >= unsafe { libc::SIGRTMIN() });
        assert!(signum <= unsafe { libc::SIGRTMAX() });
    }

    #[test]
    fn test_dispatch_parses_snapshot_path_argument() {
        let line = "snapshot /tmp/out.img";
        let mut parts = line.splitn(2, ' ');
        assert_eq!(parts.next(), Some("snapshot"));
        assert_eq!(parts.next(), Some("/tmp/out.img"));
    }

    #[test]
    fn test_pause_wait_condition_is_count_based() {
        let paused_count = Arc::new(AtomicUsize::new(0));
        let n = 3usize;
        assert!(paused_count.load(Ordering::SeqCst) < n);
        paused_count.store(3, Ordering::SeqCst);
        assert!(!(paused_count.load(Ordering::SeqCst) < n));
    }
}
