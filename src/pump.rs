//! The PTY pump: a single background thread multiplexing every live
//! instance's PTY master fd, appending output to scrollback, and
//! forwarding to an attached console.
//!
//! Grounded on `tty_io_queue_loop`: reap, build an fd set of live PTYs,
//! wait with a 500ms timeout, then for each ready fd read up to 8KiB and
//! either mark DEAD (EOF) or append+forward (data). The original uses
//! `select()`; this targets `poll()` instead, and swaps the Linux-only
//! `signalfd` trick seen in wormhole's reaper for a portable self-pipe +
//! `sigaction`, since this daemon targets a BSD-style kernel.
//!
//! Runs on a dedicated OS thread, not a tokio task: it blocks in `poll()`
//! and takes `instance_lock` as a plain `std::sync::Mutex`, which must
//! never be held across an `.await` — a constraint the teacher's own
//! async handlers satisfy by keeping locks synchronous and short-lived.

use std::io::Read;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{pipe, read as nix_read};

use crate::config::Config;
use crate::instance::{InstanceRegistry, State};

const READ_CHUNK: usize = 8192;
const POLL_TIMEOUT_MS: u16 = 500;

static SIGCHLD_PIPE_WRITE: AtomicI32 = AtomicI32::new(-1);

extern "C" fn sigchld_relay(_sig: libc::c_int) {
    let fd = SIGCHLD_PIPE_WRITE.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = 1u8;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// Install the `SIGCHLD` handler and return the read end of the wakeup
/// pipe the pump should add to its poll set. Async-signal-safe: the
/// handler only performs a `write(2)` of one byte.
fn install_sigchld_relay() -> anyhow::Result<RawFd> {
    let (read_fd, write_fd) = pipe()?;
    let read_fd = std::os::unix::io::IntoRawFd::into_raw_fd(read_fd);
    let write_fd = std::os::unix::io::IntoRawFd::into_raw_fd(write_fd);
    SIGCHLD_PIPE_WRITE.store(write_fd, Ordering::Relaxed);

    let action = SigAction::new(
        SigHandler::Handler(sigchld_relay),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe {
        signal::sigaction(Signal::SIGCHLD, &action)?;
    }
    Ok(read_fd)
}

/// Framed `{CONSOLE_TO_CLIENT, len, bytes}` write to a raw peer socket fd,
/// performed synchronously while `instance_lock` is held, matching the
/// original's (documented) hazard of writing to the peer under the lock.
fn forward_to_console(peer_fd: RawFd, bytes: &[u8]) -> std::io::Result<()> {
    use crate::wire::Command;
    let cmd = (Command::ConsoleToClient as u32).to_ne_bytes();
    let len = (bytes.len() as u32).to_ne_bytes();
    write_all_raw(peer_fd, &cmd)?;
    write_all_raw(peer_fd, &len)?;
    write_all_raw(peer_fd, bytes)
}

fn write_all_raw(fd: RawFd, mut buf: &[u8]) -> std::io::Result<()> {
    while !buf.is_empty() {
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            return Err(std::io::Error::last_os_error());
        }
        buf = &buf[n as usize..];
    }
    Ok(())
}

/// Spawn the pump thread. Returns its `JoinHandle`; the daemon never
/// joins it under normal operation, it runs for the process lifetime.
pub fn spawn(
    cfg: Arc<Config>,
    registry: Arc<InstanceRegistry>,
) -> anyhow::Result<std::thread::JoinHandle<()>> {
    let sigchld_read_fd = install_sigchld_relay()?;
    Ok(std::thread::spawn(move || run(cfg, registry, sigchld_read_fd)))
}

fn run(cfg: Arc<Config>, registry: Arc<InstanceRegistry>, sigchld_read_fd: RawFd) {
    debug!("pty pump: dispatched");
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let dead = crate::reaper::reap(&registry);
        for inst in dead {
            crate::dispatch::cleanup_instance(cfg.clone(), inst);
        }

        let mut fds: Vec<(String, RawFd)> = Vec::new();
        {
            let guard = registry.lock();
            for (tag, inst) in guard.iter() {
                if !inst.is_dead() {
                    fds.push((tag.clone(), inst.pty_raw_fd()));
                }
            }
        }

        let mut pollfds: Vec<PollFd> = Vec::with_capacity(fds.len() + 1);
        let sigchld_borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(sigchld_read_fd) };
        pollfds.push(PollFd::new(&sigchld_borrowed, PollFlags::POLLIN));
        let borrowed_fds: Vec<_> = fds
            .iter()
            .map(|(_, fd)| unsafe { std::os::fd::BorrowedFd::borrow_raw(*fd) })
            .collect();
        for bf in &borrowed_fds {
            pollfds.push(PollFd::new(bf, PollFlags::POLLIN));
        }

        let n = match poll(&mut pollfds, POLL_TIMEOUT_MS) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                error!("poll(tty io) failed: {e}");
                std::process::exit(1);
            }
        };
        if n == 0 {
            continue;
        }

        if let Some(revents) = pollfds[0].revents() {
            if revents.contains(PollFlags::POLLIN) {
                let mut drain = [0u8; 64];
                let _ = nix_read(sigchld_read_fd, &mut drain);
            }
        }

        let mut guard = registry.lock();
        for (i, (tag, fd)) in fds.iter().enumerate() {
            let revents = match pollfds[i + 1].revents() {
                Some(r) => r,
                None => continue,
            };
            if !revents.contains(PollFlags::POLLIN) {
                continue;
            }
            let cc = unsafe {
                libc::read(*fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            let Some(inst) = guard.get_mut(tag) else {
                continue;
            };
            if cc == 0 {
                debug!("state dead for {tag}");
                inst.state.insert(State::DEAD);
                continue;
            }
            if cc < 0 {
                error!("{tag}: pty read failed: {}", std::io::Error::last_os_error());
                std::process::exit(1);
            }
            let n = cc as usize;
            inst.scrollback.append(&buf[..n]);
            if inst.is_connected() {
                if let Some(peer) = &inst.peer_fd {
                    if let Err(e) = forward_to_console(peer.as_raw_fd(), &buf[..n]) {
                        error!("{tag}: forward to console failed: {e}");
                        std::process::exit(1);
                    }
                }
            }
        }
    }
}
