//! PTY allocation and termios/winsize plumbing.
//!
//! Grounded on `forkpty()` in the original `prison_create`/launch paths and
//! on wormhole's `termios.rs`, adapted to spawn children via
//! `tokio::process::Command` + `pre_exec` instead of a raw `fork()`, which
//! is the idiomatic way to get a controlling terminal under a
//! multithreaded async runtime (`nix::unistd::fork()` is unsound there).

use std::os::unix::io::OwnedFd;
use std::os::unix::process::CommandExt as _;

use anyhow::{Context, Result};
use nix::pty::{openpty, OpenptyResult, Winsize as NixWinsize};
use nix::sys::termios::{tcsetattr, SetArg, Termios};
use nix::unistd::setsid;

use crate::wire::Winsize;

/// A freshly allocated PTY pair: the daemon keeps `master`, the slave path
/// is handed to the child as its controlling terminal.
pub struct Pty {
    pub master: OwnedFd,
    pub slave_path: String,
}

/// Allocate a PTY with the given initial window size.
pub fn allocate(winsize: Winsize) -> Result<Pty> {
    let OpenptyResult { master, slave } = openpty(
        Some(&NixWinsize {
            ws_row: winsize.rows,
            ws_col: winsize.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }),
        None,
    )
    .context("openpty")?;

    let slave_path = nix::pty::ptsname_r(&master).context("ptsname_r")?;
    // The slave fd returned by openpty is only needed by the parent to
    // validate the allocation; the child reopens the pty by path after
    // `setsid`+`TIOCSCTTY` so it gets a controlling terminal.
    drop(slave);

    Ok(Pty { master, slave_path })
}

/// Wire up `pre_exec` on a `tokio::process::Command` so the spawned child
/// detaches from the daemon's session, attaches to `slave_path` as its
/// controlling terminal, and has stdio duped onto the slave. Mirrors the
/// child-side half of `forkpty()`.
pub fn attach_to_slave(cmd: &mut tokio::process::Command, slave_path: String) {
    unsafe {
        cmd.pre_exec(move || {
            setsid().map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            let slave_fd = nix::fcntl::open(
                slave_path.as_str(),
                nix::fcntl::OFlag::O_RDWR,
                nix::sys::stat::Mode::empty(),
            )
            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            nix::ioctl_write_int_bad!(tiocsctty, libc::TIOCSCTTY);
            tiocsctty(slave_fd, 0).map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            libc::dup2(slave_fd, 0);
            libc::dup2(slave_fd, 1);
            libc::dup2(slave_fd, 2);
            if slave_fd > 2 {
                libc::close(slave_fd);
            }
            Ok(())
        });
    }
}

/// Apply a client-supplied termios snapshot to the PTY slave via
/// `tcsetattr(TCSANOW)`. `raw` is opaque bytes whose format is negotiated
/// by the client-side helper library (out of scope here); this daemon
/// treats it as a pre-built `Termios` the caller decoded.
pub fn apply_termios(fd: std::os::unix::io::RawFd, termios: &Termios) -> Result<()> {
    let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
    tcsetattr(&borrowed, SetArg::TCSANOW, termios).context("tcsetattr")
}

/// Apply a winsize to the PTY master via `TIOCSWINSZ`.
pub fn set_winsize(fd: std::os::unix::io::RawFd, winsize: Winsize) -> Result<()> {
    let ws = NixWinsize {
        ws_row: winsize.rows,
        ws_col: winsize.cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, NixWinsize);
    unsafe { tiocswinsz(fd, &ws) }.context("TIOCSWINSZ")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_produces_a_pts_path() {
        let pty = allocate(Winsize { rows: 24, cols: 80 }).expect("openpty");
        assert!(pty.slave_path.starts_with("/dev/pts/"));
    }
}
