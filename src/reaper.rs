//! SIGCHLD-triggered sweep that non-blockingly collects exited children.
//!
//! Grounded on `prison_reap_children`: a `TAILQ_FOREACH_SAFE` over the
//! registry calling `waitpid(WNOHANG)` per instance. The pump calls this
//! unconditionally every cycle (not gated on the signal flag), which is
//! cheap because `WNOHANG` makes every call non-blocking regardless of
//! whether `SIGCHLD` actually fired.

use std::sync::Arc;

use log::info;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::instance::InstanceRegistry;

/// One sweep over the registry. Returns the tags of instances that were
/// found dead this cycle, already removed from the registry; the caller
/// (the pump) is responsible for the cleanup-outside-lock step
/// (`Instance::into_cleanup`).
pub fn reap(registry: &Arc<InstanceRegistry>) -> Vec<crate::instance::Instance> {
    let mut collected = Vec::new();
    let mut guard = registry.lock();
    let dead_tags: Vec<String> = guard
        .iter()
        .filter_map(|(tag, inst)| {
            if inst.is_dead() {
                return Some(tag.clone());
            }
            match waitpid(Pid::from_raw(inst.pid), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(_) => None,
                Ok(_exited) => Some(tag.clone()),
            }
        })
        .collect();
    for tag in dead_tags {
        if let Some(mut inst) = guard.remove(&tag) {
            inst.state.insert(crate::instance::State::DEAD);
            info!("collected exit status from proc {} ({})", inst.pid, tag);
            collected.push(inst);
        }
    }
    collected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{Instance, InstanceKind, State};
    use crate::scrollback::Scrollback;
    use std::os::unix::io::{FromRawFd, OwnedFd};

    fn dummy_fd() -> OwnedFd {
        let fds = nix::unistd::pipe().expect("pipe");
        unsafe { OwnedFd::from_raw_fd(fds.0) }
    }

    #[test]
    fn reaps_exited_child() {
        let registry = Arc::new(InstanceRegistry::new());
        // A short-lived child we can reap deterministically.
        let child = nix::unistd::fork().expect("fork");
        let pid = match child {
            nix::unistd::ForkResult::Parent { child } => child.as_raw(),
            nix::unistd::ForkResult::Child => {
                std::process::exit(0);
            }
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        registry.insert(Instance {
            tag: "d".repeat(64),
            image_name: "alpine".into(),
            image_tag: "latest".into(),
            kind: InstanceKind::Regular,
            pid,
            pty_fd: dummy_fd(),
            pty_name: "/dev/pts/9".into(),
            scrollback: Scrollback::new(),
            state: State::empty(),
            peer_fd: None,
            launch_time: 0,
            pid_file: None,
            sync_pipe_write: None,
        });
        let dead = reap(&registry);
        assert_eq!(dead.len(), 1);
        assert!(registry.is_empty());
    }
}
