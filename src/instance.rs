//! Instance data model and the process-wide instance registry.
//!
//! A single `std::sync::Mutex` (not `tokio::sync::Mutex`) guards the
//! registry: the PTY pump runs on a dedicated blocking OS thread and must
//! never `.await` while holding it, so the lock has to be the synchronous
//! flavor shared between that thread and the async peer tasks.

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::Mutex;

use bitflags::bitflags;

use crate::scrollback::Scrollback;

bitflags! {
    #[derive(Default)]
    pub struct State: u32 {
        const CONNECTED = 0b01;
        const DEAD      = 0b10;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceKind {
    Regular,
    Build,
}

impl InstanceKind {
    /// String form handed to `stage_launch_cleanup.sh` as its third
    /// positional argument.
    pub fn as_helper_arg(self) -> &'static str {
        match self {
            InstanceKind::Regular => "regular",
            InstanceKind::Build => "build",
        }
    }
}

/// One live container instance.
pub struct Instance {
    pub tag: String,
    pub image_name: String,
    pub image_tag: String,
    pub kind: InstanceKind,
    pub pid: i32,
    pub pty_fd: OwnedFd,
    pub pty_name: String,
    pub scrollback: Scrollback,
    pub state: State,
    /// Dup'd fd of the attached console's socket, owned independently of
    /// the peer task's own handle so the pump can write to it without
    /// racing the peer task's close/fd-reuse. Present iff `CONNECTED`.
    pub peer_fd: Option<OwnedFd>,
    pub launch_time: i64,
    /// Held for the instance's lifetime under an exclusive advisory lock.
    pub pid_file: Option<File>,
    /// BUILD-kind only: write end of the rendezvous pipe that unblocks the
    /// build child once a console attaches. `None` for REGULAR instances
    /// and for BUILD instances past the rendezvous point.
    pub sync_pipe_write: Option<OwnedFd>,
}

impl Instance {
    pub fn is_connected(&self) -> bool {
        self.state.contains(State::CONNECTED)
    }

    pub fn is_dead(&self) -> bool {
        self.state.contains(State::DEAD)
    }

    pub fn short_tag(&self) -> &str {
        &self.tag[..10.min(self.tag.len())]
    }

    pub fn pty_raw_fd(&self) -> RawFd {
        self.pty_fd.as_raw_fd()
    }
}

/// Process-wide mutable collection of live instances, keyed by full tag.
#[derive(Default)]
pub struct InstanceRegistry {
    inner: Mutex<HashMap<String, Instance>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        InstanceRegistry {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instance>> {
        self.inner.lock().expect("instance_lock poisoned")
    }

    pub fn insert(&self, instance: Instance) {
        let mut guard = self.lock();
        guard.insert(instance.tag.clone(), instance);
    }

    pub fn remove(&self, tag: &str) -> Option<Instance> {
        let mut guard = self.lock();
        guard.remove(tag)
    }

    /// Resolve a user-supplied identifier. Exactly 10 characters means
    /// prefix match against the stored tag; anything else means full
    /// equality. First match wins on prefix collision (documented open
    /// question, not guarded against).
    pub fn resolve_tag(&self, query: &str) -> Option<String> {
        let guard = self.lock();
        if query.len() == 10 {
            guard
                .values()
                .find(|inst| inst.short_tag() == query)
                .map(|inst| inst.tag.clone())
        } else {
            guard.contains_key(query).then(|| query.to_string())
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::FromRawFd;

    fn dummy_fd() -> OwnedFd {
        let fds = nix::unistd::pipe().expect("pipe");
        unsafe { OwnedFd::from_raw_fd(fds.0) }
    }

    fn dummy_instance(tag: &str) -> Instance {
        Instance {
            tag: tag.to_string(),
            image_name: "alpine".into(),
            image_tag: "latest".into(),
            kind: InstanceKind::Regular,
            pid: 1234,
            pty_fd: dummy_fd(),
            pty_name: "/dev/pts/3".into(),
            scrollback: Scrollback::new(),
            state: State::empty(),
            peer_fd: None,
            launch_time: 0,
            pid_file: None,
            sync_pipe_write: None,
        }
    }

    #[test]
    fn connected_iff_peer_fd_present() {
        let mut inst = dummy_instance("a".repeat(64).as_str());
        assert!(!inst.is_connected());
        inst.state.insert(State::CONNECTED);
        inst.peer_fd = Some(dummy_fd());
        assert!(inst.is_connected());
    }

    #[test]
    fn resolve_by_full_tag() {
        let reg = InstanceRegistry::new();
        let tag = "b".repeat(64);
        reg.insert(dummy_instance(&tag));
        assert_eq!(reg.resolve_tag(&tag), Some(tag.clone()));
        assert_eq!(reg.resolve_tag("nonexistent"), None);
    }

    #[test]
    fn resolve_by_ten_char_prefix() {
        let reg = InstanceRegistry::new();
        let tag = "deadbeef00aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_string();
        reg.insert(dummy_instance(&tag));
        assert_eq!(reg.resolve_tag("deadbeef00"), Some(tag));
        assert_eq!(reg.resolve_tag("deadbeefXX"), None);
    }

    #[test]
    fn tag_uniqueness_last_insert_wins_on_collision() {
        let reg = InstanceRegistry::new();
        let tag = "c".repeat(64);
        reg.insert(dummy_instance(&tag));
        reg.insert(dummy_instance(&tag));
        assert_eq!(reg.len(), 1);
    }
}
