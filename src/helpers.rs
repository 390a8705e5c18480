//! Small daemon-side helpers shared by the launch and build paths: tag
//! generation, pidfile locking, and the `stage_launch.sh` argv/environment
//! construction.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use anyhow::{Context, Result};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::wire::argvec::ArgVec;

/// Mint a fresh 64-hex instance tag from 128 bytes of OS randomness,
/// hashed with SHA-256. The original hashes `(tv_sec, tv_usec, name)`
/// instead; random entropy avoids collisions across concurrent launches of
/// the same image, which is this implementation's redesign of that
/// generator (see DESIGN.md).
pub fn gen_instance_tag() -> String {
    let mut entropy = [0u8; 128];
    rand::thread_rng().fill_bytes(&mut entropy);
    let digest = Sha256::digest(entropy);
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Create `<data_dir>/locks/<tag>.pid`, write the pid, and hold an
/// exclusive advisory lock on it for the instance's lifetime. Dropping the
/// returned `File` releases the lock.
pub fn create_pid_file(cfg: &Config, tag: &str, pid: i32) -> Result<File> {
    std::fs::create_dir_all(cfg.locks_dir()).context("mkdir locks dir")?;
    let path = cfg.locks_dir().join(format!("{tag}.pid"));
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .mode(0o644)
        .open(&path)
        .with_context(|| format!("open pidfile {}", path.display()))?;
    nix::fcntl::flock(
        file.as_raw_fd(),
        nix::fcntl::FlockArg::LockExclusiveNonblock,
    )
    .with_context(|| format!("flock pidfile {}", path.display()))?;
    use std::io::Write;
    let mut f = &file;
    write!(f, "{pid}\n").context("write pidfile")?;
    Ok(file)
}

/// Build the argv and environment for `stage_launch.sh`, matching
/// `dispatch_launch_prison`: `(data_dir, image_name, tag, volumes,
/// network-or-"default", image_tag, ports-or-"none", [entry_point_args])`.
pub struct LaunchArgs {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
}

#[allow(clippy::too_many_arguments)]
pub fn build_launch_args(
    cfg: &Config,
    image_name: &str,
    image_tag: &str,
    tag: &str,
    term: &str,
    volumes: &str,
    network: &str,
    ports: &str,
    entry_point_args: &str,
) -> LaunchArgs {
    let mut cmd = ArgVec::init(16);
    cmd.append("/bin/sh");
    cmd.append(
        cfg.lib_dir()
            .join("stage_launch.sh")
            .to_string_lossy()
            .into_owned(),
    );
    cmd.append(cfg.data_dir().to_string_lossy().into_owned());
    cmd.append(image_name);
    cmd.append(tag);
    cmd.append(volumes);
    cmd.append(if network.is_empty() { "default" } else { network });
    cmd.append(image_tag);
    cmd.append(if ports.is_empty() { "none" } else { ports });
    if !entry_point_args.is_empty() {
        cmd.append(entry_point_args);
    }
    cmd.finalize();

    LaunchArgs {
        argv: cmd.to_exec_args(),
        env: vec![
            ("TERM".into(), term.into()),
            ("USER".into(), "root".into()),
            ("HOME".into(), "/root".into()),
            ("CBLOCK_FS".into(), cfg.underlying_fs().to_string()),
        ],
    }
}

pub fn ensure_data_dirs(cfg: &Config) -> Result<()> {
    for dir in [cfg.locks_dir(), cfg.instances_dir(), cfg.lib_dir()] {
        std::fs::create_dir_all(&dir).with_context(|| format!("mkdir {}", dir.display()))?;
    }
    Ok(())
}

pub fn script_exists(cfg: &Config, name: &str) -> bool {
    Path::new(&cfg.lib_dir().join(name)).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_is_64_hex_chars() {
        let tag = gen_instance_tag();
        assert_eq!(tag.len(), 64);
        assert!(tag.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn tags_are_not_trivially_repeated() {
        let a = gen_instance_tag();
        let b = gen_instance_tag();
        assert_ne!(a, b);
    }

    #[test]
    fn launch_args_use_default_network_and_ports() {
        use clap::Parser;
        let cfg = crate::config::Config::try_parse_from(["cellblockd"]).expect("parse");
        let args = build_launch_args(
            &cfg, "alpine", "latest", "abc123", "xterm", "devfs,", "", "", "",
        );
        assert!(args.argv.contains(&"default".to_string()));
        assert!(args.argv.contains(&"none".to_string()));
        assert!(args
            .env
            .iter()
            .any(|(k, v)| k == "TERM" && v == "xterm"));
    }

    #[test]
    fn pid_file_holds_exclusive_lock() {
        let dir = tempfile::tempdir().expect("tmp");
        use clap::Parser;
        let cfg = crate::config::Config::try_parse_from([
            "cellblockd",
            "--data-dir",
            dir.path().to_str().unwrap(),
        ])
        .expect("parse");
        let tag = "f".repeat(64);
        let file = create_pid_file(&cfg, &tag, 4242).expect("create");
        let second = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(cfg.locks_dir().join(format!("{tag}.pid")))
            .expect("reopen");
        let res = nix::fcntl::flock(
            second.as_raw_fd(),
            nix::fcntl::FlockArg::LockExclusiveNonblock,
        );
        assert!(res.is_err());
        drop(file);
    }
}
