//! Two-phase build engine: receive a build context, then drive stages.
//!
//! Grounded on `build.c`: `build_emit_shell_script` (script text, emitted
//! verbatim below), `build_get_stage_deps`, `build_init_stage`,
//! `build_run_build_stage` (abort-on-first-failure semantics), and
//! `build_commit_image`. Helper processes are spawned with
//! `tokio::process::Command` instead of raw `fork`/`execve`, with their
//! stdout/stderr duped onto the client socket so build output streams live
//! the same way the client stream teeing does for generic commands.

use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::process::Command;

use crate::config::Config;
use crate::wire::headers::{BuildContextHeader, StageRecord, StepOp, StepRecord};

/// One queued build: the header plus its stage/step arrays, keyed by
/// (image_name, tag) the way `build_lookup_queued_context` keys
/// `bc_head`, except here phase 1 and phase 2 run inline on the same
/// connection so no global queue is needed.
pub struct BuildContext {
    pub header: BuildContextHeader,
    pub stages: Vec<StageRecord>,
    pub steps: Vec<StepRecord>,
    pub instance_tag: String,
    pub build_root: PathBuf,
}

impl BuildContext {
    pub fn context_archive(&self, cfg: &Config) -> PathBuf {
        cfg.instances_dir()
            .join(format!("{}.tar.gz", self.instance_tag))
    }

    fn stage_deps(&self, stage_index: u32) -> String {
        let mut deps: Vec<String> = self
            .steps
            .iter()
            .filter(|s| s.stage_index == stage_index)
            .filter_map(|s| match &s.op {
                StepOp::CopyFrom { from_stage, .. } => Some(from_stage.to_string()),
                _ => None,
            })
            .collect();
        deps.dedup();
        deps.join(" ")
    }

    /// Emit `<build_root>/<stage_index>.sh`. Matches `build_emit_shell_script`
    /// step-for-step, including the bold `-- Step k/n : <text>` prefix line.
    pub fn emit_shell_script(&self, stage_index: u32) -> Result<PathBuf> {
        let steps: Vec<&StepRecord> = self
            .steps
            .iter()
            .filter(|s| s.stage_index == stage_index)
            .collect();
        let mut script = String::new();
        script.push_str("#!/bin/sh\n\n");
        script.push_str(". /prison_build_variables.sh\n");
        script.push_str("set -e\n");
        if self.header.verbose {
            script.push_str("set -x\n");
        }
        let total = steps.len();
        for (i, step) in steps.iter().enumerate() {
            script.push_str("echo -n \x1b[1m--\x1b[0m\n");
            script.push_str(&format!(
                "echo ' Step {}/{} : {}'\n",
                i + 1,
                total,
                step.step_string
            ));
            match &step.op {
                StepOp::Env { key, value } => {
                    script.push_str(&format!("export {key}=\"{value}\"\n"));
                }
                StepOp::RootPivot { target } => {
                    script.push_str(&format!("ln -s {target} /cellblock-root-ptr\n"));
                }
                StepOp::AddFile { source, dest } => {
                    script.push_str(&format!("cp -pr \"${{stage_tmp_dir}}/{source}\" {dest}\n"));
                }
                StepOp::AddArchive { source, dest } => {
                    script.push_str(&format!(
                        "tar -C {dest} -zxf \"${{stage_tmp_dir}}/{source}\"\n"
                    ));
                }
                StepOp::AddUrl { source, dest } => {
                    script.push_str(&format!("fetch -o {dest} {source}\n"));
                }
                StepOp::Copy { source, dest } => {
                    script.push_str(&format!("cp -pr \"${{stage_tmp_dir}}/{source}\" {dest}\n"));
                }
                StepOp::CopyFrom {
                    from_stage,
                    source,
                    dest,
                } => {
                    script.push_str(&format!(
                        "cp -pr \"${{stages}}/{from_stage}/{source}\" {dest}\n"
                    ));
                }
                StepOp::Run { command } => {
                    script.push_str(command);
                    script.push('\n');
                }
                StepOp::Workdir { path } => {
                    script.push_str(&format!("cd {path}\n"));
                }
            }
        }
        let path = self.build_root.join(format!("{stage_index}.sh"));
        std::fs::write(&path, script).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }
}

/// Prefix used before every build-progress line streamed to the client,
/// matching `print_bold_prefix`'s bold `--` marker.
const BOLD_PREFIX: &str = "\x1b[1m--\x1b[0m ";

async fn stream_line(sock: &mut OwnedWriteHalf, line: &str) -> Result<()> {
    sock.write_all(BOLD_PREFIX.as_bytes()).await?;
    sock.write_all(line.as_bytes()).await?;
    sock.write_all(b"\n").await?;
    sock.flush().await?;
    Ok(())
}

fn duped_stdio(sock_fd: std::os::unix::io::RawFd) -> Result<Stdio> {
    let dup = nix::unistd::dup(sock_fd).context("dup client socket for helper stdio")?;
    Ok(unsafe { Stdio::from_raw_fd(dup) })
}

use std::os::unix::io::FromRawFd;

/// Run `stage_init.sh` for one stage, stdout/stderr duped to the client
/// socket. Mirrors `build_init_stage`.
async fn run_stage_init(
    cfg: &Config,
    ctx: &BuildContext,
    stage: &StageRecord,
    sock_fd: std::os::unix::io::RawFd,
) -> Result<std::process::ExitStatus> {
    let script = cfg.lib_dir().join("stage_init.sh");
    let mut cmd = Command::new("/bin/sh");
    if ctx.header.verbose {
        cmd.arg("-x");
    }
    cmd.arg(&script)
        .arg(&ctx.build_root)
        .arg(stage.index.to_string())
        .arg(&stage.base_container)
        .arg(cfg.data_dir())
        .arg(ctx.context_archive(cfg))
        .arg(ctx.stage_deps(stage.index))
        .arg(&ctx.instance_tag);
    if !stage.name.is_empty() {
        cmd.arg(&stage.name);
    }
    cmd.env_clear();
    cmd.env("PATH", "/sbin:/bin:/usr/sbin:/usr/bin");
    cmd.env("CBLOCK_FS", cfg.underlying_fs());
    cmd.stdout(duped_stdio(sock_fd)?);
    cmd.stderr(duped_stdio(sock_fd)?);
    cmd.status().await.context("spawn stage_init.sh")
}

/// Run `stage_build.sh` for one stage, targeting `<stage>/root`. Mirrors
/// the inner fork in `build_run_build_stage`.
async fn run_stage_build(
    cfg: &Config,
    ctx: &BuildContext,
    stage: &StageRecord,
    sock_fd: std::os::unix::io::RawFd,
) -> Result<std::process::ExitStatus> {
    let builder = cfg.lib_dir().join("stage_build.sh");
    let stage_root = ctx.build_root.join(stage.index.to_string()).join("root");
    let mut cmd = Command::new("/bin/sh");
    if ctx.header.verbose {
        cmd.arg("-x");
    }
    cmd.arg(&builder).arg(&stage_root);
    cmd.env_clear();
    cmd.env("CBLOCK_FS", cfg.underlying_fs());
    cmd.env("USER", "root");
    cmd.env("PATH", "/sbin:/bin:/usr/sbin:/usr/bin");
    cmd.env("TERM", "xterm");
    cmd.env("BLOCKSIZE", "K");
    cmd.env("SHELL", "/bin/sh");
    cmd.stdout(duped_stdio(sock_fd)?);
    cmd.stderr(duped_stdio(sock_fd)?);
    cmd.status().await.context("spawn stage_build.sh")
}

/// Drive every stage in declared order. Returns `Ok(Some(last_index))` with
/// the index of the stage processed last if all stages succeeded,
/// `Ok(None)` if a stage failed (pipeline already reported and aborted),
/// and `Err` only for daemon-side I/O failures unrelated to the helpers'
/// exit status.
pub async fn run_build_stages(
    cfg: &Config,
    ctx: &BuildContext,
    sock_fd: std::os::unix::io::RawFd,
    client: &mut OwnedWriteHalf,
) -> Result<Option<u32>> {
    let mut last_index = None;
    for (k, stage) in ctx.stages.iter().enumerate() {
        let stage_root = ctx.build_root.join(stage.index.to_string());
        std::fs::create_dir_all(stage_root.join("root"))
            .with_context(|| format!("mkdir stage root {}", stage_root.display()))?;
        ctx.emit_shell_script(stage.index)?;

        let init_status = run_stage_init(cfg, ctx, stage, sock_fd).await?;
        if !init_status.success() {
            stream_line(
                client,
                &format!(
                    "Stage index {} failed with {} code. Exiting",
                    stage.index,
                    init_status.code().unwrap_or(-1)
                ),
            )
            .await?;
            return Ok(None);
        }

        stream_line(
            client,
            &format!("Executing stage ({}/{})", k + 1, ctx.stages.len()),
        )
        .await?;

        let build_status = run_stage_build(cfg, ctx, stage, sock_fd).await?;
        if !build_status.success() {
            stream_line(
                client,
                &format!(
                    "Stage index {} failed with {} code. Exiting",
                    stage.index,
                    build_status.code().unwrap_or(-1)
                ),
            )
            .await?;
            return Ok(None);
        }
        last_index = Some(stage.index);
    }
    Ok(last_index)
}

/// Run `stage_commit.sh` against the stage `run_build_stages` processed
/// last, after writing `ENTRYPOINT`/`ARGS` if present. Mirrors
/// `build_commit_image`. `last` is the stage index `run_build_stages`
/// returned, not necessarily the numerically highest stage index.
pub async fn commit_image(
    cfg: &Config,
    ctx: &BuildContext,
    sock_fd: std::os::unix::io::RawFd,
    last: u32,
) -> Result<bool> {
    let last_dir = ctx.build_root.join(last.to_string());

    if !ctx.header.entry_point.is_empty() {
        std::fs::write(last_dir.join("ENTRYPOINT"), &ctx.header.entry_point)?;
    }
    if !ctx.header.entry_point_args.is_empty() {
        std::fs::write(last_dir.join("ARGS"), &ctx.header.entry_point_args)?;
    }

    let commit_cmd = cfg.lib_dir().join("stage_commit.sh");
    let mut cmd = Command::new("/bin/sh");
    if ctx.header.verbose {
        cmd.arg("-x");
    }
    cmd.arg(&commit_cmd)
        .arg(&ctx.build_root)
        .arg(last.to_string())
        .arg(cfg.data_dir())
        .arg(&ctx.header.image_name)
        .arg(ctx.stages.len().to_string())
        .arg(&ctx.instance_tag)
        .arg("OFF");
    cmd.env_clear();
    cmd.env("CBLOCK_FS", cfg.underlying_fs());
    cmd.stdout(duped_stdio(sock_fd)?);
    cmd.stderr(duped_stdio(sock_fd)?);
    let status = cmd.status().await.context("spawn stage_commit.sh")?;
    Ok(status.success())
}

/// Fork `stage_launch_cleanup.sh` to release ephemeral build resources.
/// Shared with non-build instance teardown; see `dispatch::cleanup_instance`.
pub async fn run_cleanup(cfg: &Config, instance_tag: &str, kind: &str) -> Result<()> {
    let script = cfg.lib_dir().join("stage_launch_cleanup.sh");
    let status = Command::new("/bin/sh")
        .arg(&script)
        .arg(cfg.data_dir())
        .arg(instance_tag)
        .arg(kind)
        .status()
        .await
        .context("spawn stage_launch_cleanup.sh")?;
    if !status.success() {
        log::warn!(
            "stage_launch_cleanup.sh exited {:?} for {instance_tag}",
            status.code()
        );
    }
    Ok(())
}

/// Create `<data_dir>/instances/<tag>.tar.gz` with `O_CREAT|O_EXCL|0600`
/// and `<data_dir>/instances/<tag>/`. Mirrors `dispatch_build_set_outfile`.
pub fn create_build_outfile(cfg: &Config, instance_tag: &str) -> Result<std::fs::File> {
    use std::fs::OpenOptions;
    use std::os::unix::fs::OpenOptionsExt;

    let path = cfg.instances_dir().join(format!("{instance_tag}.tar.gz"));
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&path)
        .with_context(|| format!("create build spool {}", path.display()))?;
    let build_root = cfg.instances_dir().join(instance_tag);
    std::fs::create_dir_all(&build_root)
        .with_context(|| format!("mkdir build root {}", build_root.display()))?;
    Ok(file)
}

/// Panic-free helper so call sites above can get a raw fd for `dup()`
/// without importing `AsRawFd` at every call site.
pub fn raw_fd_of(stream: &tokio::net::UnixStream) -> std::os::unix::io::RawFd {
    stream.as_raw_fd()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::headers::StageRecord;

    fn sample_ctx(build_root: PathBuf) -> BuildContext {
        BuildContext {
            header: BuildContextHeader {
                verbose: true,
                ..Default::default()
            },
            stages: vec![
                StageRecord {
                    index: 0,
                    name: String::new(),
                    base_container: "base".into(),
                    is_last: false,
                },
                StageRecord {
                    index: 1,
                    name: String::new(),
                    base_container: "stage0".into(),
                    is_last: true,
                },
            ],
            steps: vec![
                StepRecord {
                    stage_index: 0,
                    step_string: "RUN echo hi > /marker".into(),
                    op: StepOp::Run {
                        command: "echo hi > /marker".into(),
                    },
                },
                StepRecord {
                    stage_index: 1,
                    step_string: "COPY_FROM 0 /marker /marker".into(),
                    op: StepOp::CopyFrom {
                        from_stage: 0,
                        source: "marker".into(),
                        dest: "/marker".into(),
                    },
                },
            ],
            instance_tag: "e".repeat(64),
            build_root,
        }
    }

    #[test]
    fn stage_deps_collects_copy_from_sources() {
        let dir = tempfile::tempdir().expect("tmp");
        let ctx = sample_ctx(dir.path().to_path_buf());
        assert_eq!(ctx.stage_deps(0), "");
        assert_eq!(ctx.stage_deps(1), "0");
    }

    #[test]
    fn emit_shell_script_contains_step_header_and_set_x() {
        let dir = tempfile::tempdir().expect("tmp");
        let ctx = sample_ctx(dir.path().to_path_buf());
        let path = ctx.emit_shell_script(0).expect("emit");
        let contents = std::fs::read_to_string(path).expect("read");
        assert!(contents.starts_with("#!/bin/sh"));
        assert!(contents.contains("set -x"));
        assert!(contents.contains("Step 1/1 : RUN echo hi > /marker"));
        assert!(contents.contains("echo hi > /marker"));
    }

    #[test]
    fn emit_shell_script_copy_from_references_stages_var() {
        let dir = tempfile::tempdir().expect("tmp");
        let ctx = sample_ctx(dir.path().to_path_buf());
        let path = ctx.emit_shell_script(1).expect("emit");
        let contents = std::fs::read_to_string(path).expect("read");
        assert!(contents.contains("cp -pr \"${stages}/0/marker\" /marker"));
    }
}
