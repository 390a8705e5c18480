//! Fixed-size per-verb headers. Each struct's `to_bytes`/`from_bytes` pair
//! defines the exact on-wire layout; all multi-byte fields are native
//! endian, matching the framed IPC channel's same-host contract.

use super::{
    pack_field, unpack_field, Winsize, MAX_CMD_NAME_LEN, MAX_ENTRY_ARGS_LEN, MAX_IMAGE_TAG_LEN,
    MAX_NAME_LEN, MAX_NETWORK_LEN, MAX_PATH_LEN, MAX_PORTS_LEN, MAX_STEP_STRING_LEN, MAX_TAG_LEN,
    MAX_TERM_LEN, MAX_VOLUMES_LEN,
};

/// `LAUNCH_INSTANCE` header.
#[derive(Debug, Clone, Default)]
pub struct LaunchHeader {
    pub name: String,
    pub term: String,
    pub volumes: String,
    pub network: String,
    pub tag: String,
    pub ports: String,
    pub entry_point_args: String,
    pub verbose: bool,
}

impl LaunchHeader {
    pub const LEN: usize = MAX_NAME_LEN
        + MAX_TERM_LEN
        + MAX_VOLUMES_LEN
        + MAX_NETWORK_LEN
        + MAX_TAG_LEN
        + MAX_PORTS_LEN
        + MAX_ENTRY_ARGS_LEN
        + 4;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN);
        buf.extend_from_slice(&pack_field::<MAX_NAME_LEN>(&self.name));
        buf.extend_from_slice(&pack_field::<MAX_TERM_LEN>(&self.term));
        buf.extend_from_slice(&pack_field::<MAX_VOLUMES_LEN>(&self.volumes));
        buf.extend_from_slice(&pack_field::<MAX_NETWORK_LEN>(&self.network));
        buf.extend_from_slice(&pack_field::<MAX_TAG_LEN>(&self.tag));
        buf.extend_from_slice(&pack_field::<MAX_PORTS_LEN>(&self.ports));
        buf.extend_from_slice(&pack_field::<MAX_ENTRY_ARGS_LEN>(&self.entry_point_args));
        buf.extend_from_slice(&(self.verbose as u32).to_ne_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<LaunchHeader> {
        if buf.len() < Self::LEN {
            return None;
        }
        let mut off = 0;
        macro_rules! field {
            ($n:expr) => {{
                let s = unpack_field(&buf[off..off + $n]);
                off += $n;
                s
            }};
        }
        let name = field!(MAX_NAME_LEN);
        let term = field!(MAX_TERM_LEN);
        let volumes = field!(MAX_VOLUMES_LEN);
        let network = field!(MAX_NETWORK_LEN);
        let tag = field!(MAX_TAG_LEN);
        let ports = field!(MAX_PORTS_LEN);
        let entry_point_args = field!(MAX_ENTRY_ARGS_LEN);
        let verbose = u32::from_ne_bytes(buf[off..off + 4].try_into().ok()?) != 0;
        Some(LaunchHeader {
            name,
            term,
            volumes,
            network,
            tag,
            ports,
            entry_point_args,
            verbose,
        })
    }
}

/// `CONSOLE_CONNECT` header: target identifier plus the client's current
/// termios (opaque to the daemon beyond size) and winsize.
#[derive(Debug, Clone)]
pub struct ConsoleConnectHeader {
    pub target: String,
    pub termios: Vec<u8>,
    pub winsize: Winsize,
}

pub const TERMIOS_LEN: usize = 60;

impl ConsoleConnectHeader {
    pub const LEN: usize = MAX_TAG_LEN + TERMIOS_LEN + Winsize::LEN;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN);
        buf.extend_from_slice(&pack_field::<MAX_TAG_LEN>(&self.target));
        let mut termios = [0u8; TERMIOS_LEN];
        let n = self.termios.len().min(TERMIOS_LEN);
        termios[..n].copy_from_slice(&self.termios[..n]);
        buf.extend_from_slice(&termios);
        buf.extend_from_slice(&self.winsize.to_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<ConsoleConnectHeader> {
        if buf.len() < Self::LEN {
            return None;
        }
        let target = unpack_field(&buf[0..MAX_TAG_LEN]);
        let termios = buf[MAX_TAG_LEN..MAX_TAG_LEN + TERMIOS_LEN].to_vec();
        let winsize = Winsize::from_bytes(&buf[MAX_TAG_LEN + TERMIOS_LEN..])?;
        Some(ConsoleConnectHeader {
            target,
            termios,
            winsize,
        })
    }
}

/// `GENERIC_COMMAND` header. The marshalled `ArgVec` payload follows on the
/// wire, length-delimited by `payload_len`.
#[derive(Debug, Clone, Default)]
pub struct GenericCommandHeader {
    pub cmd_name: String,
    pub verbose: bool,
    pub payload_len: u32,
}

impl GenericCommandHeader {
    pub const LEN: usize = MAX_CMD_NAME_LEN + 4 + 4;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN);
        buf.extend_from_slice(&pack_field::<MAX_CMD_NAME_LEN>(&self.cmd_name));
        buf.extend_from_slice(&(self.verbose as u32).to_ne_bytes());
        buf.extend_from_slice(&self.payload_len.to_ne_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<GenericCommandHeader> {
        if buf.len() < Self::LEN {
            return None;
        }
        let cmd_name = unpack_field(&buf[0..MAX_CMD_NAME_LEN]);
        let verbose =
            u32::from_ne_bytes(buf[MAX_CMD_NAME_LEN..MAX_CMD_NAME_LEN + 4].try_into().ok()?) != 0;
        let payload_len = u32::from_ne_bytes(
            buf[MAX_CMD_NAME_LEN + 4..MAX_CMD_NAME_LEN + 8]
                .try_into()
                .ok()?,
        );
        Some(GenericCommandHeader {
            cmd_name,
            verbose,
            payload_len,
        })
    }
}

/// One row of a `GET_INSTANCES` reply.
#[derive(Debug, Clone, Default)]
pub struct InstanceListEntry {
    pub tag: String,
    pub image_name: String,
    pub pid: i32,
    pub pty_name: String,
    pub launch_time: i64,
}

impl InstanceListEntry {
    pub const LEN: usize = MAX_TAG_LEN + MAX_NAME_LEN + 4 + MAX_PATH_LEN + 8;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN);
        buf.extend_from_slice(&pack_field::<MAX_TAG_LEN>(&self.tag));
        buf.extend_from_slice(&pack_field::<MAX_NAME_LEN>(&self.image_name));
        buf.extend_from_slice(&self.pid.to_ne_bytes());
        buf.extend_from_slice(&pack_field::<MAX_PATH_LEN>(&self.pty_name));
        buf.extend_from_slice(&self.launch_time.to_ne_bytes());
        buf
    }
}

/// Build-context header preceding the stage/step arrays in `LAUNCH_BUILD`
/// and `SEND_BUILD_CTX`.
#[derive(Debug, Clone, Default)]
pub struct BuildContextHeader {
    pub image_name: String,
    pub tag: String,
    pub term: String,
    pub verbose: bool,
    pub entry_point: String,
    pub entry_point_args: String,
    pub n_stages: u32,
    pub n_steps: u32,
    pub context_size: u64,
}

impl BuildContextHeader {
    pub const LEN: usize = MAX_NAME_LEN
        + MAX_IMAGE_TAG_LEN
        + MAX_TERM_LEN
        + 4
        + MAX_PATH_LEN
        + MAX_ENTRY_ARGS_LEN
        + 4
        + 4
        + 8;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN);
        buf.extend_from_slice(&pack_field::<MAX_NAME_LEN>(&self.image_name));
        buf.extend_from_slice(&pack_field::<MAX_IMAGE_TAG_LEN>(&self.tag));
        buf.extend_from_slice(&pack_field::<MAX_TERM_LEN>(&self.term));
        buf.extend_from_slice(&(self.verbose as u32).to_ne_bytes());
        buf.extend_from_slice(&pack_field::<MAX_PATH_LEN>(&self.entry_point));
        buf.extend_from_slice(&pack_field::<MAX_ENTRY_ARGS_LEN>(&self.entry_point_args));
        buf.extend_from_slice(&self.n_stages.to_ne_bytes());
        buf.extend_from_slice(&self.n_steps.to_ne_bytes());
        buf.extend_from_slice(&self.context_size.to_ne_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<BuildContextHeader> {
        if buf.len() < Self::LEN {
            return None;
        }
        let mut off = 0;
        macro_rules! field {
            ($n:expr) => {{
                let s = unpack_field(&buf[off..off + $n]);
                off += $n;
                s
            }};
        }
        let image_name = field!(MAX_NAME_LEN);
        let tag = field!(MAX_IMAGE_TAG_LEN);
        let term = field!(MAX_TERM_LEN);
        let verbose = u32::from_ne_bytes(buf[off..off + 4].try_into().ok()?) != 0;
        off += 4;
        let entry_point = field!(MAX_PATH_LEN);
        let entry_point_args = field!(MAX_ENTRY_ARGS_LEN);
        let n_stages = u32::from_ne_bytes(buf[off..off + 4].try_into().ok()?);
        off += 4;
        let n_steps = u32::from_ne_bytes(buf[off..off + 4].try_into().ok()?);
        off += 4;
        let context_size = u64::from_ne_bytes(buf[off..off + 8].try_into().ok()?);
        Some(BuildContextHeader {
            image_name,
            tag,
            term,
            verbose,
            entry_point,
            entry_point_args,
            n_stages,
            n_steps,
            context_size,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct StageRecord {
    pub index: u32,
    pub name: String,
    pub base_container: String,
    pub is_last: bool,
}

impl StageRecord {
    pub const LEN: usize = 4 + MAX_NAME_LEN + MAX_NAME_LEN + 4;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN);
        buf.extend_from_slice(&self.index.to_ne_bytes());
        buf.extend_from_slice(&pack_field::<MAX_NAME_LEN>(&self.name));
        buf.extend_from_slice(&pack_field::<MAX_NAME_LEN>(&self.base_container));
        buf.extend_from_slice(&(self.is_last as u32).to_ne_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<StageRecord> {
        if buf.len() < Self::LEN {
            return None;
        }
        let index = u32::from_ne_bytes(buf[0..4].try_into().ok()?);
        let name = unpack_field(&buf[4..4 + MAX_NAME_LEN]);
        let off = 4 + MAX_NAME_LEN;
        let base_container = unpack_field(&buf[off..off + MAX_NAME_LEN]);
        let off = off + MAX_NAME_LEN;
        let is_last = u32::from_ne_bytes(buf[off..off + 4].try_into().ok()?) != 0;
        Some(StageRecord {
            index,
            name,
            base_container,
            is_last,
        })
    }
}

/// Step operation and its op-specific payload. The on-wire form is a
/// discriminant tag followed by a fixed union-sized region; in this
/// implementation the region is simply three path-sized string fields,
/// which is enough room for every variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOp {
    Env { key: String, value: String },
    RootPivot { target: String },
    AddFile { source: String, dest: String },
    AddArchive { source: String, dest: String },
    AddUrl { source: String, dest: String },
    Copy { source: String, dest: String },
    CopyFrom { from_stage: u32, source: String, dest: String },
    Run { command: String },
    Workdir { path: String },
}

#[derive(Debug, Clone)]
pub struct StepRecord {
    pub stage_index: u32,
    pub step_string: String,
    pub op: StepOp,
}

const OP_ENV: u32 = 0;
const OP_ROOT_PIVOT: u32 = 1;
const OP_ADD_FILE: u32 = 2;
const OP_ADD_ARCHIVE: u32 = 3;
const OP_ADD_URL: u32 = 4;
const OP_COPY: u32 = 5;
const OP_COPY_FROM: u32 = 6;
const OP_RUN: u32 = 7;
const OP_WORKDIR: u32 = 8;

impl StepRecord {
    pub const LEN: usize = 4 + MAX_STEP_STRING_LEN + 4 + 4 + MAX_PATH_LEN + MAX_PATH_LEN;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN);
        buf.extend_from_slice(&self.stage_index.to_ne_bytes());
        buf.extend_from_slice(&pack_field::<MAX_STEP_STRING_LEN>(&self.step_string));
        let (opcode, from_stage, a, b) = match &self.op {
            StepOp::Env { key, value } => (OP_ENV, 0, key.clone(), value.clone()),
            StepOp::RootPivot { target } => (OP_ROOT_PIVOT, 0, target.clone(), String::new()),
            StepOp::AddFile { source, dest } => (OP_ADD_FILE, 0, source.clone(), dest.clone()),
            StepOp::AddArchive { source, dest } => {
                (OP_ADD_ARCHIVE, 0, source.clone(), dest.clone())
            }
            StepOp::AddUrl { source, dest } => (OP_ADD_URL, 0, source.clone(), dest.clone()),
            StepOp::Copy { source, dest } => (OP_COPY, 0, source.clone(), dest.clone()),
            StepOp::CopyFrom {
                from_stage,
                source,
                dest,
            } => (OP_COPY_FROM, *from_stage, source.clone(), dest.clone()),
            StepOp::Run { command } => (OP_RUN, 0, command.clone(), String::new()),
            StepOp::Workdir { path } => (OP_WORKDIR, 0, path.clone(), String::new()),
        };
        buf.extend_from_slice(&opcode.to_ne_bytes());
        buf.extend_from_slice(&from_stage.to_ne_bytes());
        buf.extend_from_slice(&pack_field::<MAX_PATH_LEN>(&a));
        buf.extend_from_slice(&pack_field::<MAX_PATH_LEN>(&b));
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<StepRecord> {
        if buf.len() < Self::LEN {
            return None;
        }
        let stage_index = u32::from_ne_bytes(buf[0..4].try_into().ok()?);
        let mut off = 4;
        let step_string = unpack_field(&buf[off..off + MAX_STEP_STRING_LEN]);
        off += MAX_STEP_STRING_LEN;
        let opcode = u32::from_ne_bytes(buf[off..off + 4].try_into().ok()?);
        off += 4;
        let from_stage = u32::from_ne_bytes(buf[off..off + 4].try_into().ok()?);
        off += 4;
        let a = unpack_field(&buf[off..off + MAX_PATH_LEN]);
        off += MAX_PATH_LEN;
        let b = unpack_field(&buf[off..off + MAX_PATH_LEN]);
        let op = match opcode {
            OP_ENV => StepOp::Env { key: a, value: b },
            OP_ROOT_PIVOT => StepOp::RootPivot { target: a },
            OP_ADD_FILE => StepOp::AddFile { source: a, dest: b },
            OP_ADD_ARCHIVE => StepOp::AddArchive { source: a, dest: b },
            OP_ADD_URL => StepOp::AddUrl { source: a, dest: b },
            OP_COPY => StepOp::Copy { source: a, dest: b },
            OP_COPY_FROM => StepOp::CopyFrom {
                from_stage,
                source: a,
                dest: b,
            },
            OP_RUN => StepOp::Run { command: a },
            OP_WORKDIR => StepOp::Workdir { path: a },
            _ => return None,
        };
        Some(StepRecord {
            stage_index,
            step_string,
            op,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_header_round_trip() {
        let h = LaunchHeader {
            name: "alpine".into(),
            term: "xterm".into(),
            volumes: "devfs,".into(),
            network: "".into(),
            tag: "latest".into(),
            ports: "none".into(),
            entry_point_args: "".into(),
            verbose: true,
        };
        let back = LaunchHeader::from_bytes(&h.to_bytes()).expect("decode");
        assert_eq!(back.name, "alpine");
        assert_eq!(back.volumes, "devfs,");
        assert!(back.verbose);
    }

    #[test]
    fn console_connect_header_round_trip() {
        let h = ConsoleConnectHeader {
            target: "deadbeef00".into(),
            termios: vec![1, 2, 3],
            winsize: Winsize { rows: 24, cols: 80 },
        };
        let back = ConsoleConnectHeader::from_bytes(&h.to_bytes()).expect("decode");
        assert_eq!(back.target, "deadbeef00");
        assert_eq!(back.winsize, h.winsize);
    }

    #[test]
    fn build_context_header_round_trip() {
        let h = BuildContextHeader {
            image_name: "myimage".into(),
            tag: "v1".into(),
            n_stages: 2,
            n_steps: 3,
            context_size: 4096,
            ..Default::default()
        };
        let back = BuildContextHeader::from_bytes(&h.to_bytes()).expect("decode");
        assert_eq!(back.n_stages, 2);
        assert_eq!(back.n_steps, 3);
        assert_eq!(back.context_size, 4096);
    }

    #[test]
    fn step_record_round_trip_each_variant() {
        let steps = vec![
            StepOp::Env {
                key: "FOO".into(),
                value: "bar".into(),
            },
            StepOp::RootPivot {
                target: "/stage0/root".into(),
            },
            StepOp::AddFile {
                source: "a".into(),
                dest: "/b".into(),
            },
            StepOp::CopyFrom {
                from_stage: 0,
                source: "/marker".into(),
                dest: "/marker".into(),
            },
            StepOp::Run {
                command: "echo hi > /marker".into(),
            },
            StepOp::Workdir { path: "/app".into() },
        ];
        for op in steps {
            let rec = StepRecord {
                stage_index: 1,
                step_string: "display".into(),
                op: op.clone(),
            };
            let back = StepRecord::from_bytes(&rec.to_bytes()).expect("decode");
            assert_eq!(back.op, op);
            assert_eq!(back.stage_index, 1);
        }
    }
}
