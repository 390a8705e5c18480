//! Framed IPC channel: command codes, fixed-size headers, and the
//! must-read/must-write primitives every verb is built from.
//!
//! Every message on the wire begins with a 4-byte command code, native byte
//! order, same-host only (no cross-host portability is attempted). A short
//! read of the command code means the peer hung up gracefully; a short read
//! of anything after that is a protocol error and the peer is dropped.

pub mod argvec;

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

pub const ERRBUF_LEN: usize = 1024;
pub const MAX_NAME_LEN: usize = 64;
pub const MAX_TERM_LEN: usize = 32;
pub const MAX_VOLUMES_LEN: usize = 256;
pub const MAX_NETWORK_LEN: usize = 64;
pub const MAX_TAG_LEN: usize = 65;
pub const MAX_PORTS_LEN: usize = 256;
pub const MAX_ENTRY_ARGS_LEN: usize = 512;
pub const MAX_IMAGE_TAG_LEN: usize = 64;
pub const MAX_STEP_STRING_LEN: usize = 256;
pub const MAX_PATH_LEN: usize = 512;
pub const MAX_CMD_NAME_LEN: usize = 64;

/// Hard caps on a build context header, checked before any stage/step
/// array is allocated.
pub const MAX_STAGES: u32 = 64;
pub const MAX_STEPS: u32 = 1024;

/// Upper bound on a single in-flight `GET_INSTANCES` reply; the daemon
/// truncates rather than grow the response unbounded.
pub const MAX_LISTED_INSTANCES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    GenericCommand = 1,
    GetInstances = 2,
    LaunchInstance = 3,
    LaunchBuild = 4,
    SendBuildCtx = 5,
    ConsoleConnect = 6,
    ConsoleResize = 7,
    ConsoleData = 8,
    ConsoleToClient = 9,
    ConsoleSessionDone = 10,
    Response = 11,
}

impl Command {
    pub fn from_u32(v: u32) -> Option<Command> {
        Some(match v {
            1 => Command::GenericCommand,
            2 => Command::GetInstances,
            3 => Command::LaunchInstance,
            4 => Command::LaunchBuild,
            5 => Command::SendBuildCtx,
            6 => Command::ConsoleConnect,
            7 => Command::ConsoleResize,
            8 => Command::ConsoleData,
            9 => Command::ConsoleToClient,
            10 => Command::ConsoleSessionDone,
            11 => Command::Response,
            _ => return None,
        })
    }
}

/// Outcome of attempting to read the leading command code off the wire.
pub enum ReadCommand {
    /// A full command code was read.
    Some(Command),
    /// The peer closed the connection before sending a single byte. This is
    /// the graceful-disconnect signal, not a protocol error.
    Eof,
    /// Bytes arrived but did not form a known command code, or the read was
    /// short. Protocol error; the caller must close the peer.
    Invalid,
}

/// Read the leading 4-byte command code, distinguishing a graceful EOF
/// (zero bytes read) from a short/garbled read (protocol error). Mirrors
/// `sock_ipc_may_read` for the very first read of a request and
/// `sock_ipc_must_read` semantics for everything after.
pub async fn read_command(stream: &mut OwnedReadHalf) -> io::Result<ReadCommand> {
    let mut buf = [0u8; 4];
    let mut total = 0;
    loop {
        let n = stream.read(&mut buf[total..]).await?;
        if n == 0 {
            return Ok(if total == 0 {
                ReadCommand::Eof
            } else {
                ReadCommand::Invalid
            });
        }
        total += n;
        if total == buf.len() {
            break;
        }
    }
    let code = u32::from_ne_bytes(buf);
    Ok(match Command::from_u32(code) {
        Some(cmd) => ReadCommand::Some(cmd),
        None => ReadCommand::Invalid,
    })
}

/// Read exactly `buf.len()` bytes or fail. Any short read here (including
/// zero bytes) is a protocol error, unlike the leading command-code read.
pub async fn must_read(stream: &mut OwnedReadHalf, buf: &mut [u8]) -> io::Result<()> {
    stream.read_exact(buf).await.map_err(|e| {
        io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("short read of expected frame: {e}"),
        )
    })
}

/// Write the entirety of `buf` or fail. A partial/failing write terminates
/// the peer, matching the "writes are must-write" contract.
pub async fn must_write(stream: &mut OwnedWriteHalf, buf: &[u8]) -> io::Result<()> {
    stream.write_all(buf).await
}

pub async fn write_command(stream: &mut OwnedWriteHalf, cmd: Command) -> io::Result<()> {
    must_write(stream, &(cmd as u32).to_ne_bytes()).await
}

/// `{ecode, errbuf}` response header. For LAUNCH, a successful response
/// repurposes `errbuf` to carry the freshly minted tag instead of an error
/// message.
#[derive(Debug, Clone)]
pub struct Response {
    pub ecode: i32,
    pub message: String,
}

impl Response {
    pub fn ok() -> Response {
        Response {
            ecode: 0,
            message: String::new(),
        }
    }

    pub fn ok_with(message: impl Into<String>) -> Response {
        Response {
            ecode: 0,
            message: message.into(),
        }
    }

    pub fn err(ecode: i32, message: impl Into<String>) -> Response {
        Response {
            ecode,
            message: message.into(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + ERRBUF_LEN);
        buf.extend_from_slice(&self.ecode.to_ne_bytes());
        let mut errbuf = [0u8; ERRBUF_LEN];
        let msg = self.message.as_bytes();
        let n = msg.len().min(ERRBUF_LEN - 1);
        errbuf[..n].copy_from_slice(&msg[..n]);
        buf.extend_from_slice(&errbuf);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Response> {
        if buf.len() < 4 + ERRBUF_LEN {
            return None;
        }
        let ecode = i32::from_ne_bytes(buf[0..4].try_into().ok()?);
        let raw = &buf[4..4 + ERRBUF_LEN];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let message = String::from_utf8_lossy(&raw[..end]).into_owned();
        Some(Response { ecode, message })
    }

    pub async fn write(&self, stream: &mut OwnedWriteHalf) -> io::Result<()> {
        write_command(stream, Command::Response).await?;
        must_write(stream, &self.to_bytes()).await
    }
}

/// Fixed 4-byte terminal size, native order, matching `struct winsize`'s
/// row/col pair (the two fields the pump actually needs; pixel fields are
/// not used by cellblockd).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Winsize {
    pub rows: u16,
    pub cols: u16,
}

impl Winsize {
    pub const LEN: usize = 4;

    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0..2].copy_from_slice(&self.rows.to_ne_bytes());
        buf[2..4].copy_from_slice(&self.cols.to_ne_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Winsize> {
        if buf.len() < Self::LEN {
            return None;
        }
        Some(Winsize {
            rows: u16::from_ne_bytes(buf[0..2].try_into().ok()?),
            cols: u16::from_ne_bytes(buf[2..4].try_into().ok()?),
        })
    }
}

/// Fixed-size ASCII/UTF-8 field helpers shared by every header struct:
/// pack a `&str` into an N-byte NUL-padded field, and unpack it back.
pub fn pack_field<const N: usize>(s: &str) -> [u8; N] {
    let mut buf = [0u8; N];
    let bytes = s.as_bytes();
    let n = bytes.len().min(N - 1);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

pub fn unpack_field(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

pub mod headers;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trip() {
        for code in 1u32..=11 {
            let cmd = Command::from_u32(code).expect("known code");
            assert_eq!(cmd as u32, code);
        }
        assert!(Command::from_u32(0).is_none());
        assert!(Command::from_u32(999).is_none());
    }

    #[test]
    fn response_round_trip() {
        let r = Response::err(1, "already attached");
        let bytes = r.to_bytes();
        let back = Response::from_bytes(&bytes).expect("decode");
        assert_eq!(back.ecode, 1);
        assert_eq!(back.message, "already attached");
    }

    #[test]
    fn response_truncates_overlong_message() {
        let long = "x".repeat(ERRBUF_LEN + 10);
        let r = Response::ok_with(long.clone());
        let bytes = r.to_bytes();
        let back = Response::from_bytes(&bytes).expect("decode");
        assert_eq!(back.message.len(), ERRBUF_LEN - 1);
    }

    #[test]
    fn winsize_round_trip() {
        let w = Winsize { rows: 24, cols: 80 };
        let back = Winsize::from_bytes(&w.to_bytes()).expect("decode");
        assert_eq!(w, back);
    }

    #[test]
    fn field_pack_unpack() {
        let packed: [u8; 16] = pack_field("alpine");
        assert_eq!(unpack_field(&packed), "alpine");
    }
}
