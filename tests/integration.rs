//! In-process integration tests: the daemon types are constructed directly
//! and driven over a real Unix socket bound to a temp directory, the way
//! `common.rs`'s `Sut` drives the teacher's gRPC service against a spawned
//! binary — except here there is no separate binary, `handle_peer` is
//! spawned as a task in this same test process.

use std::path::Path;
use std::sync::Arc;

use cellblockd::dispatch::{handle_peer, Daemon};
use cellblockd::wire::headers::{
    BuildContextHeader, ConsoleConnectHeader, GenericCommandHeader, LaunchHeader,
};
use cellblockd::wire::{argvec::ArgVec, Command, Response, Winsize, ERRBUF_LEN};
use cellblockd::Config;
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

async fn spawn_test_daemon(tmp: &tempfile::TempDir) -> (Arc<Daemon>, std::path::PathBuf) {
    let sock_path = tmp.path().join("test.sock");
    let cfg = Config::try_parse_from([
        "cellblockd",
        "--data-dir",
        tmp.path().to_str().unwrap(),
        "--sock-path",
        sock_path.to_str().unwrap(),
    ])
    .expect("parse test config");
    cellblockd::helpers::ensure_data_dirs(&cfg).expect("create data dirs");

    let daemon = Arc::new(Daemon::new(cfg));
    let listener = UnixListener::bind(&sock_path).expect("bind test socket");

    let accept_daemon = daemon.clone();
    tokio::spawn(async move {
        loop {
            let (stream, _addr) = match listener.accept().await {
                Ok(s) => s,
                Err(_) => break,
            };
            tokio::spawn(handle_peer(accept_daemon.clone(), stream));
        }
    });

    (daemon, sock_path)
}

async fn read_response(stream: &mut UnixStream) -> Response {
    let mut code = [0u8; 4];
    stream.read_exact(&mut code).await.expect("read response code");
    assert_eq!(u32::from_ne_bytes(code), Command::Response as u32);
    let mut body = vec![0u8; 4 + ERRBUF_LEN];
    stream.read_exact(&mut body).await.expect("read response body");
    Response::from_bytes(&body).expect("decode response")
}

async fn send_launch(sock_path: &Path, name: &str) -> Response {
    let mut stream = UnixStream::connect(sock_path).await.expect("connect");
    stream
        .write_all(&(Command::LaunchInstance as u32).to_ne_bytes())
        .await
        .unwrap();
    let hdr = LaunchHeader {
        name: name.into(),
        term: "xterm".into(),
        volumes: String::new(),
        network: String::new(),
        tag: "latest".into(),
        ports: String::new(),
        entry_point_args: String::new(),
        verbose: false,
    };
    stream.write_all(&hdr.to_bytes()).await.unwrap();
    read_response(&mut stream).await
}

#[tokio::test]
async fn launch_rejects_duplicate_image_name() {
    let tmp = tempfile::tempdir().unwrap();
    let (_daemon, sock_path) = spawn_test_daemon(&tmp).await;

    let first = send_launch(&sock_path, "alpine").await;
    assert_eq!(first.ecode, 0);
    assert_eq!(first.message.len(), 64);

    let second = send_launch(&sock_path, "alpine").await;
    assert_eq!(second.ecode, 1);
    assert!(second.message.contains("already exists"));
}

#[tokio::test]
async fn console_connect_unknown_instance_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let (_daemon, sock_path) = spawn_test_daemon(&tmp).await;

    let mut stream = UnixStream::connect(&sock_path).await.unwrap();
    stream
        .write_all(&(Command::ConsoleConnect as u32).to_ne_bytes())
        .await
        .unwrap();
    let hdr = ConsoleConnectHeader {
        target: "f".repeat(64),
        termios: vec![0u8; 16],
        winsize: Winsize { rows: 24, cols: 80 },
    };
    stream.write_all(&hdr.to_bytes()).await.unwrap();

    let resp = read_response(&mut stream).await;
    assert_eq!(resp.ecode, 1);
    assert!(resp.message.contains("invalid container"));
}

#[tokio::test]
async fn generic_command_network_list_reports_no_networks() {
    let tmp = tempfile::tempdir().unwrap();
    let (_daemon, sock_path) = spawn_test_daemon(&tmp).await;

    let mut stream = UnixStream::connect(&sock_path).await.unwrap();
    let mut args = ArgVec::init(0);
    args.finalize();
    let payload = args.marshal();
    let hdr = GenericCommandHeader {
        cmd_name: "network-list".into(),
        verbose: false,
        payload_len: payload.len() as u32,
    };
    stream
        .write_all(&(Command::GenericCommand as u32).to_ne_bytes())
        .await
        .unwrap();
    stream.write_all(&hdr.to_bytes()).await.unwrap();
    stream.write_all(&payload).await.unwrap();

    let mut out = [0u8; 64];
    let n = stream.read(&mut out).await.unwrap();
    assert_eq!(&out[..n], b"no networks configured\n");
}

#[tokio::test]
async fn get_instances_counts_launched_instance() {
    let tmp = tempfile::tempdir().unwrap();
    let (_daemon, sock_path) = spawn_test_daemon(&tmp).await;

    let launch = send_launch(&sock_path, "alpine").await;
    assert_eq!(launch.ecode, 0);

    let mut stream = UnixStream::connect(&sock_path).await.unwrap();
    stream
        .write_all(&(Command::GetInstances as u32).to_ne_bytes())
        .await
        .unwrap();
    let mut count_buf = [0u8; 4];
    stream.read_exact(&mut count_buf).await.unwrap();
    assert_eq!(u32::from_ne_bytes(count_buf), 1);
}

#[tokio::test]
async fn build_context_rejects_too_many_stages() {
    let tmp = tempfile::tempdir().unwrap();
    let (_daemon, sock_path) = spawn_test_daemon(&tmp).await;

    let mut stream = UnixStream::connect(&sock_path).await.unwrap();
    stream
        .write_all(&(Command::SendBuildCtx as u32).to_ne_bytes())
        .await
        .unwrap();
    let hdr = BuildContextHeader {
        image_name: "toobig".into(),
        n_stages: cellblockd::wire::MAX_STAGES + 1,
        ..Default::default()
    };
    stream.write_all(&hdr.to_bytes()).await.unwrap();

    let resp = read_response(&mut stream).await;
    assert_eq!(resp.ecode, 1);
    assert!(resp.message.contains("too many"));
}
