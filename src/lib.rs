//! Instance dispatcher for a lightweight BSD-jail-style container manager:
//! a single daemon process that launches, attaches to, and tears down
//! jailed instances over a framed Unix-socket protocol.

pub mod build;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod helpers;
pub mod instance;
pub mod peer;
pub mod pty;
pub mod pump;
pub mod reaper;
pub mod scrollback;
pub mod server;
pub mod wire;

pub use config::Config;
pub use server::Server;
