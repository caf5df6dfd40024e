#![forbid(unsafe_code)]

//! `stagehand` — session-management server for externally launched client
//! processes, coordinated over a UDP OSC protocol.
//!
//! A controller asks the server to spawn named client programs into the
//! current session; spawned clients announce themselves back over the
//! same socket, their output is captured into durable per-client log
//! files, and sessions persist as directories under a home directory.

pub mod config;
pub mod errors;
pub mod handshake;
pub mod process;
pub mod protocol;
pub mod server;
pub mod session;
pub mod supervisor;

pub use config::{Config, TimeoutConfig};
pub use errors::{AppError, Result};
