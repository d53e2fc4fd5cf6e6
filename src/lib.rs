//! `vtsession`: a terminal multiplexer core.
//!
//! Spawns PTY-attached child processes, records their output in an
//! asciinema-v2-compatible append-only cast file, and exposes live and
//! historical views of each session over HTTP, Server-Sent Events, and a
//! binary-framed WebSocket protocol. This crate is the embeddable core —
//! HTTP routing and the WebSocket upgrade handshake are left to the
//! embedding binary; see [`http`] and [`ws`] for the handler surface.

pub mod buffer;
pub mod cast;
pub mod config;
pub mod constants;
pub mod error;
pub mod file_watcher;
pub mod http;
pub mod process;
pub mod pty;
pub mod session;
pub mod subscription;
pub mod terminator;
pub mod ws;

pub use config::Config;
pub use error::{Error, Result};
pub use session::{CreateSpec, Metadata, SessionManager, Status};
