//! Shadowbox - remote sandbox execution service.
//!
//! A client pushes the state of an ephemeral workspace into a time-bounded
//! session, asks for a command to run against that state inside a disposable
//! sandbox, and watches the run live over a WebSocket log stream.

pub mod config;
pub mod error;
pub mod gateway;
pub mod logs;
pub mod registry;
pub mod runner;
pub mod sync;
