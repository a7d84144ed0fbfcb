//! longlink: a persistent framed TCP link.
//!
//! Keeps one long-lived connection to a remote endpoint:
//! - Length-prefixed frames (`u32` big-endian length, at most 1024 bytes)
//! - Strictly ordered writes through a single writer task
//! - Heartbeat probes with a timeout watchdog that recycles dead connections
//! - Reconnect with a fixed retry interval, gated by a caller error policy
//!
//! The crate also carries the two collaborators of the link: an echo server
//! that mirrors bytes back, and an echo client that sends text over a link.

pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod link;
pub mod server;

pub use config::LinkConfig;
pub use error::LinkError;
pub use link::{ConnectionState, Link, WriteOutcome};
