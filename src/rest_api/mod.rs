//! REST API module for external integrations
//!
//! Serves operator metrics, probes and the outcome of the last
//! reconciliation pass of every signal.

mod dto;
mod handlers;
mod server;

pub use server::{run_server, DEFAULT_BIND_ADDRESS};
