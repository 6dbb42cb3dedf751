//! Core daemon management modules.
//!
//! - `daemon`: the daemon aggregate, its builder and state queries
//! - `instance`: filesystem instances and their registry
//! - `mount`: mount orchestration per driver and direct kernel mounts
//! - `process`: termination and cleanup of daemon processes
//! - `client`: control-plane client and wire framing
//! - `supervisor`: state hand-off between daemon generations
//! - `config`: modes, drivers and per-instance configuration

pub mod client;
pub mod config;
pub mod constants;
pub mod daemon;
pub mod errors;
pub mod instance;
pub mod mount;
pub mod process;
pub mod retry;
pub mod supervisor;
pub mod types;

#[cfg(test)]
mod testing;
