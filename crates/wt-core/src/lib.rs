//! Core data model, configuration, clock and persistence for watchtower.
//!
//! Everything the scheduling/execution/health crates share lives here:
//! - [`types`]: agents, executions, results and their status enums
//! - [`config`]: the TOML configuration surface
//! - [`clock`]: injectable time source so loops can be driven deterministically
//! - [`store`]: SQLite-backed storage for agents, executions and results

pub mod clock;
pub mod config;
pub mod store;
pub mod types;
