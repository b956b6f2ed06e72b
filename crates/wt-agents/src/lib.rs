//! Agent registry, execution and health for watchtower.
//!
//! This crate owns everything between "an agent is defined" and "an
//! execution record is terminal":
//! - [`registry`]: tenant-scoped agent CRUD with capability validation
//! - [`capabilities`]: capability → executor mapping and config rules
//! - [`sources`] / [`executor`]: data-source contract and the executor variants
//! - [`coordinator`]: claims agents, bounds concurrency, runs in-process or isolated
//! - [`isolation`] / [`worker`]: isolated worker dispatch and the worker routine
//! - [`results`]: result and execution-history queries, retention
//! - [`health`]: windowed health assessment and demotion
//! - [`events`]: in-process event bus

pub mod capabilities;
pub mod coordinator;
pub mod events;
pub mod executor;
pub mod health;
pub mod isolation;
pub mod registry;
pub mod results;
pub mod sources;
pub mod state_machine;
pub mod worker;
