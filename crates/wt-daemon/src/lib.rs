//! watchtower daemon: the scheduler, the periodic health and retention
//! loops, and the wiring that puts the agent system behind the API.

pub mod daemon;
pub mod scheduler;
pub mod signals;
