//! Reliability infrastructure shared by the daemon and the isolated worker.
//!
//! - [`shutdown`]: cooperative shutdown plus in-flight execution tracking
//! - [`circuit_breaker`]: per-source breakers around external fetches

pub mod circuit_breaker;
pub mod shutdown;
