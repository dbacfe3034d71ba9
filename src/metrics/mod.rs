//! Prometheus metrics for the workload policy operator
//!
//! This module exposes metrics for monitoring operator health and reconciliation work.

pub mod prometheus;

pub use prometheus::*;
