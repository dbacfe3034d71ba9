//! Workload Policy Operator
//!
//! Watches Deployments and keeps two kinds of derived state in line with them:
//! the resource requests and limits of a designated container, and zero-scaled
//! shadow copies (plus their cronscalers) placed on the eklet node pool.

pub mod adapters;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod reconcilers;

pub use error::{Error, Result};
