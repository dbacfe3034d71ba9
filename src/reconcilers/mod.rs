//! Reconciliation logic for resource enforcement and Deployment mirroring

pub mod mirror;
pub mod resources;
pub mod rollout;
