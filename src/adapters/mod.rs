//! Adapters between Kubernetes objects and the operator's reconcilers

pub mod cluster;
pub mod quantity;
pub mod shadow_builder;
