//! Integration tests for the Cluster controller
//!
//! These tests require a Kubernetes cluster (kind) to run and tell the story
//! of how the controller drives Cluster resources against a real API server.
//!
//! # Test Organization
//!
//! - `crd_operations`: Stories about creating, reading and patching Cluster
//!   resources through the Kubernetes API
//!
//! - `cluster_lifecycle`: Stories about how the controller claims a Cluster,
//!   computes its phase and releases it on deletion
//!
//! # Running These Tests
//!
//! ```bash
//! cargo test --test kind -- --ignored
//! ```

mod cluster_lifecycle;
mod crd_operations;
mod helpers;
