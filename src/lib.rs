//! capi-cluster-controller - reconciles Cluster API `Cluster` resources
//!
//! The controller drives a Cluster from its declared references to a running
//! workload cluster and tears the whole fleet down safely on deletion.
//!
//! # Architecture
//!
//! Each reconcile pass is level-triggered:
//! - The entry point fetches the latest Cluster and gates on pause and the finalizer
//! - The normal path resolves provider objects, mirrors their readiness into
//!   conditions and generates the admin kubeconfig
//! - The deletion path removes owned descendants, then the control plane and
//!   infrastructure objects, and finally releases the finalizer
//! - Everything is written back in one conflict-aware patch
//!
//! # Modules
//!
//! - [`crd`] - Cluster and Machine-family resource types
//! - [`controller`] - Reconciliation entry point, phases, teardown and watch mapping
//! - [`descendants`] - Descendant discovery and ownership filtering
//! - [`external`] - Resolution of provider objects referenced by `(apiVersion, kind, name)`
//! - [`conditions`] - Condition helpers (set, summarize, mirror, three-way merge)
//! - [`pki`] - CA loading and admin client certificate issuance
//! - [`events`] - Kubernetes Event publishing
//! - [`retry`] - Backoff for conflicting writes
//! - [`config`] - Runtime configuration
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod conditions;
pub mod config;
pub mod controller;
pub mod crd;
pub mod descendants;
pub mod error;
pub mod events;
pub mod external;
pub mod pki;
pub mod retry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Well-known names
// =============================================================================

/// Finalizer this controller places on every Cluster it manages
pub const CLUSTER_FINALIZER: &str = "cluster.cluster.x-k8s.io";

/// Annotation that pauses reconciliation of a Cluster or provider object
pub const PAUSED_ANNOTATION: &str = "cluster.x-k8s.io/paused";

/// Label linking Machines, MachineSets, MachineDeployments and MachinePools
/// to their Cluster
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Label marking control plane Machines
pub const CONTROL_PLANE_LABEL: &str = "cluster.x-k8s.io/control-plane";

/// Field manager used for every write
pub const FIELD_MANAGER: &str = "capi-cluster-controller";

/// Name reported on Kubernetes Events
pub const CONTROLLER_NAME: &str = "cluster-controller";
