//! Controller implementation for Cluster API Clusters
//!
//! The entry point fetches the latest Cluster, gates on pause and the
//! finalizer, and hands off to either the normal path (provider objects,
//! kubeconfig, control plane initialization) or the cascading teardown.
//! A mapper turns control plane Machine events into Cluster requeues.

mod cluster;
mod deletion;
mod kubeconfig;
mod patch;
mod phases;
mod watch;

#[cfg(test)]
pub use cluster::MockKubeClient;
pub use cluster::{
    error_policy, reconcile, reconcile_cluster, Context, ContextBuilder, KubeClient,
    KubeClientImpl, Requeue,
};
pub use deletion::{reconcile_delete, DELETE_REQUEUE_AFTER};
pub use kubeconfig::{
    ca_secret_name, kubeconfig_secret_name, render_kubeconfig, CLUSTER_SECRET_TYPE,
    KUBECONFIG_KEY,
};
pub use phases::{reconcile_normal, update_phase};
pub use watch::control_plane_machine_to_cluster;
