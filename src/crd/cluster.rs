//! Cluster Custom Resource Definition
//!
//! The Cluster CRD describes a desired workload cluster. Infrastructure and
//! control plane are delegated to provider objects referenced by
//! `infrastructureRef` and `controlPlaneRef`.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ApiEndpoint, ClusterPhase, Condition, ExternalReference, FailureDomains};
use crate::{CLUSTER_FINALIZER, PAUSED_ANNOTATION};

/// Specification for a Cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1alpha4",
    kind = "Cluster",
    plural = "clusters",
    shortname = "cl",
    status = "ClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Pause reconciliation of this cluster and its provider objects
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub paused: bool,

    /// Endpoint used to communicate with the control plane
    #[serde(default)]
    pub control_plane_endpoint: ApiEndpoint,

    /// Provider-specific control plane object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_ref: Option<ExternalReference>,

    /// Provider-specific infrastructure object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_ref: Option<ExternalReference>,
}

/// Observed state of a Cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Failure domains reported by the infrastructure provider
    #[serde(default, skip_serializing_if = "FailureDomains::is_empty")]
    pub failure_domains: FailureDomains,

    /// Terminal failure reason reported by a provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Terminal failure message reported by a provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,

    /// Infrastructure provider reports ready
    #[serde(default)]
    pub infrastructure_ready: bool,

    /// Control plane provider reports ready
    #[serde(default)]
    pub control_plane_ready: bool,

    /// The control plane has been initialized at least once
    #[serde(default)]
    pub control_plane_initialized: bool,

    /// Conditions representing the cluster state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation last fully reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl ClusterStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: ClusterPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Add a condition and return self for chaining
    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
        self
    }
}

impl Cluster {
    /// Status, inserting a default one if missing
    pub fn status_mut(&mut self) -> &mut ClusterStatus {
        self.status.get_or_insert_with(ClusterStatus::default)
    }

    /// Returns true if the deletion timestamp is set
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Returns true if this controller's finalizer is present
    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == CLUSTER_FINALIZER)
    }

    /// Add this controller's finalizer (no-op if present)
    pub fn add_finalizer(&mut self) {
        if !self.has_finalizer() {
            self.finalizers_mut().push(CLUSTER_FINALIZER.to_string());
        }
    }

    /// Remove this controller's finalizer
    pub fn remove_finalizer(&mut self) {
        self.finalizers_mut().retain(|f| f != CLUSTER_FINALIZER);
    }

    /// Returns true if reconciliation is paused via spec or annotation
    pub fn is_paused(&self) -> bool {
        self.spec.paused || self.annotations().contains_key(PAUSED_ANNOTATION)
    }

    /// Returns true once the control plane has been initialized
    pub fn is_control_plane_initialized(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.control_plane_initialized)
    }

    /// Returns true once infrastructure reports ready
    pub fn is_infrastructure_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.infrastructure_ready)
    }

    /// Current phase, Unknown when no status has been written
    pub fn phase(&self) -> ClusterPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// `namespace/name` key for logs and error messages
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }
}
