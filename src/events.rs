//! Kubernetes Events emitted while reconciling a Cluster
//!
//! Every lifecycle milestone the controller reaches is described by a
//! [`ClusterEvent`] and handed to an [`EventPublisher`]. Events show up in
//! `kubectl describe cluster` and are best effort: a failed publish is logged
//! and never fails the reconcile pass.

use async_trait::async_trait;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use tracing::warn;

use crate::crd::Cluster;

/// Action recorded for events raised on the normal path
pub const ACTION_RECONCILE: &str = "Reconcile";

/// Action recorded for events raised during teardown
pub const ACTION_DELETE: &str = "Delete";

/// A milestone in the life of a Cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterEvent {
    /// Descendants still exist and teardown is waiting on them
    DescendantsDeleting {
        /// Comma separated descendant names
        names: String,
    },
    /// At least one owned descendant could not be deleted
    DescendantDeleteFailed {
        /// Aggregated delete error
        error: String,
    },
    /// The control plane object was asked to delete
    ControlPlaneDeleting {
        /// `apiVersion/kind "name"` of the object
        object: String,
    },
    /// The infrastructure object was asked to delete
    InfrastructureDeleting {
        /// `apiVersion/kind "name"` of the object
        object: String,
    },
    /// Teardown finished and the finalizer was released
    FinalizerRemoved,
    /// The control plane reported itself initialized
    ControlPlaneInitialized {
        /// What reported initialization
        source: String,
    },
    /// The admin kubeconfig Secret was generated
    KubeconfigCreated {
        /// Name of the created Secret
        secret: String,
    },
}

impl ClusterEvent {
    /// Machine-readable reason
    pub fn reason(&self) -> &'static str {
        match self {
            Self::DescendantsDeleting { .. } => "DescendantsDeleting",
            Self::DescendantDeleteFailed { .. } => "DescendantDeleteFailed",
            Self::ControlPlaneDeleting { .. } => "ControlPlaneDeleting",
            Self::InfrastructureDeleting { .. } => "InfrastructureDeleting",
            Self::FinalizerRemoved => "FinalizerRemoved",
            Self::ControlPlaneInitialized { .. } => "ControlPlaneInitialized",
            Self::KubeconfigCreated { .. } => "KubeconfigCreated",
        }
    }

    /// Warning for failures, Normal otherwise
    pub fn event_type(&self) -> EventType {
        match self {
            Self::DescendantDeleteFailed { .. } => EventType::Warning,
            _ => EventType::Normal,
        }
    }

    /// Whether the event belongs to teardown or to the normal path
    pub fn action(&self) -> &'static str {
        match self {
            Self::ControlPlaneInitialized { .. } | Self::KubeconfigCreated { .. } => {
                ACTION_RECONCILE
            }
            _ => ACTION_DELETE,
        }
    }

    /// Human-readable note
    pub fn note(&self) -> String {
        match self {
            Self::DescendantsDeleting { names } => {
                format!("Waiting for descendants to be deleted: {}", names)
            }
            Self::DescendantDeleteFailed { error } => error.clone(),
            Self::ControlPlaneDeleting { object } => format!("Deleting control plane {}", object),
            Self::InfrastructureDeleting { object } => {
                format!("Deleting infrastructure {}", object)
            }
            Self::FinalizerRemoved => "All descendants and provider objects are gone".to_string(),
            Self::ControlPlaneInitialized { source } => {
                format!("Control plane initialized, reported by {}", source)
            }
            Self::KubeconfigCreated { secret } => {
                format!("Created admin kubeconfig in Secret {}", secret)
            }
        }
    }
}

/// Sink for Cluster events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Record `event` against `cluster`
    async fn publish(&self, cluster: &Cluster, event: ClusterEvent);
}

/// Publisher backed by the events.k8s.io API
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Report as `controller_name`, tagged with the pod name when known
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, cluster: &Cluster, event: ClusterEvent) {
        let record = Event {
            type_: event.event_type(),
            reason: event.reason().to_string(),
            note: Some(event.note()),
            action: event.action().to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&record, &cluster.object_ref(&())).await {
            warn!(
                cluster = %cluster.name_any(),
                reason = event.reason(),
                error = %e,
                "failed to publish cluster event"
            );
        }
    }
}

/// Publisher that drops everything
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _cluster: &Cluster, _event: ClusterEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::waiting(ClusterEvent::DescendantsDeleting { names: "a".into() }, "DescendantsDeleting", ACTION_DELETE)]
    #[case::finalizer(ClusterEvent::FinalizerRemoved, "FinalizerRemoved", ACTION_DELETE)]
    #[case::initialized(
        ClusterEvent::ControlPlaneInitialized { source: "KubeadmControlPlane".into() },
        "ControlPlaneInitialized",
        ACTION_RECONCILE
    )]
    #[case::kubeconfig(
        ClusterEvent::KubeconfigCreated { secret: "test-kubeconfig".into() },
        "KubeconfigCreated",
        ACTION_RECONCILE
    )]
    fn story_events_carry_reason_and_action(
        #[case] event: ClusterEvent,
        #[case] reason: &str,
        #[case] action: &str,
    ) {
        assert_eq!(event.reason(), reason);
        assert_eq!(event.action(), action);
        assert_eq!(event.event_type(), EventType::Normal);
    }

    #[test]
    fn story_failed_teardown_is_a_warning() {
        let event = ClusterEvent::DescendantDeleteFailed {
            error: "failed to delete Machine \"m-0\"".into(),
        };
        assert_eq!(event.event_type(), EventType::Warning);
        assert_eq!(event.note(), "failed to delete Machine \"m-0\"");
    }

    #[test]
    fn story_notes_name_the_object() {
        let event = ClusterEvent::InfrastructureDeleting {
            object: "infrastructure.cluster.x-k8s.io/v1alpha4/DockerCluster \"test\"".into(),
        };
        assert_eq!(
            event.note(),
            "Deleting infrastructure infrastructure.cluster.x-k8s.io/v1alpha4/DockerCluster \"test\""
        );
    }

    #[tokio::test]
    async fn story_noop_publisher_accepts_everything() {
        let cluster = crate::descendants::fixtures::cluster("test");
        NoopEventPublisher
            .publish(&cluster, ClusterEvent::FinalizerRemoved)
            .await;
    }
}
