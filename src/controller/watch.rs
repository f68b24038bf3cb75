//! Mapping from Machine events to Cluster reconcile requests
//!
//! A Cluster without a control plane provider learns that its control plane
//! is up from its Machines. When a control plane Machine gets a node
//! reference, the owning Cluster is requeued so it can latch
//! `status.controlPlaneInitialized`.

use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;
use tracing::debug;

use crate::crd::{Cluster, Machine};

/// Cluster to reconcile after a change to `machine`, if any
///
/// `clusters` is the controller's own reflector store, so the lookup never
/// hits the API server.
pub fn control_plane_machine_to_cluster(
    machine: &Machine,
    clusters: &Store<Cluster>,
) -> Vec<ObjectRef<Cluster>> {
    if !machine.is_control_plane() || !machine.has_node_ref() {
        return Vec::new();
    }

    let namespace = machine.namespace().unwrap_or_default();
    let key = ObjectRef::new(&machine.spec.cluster_name).within(&namespace);
    let Some(cluster) = clusters.get(&key) else {
        debug!(
            machine = %machine.name_any(),
            cluster = %machine.spec.cluster_name,
            namespace = %namespace,
            "cluster for control plane machine not found"
        );
        return Vec::new();
    };

    if cluster.is_control_plane_initialized() {
        return Vec::new();
    }

    vec![ObjectRef::from_obj(cluster.as_ref())]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descendants::fixtures::{cluster as sample_cluster, machine, with_node_ref};
    use kube::runtime::reflector::store::Writer;
    use kube::runtime::watcher::Event;
    use rstest::rstest;

    fn store_with(clusters: Vec<Cluster>) -> Store<Cluster> {
        let mut writer = Writer::<Cluster>::default();
        for cluster in clusters {
            writer.apply_watcher_event(&Event::Apply(cluster));
        }
        writer.as_reader()
    }

    fn initialized(mut cluster: Cluster) -> Cluster {
        cluster.status_mut().control_plane_initialized = true;
        cluster
    }

    /// Story: Only a joined control plane Machine of an uninitialized
    /// Cluster triggers a reconcile
    #[rstest]
    #[case::worker_machine(false, true, false)]
    #[case::control_plane_without_node(true, false, false)]
    #[case::joined_control_plane(true, true, true)]
    fn story_only_joined_control_plane_machines_map(
        #[case] control_plane: bool,
        #[case] joined: bool,
        #[case] requeued: bool,
    ) {
        let store = store_with(vec![sample_cluster("test")]);
        let m = machine("m-0", "test", control_plane, true);
        let m = if joined { with_node_ref(m) } else { m };

        let requests = control_plane_machine_to_cluster(&m, &store);
        if requeued {
            assert_eq!(
                requests,
                vec![ObjectRef::<Cluster>::new("test").within("default")]
            );
        } else {
            assert!(requests.is_empty());
        }
    }

    /// Story: A Machine whose Cluster is gone maps to nothing
    #[test]
    fn story_unknown_cluster_maps_to_nothing() {
        let store = store_with(vec![sample_cluster("other")]);
        let m = with_node_ref(machine("cp-0", "test", true, true));
        assert!(control_plane_machine_to_cluster(&m, &store).is_empty());
    }

    /// Story: An initialized Cluster is not requeued again
    #[test]
    fn story_initialized_cluster_is_not_requeued() {
        let store = store_with(vec![initialized(sample_cluster("test"))]);
        let m = with_node_ref(machine("cp-0", "test", true, true));
        assert!(control_plane_machine_to_cluster(&m, &store).is_empty());
    }

    /// Story: The lookup respects namespaces
    #[test]
    fn story_cluster_in_other_namespace_is_not_matched() {
        let mut elsewhere = sample_cluster("test");
        elsewhere.metadata.namespace = Some("team-a".to_string());
        let store = store_with(vec![elsewhere]);
        let m = with_node_ref(machine("cp-0", "test", true, true));
        assert!(control_plane_machine_to_cluster(&m, &store).is_empty());
    }
}
