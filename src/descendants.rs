//! Descendant discovery for a Cluster
//!
//! Every Machine, MachineSet, MachineDeployment and MachinePool that belongs
//! to a Cluster carries the `cluster.x-k8s.io/cluster-name` label. The graph
//! query lists them by that label and splits Machines into control plane and
//! worker sets. Owned descendants are the subset with an owner reference to
//! the Cluster itself; the rest are reached transitively (e.g. a Machine owned
//! by a MachineSet) and disappear when their owner is deleted.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

use crate::controller::KubeClient;
use crate::crd::{Cluster, Machine, MachineDeployment, MachinePool, MachineSet};
use crate::external::parse_api_version;
use crate::Error;

/// One deletable descendant of a Cluster
#[derive(Clone, Debug, PartialEq)]
pub enum Descendant {
    /// An experimental MachinePool
    MachinePool(MachinePool),
    /// A MachineDeployment
    MachineDeployment(MachineDeployment),
    /// A MachineSet
    MachineSet(MachineSet),
    /// A Machine (control plane or worker)
    Machine(Machine),
}

impl Descendant {
    /// Kind of the wrapped object
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MachinePool(_) => "MachinePool",
            Self::MachineDeployment(_) => "MachineDeployment",
            Self::MachineSet(_) => "MachineSet",
            Self::Machine(_) => "Machine",
        }
    }

    /// Name of the wrapped object
    pub fn name(&self) -> String {
        match self {
            Self::MachinePool(o) => o.name_any(),
            Self::MachineDeployment(o) => o.name_any(),
            Self::MachineSet(o) => o.name_any(),
            Self::Machine(o) => o.name_any(),
        }
    }

    /// Namespace of the wrapped object
    pub fn namespace(&self) -> Option<String> {
        match self {
            Self::MachinePool(o) => o.namespace(),
            Self::MachineDeployment(o) => o.namespace(),
            Self::MachineSet(o) => o.namespace(),
            Self::Machine(o) => o.namespace(),
        }
    }

    /// Returns true if the deletion timestamp is set
    pub fn is_deleting(&self) -> bool {
        self.metadata().deletion_timestamp.is_some()
    }

    fn metadata(&self) -> &ObjectMeta {
        match self {
            Self::MachinePool(o) => &o.metadata,
            Self::MachineDeployment(o) => &o.metadata,
            Self::MachineSet(o) => &o.metadata,
            Self::Machine(o) => &o.metadata,
        }
    }

    /// Returns true if the object has an owner reference to `cluster`
    pub fn is_owned_by(&self, cluster: &Cluster) -> bool {
        let group = Cluster::group(&());
        let kind = Cluster::kind(&());
        let name = cluster.name_any();
        self.metadata()
            .owner_references
            .iter()
            .flatten()
            .any(|o| is_cluster_owner(o, &group, &kind, &name))
    }
}

fn is_cluster_owner(owner: &OwnerReference, group: &str, kind: &str, name: &str) -> bool {
    owner.kind == kind && owner.name == name && parse_api_version(&owner.api_version).0 == group
}

/// Everything that belongs to a Cluster, by kind
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClusterDescendants {
    /// MachinePools, only populated when the feature gate is on
    pub machine_pools: Vec<MachinePool>,
    /// MachineDeployments
    pub machine_deployments: Vec<MachineDeployment>,
    /// MachineSets
    pub machine_sets: Vec<MachineSet>,
    /// Control plane Machines, only populated without a control plane provider
    pub control_plane_machines: Vec<Machine>,
    /// Worker Machines
    pub worker_machines: Vec<Machine>,
}

impl ClusterDescendants {
    /// Total number of descendants, direct and indirect
    pub fn len(&self) -> usize {
        self.machine_pools.len()
            + self.machine_deployments.len()
            + self.machine_sets.len()
            + self.control_plane_machines.len()
            + self.worker_machines.len()
    }

    /// Returns true when nothing belongs to the Cluster any more
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Human-readable summary of what remains, for logs
    pub fn names(&self) -> String {
        let mut parts = Vec::new();
        push_names(&mut parts, "MachinePools", &self.machine_pools);
        push_names(&mut parts, "MachineDeployments", &self.machine_deployments);
        push_names(&mut parts, "MachineSets", &self.machine_sets);
        push_names(&mut parts, "Control plane Machines", &self.control_plane_machines);
        push_names(&mut parts, "Worker Machines", &self.worker_machines);
        parts.join("; ")
    }

    /// Descendants with an owner reference to `cluster`, in deletion order:
    /// MachinePools, MachineDeployments, MachineSets, worker Machines and
    /// control plane Machines last
    pub fn filter_owned(&self, cluster: &Cluster) -> Vec<Descendant> {
        self.in_deletion_order()
            .into_iter()
            .filter(|d| d.is_owned_by(cluster))
            .collect()
    }

    fn in_deletion_order(&self) -> Vec<Descendant> {
        self.machine_pools
            .iter()
            .cloned()
            .map(Descendant::MachinePool)
            .chain(
                self.machine_deployments
                    .iter()
                    .cloned()
                    .map(Descendant::MachineDeployment),
            )
            .chain(self.machine_sets.iter().cloned().map(Descendant::MachineSet))
            .chain(self.worker_machines.iter().cloned().map(Descendant::Machine))
            .chain(
                self.control_plane_machines
                    .iter()
                    .cloned()
                    .map(Descendant::Machine),
            )
            .collect()
    }
}

fn push_names<K: ResourceExt>(parts: &mut Vec<String>, label: &str, items: &[K]) {
    if items.is_empty() {
        return;
    }
    let names: Vec<String> = items.iter().map(ResourceExt::name_any).collect();
    parts.push(format!("{}: {}", label, names.join(", ")));
}

/// Query everything labelled as belonging to `cluster`.
///
/// MachinePools are listed only when `machine_pools_enabled`. Control plane
/// Machines are left out entirely when the Cluster has a control plane
/// provider, which owns their lifecycle.
pub async fn list_descendants(
    kube: &dyn KubeClient,
    cluster: &Cluster,
    machine_pools_enabled: bool,
) -> Result<ClusterDescendants, Error> {
    let namespace = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();

    let mut descendants = ClusterDescendants {
        machine_deployments: kube.list_machine_deployments(&namespace, &name).await?,
        machine_sets: kube.list_machine_sets(&namespace, &name).await?,
        ..Default::default()
    };

    if machine_pools_enabled {
        descendants.machine_pools = kube.list_machine_pools(&namespace, &name).await?;
    }

    let (control_plane, workers): (Vec<Machine>, Vec<Machine>) = kube
        .list_machines(&namespace, &name)
        .await?
        .into_iter()
        .partition(Machine::is_control_plane);

    descendants.worker_machines = workers;
    if cluster.spec.control_plane_ref.is_none() {
        descendants.control_plane_machines = control_plane;
    }

    Ok(descendants)
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::controller::MockKubeClient;
    use crate::crd::ExternalReference;

    /// A mock store holding one of each descendant kind for cluster "test"
    fn populated_store() -> MockKubeClient {
        let mut kube = MockKubeClient::new();
        kube.expect_list_machine_deployments()
            .returning(|_, c| Ok(vec![machine_deployment("md-0", c)]));
        kube.expect_list_machine_sets()
            .returning(|_, c| Ok(vec![machine_set("ms-0", c)]));
        kube.expect_list_machine_pools()
            .returning(|_, c| Ok(vec![machine_pool("mp-0", c)]));
        kube.expect_list_machines().returning(|_, c| {
            Ok(vec![
                machine("cp-0", c, true, true),
                machine("worker-0", c, false, true),
                machine("worker-1", c, false, false),
            ])
        });
        kube
    }

    mod graph_query {
        use super::*;

        /// Story: Machines split into control plane and worker sets
        #[tokio::test]
        async fn story_machines_are_classified() {
            let kube = populated_store();
            let descendants = list_descendants(&kube, &cluster("test"), false)
                .await
                .unwrap();

            assert_eq!(descendants.control_plane_machines.len(), 1);
            assert_eq!(descendants.worker_machines.len(), 2);
            assert!(descendants.machine_pools.is_empty());
            assert_eq!(descendants.len(), 5);
        }

        /// Story: MachinePools only participate when the feature gate is on
        #[tokio::test]
        async fn story_machine_pools_follow_feature_gate() {
            let mut kube = MockKubeClient::new();
            kube.expect_list_machine_deployments().returning(|_, _| Ok(vec![]));
            kube.expect_list_machine_sets().returning(|_, _| Ok(vec![]));
            kube.expect_list_machines().returning(|_, _| Ok(vec![]));
            kube.expect_list_machine_pools().never();

            let descendants = list_descendants(&kube, &cluster("test"), false)
                .await
                .unwrap();
            assert!(descendants.is_empty());

            let kube = populated_store();
            let descendants = list_descendants(&kube, &cluster("test"), true)
                .await
                .unwrap();
            assert_eq!(descendants.machine_pools.len(), 1);
            assert_eq!(descendants.len(), 6);
        }

        /// Story: A control plane provider hides control plane Machines entirely
        #[tokio::test]
        async fn story_control_plane_provider_hides_control_plane_machines() {
            let kube = populated_store();
            let mut cluster = cluster("test");
            cluster.spec.control_plane_ref = Some(ExternalReference::new(
                "controlplane.cluster.x-k8s.io/v1alpha4",
                "KubeadmControlPlane",
                "test-cp",
            ));

            let descendants = list_descendants(&kube, &cluster, false).await.unwrap();
            assert!(descendants.control_plane_machines.is_empty());
            assert_eq!(descendants.worker_machines.len(), 2);
            assert_eq!(descendants.len(), 4);
        }

        #[tokio::test]
        async fn test_list_failure_propagates() {
            let mut kube = MockKubeClient::new();
            kube.expect_list_machine_deployments()
                .returning(|_, _| Err(Error::internal("apiserver unavailable")));

            let err = list_descendants(&kube, &cluster("test"), false)
                .await
                .unwrap_err();
            assert!(err.to_string().contains("apiserver unavailable"));
        }
    }

    mod ownership_filter {
        use super::*;

        fn one_of_each() -> ClusterDescendants {
            ClusterDescendants {
                machine_pools: vec![machine_pool("mp-0", "test")],
                machine_deployments: vec![machine_deployment("md-0", "test")],
                machine_sets: vec![machine_set("ms-0", "test")],
                control_plane_machines: vec![machine("cp-0", "test", true, true)],
                worker_machines: vec![
                    machine("worker-0", "test", false, true),
                    machine("worker-1", "test", false, false),
                ],
            }
        }

        /// Story: Owned descendants come out in teardown order, control plane last
        #[test]
        fn story_owned_descendants_in_deletion_order() {
            let owned = one_of_each().filter_owned(&cluster("test"));
            let order: Vec<_> = owned.iter().map(|d| (d.kind(), d.name())).collect();

            assert_eq!(
                order,
                vec![
                    ("MachinePool", "mp-0".to_string()),
                    ("MachineDeployment", "md-0".to_string()),
                    ("MachineSet", "ms-0".to_string()),
                    ("Machine", "worker-0".to_string()),
                    ("Machine", "cp-0".to_string()),
                ]
            );
        }

        /// Story: Machines owned by a MachineSet are indirect and not deleted directly
        #[test]
        fn story_indirect_descendants_are_filtered_out() {
            let owned = one_of_each().filter_owned(&cluster("test"));
            assert!(owned.iter().all(|d| d.name() != "worker-1"));
        }

        #[test]
        fn test_ownership_requires_matching_cluster_name() {
            let owned = one_of_each().filter_owned(&cluster("other"));
            assert!(owned.is_empty());
        }

        #[test]
        fn test_names_lists_remaining_objects() {
            let names = one_of_each().names();
            assert!(names.contains("MachineDeployments: md-0"));
            assert!(names.contains("Worker Machines: worker-0, worker-1"));
            assert!(ClusterDescendants::default().names().is_empty());
        }
    }
}
