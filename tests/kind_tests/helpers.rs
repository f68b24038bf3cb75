//! Shared setup for integration tests

use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use capi_cluster_controller::crd::{Cluster, Machine, MachineDeployment, MachinePool, MachineSet};
use capi_cluster_controller::FIELD_MANAGER;

/// Namespace every test works in
pub const TEST_NAMESPACE: &str = "default";

/// Connect to the current cluster and install the CRDs the controller reads
///
/// The Machine kinds are normally installed by the machine controllers; a
/// bare kind cluster has none, so the tests install the controller's view of
/// them.
pub async fn ensure_test_cluster() -> anyhow::Result<Client> {
    let client = Client::try_default().await?;
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in [
        Cluster::crd(),
        Machine::crd(),
        MachineSet::crd(),
        MachineDeployment::crd(),
        MachinePool::crd(),
    ] {
        let name = crd
            .metadata
            .name
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generated CRD has no name"))?;
        crds.patch(&name, &params, &Patch::Apply(&crd)).await?;
        wait_established(&crds, &name).await?;
    }

    Ok(client)
}

async fn wait_established(crds: &Api<CustomResourceDefinition>, name: &str) -> anyhow::Result<()> {
    for _ in 0..30 {
        let crd = crds.get(name).await?;
        let established = crd
            .status
            .and_then(|s| s.conditions)
            .unwrap_or_default()
            .iter()
            .any(|c| c.type_ == "Established" && c.status == "True");
        if established {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    anyhow::bail!("CRD {} never became established", name)
}

/// Delete a Cluster, stripping finalizers so it does not outlive the test
pub async fn cleanup_cluster(client: &Client, name: &str) {
    let api: Api<Cluster> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let _ = api
        .patch(
            name,
            &PatchParams::default(),
            &Patch::Merge(serde_json::json!({"metadata": {"finalizers": null}})),
        )
        .await;
    let _ = api.delete(name, &DeleteParams::default()).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
}
