//! Integration tests for CRD operations
//!
//! These tests tell the story of how users interact with Cluster resources
//! through the Kubernetes API before the controller ever touches them.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams, PostParams};

use capi_cluster_controller::crd::{
    ApiEndpoint, Cluster, ClusterPhase, ClusterSpec, ClusterStatus, ExternalReference,
};
use capi_cluster_controller::FIELD_MANAGER;

use super::helpers::{cleanup_cluster, ensure_test_cluster, TEST_NAMESPACE};

// =============================================================================
// Test Fixtures
// =============================================================================

/// A Cluster backed by Docker infrastructure and a kubeadm control plane
fn provider_backed_cluster(name: &str) -> Cluster {
    Cluster {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(TEST_NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: ClusterSpec {
            paused: false,
            control_plane_endpoint: ApiEndpoint::default(),
            control_plane_ref: Some(ExternalReference::new(
                "controlplane.cluster.x-k8s.io/v1alpha4",
                "KubeadmControlPlane",
                name,
            )),
            infrastructure_ref: Some(ExternalReference::new(
                "infrastructure.cluster.x-k8s.io/v1alpha4",
                "DockerCluster",
                name,
            )),
        },
        status: None,
    }
}

// =============================================================================
// Cluster Resource Stories
// =============================================================================

/// Story: A user declares a Cluster backed by provider objects
///
/// Expected behavior:
/// - Both references survive the round trip through the API server
/// - The endpoint starts out unset and therefore invalid
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_user_declares_provider_backed_cluster() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<Cluster> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let name = "crd-provider-backed";
    cleanup_cluster(&client, name).await;

    api.create(&PostParams::default(), &provider_backed_cluster(name))
        .await
        .expect("failed to create cluster");

    let fetched = api.get(name).await.expect("failed to get cluster");
    let infra = fetched.spec.infrastructure_ref.as_ref().unwrap();
    assert_eq!(infra.kind, "DockerCluster");
    assert_eq!(infra.namespace_or(TEST_NAMESPACE), TEST_NAMESPACE);
    assert_eq!(
        fetched.spec.control_plane_ref.as_ref().unwrap().kind,
        "KubeadmControlPlane"
    );
    assert!(!fetched.spec.control_plane_endpoint.is_valid());
    assert!(!fetched.is_paused());

    cleanup_cluster(&client, name).await;
}

/// Story: A user pauses a Cluster with the well-known annotation
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_user_pauses_cluster_with_annotation() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<Cluster> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let name = "crd-paused";
    cleanup_cluster(&client, name).await;

    api.create(&PostParams::default(), &provider_backed_cluster(name))
        .await
        .expect("failed to create cluster");
    api.patch(
        name,
        &PatchParams::default(),
        &Patch::Merge(serde_json::json!({
            "metadata": {"annotations": {"cluster.x-k8s.io/paused": "true"}}
        })),
    )
    .await
    .expect("failed to annotate cluster");

    let fetched = api.get(name).await.expect("failed to get cluster");
    assert!(fetched.is_paused());

    cleanup_cluster(&client, name).await;
}

/// Story: Status lives in its own subresource
///
/// Writing status through the main resource is ignored by the API server,
/// which is why the controller patches `/status` separately.
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_status_is_a_subresource() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<Cluster> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let name = "crd-status";
    cleanup_cluster(&client, name).await;

    api.create(&PostParams::default(), &provider_backed_cluster(name))
        .await
        .expect("failed to create cluster");

    let status = ClusterStatus::with_phase(ClusterPhase::Provisioning);
    api.patch_status(
        name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(serde_json::json!({ "status": status })),
    )
    .await
    .expect("failed to patch status");

    let fetched = api.get(name).await.expect("failed to get cluster");
    assert_eq!(fetched.phase(), ClusterPhase::Provisioning);

    cleanup_cluster(&client, name).await;
}
