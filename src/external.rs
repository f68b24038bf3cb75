//! Resolution of provider-managed objects referenced by `(apiVersion, kind, name)`
//!
//! Infrastructure and control plane providers define their own CRDs, so the
//! controller handles their objects as [`DynamicObject`]s behind the narrow
//! [`ExternalObject`] view. Only a handful of conventional fields are read:
//! `status.ready`, `status.initialized`, `status.failureReason`,
//! `status.failureMessage`, `status.conditions`, `status.failureDomains` and
//! `spec.controlPlaneEndpoint`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::conditions::Getter;
use crate::crd::{ApiEndpoint, Condition, ExternalReference, FailureDomains};
use crate::error::classify;
use crate::{Error, CLUSTER_NAME_LABEL, FIELD_MANAGER, PAUSED_ANNOTATION};

/// Trait abstracting access to provider objects
///
/// This trait allows mocking providers in tests while using dynamic
/// discovery against the API server in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ExternalResolver: Send + Sync {
    /// Fetch the referenced object
    ///
    /// Returns [`Error::NotFound`] when the object does not exist, which
    /// callers treat as a state transition rather than a failure.
    async fn get(
        &self,
        reference: &ExternalReference,
        namespace: &str,
    ) -> Result<ExternalObject, Error>;

    /// Request deletion of the object; an already-deleted object is success
    async fn delete(&self, object: &ExternalObject) -> Result<(), Error>;

    /// Persist the object's labels and owner references
    async fn patch_metadata(&self, object: &ExternalObject) -> Result<(), Error>;
}

/// Weakly typed view of a provider object
#[derive(Clone, Debug)]
pub struct ExternalObject {
    resource: ApiResource,
    object: DynamicObject,
}

impl ExternalObject {
    /// Wrap a fetched object together with the resource it was fetched from
    pub fn new(resource: ApiResource, object: DynamicObject) -> Self {
        Self { resource, object }
    }

    /// Build from raw JSON, deriving the resource from `apiVersion` and `kind`
    pub fn from_value(value: Value) -> Result<Self, Error> {
        let object: DynamicObject =
            serde_json::from_value(value).map_err(|e| Error::serialization(e.to_string()))?;
        let types = object
            .types
            .clone()
            .ok_or_else(|| Error::serialization("object is missing apiVersion/kind"))?;
        let resource = fallback_api_resource(&types.api_version, &types.kind);
        Ok(Self { resource, object })
    }

    /// Resource this object belongs to
    pub fn resource(&self) -> &ApiResource {
        &self.resource
    }

    /// Underlying dynamic object
    pub fn object(&self) -> &DynamicObject {
        &self.object
    }

    /// Object name
    pub fn name(&self) -> String {
        self.object.name_any()
    }

    /// Object namespace
    pub fn namespace(&self) -> Option<String> {
        self.object.namespace()
    }

    /// API version of the object
    pub fn api_version(&self) -> &str {
        &self.resource.api_version
    }

    /// Kind of the object
    pub fn kind(&self) -> &str {
        &self.resource.kind
    }

    /// `apiVersion/kind "name"` for logs and errors
    pub fn describe(&self) -> String {
        format!("{}/{} {:?}", self.api_version(), self.kind(), self.name())
    }

    /// Returns true if the deletion timestamp is set
    pub fn is_deleting(&self) -> bool {
        self.object.metadata.deletion_timestamp.is_some()
    }

    /// Returns true if the object carries the paused annotation
    pub fn is_paused(&self) -> bool {
        self.object.annotations().contains_key(PAUSED_ANNOTATION)
    }

    /// Labels on the object
    pub fn labels(&self) -> &BTreeMap<String, String> {
        self.object.labels()
    }

    /// Owner references on the object
    pub fn owner_references(&self) -> &[OwnerReference] {
        self.object.owner_references()
    }

    /// The `spec` stanza, if any
    pub fn spec(&self) -> Option<&Value> {
        self.object.data.get("spec")
    }

    /// The `status` stanza, if any
    pub fn status(&self) -> Option<&Value> {
        self.object.data.get("status")
    }

    /// Deserialize a nested field; `None` when any path segment is missing
    pub fn field<T: DeserializeOwned>(&self, path: &[&str]) -> Result<Option<T>, Error> {
        let mut current = &self.object.data;
        for segment in path {
            match current.get(segment) {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        if current.is_null() {
            return Ok(None);
        }
        serde_json::from_value(current.clone()).map(Some).map_err(|e| {
            Error::external(
                self.describe(),
                format!("failed to read {}: {}", path.join("."), e),
            )
        })
    }

    /// `status.ready`, false when unset
    pub fn is_ready(&self) -> Result<bool, Error> {
        self.bool_status("ready")
    }

    /// `status.initialized`, false when unset
    pub fn is_initialized(&self) -> Result<bool, Error> {
        self.bool_status("initialized")
    }

    fn bool_status(&self, field: &str) -> Result<bool, Error> {
        Ok(self.field::<bool>(&["status", field])?.unwrap_or(false))
    }

    /// `status.failureReason` and `status.failureMessage`
    pub fn failures(&self) -> Result<(Option<String>, Option<String>), Error> {
        let reason = self.field::<String>(&["status", "failureReason"])?;
        let message = self.field::<String>(&["status", "failureMessage"])?;
        Ok((
            reason.filter(|r| !r.is_empty()),
            message.filter(|m| !m.is_empty()),
        ))
    }

    /// `spec.controlPlaneEndpoint`
    pub fn control_plane_endpoint(&self) -> Result<Option<ApiEndpoint>, Error> {
        self.field(&["spec", "controlPlaneEndpoint"])
    }

    /// `status.failureDomains`
    pub fn failure_domains(&self) -> Result<Option<FailureDomains>, Error> {
        self.field(&["status", "failureDomains"])
    }

    /// Make `owner` the controller of this object and label it with the
    /// cluster name. Returns true if anything changed.
    ///
    /// Fails if a different object already controls this one.
    pub fn ensure_cluster_ownership(
        &mut self,
        owner: OwnerReference,
        cluster_name: &str,
    ) -> Result<bool, Error> {
        if let Some(other) = self
            .owner_references()
            .iter()
            .find(|o| o.controller == Some(true) && o.uid != owner.uid)
        {
            return Err(Error::external(
                self.describe(),
                format!("already controlled by {} {:?}", other.kind, other.name),
            ));
        }

        let mut changed = false;
        let owners = self.object.owner_references_mut();
        match owners
            .iter()
            .position(|o| o.kind == owner.kind && o.name == owner.name && same_group(o, &owner))
        {
            Some(idx) if owners[idx] == owner => {}
            Some(idx) => {
                owners[idx] = owner;
                changed = true;
            }
            None => {
                owners.push(owner);
                changed = true;
            }
        }

        let labels = self.object.labels_mut();
        if labels.get(CLUSTER_NAME_LABEL).map(String::as_str) != Some(cluster_name) {
            labels.insert(CLUSTER_NAME_LABEL.to_string(), cluster_name.to_string());
            changed = true;
        }

        Ok(changed)
    }
}

fn same_group(a: &OwnerReference, b: &OwnerReference) -> bool {
    parse_api_version(&a.api_version).0 == parse_api_version(&b.api_version).0
}

impl Getter for ExternalObject {
    /// Entries that do not parse as conditions are skipped
    fn conditions(&self) -> Vec<Condition> {
        self.status()
            .and_then(|s| s.get("conditions"))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|c| serde_json::from_value(c.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Production resolver using discovery and the dynamic API
pub struct DynamicResolver {
    client: Client,
}

impl DynamicResolver {
    /// Create a resolver over the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Discover the ApiResource for an API version and kind.
    ///
    /// Falls back to a pluralization guess when the group is not served yet,
    /// which happens right after a provider's CRDs are installed.
    async fn api_resource(&self, api_version: &str, kind: &str) -> ApiResource {
        let (group, version) = parse_api_version(api_version);
        let gvk = GroupVersionKind::gvk(group, version, kind);

        match kube::discovery::pinned_kind(&self.client, &gvk).await {
            Ok((ar, _caps)) => ar,
            Err(e) => {
                debug!(
                    api_version = %api_version,
                    kind = %kind,
                    error = %e,
                    "Resource not found in discovery, using fallback pluralization"
                );
                fallback_api_resource(api_version, kind)
            }
        }
    }

    fn api(&self, resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, resource)
    }
}

#[async_trait]
impl ExternalResolver for DynamicResolver {
    async fn get(
        &self,
        reference: &ExternalReference,
        namespace: &str,
    ) -> Result<ExternalObject, Error> {
        let resource = self
            .api_resource(&reference.api_version, &reference.kind)
            .await;
        let namespace = reference.namespace_or(namespace);
        let object = self
            .api(&resource, namespace)
            .get(&reference.name)
            .await
            .map_err(|e| {
                classify(e, &reference.kind, &format!("{}/{}", namespace, reference.name))
            })?;
        Ok(ExternalObject::new(resource, object))
    }

    async fn delete(&self, object: &ExternalObject) -> Result<(), Error> {
        let namespace = object.namespace().unwrap_or_default();
        match self
            .api(object.resource(), &namespace)
            .delete(&object.name(), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_metadata(&self, object: &ExternalObject) -> Result<(), Error> {
        let namespace = object.namespace().unwrap_or_default();
        let patch = serde_json::json!({
            "metadata": {
                "labels": object.labels(),
                "ownerReferences": object.owner_references(),
            }
        });
        self.api(object.resource(), &namespace)
            .patch(
                &object.name(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| classify(e, object.kind(), &object.name()))?;
        Ok(())
    }
}

/// Parse API version into group and version components
pub(crate) fn parse_api_version(api_version: &str) -> (&str, &str) {
    if let Some(idx) = api_version.rfind('/') {
        (&api_version[..idx], &api_version[idx + 1..])
    } else {
        // Core API (e.g., "v1")
        ("", api_version)
    }
}

fn fallback_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group: group.to_string(),
        version: version.to_string(),
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Known provider resource pluralizations.
///
/// Kubernetes plurals are lowercase with no separators. Kinds not listed
/// here use the standard English rules in [`pluralize_kind`].
const PROVIDER_KIND_PLURALS: &[(&str, &str)] = &[
    ("kubeadmcontrolplane", "kubeadmcontrolplanes"),
    ("dockercluster", "dockerclusters"),
    ("awscluster", "awsclusters"),
    ("awsmanagedcontrolplane", "awsmanagedcontrolplanes"),
    ("gcpcluster", "gcpclusters"),
    ("azurecluster", "azureclusters"),
    ("vspherecluster", "vsphereclusters"),
    ("metal3cluster", "metal3clusters"),
];

/// Convert a Kind to its plural resource name
fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    if let Some((_, plural)) = PROVIDER_KIND_PLURALS.iter().find(|(s, _)| *s == lower) {
        return (*plural).to_string();
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        // policy -> policies, but not gateway -> gateways
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::types;
    use crate::crd::ConditionStatus;
    use serde_json::json;

    fn infra(status: Value) -> ExternalObject {
        ExternalObject::from_value(json!({
            "apiVersion": "infrastructure.cluster.x-k8s.io/v1alpha4",
            "kind": "DockerCluster",
            "metadata": {"name": "test", "namespace": "default"},
            "spec": {"controlPlaneEndpoint": {"host": "172.18.0.3", "port": 6443}},
            "status": status
        }))
        .unwrap()
    }

    fn cluster_owner(uid: &str) -> OwnerReference {
        OwnerReference {
            api_version: "cluster.x-k8s.io/v1alpha4".to_string(),
            kind: "Cluster".to_string(),
            name: "test".to_string(),
            uid: uid.to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    mod api_version_parsing {
        use super::*;

        #[test]
        fn test_grouped_api_version() {
            assert_eq!(
                parse_api_version("infrastructure.cluster.x-k8s.io/v1alpha4"),
                ("infrastructure.cluster.x-k8s.io", "v1alpha4")
            );
        }

        #[test]
        fn test_core_api_version() {
            assert_eq!(parse_api_version("v1"), ("", "v1"));
        }
    }

    mod resource_pluralization {
        use super::*;
        use rstest::rstest;

        #[rstest]
        #[case("DockerCluster", "dockerclusters")]
        #[case("KubeadmControlPlane", "kubeadmcontrolplanes")]
        #[case("OpenStackCluster", "openstackclusters")]
        #[case("Policy", "policies")]
        #[case("Gateway", "gateways")]
        #[case("Address", "addresses")]
        fn test_pluralize(#[case] kind: &str, #[case] plural: &str) {
            assert_eq!(pluralize_kind(kind), plural);
        }

        #[test]
        fn test_from_value_derives_resource() {
            let obj = infra(json!({}));
            assert_eq!(obj.resource().plural, "dockerclusters");
            assert_eq!(obj.resource().group, "infrastructure.cluster.x-k8s.io");
            assert_eq!(obj.kind(), "DockerCluster");
        }
    }

    mod status_accessors {
        use super::*;

        #[test]
        fn test_ready_defaults_to_false() {
            assert!(!infra(json!({})).is_ready().unwrap());
            assert!(infra(json!({"ready": true})).is_ready().unwrap());
            assert!(!infra(json!({"initialized": false})).is_initialized().unwrap());
        }

        /// Story: A provider writing garbage into status.ready is an error, not "not ready"
        #[test]
        fn story_malformed_ready_is_reported() {
            let err = infra(json!({"ready": "yes"})).is_ready().unwrap_err();
            assert!(err.to_string().contains("status.ready"));
            assert!(err.to_string().contains("DockerCluster"));
        }

        #[test]
        fn test_failures_ignore_empty_strings() {
            let obj = infra(json!({"failureReason": "", "failureMessage": "boom"}));
            assert_eq!(obj.failures().unwrap(), (None, Some("boom".to_string())));
        }

        #[test]
        fn test_endpoint_and_failure_domains() {
            let obj = infra(json!({
                "failureDomains": {"fd1": {"controlPlane": true}}
            }));
            let endpoint = obj.control_plane_endpoint().unwrap().unwrap();
            assert_eq!(endpoint.port, 6443);

            let domains = obj.failure_domains().unwrap().unwrap();
            assert!(domains["fd1"].control_plane);

            assert!(infra(json!({})).failure_domains().unwrap().is_none());
        }

        #[test]
        fn test_conditions_skip_malformed_entries() {
            let obj = infra(json!({
                "conditions": [
                    {"type": "Ready", "status": "True", "lastTransitionTime": "2024-01-01T00:00:00Z"},
                    {"type": "Broken"}
                ]
            }));
            let conditions = obj.conditions();
            assert_eq!(conditions.len(), 1);
            let ready = obj.get_condition(types::READY).unwrap();
            assert_eq!(ready.status, ConditionStatus::True);
        }
    }

    mod ownership {
        use super::*;

        #[test]
        fn test_adopts_unowned_object() {
            let mut obj = infra(json!({}));
            let changed = obj
                .ensure_cluster_ownership(cluster_owner("uid-1"), "test")
                .unwrap();
            assert!(changed);
            assert_eq!(obj.owner_references().len(), 1);
            assert_eq!(obj.labels()[CLUSTER_NAME_LABEL], "test");

            let again = obj
                .ensure_cluster_ownership(cluster_owner("uid-1"), "test")
                .unwrap();
            assert!(!again, "second pass must be a no-op");
        }

        #[test]
        fn test_refuses_object_controlled_by_someone_else() {
            let mut obj = infra(json!({}));
            obj.ensure_cluster_ownership(cluster_owner("uid-1"), "test")
                .unwrap();

            let err = obj
                .ensure_cluster_ownership(cluster_owner("uid-2"), "test")
                .unwrap_err();
            assert!(err.to_string().contains("already controlled"));
        }
    }
}
