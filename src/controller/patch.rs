//! Conflict-scoped write-back of a reconciled Cluster
//!
//! A pass mutates an in-memory copy of the Cluster. [`ClusterPatcher`]
//! remembers what the pass started from and, at the end, sends only what the
//! pass changed:
//!
//! - status goes to the status subresource guarded by the latest
//!   `resourceVersion`, with conditions three-way merged against whatever
//!   other writers stored in the meantime,
//! - finalizers and spec go out as a JSON merge patch.
//!
//! Status is written first; removing the last finalizer may let the API
//! server delete the object immediately.

use kube::ResourceExt;
use serde_json::{Map, Value};
use tracing::debug;

use super::KubeClient;
use crate::conditions::{self, OWNED_CONDITIONS};
use crate::crd::Cluster;
use crate::retry::{retry_on_conflict, Backoff};
use crate::Error;

/// Snapshot of a Cluster taken before a reconcile pass
pub(crate) struct ClusterPatcher {
    before: Cluster,
}

impl ClusterPatcher {
    /// Remember `cluster` as the starting point of the pass
    pub(crate) fn new(cluster: &Cluster) -> Self {
        Self {
            before: cluster.clone(),
        }
    }

    /// Write back everything the pass changed.
    ///
    /// `observedGeneration` advances only when `pass_succeeded`. Failures of
    /// the status and metadata writes are aggregated.
    pub(crate) async fn patch(
        &self,
        kube: &dyn KubeClient,
        after: &Cluster,
        pass_succeeded: bool,
    ) -> Result<(), Error> {
        let mut errors = Vec::new();
        if let Err(e) = self.patch_status(kube, after, pass_succeeded).await {
            errors.push(e);
        }
        if let Err(e) = self.patch_metadata(kube, after).await {
            errors.push(e);
        }
        Error::aggregate(errors).map_or(Ok(()), Err)
    }

    /// Write finalizer and spec changes, if any
    pub(crate) async fn patch_metadata(
        &self,
        kube: &dyn KubeClient,
        after: &Cluster,
    ) -> Result<(), Error> {
        let before = metadata_view(&self.before)?;
        let desired = metadata_view(after)?;
        let patch = merge_patch(&before, &desired);
        if is_empty_patch(&patch) {
            return Ok(());
        }

        debug!(patch = %patch, "patching cluster metadata");
        kube.patch_cluster(&namespace(after), &after.name_any(), &patch)
            .await
    }

    async fn patch_status(
        &self,
        kube: &dyn KubeClient,
        after: &Cluster,
        pass_succeeded: bool,
    ) -> Result<(), Error> {
        let before = self.before.status.clone().unwrap_or_default();
        let mut desired = after.status.clone().unwrap_or_default();
        if pass_succeeded {
            desired.observed_generation = after.metadata.generation;
        }
        // only fields this pass changed; everything else stays as stored
        let changes = merge_patch(&to_value(&before)?, &to_value(&desired)?);

        let namespace = namespace(after);
        let name = after.name_any();

        retry_on_conflict(&Backoff::conflicts(), "patch_cluster_status", || {
            let (before, desired, changes) = (&before, &desired, &changes);
            let (namespace, name) = (&namespace, &name);
            async move {
                let Some(latest) = kube.get_cluster(namespace, name).await? else {
                    debug!("cluster disappeared before its status was written");
                    return Ok(());
                };
                let stored = latest.status.clone().unwrap_or_default();

                let merged = conditions::merge_changes(
                    &before.conditions,
                    &desired.conditions,
                    &stored.conditions,
                    OWNED_CONDITIONS,
                )?;
                let mut fields = changes.clone();
                if let Value::Object(map) = &mut fields {
                    map.remove("conditions");
                    if merged != stored.conditions {
                        map.insert("conditions".to_string(), to_value(&merged)?);
                    }
                }

                let fields = without_noops(&fields, &to_value(&stored)?);
                if is_empty_patch(&fields) {
                    return Ok(());
                }

                let patch = serde_json::json!({
                    "metadata": { "resourceVersion": latest.resource_version() },
                    "status": fields,
                });
                debug!(patch = %patch, "patching cluster status");
                kube.patch_cluster_status(namespace, name, &patch).await
            }
        })
        .await
    }
}

fn namespace(cluster: &Cluster) -> String {
    cluster.namespace().unwrap_or_default()
}

/// The parts of a Cluster outside status that a pass may change
fn metadata_view(cluster: &Cluster) -> Result<Value, Error> {
    Ok(serde_json::json!({
        "metadata": { "finalizers": cluster.finalizers() },
        "spec": to_value(&cluster.spec)?,
    }))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, Error> {
    serde_json::to_value(value).map_err(|e| Error::serialization(e.to_string()))
}

/// RFC 7386 merge patch turning `from` into `to`.
///
/// Keys absent from `to` are nulled; arrays and scalars are replaced whole.
fn merge_patch(from: &Value, to: &Value) -> Value {
    match (from, to) {
        (Value::Object(from), Value::Object(to)) => {
            let mut patch = Map::new();
            for (key, value) in to {
                match from.get(key) {
                    Some(old) if old == value => {}
                    Some(old) => {
                        patch.insert(key.clone(), merge_patch(old, value));
                    }
                    None => {
                        patch.insert(key.clone(), value.clone());
                    }
                }
            }
            for key in from.keys() {
                if !to.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ => to.clone(),
    }
}

/// Drop the parts of `patch` that `stored` already satisfies
fn without_noops(patch: &Value, stored: &Value) -> Value {
    let Value::Object(fields) = patch else {
        return patch.clone();
    };
    let mut kept = Map::new();
    for (key, value) in fields {
        match (value, stored.get(key)) {
            (Value::Null, None | Some(Value::Null)) => {}
            (Value::Object(_), Some(current @ Value::Object(_))) => {
                let nested = without_noops(value, current);
                if !is_empty_patch(&nested) {
                    kept.insert(key.clone(), nested);
                }
            }
            (value, Some(current)) if value == current => {}
            _ => {
                kept.insert(key.clone(), value.clone());
            }
        }
    }
    Value::Object(kept)
}

fn is_empty_patch(patch: &Value) -> bool {
    patch.as_object().is_some_and(Map::is_empty)
}
