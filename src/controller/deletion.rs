//! Cascading teardown of a Cluster marked for deletion
//!
//! Teardown runs in a fixed order across passes: owned descendants first,
//! then the control plane object, then the infrastructure object. The
//! finalizer is released only once all three are gone.

use std::time::Duration;

use kube::ResourceExt;
use tracing::{info, warn};

use super::{Context, Requeue};
use crate::conditions::{self, reasons, types, Fallback};
use crate::crd::{Cluster, ConditionSeverity, ExternalReference};
use crate::descendants::list_descendants;
use crate::events::ClusterEvent;
use crate::Error;

/// Recheck interval while descendants are still going away
pub const DELETE_REQUEUE_AFTER: Duration = Duration::from_secs(5);

/// Advance the teardown of `cluster` by one step
///
/// # Returns
///
/// A 5s requeue while descendants remain, no requeue after a provider delete
/// was issued (its removal triggers the next pass), and no requeue once the
/// finalizer has been removed.
pub async fn reconcile_delete(cluster: &mut Cluster, ctx: &Context) -> Result<Requeue, Error> {
    let descendants = list_descendants(ctx.kube.as_ref(), cluster, ctx.config.machine_pool).await?;
    let children = descendants.filter_owned(cluster);

    if !children.is_empty() {
        info!(count = children.len(), "cluster still has children, deleting them first");

        let mut errors = Vec::new();
        for child in children.iter().filter(|c| !c.is_deleting()) {
            info!(kind = child.kind(), name = %child.name(), "deleting child");
            if let Err(e) = ctx.kube.delete_descendant(child).await {
                warn!(kind = child.kind(), name = %child.name(), error = %e, "failed to delete child");
                let target = format!("{} {:?}", child.kind(), child.name());
                errors.push(Error::delete(target, cluster.key(), e));
            }
        }

        if let Some(err) = Error::aggregate(errors) {
            let event = ClusterEvent::DescendantDeleteFailed {
                error: err.to_string(),
            };
            ctx.events.publish(cluster, event).await;
            return Err(err);
        }
    }

    if !descendants.is_empty() {
        let names = descendants.names();
        info!(
            descendants = %names,
            indirect = descendants.len() - children.len(),
            "cluster still has descendants, waiting for them to go away"
        );
        ctx.events
            .publish(cluster, ClusterEvent::DescendantsDeleting { names })
            .await;
        return Ok(Requeue::after(DELETE_REQUEUE_AFTER));
    }

    if let Some(reference) = cluster.spec.control_plane_ref.clone() {
        if !delete_external(cluster, &reference, types::CONTROL_PLANE_READY, ctx).await? {
            let event = ClusterEvent::ControlPlaneDeleting {
                object: reference.to_string(),
            };
            ctx.events.publish(cluster, event).await;
            return Ok(Requeue::none());
        }
    }

    if let Some(reference) = cluster.spec.infrastructure_ref.clone() {
        if !delete_external(cluster, &reference, types::INFRASTRUCTURE_READY, ctx).await? {
            let event = ClusterEvent::InfrastructureDeleting {
                object: reference.to_string(),
            };
            ctx.events.publish(cluster, event).await;
            return Ok(Requeue::none());
        }
    }

    cluster.remove_finalizer();
    info!("teardown complete, removed finalizer");
    ctx.events.publish(cluster, ClusterEvent::FinalizerRemoved).await;

    Ok(Requeue::none())
}

/// Delete a referenced provider object, mirroring its state into `condition`
///
/// Returns true once the object no longer exists.
async fn delete_external(
    cluster: &mut Cluster,
    reference: &ExternalReference,
    condition: &str,
    ctx: &Context,
) -> Result<bool, Error> {
    let namespace = cluster.namespace().unwrap_or_default();
    match ctx.external.get(reference, &namespace).await {
        Err(e) if e.is_not_found() => {
            conditions::mark_false(
                cluster,
                condition,
                reasons::DELETED,
                ConditionSeverity::Info,
                "",
            );
            Ok(true)
        }
        Err(e) => Err(Error::lookup(reference, cluster.key(), e)),
        Ok(object) => {
            conditions::set_mirror(
                cluster,
                condition,
                &object,
                Fallback::status_false(reasons::DELETING, ConditionSeverity::Info),
            );
            ctx.external
                .delete(&object)
                .await
                .map_err(|e| Error::delete(object.describe(), cluster.key(), e))?;
            info!(object = %object.describe(), "requested deletion of provider object");
            Ok(false)
        }
    }
}
