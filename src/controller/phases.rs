//! Normal-path reconciliation of a Cluster
//!
//! A pass runs a fixed list of steps. Every step runs exactly once; errors
//! are collected and requeue hints are merged only while no step has failed,
//! so a broken provider never hides behind a short recheck.

use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use super::{kubeconfig, Context, Requeue};
use crate::conditions::{self, reasons, types, Fallback};
use crate::crd::{Cluster, ClusterPhase, ConditionSeverity, ExternalReference};
use crate::events::ClusterEvent;
use crate::external::ExternalObject;
use crate::Error;

/// One ordered unit of the normal path
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Step {
    Infrastructure,
    ControlPlane,
    Kubeconfig,
    ControlPlaneInitialized,
}

impl Step {
    const ALL: [Step; 4] = [
        Step::Infrastructure,
        Step::ControlPlane,
        Step::Kubeconfig,
        Step::ControlPlaneInitialized,
    ];

    async fn run(self, cluster: &mut Cluster, ctx: &Context) -> Result<Requeue, Error> {
        match self {
            Step::Infrastructure => reconcile_infrastructure(cluster, ctx).await,
            Step::ControlPlane => reconcile_control_plane(cluster, ctx).await,
            Step::Kubeconfig => kubeconfig::reconcile_kubeconfig(cluster, ctx).await,
            Step::ControlPlaneInitialized => {
                reconcile_control_plane_initialized(cluster, ctx).await
            }
        }
    }
}

/// Drive a live Cluster towards its desired state
///
/// # Returns
///
/// The lowest non-zero requeue hint of all steps, or the aggregate of every
/// step error.
pub async fn reconcile_normal(cluster: &mut Cluster, ctx: &Context) -> Result<Requeue, Error> {
    let mut requeue = Requeue::none();
    let mut errors = Vec::new();

    for step in Step::ALL {
        match step.run(cluster, ctx).await {
            Ok(hint) if errors.is_empty() => requeue = requeue.merge(hint),
            Ok(_) => {}
            Err(e) => {
                debug!(?step, error = %e, "reconcile step failed");
                errors.push(e);
            }
        }
    }

    match Error::aggregate(errors) {
        Some(e) => Err(e),
        None => Ok(requeue),
    }
}

/// Outcome of resolving a provider object for the normal path
#[derive(Debug)]
pub(crate) enum Resolution {
    /// The object does not exist yet
    Missing,
    /// The Cluster or the object is paused; leave both alone
    Paused,
    /// The object exists and is owned by the Cluster
    Resolved(ExternalObject),
}

/// Fetch a referenced provider object, adopt it and surface its failures
pub(crate) async fn reconcile_external(
    cluster: &mut Cluster,
    reference: &ExternalReference,
    ctx: &Context,
) -> Result<Resolution, Error> {
    let namespace = cluster.namespace().unwrap_or_default();
    let mut object = match ctx.external.get(reference, &namespace).await {
        Ok(object) => object,
        Err(e) if e.is_not_found() => {
            info!(reference = %reference, "referenced object not found yet");
            return Ok(Resolution::Missing);
        }
        Err(e) => return Err(Error::lookup(reference, cluster.key(), e)),
    };

    if cluster.is_paused() || object.is_paused() {
        debug!(object = %object.describe(), "referenced object is paused");
        return Ok(Resolution::Paused);
    }

    let owner = cluster.controller_owner_ref(&()).ok_or_else(|| {
        Error::internal(format!("Cluster {} has no uid to own {}", cluster.key(), reference))
    })?;
    if object.ensure_cluster_ownership(owner, &cluster.name_any())? {
        ctx.external.patch_metadata(&object).await?;
        debug!(object = %object.describe(), "set cluster ownership");
    }

    let (failure_reason, failure_message) = object.failures()?;
    let status = cluster.status_mut();
    if let Some(reason) = failure_reason {
        status.failure_reason = Some(reason);
    }
    if let Some(message) = failure_message {
        status.failure_message = Some(format!(
            "Failure detected from referenced resource {}, Kind={} with name {:?}: {}",
            object.api_version(),
            object.kind(),
            object.name(),
            message
        ));
    }

    Ok(Resolution::Resolved(object))
}

async fn reconcile_infrastructure(cluster: &mut Cluster, ctx: &Context) -> Result<Requeue, Error> {
    let Some(reference) = cluster.spec.infrastructure_ref.clone() else {
        return Ok(Requeue::none());
    };
    let object = match reconcile_external(cluster, &reference, ctx).await? {
        Resolution::Resolved(object) => object,
        Resolution::Missing => return Ok(Requeue::after(ctx.config.external_ready_wait())),
        Resolution::Paused => return Ok(Requeue::none()),
    };

    if object.is_deleting() {
        debug!(object = %object.describe(), "infrastructure is being deleted");
        return Ok(Requeue::none());
    }

    let ready = object.is_ready()?;
    cluster.status_mut().infrastructure_ready = ready;
    conditions::set_mirror(
        cluster,
        types::INFRASTRUCTURE_READY,
        &object,
        Fallback::from_ready(ready, reasons::WAITING_FOR_INFRASTRUCTURE, ConditionSeverity::Info),
    );

    if !ready {
        info!(object = %object.describe(), "infrastructure is not ready yet");
        return Ok(Requeue::after(ctx.config.external_ready_wait()));
    }

    if !cluster.spec.control_plane_endpoint.is_valid() {
        if let Some(endpoint) = object.control_plane_endpoint()? {
            cluster.spec.control_plane_endpoint = endpoint;
        }
    }

    if let Some(domains) = object.failure_domains()? {
        cluster.status_mut().failure_domains = domains;
    }

    Ok(Requeue::none())
}

async fn reconcile_control_plane(cluster: &mut Cluster, ctx: &Context) -> Result<Requeue, Error> {
    let Some(reference) = cluster.spec.control_plane_ref.clone() else {
        return Ok(Requeue::none());
    };
    let object = match reconcile_external(cluster, &reference, ctx).await? {
        Resolution::Resolved(object) => object,
        Resolution::Missing => return Ok(Requeue::after(ctx.config.external_ready_wait())),
        Resolution::Paused => return Ok(Requeue::none()),
    };

    if object.is_deleting() {
        debug!(object = %object.describe(), "control plane is being deleted");
        return Ok(Requeue::none());
    }

    if object.is_initialized()? && !cluster.is_control_plane_initialized() {
        cluster.status_mut().control_plane_initialized = true;
        publish_initialized(cluster, ctx, &object.describe()).await;
    }

    let ready = object.is_ready()?;
    cluster.status_mut().control_plane_ready = ready;
    conditions::set_mirror(
        cluster,
        types::CONTROL_PLANE_READY,
        &object,
        Fallback::from_ready(ready, reasons::WAITING_FOR_CONTROL_PLANE, ConditionSeverity::Info),
    );

    if !ready {
        info!(object = %object.describe(), "control plane is not ready yet");
        return Ok(Requeue::after(ctx.config.external_ready_wait()));
    }

    if !cluster.spec.control_plane_endpoint.is_valid() {
        if let Some(endpoint) = object.control_plane_endpoint()? {
            cluster.spec.control_plane_endpoint = endpoint;
        }
    }

    Ok(Requeue::none())
}

/// Latch `status.controlPlaneInitialized` once a control plane Machine has
/// joined, for Clusters without a control plane provider
async fn reconcile_control_plane_initialized(
    cluster: &mut Cluster,
    ctx: &Context,
) -> Result<Requeue, Error> {
    if cluster.spec.control_plane_ref.is_some() || cluster.is_control_plane_initialized() {
        return Ok(Requeue::none());
    }

    let namespace = cluster.namespace().unwrap_or_default();
    let machines = ctx.kube.list_machines(&namespace, &cluster.name_any()).await?;

    let joined = machines
        .iter()
        .filter(|m| m.metadata.deletion_timestamp.is_none())
        .find(|m| m.is_control_plane() && m.has_node_ref());

    if let Some(machine) = joined {
        cluster.status_mut().control_plane_initialized = true;
        let source = format!("Machine {:?}", machine.name_any());
        publish_initialized(cluster, ctx, &source).await;
    }

    Ok(Requeue::none())
}

async fn publish_initialized(cluster: &Cluster, ctx: &Context, source: &str) {
    info!(source, "control plane initialized");
    let event = ClusterEvent::ControlPlaneInitialized {
        source: source.to_string(),
    };
    ctx.events.publish(cluster, event).await;
}

/// Recompute `status.phase` from the rest of the Cluster's state
///
/// Rules apply in order and later ones win.
pub fn update_phase(cluster: &mut Cluster) {
    let mut phase = cluster.phase();

    if phase == ClusterPhase::Unknown {
        phase = ClusterPhase::Pending;
    }
    if cluster.spec.infrastructure_ref.is_some() {
        phase = ClusterPhase::Provisioning;
    }
    if cluster.is_infrastructure_ready() && cluster.spec.control_plane_endpoint.is_valid() {
        phase = ClusterPhase::Provisioned;
    }
    let failed = cluster
        .status
        .as_ref()
        .is_some_and(|s| s.failure_reason.is_some() || s.failure_message.is_some());
    if failed {
        phase = ClusterPhase::Failed;
    }
    if cluster.is_deleting() {
        phase = ClusterPhase::Deleting;
    }

    if phase != cluster.phase() {
        debug!(from = %cluster.phase(), to = %phase, "phase changed");
        cluster.status_mut().phase = phase;
    }
}
