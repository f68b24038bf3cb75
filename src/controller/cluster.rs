//! Cluster controller implementation
//!
//! This module implements the reconciliation entry point for Cluster
//! resources. Each pass fetches the latest object, gates on pause and the
//! finalizer, dispatches to the deletion or normal path, then recomputes the
//! phase and `Ready` summary and writes everything back in one patch.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use super::patch::ClusterPatcher;
use super::{deletion, phases};
use crate::conditions::{self, types};
use crate::config::ControllerConfig;
use crate::crd::{Cluster, Machine, MachineDeployment, MachinePool, MachineSet};
use crate::descendants::Descendant;
use crate::error::classify;
use crate::events::{EventPublisher, KubeEventPublisher};
use crate::external::{DynamicResolver, ExternalResolver};
use crate::{Error, CLUSTER_NAME_LABEL, CONTROLLER_NAME, FIELD_MANAGER};

/// Trait abstracting Kubernetes client operations for the Cluster controller
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production. Lookups return `Ok(None)` for missing
/// objects; writes map HTTP 404 and 409 to [`Error::NotFound`] and
/// [`Error::Conflict`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Fetch a Cluster by namespace and name
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, Error>;

    /// Apply a JSON merge patch to a Cluster's metadata and spec
    async fn patch_cluster(&self, namespace: &str, name: &str, patch: &Value)
        -> Result<(), Error>;

    /// Apply a JSON merge patch to a Cluster's status subresource
    ///
    /// A `metadata.resourceVersion` inside the patch makes the write
    /// conditional on the object not having changed since it was read.
    async fn patch_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), Error>;

    /// MachineDeployments labelled with the cluster name
    async fn list_machine_deployments(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<MachineDeployment>, Error>;

    /// MachineSets labelled with the cluster name
    async fn list_machine_sets(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<MachineSet>, Error>;

    /// MachinePools labelled with the cluster name
    async fn list_machine_pools(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<MachinePool>, Error>;

    /// Machines labelled with the cluster name
    async fn list_machines(&self, namespace: &str, cluster_name: &str)
        -> Result<Vec<Machine>, Error>;

    /// Request deletion of a descendant; an already-deleted object is success
    async fn delete_descendant(&self, descendant: &Descendant) -> Result<(), Error>;

    /// Fetch a Secret by namespace and name
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// Create a Secret; an existing Secret with the same name is success
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn list_for_cluster<K>(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<K>, Error>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let selector = format!("{}={}", CLUSTER_NAME_LABEL, cluster_name);
        let list = self
            .api::<K>(namespace)
            .list(&ListParams::default().labels(&selector))
            .await?;
        Ok(list.items)
    }

    async fn delete_namespaced<K>(&self, namespace: &str, name: &str) -> Result<(), Error>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        match self
            .api::<K>(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, Error> {
        Ok(self.api::<Cluster>(namespace).get_opt(name).await?)
    }

    async fn patch_cluster(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), Error> {
        self.api::<Cluster>(namespace)
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await
            .map_err(|e| classify(e, "Cluster", &format!("{}/{}", namespace, name)))?;
        Ok(())
    }

    async fn patch_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), Error> {
        self.api::<Cluster>(namespace)
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await
            .map_err(|e| classify(e, "Cluster", &format!("{}/{}", namespace, name)))?;
        Ok(())
    }

    async fn list_machine_deployments(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<MachineDeployment>, Error> {
        self.list_for_cluster(namespace, cluster_name).await
    }

    async fn list_machine_sets(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<MachineSet>, Error> {
        self.list_for_cluster(namespace, cluster_name).await
    }

    async fn list_machine_pools(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<MachinePool>, Error> {
        self.list_for_cluster(namespace, cluster_name).await
    }

    async fn list_machines(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<Machine>, Error> {
        self.list_for_cluster(namespace, cluster_name).await
    }

    async fn delete_descendant(&self, descendant: &Descendant) -> Result<(), Error> {
        let namespace = descendant.namespace().unwrap_or_default();
        let name = descendant.name();
        match descendant {
            Descendant::MachinePool(_) => {
                self.delete_namespaced::<MachinePool>(&namespace, &name)
                    .await
            }
            Descendant::MachineDeployment(_) => {
                self.delete_namespaced::<MachineDeployment>(&namespace, &name)
                    .await
            }
            Descendant::MachineSet(_) => {
                self.delete_namespaced::<MachineSet>(&namespace, &name)
                    .await
            }
            Descendant::Machine(_) => self.delete_namespaced::<Machine>(&namespace, &name).await,
        }
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        Ok(self.api::<Secret>(namespace).get_opt(name).await?)
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error> {
        match self
            .api::<Secret>(namespace)
            .create(&PostParams::default(), secret)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(secret = %secret.name_any(), "secret already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Requeue hint produced by one reconcile step
///
/// Hints from several steps combine with lowest-non-zero semantics: the
/// earliest requested recheck wins and "no hint" never overrides a delay.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Requeue {
    after: Option<Duration>,
}

impl Requeue {
    /// No recheck requested; wait for the next watch event
    pub fn none() -> Self {
        Self::default()
    }

    /// Recheck after the given delay (a zero delay is no hint)
    pub fn after(delay: Duration) -> Self {
        Self {
            after: (!delay.is_zero()).then_some(delay),
        }
    }

    /// Requested delay, if any
    pub fn delay(&self) -> Option<Duration> {
        self.after
    }

    /// Combine two hints, keeping the lowest non-zero delay
    pub fn merge(self, other: Self) -> Self {
        match (self.after, other.after) {
            (Some(a), Some(b)) => Self::after(a.min(b)),
            (Some(_), None) => self,
            (None, _) => other,
        }
    }
}

impl From<Requeue> for Action {
    fn from(requeue: Requeue) -> Self {
        match requeue.after {
            Some(delay) => Action::requeue(delay),
            None => Action::await_change(),
        }
    }
}

/// Controller context containing shared state and clients
///
/// The context is shared across all reconciliation calls and holds
/// resources that are expensive to create (like Kubernetes clients).
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .config(config)
///     .build();
/// ```
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Resolver for provider objects referenced by a Cluster
    pub external: Arc<dyn ExternalResolver>,
    /// Event publisher for `kubectl describe cluster` visibility
    pub events: Arc<dyn EventPublisher>,
    /// Runtime configuration
    pub config: ControllerConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a new controller context with the given Kubernetes client
    ///
    /// This is a convenience method equivalent to `Context::builder(client).build()`.
    pub fn new(client: Client) -> Self {
        Self::builder(client).build()
    }

    /// Create a context for testing with custom mock clients
    ///
    /// Events go to a no-op publisher. For production code, use
    /// [`Context::builder`].
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        external: Arc<dyn ExternalResolver>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            kube,
            external,
            events: Arc::new(crate::events::NoopEventPublisher),
            config,
        }
    }
}

/// Builder for constructing [`Context`] instances
///
/// # Examples
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .config(ControllerConfig::default().with_machine_pool(true))
///     .build();
/// ```
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    external: Option<Arc<dyn ExternalResolver>>,
    events: Option<Arc<dyn EventPublisher>>,
    config: ControllerConfig,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            external: None,
            events: None,
            config: ControllerConfig::default(),
        }
    }

    /// Set the runtime configuration
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the provider object resolver (primarily for testing)
    pub fn external_resolver(mut self, external: Arc<dyn ExternalResolver>) -> Self {
        self.external = Some(external);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            external: self
                .external
                .unwrap_or_else(|| Arc::new(DynamicResolver::new(self.client.clone()))),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(
                    self.client.clone(),
                    CONTROLLER_NAME,
                ))
            }),
            config: self.config,
        }
    }
}

/// Reconcile a Cluster resource
///
/// Delegates to [`reconcile_cluster`] with the object's identity so every
/// pass starts from the latest stored state rather than the cached copy.
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.key()))]
pub async fn reconcile(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = cluster.namespace().unwrap_or_default();
    reconcile_cluster(&namespace, &cluster.name_any(), &ctx).await
}

/// Run one reconcile pass for the Cluster `namespace/name`
///
/// # Returns
///
/// `Action::requeue(d)` when a step asked for a recheck, otherwise
/// `Action::await_change()`. Errors from the pass and from the final patch
/// are aggregated.
pub async fn reconcile_cluster(
    namespace: &str,
    name: &str,
    ctx: &Context,
) -> Result<Action, Error> {
    let Some(cluster) = ctx.kube.get_cluster(namespace, name).await? else {
        debug!("cluster no longer exists");
        return Ok(Action::await_change());
    };

    if cluster.is_paused() {
        info!("reconciliation is paused for this cluster");
        return Ok(Action::await_change());
    }

    if !cluster.has_finalizer() && cluster.is_deleting() {
        debug!("cluster is being deleted and was never claimed");
        return Ok(Action::await_change());
    }

    let patcher = ClusterPatcher::new(&cluster);
    let mut working = cluster;

    // phase, summary and write-back below run on every path, the claim included
    let result = if !working.has_finalizer() {
        working.add_finalizer();
        info!("added finalizer");
        Ok(Requeue::none())
    } else if working.is_deleting() {
        deletion::reconcile_delete(&mut working, ctx).await
    } else {
        phases::reconcile_normal(&mut working, ctx).await
    };

    phases::update_phase(&mut working);
    conditions::set_summary(
        &mut working,
        &[types::CONTROL_PLANE_READY, types::INFRASTRUCTURE_READY],
    );

    let patched = patcher
        .patch(ctx.kube.as_ref(), &working, result.is_ok())
        .await;

    match (result, patched) {
        (Ok(requeue), Ok(())) => {
            debug!(
                phase = %working.phase(),
                requeue = ?requeue.delay(),
                "reconcile pass complete"
            );
            Ok(requeue.into())
        }
        (Err(e), Ok(())) | (Ok(_), Err(e)) => Err(e),
        (Err(pass), Err(patch)) => {
            warn!(error = %patch, "failed to patch cluster after a failed pass");
            Err(Error::Aggregate(vec![pass, patch]))
        }
    }
}

/// Error policy for the controller
///
/// Logs the failure and requeues after 5 seconds.
pub fn error_policy(cluster: Arc<Cluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        cluster = %cluster.key(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}
