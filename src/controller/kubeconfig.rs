//! Admin kubeconfig generation for Clusters without a control plane provider
//!
//! The workload cluster's CA lives in the `<cluster>-ca` Secret. Once the
//! API endpoint is known, an admin client certificate is signed with that CA
//! and a kubeconfig is stored in `<cluster>-kubeconfig` under the `value` key.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use tracing::{debug, info};

use super::{Context, Requeue};
use crate::crd::Cluster;
use crate::events::ClusterEvent;
use crate::pki::{CertificateAuthority, ClientCertificate};
use crate::{Error, CLUSTER_NAME_LABEL};

/// Secret type Cluster API uses for cluster-scoped secrets
pub const CLUSTER_SECRET_TYPE: &str = "cluster.x-k8s.io/secret";

/// Key holding the kubeconfig inside its Secret
pub const KUBECONFIG_KEY: &str = "value";

const ADMIN_USER: &str = "kubernetes-admin";
const ADMIN_GROUP: &str = "system:masters";

/// Name of the Secret holding a Cluster's admin kubeconfig
pub fn kubeconfig_secret_name(cluster_name: &str) -> String {
    format!("{}-kubeconfig", cluster_name)
}

/// Name of the Secret holding a Cluster's CA
pub fn ca_secret_name(cluster_name: &str) -> String {
    format!("{}-ca", cluster_name)
}

/// Ensure the admin kubeconfig Secret exists
///
/// Skipped until the endpoint is known, and entirely when a control plane
/// provider is in charge of the kubeconfig. A missing CA Secret asks for a
/// recheck instead of failing.
pub(crate) async fn reconcile_kubeconfig(
    cluster: &mut Cluster,
    ctx: &Context,
) -> Result<Requeue, Error> {
    let endpoint = &cluster.spec.control_plane_endpoint;
    if !endpoint.is_valid() || cluster.spec.control_plane_ref.is_some() {
        return Ok(Requeue::none());
    }

    let namespace = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();
    let secret_name = kubeconfig_secret_name(&name);

    if ctx.kube.get_secret(&namespace, &secret_name).await?.is_some() {
        return Ok(Requeue::none());
    }

    let Some(ca_secret) = ctx.kube.get_secret(&namespace, &ca_secret_name(&name)).await? else {
        info!("cluster CA secret not found yet, waiting before generating kubeconfig");
        return Ok(Requeue::after(ctx.config.external_ready_wait()));
    };

    let ca = load_ca(&ca_secret)?;
    let client = ca.issue_client_certificate(ADMIN_USER, ADMIN_GROUP)?;
    let contents = render_kubeconfig(&name, &endpoint.url(), ca.cert_pem(), &client)?;

    let owner = cluster.controller_owner_ref(&()).ok_or_else(|| {
        Error::internal(format!("Cluster {} has no uid to own its kubeconfig", cluster.key()))
    })?;
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(secret_name.clone()),
            namespace: Some(namespace.clone()),
            labels: Some(BTreeMap::from([(CLUSTER_NAME_LABEL.to_string(), name.clone())])),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        type_: Some(CLUSTER_SECRET_TYPE.to_string()),
        data: Some(BTreeMap::from([(
            KUBECONFIG_KEY.to_string(),
            ByteString(contents.into_bytes()),
        )])),
        ..Default::default()
    };

    ctx.kube.create_secret(&namespace, &secret).await?;
    debug!(secret = %secret_name, "created kubeconfig secret");

    ctx.events
        .publish(cluster, ClusterEvent::KubeconfigCreated { secret: secret_name })
        .await;

    Ok(Requeue::none())
}

fn load_ca(secret: &Secret) -> Result<CertificateAuthority, Error> {
    let cert = secret_string(secret, "tls.crt")?;
    let key = secret_string(secret, "tls.key")?;
    Ok(CertificateAuthority::from_pem(&cert, &key)?)
}

fn secret_string(secret: &Secret, key: &str) -> Result<String, Error> {
    let bytes = secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .ok_or_else(|| {
            Error::internal(format!("secret {} has no {} entry", secret.name_any(), key))
        })?;
    String::from_utf8(bytes.0.clone()).map_err(|e| {
        Error::serialization(format!("secret {} entry {}: {}", secret.name_any(), key, e))
    })
}

#[derive(Serialize)]
struct Kubeconfig {
    #[serde(rename = "apiVersion")]
    api_version: &'static str,
    kind: &'static str,
    clusters: Vec<NamedCluster>,
    contexts: Vec<NamedContext>,
    #[serde(rename = "current-context")]
    current_context: String,
    users: Vec<NamedUser>,
}

#[derive(Serialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterEntry,
}

#[derive(Serialize)]
struct ClusterEntry {
    server: String,
    #[serde(rename = "certificate-authority-data")]
    certificate_authority_data: String,
}

#[derive(Serialize)]
struct NamedContext {
    name: String,
    context: ContextEntry,
}

#[derive(Serialize)]
struct ContextEntry {
    cluster: String,
    user: String,
}

#[derive(Serialize)]
struct NamedUser {
    name: String,
    user: UserEntry,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct UserEntry {
    client_certificate_data: String,
    client_key_data: String,
}

/// Render an admin kubeconfig for `cluster_name`
///
/// The cluster entry is named after the Cluster, the user `<name>-admin`
/// and the context `<name>-admin@<name>`. Certificates are embedded base64.
pub fn render_kubeconfig(
    cluster_name: &str,
    server: &str,
    ca_cert_pem: &str,
    client: &ClientCertificate,
) -> Result<String, Error> {
    let user = format!("{}-admin", cluster_name);
    let context = format!("{}@{}", user, cluster_name);

    let config = Kubeconfig {
        api_version: "v1",
        kind: "Config",
        clusters: vec![NamedCluster {
            name: cluster_name.to_string(),
            cluster: ClusterEntry {
                server: server.to_string(),
                certificate_authority_data: STANDARD.encode(ca_cert_pem.as_bytes()),
            },
        }],
        contexts: vec![NamedContext {
            name: context.clone(),
            context: ContextEntry {
                cluster: cluster_name.to_string(),
                user: user.clone(),
            },
        }],
        current_context: context,
        users: vec![NamedUser {
            name: user,
            user: UserEntry {
                client_certificate_data: STANDARD.encode(client.cert_pem.as_bytes()),
                client_key_data: STANDARD.encode(client.key_pem.as_bytes()),
            },
        }],
    };

    serde_yaml::to_string(&config).map_err(|e| Error::serialization(e.to_string()))
}
