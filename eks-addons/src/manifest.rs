//! Typed manifests and the verbs that apply them
//!
//! An add-on is an ordered list of [`Manifest`]s. Applying a verb issues one
//! API call per manifest, strictly in sequence. A failed call is recorded in
//! the [`BatchResult`] and logged, and the remaining manifests are still
//! applied; nothing is rolled back.

use async_trait::async_trait;
use k8s_openapi::{
    api::{apps::v1 as appsv1, core::v1 as corev1, rbac::v1 as rbacv1},
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube_client::api::{Api, DeleteParams, Patch, PatchParams, PostParams};

#[cfg(test)]
use mockall::automock;

/// The field manager recorded on created and patched resources.
pub const FIELD_MANAGER: &str = "eks-addons";

/// A resource an add-on manages
#[derive(Clone, Debug, PartialEq)]
pub enum Manifest {
    /// A namespace
    Namespace(corev1::Namespace),
    /// A namespaced service account
    ServiceAccount(corev1::ServiceAccount),
    /// A namespaced config map
    ConfigMap(corev1::ConfigMap),
    /// A namespaced daemon set
    DaemonSet(appsv1::DaemonSet),
    /// A namespaced deployment
    Deployment(appsv1::Deployment),
    /// A cluster role
    ClusterRole(rbacv1::ClusterRole),
    /// A cluster role binding
    ClusterRoleBinding(rbacv1::ClusterRoleBinding),
}

/// An API operation applied to each manifest of an add-on
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Verb {
    /// Creates each resource, in order
    Create,
    /// Strategic-merge patches each resource, in order
    Patch,
    /// Deletes each resource, in reverse order
    Delete,
}

/// Applies a verb to a single manifest
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceApi: Send + Sync {
    /// Issues the API call for `verb` on `manifest`
    async fn apply(&self, verb: Verb, manifest: &Manifest) -> Result<(), ApplyError>;
}

/// Applies manifests through the Kubernetes API
#[derive(Clone)]
pub struct KubeResourceApi {
    client: kube_client::Client,
}

/// Indicates that a single resource operation failed
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// The manifest has no name
    #[error("{0} has no name")]
    MissingName(&'static str),

    /// A namespaced manifest has no namespace
    #[error("{kind} {name} has no namespace")]
    MissingNamespace {
        /// The resource kind
        kind: &'static str,
        /// The resource name
        name: String,
    },

    /// The Kubernetes API rejected the operation
    #[error("{0}")]
    Api(#[from] kube_client::Error),
}

/// The result of applying a verb to one manifest
#[derive(Debug)]
pub struct ResourceOutcome {
    /// The verb that was applied.
    pub verb: Verb,
    /// The resource kind.
    pub kind: &'static str,
    /// The resource namespace, if it is namespaced.
    pub namespace: Option<String>,
    /// The resource name.
    pub name: String,
    /// Whether the API call succeeded.
    pub result: Result<(), ApplyError>,
}

/// The outcomes of applying a verb to every manifest of an add-on, in call order
#[derive(Debug)]
pub struct BatchResult {
    verb: Verb,
    outcomes: Vec<ResourceOutcome>,
}

/// A set of manifests managed together
pub trait Addon: Send + Sync {
    /// The add-on name, used in logs.
    fn name(&self) -> &str;

    /// The add-on's manifests in creation order.
    fn manifests(&self) -> Vec<Manifest>;
}

/// Applies `verb` to every manifest of `addon`
pub async fn apply_addon<A, D>(api: &A, verb: Verb, addon: &D) -> BatchResult
where
    A: ResourceApi + ?Sized,
    D: Addon + ?Sized,
{
    tracing::info!(addon = %addon.name(), %verb, "Applying add-on");
    let batch = apply_all(api, verb, &addon.manifests()).await;
    tracing::info!(
        addon = %addon.name(),
        %verb,
        resources = batch.len(),
        failures = batch.failures().count(),
        "Applied add-on"
    );
    batch
}

/// Applies `verb` to each manifest, one call at a time
///
/// Manifests are visited in order for [`Verb::Create`] and [`Verb::Patch`]
/// and in reverse order for [`Verb::Delete`], so that dependents are removed
/// before the resources they depend on.
pub async fn apply_all<A>(api: &A, verb: Verb, manifests: &[Manifest]) -> BatchResult
where
    A: ResourceApi + ?Sized,
{
    let mut ordered = manifests.iter().collect::<Vec<_>>();
    if verb == Verb::Delete {
        ordered.reverse();
    }

    let mut outcomes = Vec::with_capacity(ordered.len());
    for manifest in ordered {
        let kind = manifest.kind();
        let name = manifest.name().unwrap_or_default().to_string();
        let namespace = manifest.namespace().map(str::to_string);
        let result = api.apply(verb, manifest).await;
        match &result {
            Ok(()) => tracing::debug!(%verb, %kind, %name, ?namespace, "Applied"),
            Err(error) => {
                tracing::warn!(%error, %verb, %kind, %name, ?namespace, "Failed to apply")
            }
        }
        outcomes.push(ResourceOutcome {
            verb,
            kind,
            namespace,
            name,
            result,
        });
    }

    BatchResult { verb, outcomes }
}

// === impl Manifest ===

impl Manifest {
    /// The resource kind
    pub fn kind(&self) -> &'static str {
        use k8s_openapi::Resource;
        match self {
            Self::Namespace(_) => corev1::Namespace::KIND,
            Self::ServiceAccount(_) => corev1::ServiceAccount::KIND,
            Self::ConfigMap(_) => corev1::ConfigMap::KIND,
            Self::DaemonSet(_) => appsv1::DaemonSet::KIND,
            Self::Deployment(_) => appsv1::Deployment::KIND,
            Self::ClusterRole(_) => rbacv1::ClusterRole::KIND,
            Self::ClusterRoleBinding(_) => rbacv1::ClusterRoleBinding::KIND,
        }
    }

    /// The resource metadata
    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Self::Namespace(r) => &r.metadata,
            Self::ServiceAccount(r) => &r.metadata,
            Self::ConfigMap(r) => &r.metadata,
            Self::DaemonSet(r) => &r.metadata,
            Self::Deployment(r) => &r.metadata,
            Self::ClusterRole(r) => &r.metadata,
            Self::ClusterRoleBinding(r) => &r.metadata,
        }
    }

    /// The resource name
    pub fn name(&self) -> Option<&str> {
        self.metadata().name.as_deref()
    }

    /// The resource namespace
    pub fn namespace(&self) -> Option<&str> {
        self.metadata().namespace.as_deref()
    }

    fn require_namespace(&self) -> Result<&str, ApplyError> {
        self.namespace().ok_or_else(|| ApplyError::MissingNamespace {
            kind: self.kind(),
            name: self.name().unwrap_or_default().to_string(),
        })
    }
}

macro_rules! impl_from_resource {
    ($($variant:ident($ty:ty)),+ $(,)?) => {
        $(
            impl From<$ty> for Manifest {
                fn from(resource: $ty) -> Self {
                    Self::$variant(resource)
                }
            }
        )+
    };
}

impl_from_resource! {
    Namespace(corev1::Namespace),
    ServiceAccount(corev1::ServiceAccount),
    ConfigMap(corev1::ConfigMap),
    DaemonSet(appsv1::DaemonSet),
    Deployment(appsv1::Deployment),
    ClusterRole(rbacv1::ClusterRole),
    ClusterRoleBinding(rbacv1::ClusterRoleBinding),
}

// === impl Verb ===

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => f.write_str("create"),
            Self::Patch => f.write_str("patch"),
            Self::Delete => f.write_str("delete"),
        }
    }
}

// === impl KubeResourceApi ===

impl KubeResourceApi {
    /// Applies manifests with `client`
    pub fn new(client: kube_client::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResourceApi for KubeResourceApi {
    async fn apply(&self, verb: Verb, manifest: &Manifest) -> Result<(), ApplyError> {
        let name = manifest
            .name()
            .ok_or(ApplyError::MissingName(manifest.kind()))?;
        let client = self.client.clone();
        match manifest {
            Manifest::Namespace(r) => send(Api::all(client), verb, name, r).await,
            Manifest::ClusterRole(r) => send(Api::all(client), verb, name, r).await,
            Manifest::ClusterRoleBinding(r) => send(Api::all(client), verb, name, r).await,
            Manifest::ServiceAccount(r) => {
                let api = Api::namespaced(client, manifest.require_namespace()?);
                send(api, verb, name, r).await
            }
            Manifest::ConfigMap(r) => {
                let api = Api::namespaced(client, manifest.require_namespace()?);
                send(api, verb, name, r).await
            }
            Manifest::DaemonSet(r) => {
                let api = Api::namespaced(client, manifest.require_namespace()?);
                send(api, verb, name, r).await
            }
            Manifest::Deployment(r) => {
                let api = Api::namespaced(client, manifest.require_namespace()?);
                send(api, verb, name, r).await
            }
        }
    }
}

async fn send<K>(api: Api<K>, verb: Verb, name: &str, resource: &K) -> Result<(), ApplyError>
where
    K: Clone + std::fmt::Debug + serde::Serialize + serde::de::DeserializeOwned,
{
    match verb {
        Verb::Create => {
            let params = PostParams {
                field_manager: Some(FIELD_MANAGER.to_string()),
                ..Default::default()
            };
            api.create(&params, resource).await?;
        }
        Verb::Patch => {
            let params = PatchParams {
                field_manager: Some(FIELD_MANAGER.to_string()),
                ..Default::default()
            };
            api.patch(name, &params, &Patch::Strategic(resource)).await?;
        }
        Verb::Delete => {
            api.delete(name, &DeleteParams::default()).await?;
        }
    }
    Ok(())
}

// === impl BatchResult ===

impl BatchResult {
    /// The verb that was applied
    pub fn verb(&self) -> Verb {
        self.verb
    }

    /// True if every call succeeded
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    /// The calls that failed
    pub fn failures(&self) -> impl Iterator<Item = &ResourceOutcome> + '_ {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }

    /// Every call in the order it was made
    pub fn outcomes(&self) -> &[ResourceOutcome] {
        &self.outcomes
    }

    /// The number of calls made
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// True if no calls were made
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}
