//! Target cluster access
//!
//! The controller never talks to a target cluster directly. It asks a
//! [`TargetClusterResolver`] for a [`TargetCluster`] matching the request's
//! cluster profile and issues every call through that handle.
//!
//! The production resolver reads a kubeconfig from the Secret
//! `<profile-name>-kubeconfig` in the profile's namespace and caches one
//! client per profile until a connection failure invalidates it.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::authentication::v1::{TokenRequest, TokenRequestSpec, TokenRequestStatus};
use k8s_openapi::api::core::v1::{Namespace, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use kube::api::{Api, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use authtoken_common::crd::{ClusterProfileRef, CLUSTER_PROFILE_KIND};
use authtoken_common::kube_utils::{
    client_from_kubeconfig, secret_value, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT,
};
use authtoken_common::{Error, API_GROUP};

/// Secret keys searched for kubeconfig contents, in order
pub const KUBECONFIG_SECRET_KEYS: &[&str] = &["value", "kubeconfig"];

/// Name of the Secret holding the kubeconfig for a cluster profile
pub fn kubeconfig_secret_name(profile: &ClusterProfileRef) -> String {
    format!("{}-kubeconfig", profile.name)
}

/// Operations the controller performs against a target cluster
///
/// `get_*` return `Ok(None)` when the object does not exist. Every error is
/// reported against the profile and the operation that failed.
#[async_trait]
pub trait TargetCluster: Send + Sync {
    /// Cluster profile key this handle was resolved from
    fn profile(&self) -> String;

    /// API server URL, when known
    fn server(&self) -> Option<String>;

    /// Get a namespace
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error>;
    /// Create a namespace
    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace, Error>;

    /// Get a service account
    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, Error>;
    /// Create a service account
    async fn create_service_account(
        &self,
        account: &ServiceAccount,
    ) -> Result<ServiceAccount, Error>;

    /// Get a role
    async fn get_role(&self, namespace: &str, name: &str) -> Result<Option<Role>, Error>;
    /// Create a role
    async fn create_role(&self, role: &Role) -> Result<Role, Error>;
    /// Replace a role (carries resourceVersion)
    async fn replace_role(&self, role: &Role) -> Result<Role, Error>;

    /// Get a role binding
    async fn get_role_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RoleBinding>, Error>;
    /// Create a role binding
    async fn create_role_binding(&self, binding: &RoleBinding) -> Result<RoleBinding, Error>;
    /// Replace a role binding (carries resourceVersion)
    async fn replace_role_binding(&self, binding: &RoleBinding) -> Result<RoleBinding, Error>;

    /// Get a cluster role
    async fn get_cluster_role(&self, name: &str) -> Result<Option<ClusterRole>, Error>;
    /// Create a cluster role
    async fn create_cluster_role(&self, role: &ClusterRole) -> Result<ClusterRole, Error>;
    /// Replace a cluster role (carries resourceVersion)
    async fn replace_cluster_role(&self, role: &ClusterRole) -> Result<ClusterRole, Error>;

    /// Get a cluster role binding
    async fn get_cluster_role_binding(
        &self,
        name: &str,
    ) -> Result<Option<ClusterRoleBinding>, Error>;
    /// Create a cluster role binding
    async fn create_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> Result<ClusterRoleBinding, Error>;

    /// Request a bound token for a service account via the TokenRequest subresource
    async fn request_token(
        &self,
        namespace: &str,
        service_account: &str,
        expiration_seconds: i64,
    ) -> Result<TokenRequestStatus, Error>;
}

/// Resolves cluster profiles to target cluster handles
#[async_trait]
pub trait TargetClusterResolver: Send + Sync {
    /// Resolve a profile reference to a live handle
    async fn resolve(&self, profile: &ClusterProfileRef) -> Result<Arc<dyn TargetCluster>, Error>;

    /// Drop any cached handle for the profile
    fn invalidate(&self, profile: &ClusterProfileRef);
}

/// Check that a profile reference is one this controller can resolve
pub fn check_profile_ref(profile: &ClusterProfileRef) -> Result<(), Error> {
    if profile.api_group != API_GROUP || profile.kind != CLUSTER_PROFILE_KIND {
        return Err(Error::cluster_profile(
            profile.key(),
            format!(
                "unsupported profile reference {}.{} (expected {}.{})",
                profile.kind, profile.api_group, CLUSTER_PROFILE_KIND, API_GROUP
            ),
        ));
    }
    Ok(())
}

// =============================================================================
// kube-rs implementation
// =============================================================================

/// Target cluster handle backed by a kube client
pub struct KubeTargetCluster {
    client: Client,
    profile: String,
    server: Option<String>,
}

impl KubeTargetCluster {
    /// Wrap a client for the given profile
    pub fn new(client: Client, profile: impl Into<String>, server: Option<String>) -> Self {
        Self {
            client,
            profile: profile.into(),
            server,
        }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn cluster<K>(&self) -> Api<K>
    where
        K: Resource,
        <K as Resource>::DynamicType: Default,
    {
        Api::all(self.client.clone())
    }

    async fn get<K>(&self, api: Api<K>, name: &str) -> Result<Option<K>, Error>
    where
        K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        api.get_opt(name).await.map_err(|e| {
            Error::target(&self.profile, format!("get {} {}", kind_of::<K>(), name), e)
        })
    }

    async fn create<K>(&self, api: Api<K>, obj: &K) -> Result<K, Error>
    where
        K: Resource + Clone + Serialize + DeserializeOwned + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let kind = kind_of::<K>();
        let name = obj.name_any();
        let created = api
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| Error::target(&self.profile, format!("create {} {}", kind, name), e))?;
        debug!(profile = %self.profile, %kind, %name, "created object");
        Ok(created)
    }

    async fn replace<K>(&self, api: Api<K>, obj: &K) -> Result<K, Error>
    where
        K: Resource + Clone + Serialize + DeserializeOwned + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let name = obj.name_any();
        api.replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| {
                Error::target(
                    &self.profile,
                    format!("replace {} {}", kind_of::<K>(), name),
                    e,
                )
            })
    }
}

fn kind_of<K>() -> String
where
    K: Resource,
    <K as Resource>::DynamicType: Default,
{
    K::kind(&Default::default()).to_string()
}

fn namespace_of<K>(obj: &K) -> Result<String, Error>
where
    K: Resource,
    <K as Resource>::DynamicType: Default,
{
    obj.meta().namespace.clone().ok_or_else(|| {
        Error::internal_with_context(
            "target",
            format!("{} {} has no namespace", kind_of::<K>(), obj.name_any()),
        )
    })
}

#[async_trait]
impl TargetCluster for KubeTargetCluster {
    fn profile(&self) -> String {
        self.profile.clone()
    }

    fn server(&self) -> Option<String> {
        self.server.clone()
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error> {
        self.get(self.cluster(), name).await
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace, Error> {
        self.create(self.cluster(), namespace).await
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, Error> {
        self.get(self.namespaced(namespace), name).await
    }

    async fn create_service_account(
        &self,
        account: &ServiceAccount,
    ) -> Result<ServiceAccount, Error> {
        let namespace = namespace_of(account)?;
        self.create(self.namespaced(&namespace), account).await
    }

    async fn get_role(&self, namespace: &str, name: &str) -> Result<Option<Role>, Error> {
        self.get(self.namespaced(namespace), name).await
    }

    async fn create_role(&self, role: &Role) -> Result<Role, Error> {
        let namespace = namespace_of(role)?;
        self.create(self.namespaced(&namespace), role).await
    }

    async fn replace_role(&self, role: &Role) -> Result<Role, Error> {
        let namespace = namespace_of(role)?;
        self.replace(self.namespaced(&namespace), role).await
    }

    async fn get_role_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RoleBinding>, Error> {
        self.get(self.namespaced(namespace), name).await
    }

    async fn create_role_binding(&self, binding: &RoleBinding) -> Result<RoleBinding, Error> {
        let namespace = namespace_of(binding)?;
        self.create(self.namespaced(&namespace), binding).await
    }

    async fn replace_role_binding(&self, binding: &RoleBinding) -> Result<RoleBinding, Error> {
        let namespace = namespace_of(binding)?;
        self.replace(self.namespaced(&namespace), binding).await
    }

    async fn get_cluster_role(&self, name: &str) -> Result<Option<ClusterRole>, Error> {
        self.get(self.cluster(), name).await
    }

    async fn create_cluster_role(&self, role: &ClusterRole) -> Result<ClusterRole, Error> {
        self.create(self.cluster(), role).await
    }

    async fn replace_cluster_role(&self, role: &ClusterRole) -> Result<ClusterRole, Error> {
        self.replace(self.cluster(), role).await
    }

    async fn get_cluster_role_binding(
        &self,
        name: &str,
    ) -> Result<Option<ClusterRoleBinding>, Error> {
        self.get(self.cluster(), name).await
    }

    async fn create_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> Result<ClusterRoleBinding, Error> {
        self.create(self.cluster(), binding).await
    }

    async fn request_token(
        &self,
        namespace: &str,
        service_account: &str,
        expiration_seconds: i64,
    ) -> Result<TokenRequestStatus, Error> {
        let api: Api<ServiceAccount> = self.namespaced(namespace);
        let request = TokenRequest {
            spec: TokenRequestSpec {
                audiences: vec![],
                expiration_seconds: Some(expiration_seconds),
                bound_object_ref: None,
            },
            ..Default::default()
        };
        let response = api
            .create_token_request(service_account, &PostParams::default(), &request)
            .await
            .map_err(|e| {
                Error::target(
                    &self.profile,
                    format!("request token for {}/{}", namespace, service_account),
                    e,
                )
            })?;
        response.status.ok_or_else(|| {
            Error::token_unavailable(
                format!("{}/{}", namespace, service_account),
                "token request returned no status",
            )
        })
    }
}

/// Resolves profiles through `<profile-name>-kubeconfig` Secrets in the local cluster
pub struct SecretKubeconfigResolver {
    client: Client,
    cache: DashMap<String, Arc<KubeTargetCluster>>,
}

impl SecretKubeconfigResolver {
    /// Create a resolver reading Secrets with `client`
    pub fn new(client: Client) -> Self {
        Self {
            client,
            cache: DashMap::new(),
        }
    }
}

#[async_trait]
impl TargetClusterResolver for SecretKubeconfigResolver {
    async fn resolve(&self, profile: &ClusterProfileRef) -> Result<Arc<dyn TargetCluster>, Error> {
        check_profile_ref(profile)?;
        let key = profile.key();

        if let Some(cached) = self.cache.get(&key) {
            let target: Arc<dyn TargetCluster> = cached.clone();
            return Ok(target);
        }

        let secret_name = kubeconfig_secret_name(profile);
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &profile.namespace);
        let secret = secrets.get_opt(&secret_name).await?.ok_or_else(|| {
            Error::cluster_profile(
                &key,
                format!("secret {}/{} not found", profile.namespace, secret_name),
            )
        })?;
        let raw = secret_value(&secret, KUBECONFIG_SECRET_KEYS).ok_or_else(|| {
            Error::cluster_profile(
                &key,
                format!(
                    "secret {}/{} has none of the keys {:?}",
                    profile.namespace, secret_name, KUBECONFIG_SECRET_KEYS
                ),
            )
        })?;

        let remote =
            client_from_kubeconfig(&key, raw, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await?;
        info!(profile = %key, server = %remote.server, "connected to target cluster");

        let target = Arc::new(KubeTargetCluster::new(
            remote.client,
            key.clone(),
            Some(remote.server),
        ));
        self.cache.insert(key, Arc::clone(&target));
        Ok(target)
    }

    fn invalidate(&self, profile: &ClusterProfileRef) {
        if self.cache.remove(&profile.key()).is_some() {
            debug!(profile = %profile.key(), "dropped cached target cluster client");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(api_group: &str, kind: &str) -> ClusterProfileRef {
        ClusterProfileRef {
            api_group: api_group.to_string(),
            kind: kind.to_string(),
            name: "prod-east".to_string(),
            namespace: "fleet".to_string(),
        }
    }

    #[test]
    fn kubeconfig_secret_follows_profile_name() {
        assert_eq!(
            kubeconfig_secret_name(&profile(API_GROUP, CLUSTER_PROFILE_KIND)),
            "prod-east-kubeconfig"
        );
    }

    #[test]
    fn supported_profile_reference_is_accepted() {
        assert!(check_profile_ref(&profile(API_GROUP, CLUSTER_PROFILE_KIND)).is_ok());
    }

    /// Story: a reference to something other than a ClusterProfile can never resolve
    #[test]
    fn story_unsupported_profile_reference_is_invalid() {
        let err = check_profile_ref(&profile("cluster.x-k8s.io", "Cluster")).unwrap_err();
        assert_eq!(err.reason(), "InvalidClusterProfile");
        assert!(err.to_string().contains("fleet/prod-east"));

        let err = check_profile_ref(&profile(API_GROUP, "Cluster")).unwrap_err();
        assert!(err.to_string().contains("unsupported profile reference"));
    }
}
