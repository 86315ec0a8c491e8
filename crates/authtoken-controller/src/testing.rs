//! In-memory fakes for the local and target clusters

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::authentication::v1::TokenRequestStatus;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, ServiceAccount};
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::ErrorResponse;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use authtoken_common::crd::{
    AuthTokenRequest, AuthTokenRequestSpec, ClusterProfileRef, CLUSTER_PROFILE_KIND,
};
use authtoken_common::{Error, API_GROUP};

use crate::controller::KubeClient;
use crate::guard::CallGuard;
use crate::target::{TargetCluster, TargetClusterResolver};

pub const TEST_PROFILE: &str = "fleet/prod-east";
pub const TEST_SERVER: &str = "https://prod-east.example:6443";

pub fn api_error(code: u16) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("status {}", code),
        reason: "Test".to_string(),
        code,
    })
}

pub fn stale_write() -> Error {
    Error::from(api_error(409))
}

pub fn test_guard() -> CallGuard {
    CallGuard::new(Duration::from_secs(5), CancellationToken::new())
}

pub fn pod_reader_rules() -> Vec<PolicyRule> {
    vec![PolicyRule {
        api_groups: Some(vec![String::new()]),
        resources: Some(vec!["pods".to_string()]),
        verbs: vec!["get".to_string(), "list".to_string()],
        ..Default::default()
    }]
}

pub fn sample_spec() -> AuthTokenRequestSpec {
    AuthTokenRequestSpec {
        target_cluster_profile: ClusterProfileRef {
            api_group: API_GROUP.to_string(),
            kind: CLUSTER_PROFILE_KIND.to_string(),
            name: "prod-east".to_string(),
            namespace: "fleet".to_string(),
        },
        service_account_name: "svc-a".to_string(),
        roles: None,
        cluster_roles: None,
    }
}

/// `team-a/ci-token` at generation 1
pub fn request_with(spec: AuthTokenRequestSpec) -> AuthTokenRequest {
    let mut request = AuthTokenRequest::new("ci-token", spec);
    request.metadata.namespace = Some("team-a".to_string());
    request.metadata.uid = Some("uid-1".to_string());
    request.metadata.generation = Some(1);
    request.metadata.resource_version = Some("1".to_string());
    request
}

// =============================================================================
// Target cluster
// =============================================================================

type ObjectKey = (String, Option<String>, String);

#[derive(Default)]
struct TargetState {
    objects: BTreeMap<ObjectKey, serde_json::Value>,
    creates: usize,
    mints: usize,
    last_expiration: Option<i64>,
    unreachable: bool,
    forbidden: bool,
    empty_tokens: bool,
    failing_creates: HashSet<String>,
}

/// A target cluster holding objects as JSON
pub struct FakeTargetCluster {
    state: Mutex<TargetState>,
}

impl FakeTargetCluster {
    /// Empty cluster with only the `default` namespace
    pub fn new() -> Self {
        let fake = Self {
            state: Mutex::new(TargetState::default()),
        };
        fake.insert_foreign("Namespace", None, "default");
        fake
    }

    fn key(kind: &str, namespace: Option<&str>, name: &str) -> ObjectKey {
        (
            kind.to_string(),
            namespace.map(str::to_string),
            name.to_string(),
        )
    }

    /// Add an object without ownership annotations
    pub fn insert_foreign(&self, kind: &str, namespace: Option<&str>, name: &str) {
        let mut obj = serde_json::json!({
            "metadata": { "name": name, "namespace": namespace },
        });
        if kind.ends_with("Binding") {
            obj["roleRef"] = serde_json::json!({
                "apiGroup": "rbac.authorization.k8s.io",
                "kind": "ClusterRole",
                "name": "view",
            });
        }
        self.state
            .lock()
            .unwrap()
            .objects
            .insert(Self::key(kind, namespace, name), obj);
    }

    pub fn remove(&self, kind: &str, namespace: Option<&str>, name: &str) {
        self.state
            .lock()
            .unwrap()
            .objects
            .remove(&Self::key(kind, namespace, name));
    }

    pub fn has(&self, kind: &str, namespace: Option<&str>, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .objects
            .contains_key(&Self::key(kind, namespace, name))
    }

    pub fn object<K: DeserializeOwned>(
        &self,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Option<K> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(&Self::key(kind, namespace, name))
            .map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    pub fn count_kind(&self, kind: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.objects.keys().filter(|(k, _, _)| k == kind).count()
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }

    pub fn create_calls(&self) -> usize {
        self.state.lock().unwrap().creates
    }

    pub fn mint_calls(&self) -> usize {
        self.state.lock().unwrap().mints
    }

    pub fn last_expiration_seconds(&self) -> Option<i64> {
        self.state.lock().unwrap().last_expiration
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unwrap().unreachable = !reachable;
    }

    /// Answer every call with 403
    pub fn set_forbidden(&self, forbidden: bool) {
        self.state.lock().unwrap().forbidden = forbidden;
    }

    pub fn issue_empty_tokens(&self, empty: bool) {
        self.state.lock().unwrap().empty_tokens = empty;
    }

    /// Fail creates of `kind` with a server error
    pub fn fail_creates_of(&self, kind: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_creates
            .insert(kind.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failing_creates.clear();
    }

    fn check(&self, state: &TargetState, operation: &str) -> Result<(), Error> {
        if state.unreachable {
            let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
            return Err(Error::target(
                TEST_PROFILE,
                operation,
                kube::Error::Service(Box::new(io)),
            ));
        }
        if state.forbidden {
            return Err(Error::target(TEST_PROFILE, operation, api_error(403)));
        }
        Ok(())
    }

    fn get<K: DeserializeOwned>(
        &self,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<K>, Error> {
        let state = self.state.lock().unwrap();
        self.check(&state, &format!("get {} {}", kind, name))?;
        Ok(state
            .objects
            .get(&Self::key(kind, namespace, name))
            .map(|v| serde_json::from_value(v.clone()).unwrap()))
    }

    fn create<K>(&self, kind: &str, obj: &K) -> Result<K, Error>
    where
        K: Resource + Serialize + Clone,
    {
        let name = obj.name_any();
        let operation = format!("create {} {}", kind, name);
        let mut state = self.state.lock().unwrap();
        self.check(&state, &operation)?;
        if state.failing_creates.contains(kind) {
            return Err(Error::target(TEST_PROFILE, operation, api_error(500)));
        }
        let key = Self::key(kind, obj.meta().namespace.as_deref(), &name);
        if state.objects.contains_key(&key) {
            return Err(Error::target(TEST_PROFILE, operation, api_error(409)));
        }
        state.creates += 1;
        state
            .objects
            .insert(key, serde_json::to_value(obj).unwrap());
        Ok(obj.clone())
    }

    fn replace<K>(&self, kind: &str, obj: &K) -> Result<K, Error>
    where
        K: Resource + Serialize + Clone,
    {
        let name = obj.name_any();
        let operation = format!("replace {} {}", kind, name);
        let mut state = self.state.lock().unwrap();
        self.check(&state, &operation)?;
        let key = Self::key(kind, obj.meta().namespace.as_deref(), &name);
        if !state.objects.contains_key(&key) {
            return Err(Error::target(TEST_PROFILE, operation, api_error(404)));
        }
        state
            .objects
            .insert(key, serde_json::to_value(obj).unwrap());
        Ok(obj.clone())
    }
}

#[async_trait]
impl TargetCluster for FakeTargetCluster {
    fn profile(&self) -> String {
        TEST_PROFILE.to_string()
    }

    fn server(&self) -> Option<String> {
        Some(TEST_SERVER.to_string())
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error> {
        self.get("Namespace", None, name)
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace, Error> {
        self.create("Namespace", namespace)
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, Error> {
        self.get("ServiceAccount", Some(namespace), name)
    }

    async fn create_service_account(
        &self,
        account: &ServiceAccount,
    ) -> Result<ServiceAccount, Error> {
        self.create("ServiceAccount", account)
    }

    async fn get_role(&self, namespace: &str, name: &str) -> Result<Option<Role>, Error> {
        self.get("Role", Some(namespace), name)
    }

    async fn create_role(&self, role: &Role) -> Result<Role, Error> {
        self.create("Role", role)
    }

    async fn replace_role(&self, role: &Role) -> Result<Role, Error> {
        self.replace("Role", role)
    }

    async fn get_role_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RoleBinding>, Error> {
        self.get("RoleBinding", Some(namespace), name)
    }

    async fn create_role_binding(&self, binding: &RoleBinding) -> Result<RoleBinding, Error> {
        self.create("RoleBinding", binding)
    }

    async fn replace_role_binding(&self, binding: &RoleBinding) -> Result<RoleBinding, Error> {
        self.replace("RoleBinding", binding)
    }

    async fn get_cluster_role(&self, name: &str) -> Result<Option<ClusterRole>, Error> {
        self.get("ClusterRole", None, name)
    }

    async fn create_cluster_role(&self, role: &ClusterRole) -> Result<ClusterRole, Error> {
        self.create("ClusterRole", role)
    }

    async fn replace_cluster_role(&self, role: &ClusterRole) -> Result<ClusterRole, Error> {
        self.replace("ClusterRole", role)
    }

    async fn get_cluster_role_binding(
        &self,
        name: &str,
    ) -> Result<Option<ClusterRoleBinding>, Error> {
        self.get("ClusterRoleBinding", None, name)
    }

    async fn create_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> Result<ClusterRoleBinding, Error> {
        self.create("ClusterRoleBinding", binding)
    }

    async fn request_token(
        &self,
        namespace: &str,
        service_account: &str,
        expiration_seconds: i64,
    ) -> Result<TokenRequestStatus, Error> {
        let operation = format!("request token for {}/{}", namespace, service_account);
        let mut state = self.state.lock().unwrap();
        self.check(&state, &operation)?;
        let key = Self::key("ServiceAccount", Some(namespace), service_account);
        if !state.objects.contains_key(&key) {
            return Err(Error::target(TEST_PROFILE, operation, api_error(404)));
        }
        state.mints += 1;
        state.last_expiration = Some(expiration_seconds);
        let token = if state.empty_tokens {
            String::new()
        } else {
            format!("token-{}-{}", service_account, state.mints)
        };
        Ok(TokenRequestStatus {
            token,
            expiration_timestamp: Time(Utc::now() + chrono::Duration::seconds(expiration_seconds)),
        })
    }
}

/// Resolves every profile to one fake cluster
pub struct FakeResolver {
    target: Arc<FakeTargetCluster>,
    missing: AtomicBool,
    invalidations: AtomicUsize,
}

impl FakeResolver {
    pub fn new(target: Arc<FakeTargetCluster>) -> Self {
        Self {
            target,
            missing: AtomicBool::new(false),
            invalidations: AtomicUsize::new(0),
        }
    }

    /// Fail resolution as if the kubeconfig Secret did not exist
    pub fn set_missing(&self, missing: bool) {
        self.missing.store(missing, Ordering::SeqCst);
    }

    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TargetClusterResolver for FakeResolver {
    async fn resolve(&self, profile: &ClusterProfileRef) -> Result<Arc<dyn TargetCluster>, Error> {
        if self.missing.load(Ordering::SeqCst) {
            return Err(Error::cluster_profile(
                profile.key(),
                "secret fleet/prod-east-kubeconfig not found",
            ));
        }
        let target: Arc<dyn TargetCluster> = self.target.clone();
        Ok(target)
    }

    fn invalidate(&self, _profile: &ClusterProfileRef) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Local cluster
// =============================================================================

#[derive(Default)]
struct LocalState {
    request: Option<AuthTokenRequest>,
    config_maps: BTreeMap<(String, String), ConfigMap>,
    version: u64,
    status_writes: usize,
}

/// Local cluster holding one request and its ConfigMaps
///
/// Status writes enforce resourceVersion like the API server does.
pub struct FakeKube {
    state: Mutex<LocalState>,
}

impl FakeKube {
    pub fn with_request(request: AuthTokenRequest) -> Self {
        Self {
            state: Mutex::new(LocalState {
                request: Some(request),
                version: 1,
                ..Default::default()
            }),
        }
    }

    /// Latest stored request
    pub fn request(&self) -> AuthTokenRequest {
        self.state.lock().unwrap().request.clone().unwrap()
    }

    /// Edit the spec as a user would, bumping generation
    pub fn delete_request(&self) {
        self.state.lock().unwrap().request = None;
    }

    pub fn update_spec(&self, edit: impl FnOnce(&mut AuthTokenRequestSpec)) {
        let mut state = self.state.lock().unwrap();
        state.version += 1;
        let version = state.version.to_string();
        let request = state.request.as_mut().unwrap();
        edit(&mut request.spec);
        request.metadata.generation = Some(request.metadata.generation.unwrap_or(0) + 1);
        request.metadata.resource_version = Some(version);
    }

    pub fn status_writes(&self) -> usize {
        self.state.lock().unwrap().status_writes
    }

    pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.state
            .lock()
            .unwrap()
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn delete_config_map(&self, namespace: &str, name: &str) {
        self.state
            .lock()
            .unwrap()
            .config_maps
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// A user-created ConfigMap without owner references
    pub fn insert_foreign_config_map(&self, namespace: &str, name: &str) {
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some(name.to_string());
        cm.metadata.namespace = Some(namespace.to_string());
        self.state
            .lock()
            .unwrap()
            .config_maps
            .insert((namespace.to_string(), name.to_string()), cm);
    }
}

#[async_trait]
impl KubeClient for FakeKube {
    async fn get_request(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<AuthTokenRequest>, Error> {
        let state = self.state.lock().unwrap();
        Ok(state
            .request
            .clone()
            .filter(|r| r.namespace().as_deref() == Some(namespace) && r.name_any() == name))
    }

    async fn replace_request_status(
        &self,
        request: &AuthTokenRequest,
    ) -> Result<AuthTokenRequest, Error> {
        let mut state = self.state.lock().unwrap();
        let current_version = state.version.to_string();
        let Some(stored) = state.request.as_ref() else {
            return Err(Error::from(api_error(404)));
        };
        if request.metadata.resource_version.as_deref() != Some(current_version.as_str()) {
            return Err(stale_write());
        }
        let mut updated = stored.clone();
        updated.status = request.status.clone();
        state.version += 1;
        updated.metadata.resource_version = Some(state.version.to_string());
        state.status_writes += 1;
        state.request = Some(updated.clone());
        Ok(updated)
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        Ok(self.config_map(namespace, name))
    }

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap, Error> {
        let mut state = self.state.lock().unwrap();
        let key = (namespace.to_string(), config_map.name_any());
        if state.config_maps.contains_key(&key) {
            return Err(stale_write());
        }
        state.config_maps.insert(key, config_map.clone());
        Ok(config_map.clone())
    }

    async fn replace_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap, Error> {
        let mut state = self.state.lock().unwrap();
        let key = (namespace.to_string(), config_map.name_any());
        if !state.config_maps.contains_key(&key) {
            return Err(Error::from(api_error(404)));
        }
        state.config_maps.insert(key, config_map.clone());
        Ok(config_map.clone())
    }
}
