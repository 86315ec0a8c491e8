//! AuthTokenRequest controller implementation
//!
//! A pass moves a request through `Pending → Provisioning → Provisioned →
//! TokenPending → Ready`. Every step checks its own postcondition first, so
//! a pass that runs again after success or a partial failure only does the
//! work that is still missing. Failures put the request in `Degraded` and are
//! retried with a delay that depends on the failure class.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use authtoken_common::crd::{
    AcceptedSpec, AuthTokenRequest, ConditionStatus, RequestPhase, CONDITION_DEGRADED,
    CONDITION_PROVISIONED, CONDITION_READY, CONDITION_TOKEN_ISSUED,
};
use authtoken_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use authtoken_common::retry::with_jitter;
use authtoken_common::{Error, ErrorClass, CONTROLLER_NAME, DEFAULT_FALLBACK_NAMESPACE};

use crate::backoff::{BackoffPolicy, FailureTracker, InFlight};
use crate::guard::CallGuard;
use crate::minter::mint;
use crate::provisioner::{plan, provision, RequestIdentity};
use crate::publisher::{build_token_config_map, is_published, publish};
use crate::status::{commit, StatusDraft};
use crate::target::{SecretKubeconfigResolver, TargetCluster, TargetClusterResolver};

/// Requeue delay when another pass for the same request is still running
const IN_FLIGHT_REQUEUE: Duration = Duration::from_secs(1);

// =============================================================================
// Traits for dependency injection and testability
// =============================================================================

/// Local cluster operations used by the controller
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get an AuthTokenRequest by namespace and name
    async fn get_request(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<AuthTokenRequest>, Error>;

    /// Replace the status subresource; fails with 409 on a stale resourceVersion
    async fn replace_request_status(
        &self,
        request: &AuthTokenRequest,
    ) -> Result<AuthTokenRequest, Error>;

    /// Get a ConfigMap
    async fn get_config_map(&self, namespace: &str, name: &str)
        -> Result<Option<ConfigMap>, Error>;

    /// Create a ConfigMap
    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap, Error>;

    /// Replace a ConfigMap (carries resourceVersion)
    async fn replace_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_request(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<AuthTokenRequest>, Error> {
        let api: Api<AuthTokenRequest> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(request) => Ok(Some(request)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace_request_status(
        &self,
        request: &AuthTokenRequest,
    ) -> Result<AuthTokenRequest, Error> {
        let namespace = request.namespace().unwrap_or_default();
        let api: Api<AuthTokenRequest> = Api::namespaced(self.client.clone(), &namespace);
        let data = serde_json::to_vec(request)
            .map_err(|e| Error::serialization_for_kind("AuthTokenRequest", e.to_string()))?;
        Ok(api
            .replace_status(&request.name_any(), &PostParams::default(), data)
            .await?)
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), config_map).await?)
    }

    async fn replace_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .replace(&config_map.name_any(), &PostParams::default(), config_map)
            .await?)
    }
}

// =============================================================================
// Controller context
// =============================================================================

/// Tunables for the reconcile loop
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerSettings {
    /// Namespace for the service account when the request has no roles
    pub fallback_namespace: String,
    /// Lifetime requested for minted tokens
    pub token_expiration: Duration,
    /// Deadline for each external call
    pub call_timeout: Duration,
    /// Requeue interval for requests that are Ready
    pub resync_interval: Duration,
    /// Consecutive permission failures before the request shows Degraded
    pub permission_degraded_threshold: u32,
    /// Requeue delays per failure class
    pub backoff: BackoffPolicy,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            fallback_namespace: DEFAULT_FALLBACK_NAMESPACE.to_string(),
            token_expiration: Duration::from_secs(86_400),
            call_timeout: Duration::from_secs(10),
            resync_interval: Duration::from_secs(600),
            permission_degraded_threshold: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Controller context shared by all reconcile passes
pub struct Context {
    /// Local cluster client
    pub kube: Arc<dyn KubeClient>,
    /// Resolves cluster profiles to target clusters
    pub resolver: Arc<dyn TargetClusterResolver>,
    /// Event publisher for emitting Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
    /// Loop tunables
    pub settings: ControllerSettings,
    /// Consecutive failures per request
    pub failures: FailureTracker,
    /// Requests with a pass currently running
    pub in_flight: Arc<InFlight>,
    /// Cancelled on shutdown; aborts outstanding external calls
    pub cancel: CancellationToken,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Guard for the external calls of one pass
    pub fn call_guard(&self) -> CallGuard {
        CallGuard::new(self.settings.call_timeout, self.cancel.child_token())
    }

    /// Create a context for testing with fake clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        resolver: Arc<dyn TargetClusterResolver>,
    ) -> Self {
        use authtoken_common::events::NoopEventPublisher;

        Self {
            kube,
            resolver,
            events: Arc::new(NoopEventPublisher),
            settings: ControllerSettings {
                call_timeout: Duration::from_secs(5),
                ..Default::default()
            },
            failures: FailureTracker::new(),
            in_flight: Arc::new(InFlight::new()),
            cancel: CancellationToken::new(),
        }
    }
}

/// Builder for Context
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    resolver: Option<Arc<dyn TargetClusterResolver>>,
    events: Option<Arc<dyn EventPublisher>>,
    settings: ControllerSettings,
    cancel: Option<CancellationToken>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            resolver: None,
            events: None,
            settings: ControllerSettings::default(),
            cancel: None,
        }
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the cluster profile resolver
    pub fn resolver(mut self, resolver: Arc<dyn TargetClusterResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set loop tunables
    pub fn settings(mut self, settings: ControllerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the shutdown token
    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            resolver: self
                .resolver
                .unwrap_or_else(|| Arc::new(SecretKubeconfigResolver::new(self.client.clone()))),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(self.client.clone(), CONTROLLER_NAME))
            }),
            settings: self.settings,
            failures: FailureTracker::new(),
            in_flight: Arc::new(InFlight::new()),
            cancel: self.cancel.unwrap_or_default(),
        }
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Reconcile an AuthTokenRequest
///
/// Runs at most one pass per request at a time. On success the request is
/// requeued at the resync interval; on failure the error is folded into
/// status and returned so [`error_policy`] picks the retry delay.
#[instrument(skip(request, ctx), fields(request = %request.key()))]
pub async fn reconcile(request: Arc<AuthTokenRequest>, ctx: Arc<Context>) -> Result<Action, Error> {
    let key = request.key();
    let Some(_flight) = ctx.in_flight.try_acquire(&key) else {
        debug!("pass already running, requeueing");
        return Ok(Action::requeue(IN_FLIGHT_REQUEUE));
    };

    info!("reconciling request");
    let guard = ctx.call_guard();
    let mut draft = StatusDraft::for_request(&request);

    match run_pass(&request, &ctx, &guard, &mut draft).await {
        Ok(()) => {
            ctx.failures.reset(&key);
            Ok(Action::requeue(ctx.settings.resync_interval))
        }
        Err(e) => Err(record_failure(&request, &ctx, &guard, draft, e).await),
    }
}

async fn run_pass(
    request: &AuthTokenRequest,
    ctx: &Context,
    guard: &CallGuard,
    draft: &mut StatusDraft,
) -> Result<(), Error> {
    request.validate()?;

    let status = request.status.clone().unwrap_or_default();
    let mut accepted = status
        .accepted_spec
        .clone()
        .unwrap_or_else(|| AcceptedSpec::from_spec(&request.spec));
    accepted.absorb(&request.spec);
    if status.accepted_spec.as_ref() != Some(&accepted) {
        draft.accepted_spec(accepted);
    }

    if status.phase == RequestPhase::Pending {
        draft
            .initial_conditions()
            .phase(RequestPhase::Provisioning);
        commit(ctx.kube.as_ref(), request, draft, guard).await?;
        emit(
            ctx,
            request,
            EventType::Normal,
            reasons::PROVISIONING_STARTED,
            actions::PROVISION,
            format!(
                "Provisioning service account {} in {}",
                request.spec.service_account_name, request.spec.target_cluster_profile
            ),
        )
        .await;
    }

    let identity = RequestIdentity::of(request)?;
    let plan = plan(&request.spec, &ctx.settings.fallback_namespace);
    let generation = request.meta().generation;
    let mut target: Option<Arc<dyn TargetCluster>> = None;

    let provisioned = status.condition_is_true(CONDITION_PROVISIONED)
        && status.observed_generation == generation;
    if provisioned {
        debug!(?generation, "target cluster already provisioned for this generation");
    } else {
        draft.condition(
            CONDITION_PROVISIONED,
            ConditionStatus::False,
            "Provisioning",
            "target cluster objects are being brought in line with the request",
        );
        let cluster = resolve(ctx, request, guard).await?;
        let report = provision(cluster.as_ref(), &plan, &identity, guard).await?;
        let message = format!(
            "service account {} ready in {} ({} created, {} updated)",
            plan.service_account,
            plan.namespaces.join(", "),
            report.created.len(),
            report.updated.len()
        );
        draft
            .condition(
                CONDITION_PROVISIONED,
                ConditionStatus::True,
                "Provisioned",
                message.clone(),
            )
            .observed_current_generation()
            .phase(RequestPhase::Provisioned);
        emit(
            ctx,
            request,
            EventType::Normal,
            reasons::PROVISIONED,
            actions::PROVISION,
            message,
        )
        .await;
        target = Some(cluster);
    }

    if is_published(ctx.kube.as_ref(), request, guard).await? {
        debug!("token already published");
    } else {
        let cluster = match target {
            Some(cluster) => cluster,
            None => resolve(ctx, request, guard).await?,
        };
        draft.phase(RequestPhase::TokenPending);

        let account = plan.primary_account();
        let token = mint(
            cluster.as_ref(),
            &account,
            ctx.settings.token_expiration,
            guard,
        )
        .await?;
        let message = format!(
            "token for {} expires at {}",
            account,
            token.expiration_timestamp.to_rfc3339()
        );
        draft.condition(
            CONDITION_TOKEN_ISSUED,
            ConditionStatus::True,
            "TokenIssued",
            message.clone(),
        );
        emit(
            ctx,
            request,
            EventType::Normal,
            reasons::TOKEN_ISSUED,
            actions::MINT,
            message,
        )
        .await;

        let server = cluster.server();
        let config_map = build_token_config_map(request, &token, &account, server.as_deref())?;
        let reference = publish(ctx.kube.as_ref(), request, config_map, guard).await?;
        emit(
            ctx,
            request,
            EventType::Normal,
            reasons::TOKEN_PUBLISHED,
            actions::PUBLISH,
            format!("token published to ConfigMap {}", reference.name),
        )
        .await;
        draft.token_response(reference);
    }

    draft
        .condition(
            CONDITION_READY,
            ConditionStatus::True,
            "TokenPublished",
            "token is available in the referenced ConfigMap",
        )
        .condition(
            CONDITION_DEGRADED,
            ConditionStatus::False,
            "ReconcileSucceeded",
            "",
        )
        .phase(RequestPhase::Ready);
    commit(ctx.kube.as_ref(), request, draft, guard).await?;
    info!("request ready");
    Ok(())
}

async fn resolve(
    ctx: &Context,
    request: &AuthTokenRequest,
    guard: &CallGuard,
) -> Result<Arc<dyn TargetCluster>, Error> {
    let profile = &request.spec.target_cluster_profile;
    guard
        .run(
            &format!("resolve cluster profile {}", profile.key()),
            ctx.resolver.resolve(profile),
        )
        .await
}

/// Record a failed pass in status and hand the error back for requeueing
///
/// Progress made before the failure stays in the draft and is written too.
async fn record_failure(
    request: &AuthTokenRequest,
    ctx: &Context,
    guard: &CallGuard,
    mut draft: StatusDraft,
    error: Error,
) -> Error {
    let key = request.key();
    let class = error.class();
    let streak = ctx.failures.record(&key, class);
    let surface = class != ErrorClass::Permission
        || streak >= ctx.settings.permission_degraded_threshold;

    warn!(
        error = %error,
        class = %class,
        streak,
        surfaced = surface,
        "reconcile pass failed"
    );

    if guard.is_cancelled() {
        debug!("shutting down, leaving status for the next run");
        return error;
    }

    draft.record_failure(&error, surface);
    match commit(ctx.kube.as_ref(), request, &draft, guard).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            debug!("request no longer exists, dropping failure history");
            ctx.failures.reset(&key);
            return error;
        }
        Err(e) => warn!(error = %e, "failed to record failure in status"),
    }

    if surface {
        emit(
            ctx,
            request,
            EventType::Warning,
            reasons::RECONCILE_FAILED,
            actions::RECONCILE,
            error.to_string(),
        )
        .await;
    }

    if error.is_connection_failure() {
        ctx.resolver.invalidate(&request.spec.target_cluster_profile);
    }
    error
}

async fn emit(
    ctx: &Context,
    request: &AuthTokenRequest,
    type_: EventType,
    reason: &str,
    action: &str,
    note: String,
) {
    ctx.events
        .publish(&request.object_ref(&()), type_, reason, action, Some(note))
        .await;
}

/// Delay before retrying a request that failed `streak` times in a row
pub fn requeue_delay(policy: &BackoffPolicy, class: ErrorClass, streak: u32) -> Duration {
    let delay = policy.delay(class, streak);
    if BackoffPolicy::jittered(class) {
        with_jitter(delay)
    } else {
        delay
    }
}

/// Error policy for the AuthTokenRequest controller
///
/// Transient and permission failures back off exponentially with jitter.
/// Conflicts and validation failures are retried at a fixed low frequency
/// since they need a spec fix or manual cleanup.
pub fn error_policy(request: Arc<AuthTokenRequest>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = request.key();
    let class = error.class();
    let streak = ctx
        .failures
        .streak(&key)
        .filter(|(c, _)| *c == class)
        .map(|(_, n)| n)
        .unwrap_or(1);
    let delay = requeue_delay(&ctx.settings.backoff, class, streak);

    error!(
        ?error,
        request = %key,
        class = %class,
        streak,
        retry_in_secs = delay.as_secs(),
        "reconciliation failed"
    );
    Action::requeue(delay)
}
