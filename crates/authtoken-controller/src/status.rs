//! Status reporting for AuthTokenRequest
//!
//! A pass accumulates its status changes in a [`StatusDraft`] and writes them
//! once through [`commit`]. The write is a read-modify-write against the
//! latest stored object so changes made by another writer in the meantime are
//! kept, and a stale `resourceVersion` is retried.

use std::time::Duration;

use kube::{Resource, ResourceExt};
use tracing::debug;

use authtoken_common::crd::{
    AcceptedSpec, AuthTokenRequest, AuthTokenRequestStatus, Condition, ConditionStatus,
    ConfigMapRef, RequestPhase, CONDITION_DEGRADED, CONDITION_PROVISIONED, CONDITION_READY,
    CONDITION_TOKEN_ISSUED,
};
use authtoken_common::retry::{retry_with_backoff_if, RetryConfig};
use authtoken_common::Error;

use crate::controller::KubeClient;
use crate::guard::CallGuard;

/// Attempts for a status write racing another writer
const STATUS_WRITE_ATTEMPTS: u32 = 5;

/// Replace the condition of the same type, or append it
///
/// The transition time is carried over when the status did not change.
/// Conditions are never removed. Returns whether anything besides the
/// timestamp changed.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            if *existing == condition {
                return false;
            }
            *existing = condition;
            true
        }
        None => {
            conditions.push(condition);
            true
        }
    }
}

/// Status changes made during one reconcile pass
#[derive(Clone, Debug, Default)]
pub struct StatusDraft {
    generation: Option<i64>,
    phase: Option<RequestPhase>,
    conditions: Vec<Condition>,
    token_response: Option<ConfigMapRef>,
    observed_generation: Option<i64>,
    accepted_spec: Option<AcceptedSpec>,
}

impl StatusDraft {
    /// Start a draft for the request's current generation
    pub fn for_request(request: &AuthTokenRequest) -> Self {
        Self {
            generation: request.meta().generation,
            ..Default::default()
        }
    }

    /// Set the lifecycle phase
    pub fn phase(&mut self, phase: RequestPhase) -> &mut Self {
        self.phase = Some(phase);
        self
    }

    /// Set a condition for the draft's generation
    pub fn condition(
        &mut self,
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
    ) -> &mut Self {
        let condition =
            Condition::new(type_, status, reason, message).with_generation(self.generation);
        set_condition(&mut self.conditions, condition);
        self
    }

    /// Point status at the published token ConfigMap
    pub fn token_response(&mut self, reference: ConfigMapRef) -> &mut Self {
        self.token_response = Some(reference);
        self
    }

    /// Record the draft's generation as fully provisioned
    pub fn observed_current_generation(&mut self) -> &mut Self {
        self.observed_generation = self.generation;
        self
    }

    /// Record the accepted immutable snapshot
    pub fn accepted_spec(&mut self, accepted: AcceptedSpec) -> &mut Self {
        self.accepted_spec = Some(accepted);
        self
    }

    /// Seed every condition type with `Unknown` for a request seen for the first time
    pub fn initial_conditions(&mut self) -> &mut Self {
        for type_ in [
            CONDITION_PROVISIONED,
            CONDITION_TOKEN_ISSUED,
            CONDITION_READY,
            CONDITION_DEGRADED,
        ] {
            self.condition(type_, ConditionStatus::Unknown, "Pending", "not yet reconciled");
        }
        self
    }

    /// Fold a failed pass into the draft
    ///
    /// When `surface` is false the failure is kept out of status, which is
    /// used for permission errors that have not yet hit their threshold.
    pub fn record_failure(&mut self, error: &Error, surface: bool) -> &mut Self {
        if !surface {
            return self;
        }
        let reason = error.reason();
        let message = error.to_string();
        self.condition(CONDITION_DEGRADED, ConditionStatus::True, reason, message.clone())
            .condition(CONDITION_READY, ConditionStatus::False, reason, message)
            .phase(RequestPhase::Degraded)
    }

    /// Whether the draft changes nothing
    pub fn is_empty(&self) -> bool {
        self.phase.is_none()
            && self.conditions.is_empty()
            && self.token_response.is_none()
            && self.observed_generation.is_none()
            && self.accepted_spec.is_none()
    }

    /// Apply the draft on top of a stored status
    pub fn apply_to(&self, status: &mut AuthTokenRequestStatus) {
        if let Some(phase) = self.phase {
            status.phase = phase;
        }
        for condition in &self.conditions {
            set_condition(&mut status.conditions, condition.clone());
        }
        if let Some(reference) = &self.token_response {
            status.token_response = Some(reference.clone());
        }
        if self.observed_generation.is_some() {
            status.observed_generation = self.observed_generation;
        }
        if let Some(accepted) = &self.accepted_spec {
            status.accepted_spec = Some(accepted.clone());
        }
    }
}

/// Write the draft to the request's status subresource
///
/// Returns the status as stored, or `None` when the request no longer exists.
/// A write that changes nothing is skipped.
pub async fn commit(
    kube: &dyn KubeClient,
    request: &AuthTokenRequest,
    draft: &StatusDraft,
    guard: &CallGuard,
) -> Result<Option<AuthTokenRequestStatus>, Error> {
    if draft.is_empty() {
        return Ok(Some(request.status.clone().unwrap_or_default()));
    }
    let namespace = request.namespace().unwrap_or_default();
    let name = request.name_any();
    let config = RetryConfig {
        initial_delay: Duration::from_millis(200),
        max_delay: Duration::from_secs(2),
        ..RetryConfig::with_max_attempts(STATUS_WRITE_ATTEMPTS)
    };
    retry_with_backoff_if(
        &config,
        "commit_status",
        |e: &Error| e.is_stale_write(),
        || write_status(kube, &namespace, &name, draft, guard),
    )
    .await
}

async fn write_status(
    kube: &dyn KubeClient,
    namespace: &str,
    name: &str,
    draft: &StatusDraft,
    guard: &CallGuard,
) -> Result<Option<AuthTokenRequestStatus>, Error> {
    let Some(mut latest) = guard
        .run(
            &format!("get AuthTokenRequest {}/{}", namespace, name),
            kube.get_request(namespace, name),
        )
        .await?
    else {
        debug!(namespace, name, "request deleted before status write");
        return Ok(None);
    };

    let mut status = latest.status.clone().unwrap_or_default();
    draft.apply_to(&mut status);
    if latest.status.as_ref() == Some(&status) {
        return Ok(Some(status));
    }

    latest.status = Some(status);
    let written = guard
        .run(
            &format!("update status of AuthTokenRequest {}/{}", namespace, name),
            kube.replace_request_status(&latest),
        )
        .await?;
    Ok(written.status)
}
