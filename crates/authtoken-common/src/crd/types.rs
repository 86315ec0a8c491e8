//! Shared types used by the AuthTokenRequest CRD

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type: target-cluster objects exist for the current generation
pub const CONDITION_PROVISIONED: &str = "Provisioned";
/// Condition type: a token was minted for the service account
pub const CONDITION_TOKEN_ISSUED: &str = "TokenIssued";
/// Condition type: the token is published in the response ConfigMap
pub const CONDITION_READY: &str = "Ready";
/// Condition type: the last pass failed
pub const CONDITION_DEGRADED: &str = "Degraded";

/// Kind of the only supported cluster profile reference
pub const CLUSTER_PROFILE_KIND: &str = "ClusterProfile";

/// Reference to a cluster profile describing how to reach the target cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ClusterProfileRef {
    /// API group of the profile (e.g. multicluster.x-k8s.io)
    pub api_group: String,
    /// Kind of the profile (e.g. ClusterProfile)
    pub kind: String,
    /// Name of the profile
    pub name: String,
    /// Namespace holding the profile
    pub namespace: String,
}

impl ClusterProfileRef {
    /// `<namespace>/<name>`, used as the cache key and in messages
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl std::fmt::Display for ClusterProfileRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{} {}/{}", self.kind, self.api_group, self.namespace, self.name)
    }
}

/// Reference to the ConfigMap holding the issued token
///
/// Always resolves in the namespace of the owning request.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapRef {
    /// Always the core group (empty string)
    #[serde(default)]
    pub api_group: String,
    /// Always "ConfigMap"
    pub kind: String,
    /// Name of the ConfigMap
    pub name: String,
}

impl ConfigMapRef {
    /// Reference a ConfigMap by name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            api_group: String::new(),
            kind: "ConfigMap".to_string(),
            name: name.into(),
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (Provisioned, TokenIssued, Ready, Degraded)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,

    /// Generation of the request this condition was computed from
    #[serde(
        rename = "observedGeneration",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
            observed_generation: None,
        }
    }

    /// Record the generation this condition describes
    pub fn with_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    /// True when the condition holds
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Lifecycle phase of an AuthTokenRequest
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RequestPhase {
    /// Not yet seen by the controller
    #[default]
    Pending,
    /// Target-cluster objects are being created
    Provisioning,
    /// Target-cluster objects exist
    Provisioned,
    /// Waiting for a token to be minted and published
    TokenPending,
    /// Token published
    Ready,
    /// The last pass failed; retried with backoff
    Degraded,
}

impl std::fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Provisioning => write!(f, "Provisioning"),
            Self::Provisioned => write!(f, "Provisioned"),
            Self::TokenPending => write!(f, "TokenPending"),
            Self::Ready => write!(f, "Ready"),
            Self::Degraded => write!(f, "Degraded"),
        }
    }
}
