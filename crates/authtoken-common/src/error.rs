//! Error types for the AuthTokenRequest operator
//!
//! Errors are structured with fields to aid debugging in production. Each
//! variant carries the request, profile, or object it concerns, and every
//! error maps onto one of four [`ErrorClass`]es that drive backoff and the
//! `Degraded` condition reason.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Failure classes understood by the reconciliation driver
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Network, timeout, server-side or optimistic-concurrency failures
    Transient,
    /// A same-named object exists in the target cluster and is not ours
    Conflict,
    /// The target or local API denied the call
    Permission,
    /// Malformed spec, immutable-field drift, or an unresolvable cluster profile
    Validation,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "Transient"),
            Self::Conflict => write!(f, "Conflict"),
            Self::Permission => write!(f, "Permission"),
            Self::Validation => write!(f, "Validation"),
        }
    }
}

/// Main error type for AuthTokenRequest operations
#[derive(Debug, Error)]
pub enum Error {
    /// Error from the local Kubernetes API
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Error from a call against the target cluster
    #[error("target cluster {profile}: {operation} failed: {source}")]
    Target {
        /// Cluster profile key (`<namespace>/<name>`)
        profile: String,
        /// Operation that failed (e.g. "create Role ns1/reader")
        operation: String,
        /// The underlying kube-rs error
        source: kube::Error,
    },

    /// Validation error for the request spec
    #[error("validation error for {request}: {message}")]
    Validation {
        /// Request key (`<namespace>/<name>`)
        request: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.serviceAccountName")
        field: Option<String>,
    },

    /// The cluster profile reference could not be resolved to a connection
    #[error("cannot resolve cluster profile {profile}: {message}")]
    ClusterProfile {
        /// Cluster profile key (`<namespace>/<name>`)
        profile: String,
        /// Description of what failed
        message: String,
    },

    /// A same-named object exists and was not created for this request
    #[error("{kind} {name} already exists and is not owned by this request (owner: {owner})")]
    Conflict {
        /// Object kind (e.g. "Role")
        kind: String,
        /// Object name, namespace-qualified for namespaced kinds
        name: String,
        /// Owner recorded on the existing object, if any
        owner: String,
    },

    /// An external call exceeded its deadline
    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Configured deadline
        after: Duration,
    },

    /// The call was aborted because the controller is shutting down
    #[error("{operation} cancelled by shutdown")]
    Cancelled {
        /// Operation that was aborted
        operation: String,
    },

    /// The token endpoint answered without a usable token
    #[error("token request for {account} returned no usable token: {message}")]
    TokenUnavailable {
        /// Service account (`<namespace>/<name>`)
        account: String,
        /// Description of what was missing
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "publisher", "status")
        context: String,
    },
}

impl Error {
    /// Create a validation error without request context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            request: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with request context and field path
    pub fn validation_for_field(
        request: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            request: request.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Attach a request key to a validation error raised without one
    pub fn for_request(self, key: impl Into<String>) -> Self {
        match self {
            Error::Validation {
                message, field, ..
            } => Error::Validation {
                request: key.into(),
                message,
                field,
            },
            other => other,
        }
    }

    /// Wrap a kube error returned by the target cluster
    pub fn target(
        profile: impl Into<String>,
        operation: impl Into<String>,
        source: kube::Error,
    ) -> Self {
        Self::Target {
            profile: profile.into(),
            operation: operation.into(),
            source,
        }
    }

    /// Create a cluster profile resolution error
    pub fn cluster_profile(profile: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ClusterProfile {
            profile: profile.into(),
            message: msg.into(),
        }
    }

    /// Create a name-conflict error
    pub fn conflict(
        kind: impl Into<String>,
        name: impl Into<String>,
        owner: Option<&str>,
    ) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
            owner: owner.unwrap_or("none").to_string(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a token-unavailable error
    pub fn token_unavailable(account: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::TokenUnavailable {
            account: account.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Classify this error for backoff and condition reporting
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Kube { source } => classify_kube_error(source),
            Error::Target { source, .. } => classify_kube_error(source),
            Error::Validation { .. } => ErrorClass::Validation,
            Error::ClusterProfile { .. } => ErrorClass::Validation,
            Error::Conflict { .. } => ErrorClass::Conflict,
            Error::Timeout { .. } => ErrorClass::Transient,
            Error::Cancelled { .. } => ErrorClass::Transient,
            Error::TokenUnavailable { .. } => ErrorClass::Transient,
            Error::Serialization { .. } => ErrorClass::Validation,
            Error::Internal { .. } => ErrorClass::Transient,
        }
    }

    /// Stable, machine-readable reason for the `Degraded` condition
    pub fn reason(&self) -> &'static str {
        match (self, self.class()) {
            (_, ErrorClass::Permission) => "PermissionDenied",
            (_, ErrorClass::Conflict) => "NameConflict",
            (Error::ClusterProfile { .. }, _) => "InvalidClusterProfile",
            (Error::Validation { .. }, _) => "InvalidSpec",
            (Error::Serialization { .. }, _) => "InvalidSpec",
            (Error::Target { .. }, ErrorClass::Validation) => "TargetRejected",
            (Error::Kube { .. }, ErrorClass::Validation) => "Rejected",
            (Error::Target { source: kube::Error::Api(_), .. }, _) => "TargetAPIError",
            (Error::Target { .. }, _) => "TargetUnreachable",
            (Error::Kube { source }, _) if is_stale_write(source) => "StatusConflict",
            (Error::Kube { .. }, _) => "APIUnavailable",
            (Error::Timeout { .. }, _) => "Timeout",
            (Error::Cancelled { .. }, _) => "Cancelled",
            (Error::TokenUnavailable { .. }, _) => "TokenUnavailable",
            _ => "InternalError",
        }
    }

    /// Whether the target connection behind this error should be re-established
    pub fn is_connection_failure(&self) -> bool {
        match self {
            Error::Target { source, .. } => !matches!(source, kube::Error::Api(_)),
            Error::Timeout { .. } => true,
            _ => false,
        }
    }

    /// True for an HTTP 409 from the local API (stale resourceVersion or create race)
    pub fn is_stale_write(&self) -> bool {
        matches!(self, Error::Kube { source } if is_stale_write(source))
    }

    /// Get the request key if this error is associated with a specific request
    pub fn request(&self) -> Option<&str> {
        match self {
            Error::Validation { request, .. } => Some(request),
            _ => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

/// True when the error is an HTTP 409 from the API server
pub fn is_stale_write(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

fn classify_kube_error(err: &kube::Error) -> ErrorClass {
    match err {
        kube::Error::Api(ae) => match ae.code {
            401 | 403 => ErrorClass::Permission,
            400 | 422 => ErrorClass::Validation,
            // 404 (namespace terminating, RBAC cache lag), 409 (create race, stale
            // resourceVersion), 429 and 5xx all clear on their own.
            _ => ErrorClass::Transient,
        },
        _ => ErrorClass::Transient,
    }
}
