//! Common types for the AuthTokenRequest operator: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod retry;
pub mod telemetry;

pub use error::{Error, ErrorClass};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of the AuthTokenRequest CRD (and of supported cluster profiles)
pub const API_GROUP: &str = "multicluster.x-k8s.io";

/// Field manager / reporting component name used for all writes
pub const CONTROLLER_NAME: &str = "authtoken-controller";

/// Standard Kubernetes label identifying the managing component
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Annotation on target-cluster objects recording the owning request (`<namespace>/<name>`)
pub const ANNOTATION_REQUEST: &str = "multicluster.x-k8s.io/auth-token-request";

/// Annotation on target-cluster objects recording the owning request UID
pub const ANNOTATION_REQUEST_UID: &str = "multicluster.x-k8s.io/auth-token-request-uid";

/// Namespace used for the service account when a request names no roles
pub const DEFAULT_FALLBACK_NAMESPACE: &str = "default";
