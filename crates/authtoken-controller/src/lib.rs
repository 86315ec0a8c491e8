//! Cross-cluster token provisioning controller for AuthTokenRequest
//!
//! - **Target**: resolves cluster profiles to target cluster connections
//! - **Provisioner**: creates the service account and its RBAC in the target cluster
//! - **Minter**: issues a bound token for the service account
//! - **Publisher**: writes the token into a ConfigMap next to the request
//! - **Status**: conditions and optimistic-concurrency status writes
//! - **Controller**: the reconcile loop tying the steps together

pub mod backoff;
pub mod controller;
pub mod guard;
pub mod minter;
pub mod provisioner;
pub mod publisher;
pub mod status;
pub mod target;

#[cfg(test)]
mod testing;

pub use controller::{
    error_policy, reconcile, Context, ContextBuilder, ControllerSettings, KubeClient,
    KubeClientImpl,
};
pub use target::{SecretKubeconfigResolver, TargetCluster, TargetClusterResolver};
