//! Operator configuration from flags and `AUTHTOKEN_*` environment variables

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser};
use thiserror::Error;

use authtoken_common::telemetry::LogFormat;
use authtoken_common::{CONTROLLER_NAME, DEFAULT_FALLBACK_NAMESPACE};
use authtoken_controller::ControllerSettings;

/// Shortest token lifetime the TokenRequest API accepts
pub const MIN_TOKEN_EXPIRATION_SECS: u64 = 600;

/// Invalid operator configuration
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// Token lifetime below the API minimum
    #[error("token expiration must be at least {MIN_TOKEN_EXPIRATION_SECS}s, got {0}s")]
    TokenExpirationTooShort(u64),

    /// A setting that must be positive was zero
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    /// Empty fallback namespace
    #[error("fallback namespace must not be empty")]
    EmptyFallbackNamespace,
}

/// Settings for the controller process
#[derive(Args, Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    /// Path to a kubeconfig for the local cluster (in-cluster config when unset)
    #[arg(long, env = "AUTHTOKEN_KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Only watch requests in this namespace (all namespaces when unset)
    #[arg(long, env = "AUTHTOKEN_WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Namespace for service accounts of requests without roles
    #[arg(long, env = "AUTHTOKEN_FALLBACK_NAMESPACE", default_value = DEFAULT_FALLBACK_NAMESPACE)]
    pub fallback_namespace: String,

    /// Lifetime of minted tokens, in seconds
    #[arg(long, env = "AUTHTOKEN_TOKEN_EXPIRATION_SECS", default_value_t = 86_400)]
    pub token_expiration_secs: u64,

    /// Deadline for each call against a cluster, in seconds
    #[arg(long, env = "AUTHTOKEN_CALL_TIMEOUT_SECS", default_value_t = 10)]
    pub call_timeout_secs: u64,

    /// Requeue interval for Ready requests, in seconds
    #[arg(long, env = "AUTHTOKEN_RESYNC_INTERVAL_SECS", default_value_t = 600)]
    pub resync_interval_secs: u64,

    /// Upper bound on reconcile passes running at once (0 = unbounded)
    #[arg(long, env = "AUTHTOKEN_MAX_CONCURRENT_RECONCILES", default_value_t = 8)]
    pub max_concurrent_reconciles: u16,

    /// Consecutive permission failures before a request shows Degraded
    #[arg(long, env = "AUTHTOKEN_PERMISSION_DEGRADED_THRESHOLD", default_value_t = 3)]
    pub permission_degraded_threshold: u32,

    /// Field manager used for server-side apply
    #[arg(long, env = "AUTHTOKEN_FIELD_MANAGER", default_value = CONTROLLER_NAME)]
    pub field_manager: String,

    /// Log output format: text or json
    #[arg(long, env = "AUTHTOKEN_LOG_FORMAT", default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Do not install or update the CRD at startup
    #[arg(long, env = "AUTHTOKEN_SKIP_CRD_INSTALL")]
    pub skip_crd_install: bool,
}

impl OperatorConfig {
    /// Settings from `AUTHTOKEN_*` variables and defaults, without flags
    pub fn from_env_defaults() -> Result<Self, clap::Error> {
        #[derive(Parser)]
        struct EnvOnly {
            #[command(flatten)]
            config: OperatorConfig,
        }
        EnvOnly::try_parse_from(["authtoken-operator"]).map(|cli| cli.config)
    }

    /// Check values clap cannot check on its own
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token_expiration_secs < MIN_TOKEN_EXPIRATION_SECS {
            return Err(ConfigError::TokenExpirationTooShort(
                self.token_expiration_secs,
            ));
        }
        if self.call_timeout_secs == 0 {
            return Err(ConfigError::Zero("call timeout"));
        }
        if self.resync_interval_secs == 0 {
            return Err(ConfigError::Zero("resync interval"));
        }
        if self.permission_degraded_threshold == 0 {
            return Err(ConfigError::Zero("permission degraded threshold"));
        }
        if self.fallback_namespace.trim().is_empty() {
            return Err(ConfigError::EmptyFallbackNamespace);
        }
        Ok(())
    }

    /// Validate and derive the reconcile loop settings
    pub fn controller_settings(&self) -> Result<ControllerSettings, ConfigError> {
        self.validate()?;
        Ok(ControllerSettings {
            fallback_namespace: self.fallback_namespace.clone(),
            token_expiration: Duration::from_secs(self.token_expiration_secs),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            resync_interval: Duration::from_secs(self.resync_interval_secs),
            permission_degraded_threshold: self.permission_degraded_threshold,
            ..Default::default()
        })
    }
}
