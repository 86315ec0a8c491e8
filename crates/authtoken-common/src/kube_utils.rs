//! Shared Kubernetes utilities using kube-rs
//!
//! Client construction for the local cluster and for target clusters reached
//! through a kubeconfig, plus naming helpers for generated objects.

use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use sha2::{Digest, Sha256};

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum length of a Kubernetes object name (DNS-1123 subdomain)
pub const MAX_OBJECT_NAME_LEN: usize = 253;

/// Create a kube client from optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client from optional kubeconfig path with custom timeouts
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// A client for a remote cluster, built from kubeconfig contents
pub struct RemoteClient {
    /// The client
    pub client: Client,
    /// API server URL of the remote cluster
    pub server: String,
}

/// Build a client config from raw kubeconfig bytes (e.g. read from a Secret)
///
/// Failures are reported as cluster profile errors against `profile`: a
/// kubeconfig that cannot be parsed will not fix itself.
pub async fn config_from_kubeconfig(
    profile: &str,
    raw: &[u8],
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Config, Error> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| Error::cluster_profile(profile, "kubeconfig is not valid UTF-8"))?;
    let kubeconfig: Kubeconfig = serde_yaml::from_str(text)
        .map_err(|e| Error::cluster_profile(profile, format!("invalid kubeconfig: {}", e)))?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::cluster_profile(profile, format!("unusable kubeconfig: {}", e)))?;
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Ok(config)
}

/// Build a client from raw kubeconfig bytes
pub async fn client_from_kubeconfig(
    profile: &str,
    raw: &[u8],
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<RemoteClient, Error> {
    let config = config_from_kubeconfig(profile, raw, connect_timeout, read_timeout).await?;
    let server = config.cluster_url.to_string();
    let client = Client::try_from(config).map_err(|e| {
        Error::cluster_profile(profile, format!("failed to create client: {}", e))
    })?;
    Ok(RemoteClient { client, server })
}

/// First value present in a Secret under any of `keys`
pub fn secret_value<'a>(secret: &'a Secret, keys: &[&str]) -> Option<&'a [u8]> {
    let data = secret.data.as_ref()?;
    keys.iter()
        .find_map(|k| data.get(*k))
        .map(|v| v.0.as_slice())
}

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Uses truncated SHA-256 so names derived from it are stable across releases.
pub fn deterministic_hash(input: &str) -> String {
    let hash = Sha256::digest(input.as_bytes());
    hash[..8].iter().fold(String::with_capacity(16), |mut s, b| {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
        s
    })
}

/// `<base><suffix>`, or a truncated form with a stable hash when too long
///
/// Names within `max_len` are returned unchanged. Longer names keep as much
/// of the base as fits before `-<hash><suffix>`, where the hash covers the
/// full untruncated name so distinct inputs stay distinct.
pub fn bounded_name(base: &str, suffix: &str, max_len: usize) -> String {
    let full = format!("{}{}", base, suffix);
    if full.len() <= max_len {
        return full;
    }
    let hash = deterministic_hash(&full);
    let keep = max_len.saturating_sub(suffix.len() + hash.len() + 1);
    let mut prefix: String = base.chars().take(keep).collect();
    while prefix.ends_with(['-', '.']) {
        prefix.pop();
    }
    format!("{}-{}{}", prefix, hash, suffix)
}
