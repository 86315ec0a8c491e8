//! Bound service account token issuance

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use authtoken_common::Error;

use crate::guard::CallGuard;
use crate::provisioner::ServiceAccountRef;
use crate::target::TargetCluster;

/// A freshly issued token
///
/// The token value never appears in `Debug` output or logs.
#[derive(Clone, PartialEq)]
pub struct MintedToken {
    /// Bearer token
    pub token: String,
    /// When the token stops being accepted
    pub expiration_timestamp: DateTime<Utc>,
}

impl std::fmt::Debug for MintedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MintedToken")
            .field("token", &"<redacted>")
            .field("expiration_timestamp", &self.expiration_timestamp)
            .finish()
    }
}

/// Issue a token for `account` valid for `expiration`
pub async fn mint(
    target: &dyn TargetCluster,
    account: &ServiceAccountRef,
    expiration: Duration,
    guard: &CallGuard,
) -> Result<MintedToken, Error> {
    let seconds = i64::try_from(expiration.as_secs()).unwrap_or(i64::MAX);
    let status = guard
        .run(
            &format!("request token for {}", account),
            target.request_token(&account.namespace, &account.name, seconds),
        )
        .await?;

    if status.token.is_empty() {
        return Err(Error::token_unavailable(
            account.to_string(),
            "token request returned an empty token",
        ));
    }

    let minted = MintedToken {
        token: status.token,
        expiration_timestamp: status.expiration_timestamp.0,
    };
    info!(
        profile = %target.profile(),
        service_account = %account,
        expires = %minted.expiration_timestamp,
        "issued service account token"
    );
    Ok(minted)
}
