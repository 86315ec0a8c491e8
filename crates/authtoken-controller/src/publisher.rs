//! Token delivery into the request's namespace
//!
//! The token is written to a ConfigMap next to the request, owner-referenced
//! to it so deleting the request garbage-collects the token. A same-named
//! ConfigMap not owned by the request is never overwritten.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Resource, ResourceExt};
use tracing::info;

use authtoken_common::crd::{AuthTokenRequest, ConfigMapRef};
use authtoken_common::kube_utils::{bounded_name, MAX_OBJECT_NAME_LEN};
use authtoken_common::{Error, CONTROLLER_NAME, LABEL_MANAGED_BY};

use crate::controller::KubeClient;
use crate::guard::CallGuard;
use crate::minter::MintedToken;
use crate::provisioner::ServiceAccountRef;

/// ConfigMap key holding the bearer token
pub const KEY_TOKEN: &str = "token";
/// ConfigMap key holding the RFC 3339 expiry
pub const KEY_EXPIRATION: &str = "expirationTimestamp";
/// ConfigMap key holding the service account name
pub const KEY_SERVICE_ACCOUNT: &str = "serviceAccount";
/// ConfigMap key holding the service account namespace
pub const KEY_NAMESPACE: &str = "namespace";
/// ConfigMap key holding the cluster profile key
pub const KEY_CLUSTER_PROFILE: &str = "clusterProfile";
/// ConfigMap key holding the target API server URL, when known
pub const KEY_SERVER: &str = "server";

/// Name of the token ConfigMap for a request
pub fn config_map_name(request_name: &str) -> String {
    bounded_name(request_name, "-auth-token", MAX_OBJECT_NAME_LEN)
}

/// Build the token ConfigMap for `request`
pub fn build_token_config_map(
    request: &AuthTokenRequest,
    token: &MintedToken,
    account: &ServiceAccountRef,
    server: Option<&str>,
) -> Result<ConfigMap, Error> {
    let owner = request.controller_owner_ref(&()).ok_or_else(|| {
        Error::internal_with_context("publisher", "AuthTokenRequest has no uid")
    })?;

    let mut data = BTreeMap::from([
        (KEY_TOKEN.to_string(), token.token.clone()),
        (
            KEY_EXPIRATION.to_string(),
            token.expiration_timestamp.to_rfc3339(),
        ),
        (KEY_SERVICE_ACCOUNT.to_string(), account.name.clone()),
        (KEY_NAMESPACE.to_string(), account.namespace.clone()),
        (
            KEY_CLUSTER_PROFILE.to_string(),
            request.spec.target_cluster_profile.key(),
        ),
    ]);
    if let Some(server) = server {
        data.insert(KEY_SERVER.to_string(), server.to_string());
    }

    let mut cm = ConfigMap {
        data: Some(data),
        ..Default::default()
    };
    cm.metadata.name = Some(config_map_name(&request.name_any()));
    cm.metadata.namespace = request.namespace();
    cm.metadata.labels = Some(BTreeMap::from([(
        LABEL_MANAGED_BY.to_string(),
        CONTROLLER_NAME.to_string(),
    )]));
    cm.metadata.owner_references = Some(vec![owner]);
    Ok(cm)
}

fn owned_by(cm: &ConfigMap, request: &AuthTokenRequest) -> bool {
    let Some(uid) = request.uid() else {
        return false;
    };
    cm.owner_references().iter().any(|o| o.uid == uid)
}

/// Write the token ConfigMap and return the reference for status
///
/// Creates the ConfigMap, or overwrites the data of one this request already
/// owns. Any other same-named ConfigMap is a conflict.
pub async fn publish(
    kube: &dyn KubeClient,
    request: &AuthTokenRequest,
    cm: ConfigMap,
    guard: &CallGuard,
) -> Result<ConfigMapRef, Error> {
    let namespace = request.namespace().unwrap_or_default();
    if cm.namespace().as_deref() != Some(namespace.as_str()) {
        return Err(Error::internal_with_context(
            "publisher",
            format!(
                "token ConfigMap must live in the request namespace {}, got {:?}",
                namespace,
                cm.namespace()
            ),
        ));
    }
    let name = cm.name_any();

    match guard
        .run(
            &format!("get ConfigMap {}/{}", namespace, name),
            kube.get_config_map(&namespace, &name),
        )
        .await?
    {
        None => {
            guard
                .run(
                    &format!("create ConfigMap {}/{}", namespace, name),
                    kube.create_config_map(&namespace, &cm),
                )
                .await?;
        }
        Some(mut existing) => {
            if !owned_by(&existing, request) {
                return Err(Error::conflict(
                    "ConfigMap",
                    format!("{}/{}", namespace, name),
                    None,
                ));
            }
            existing.data = cm.data;
            guard
                .run(
                    &format!("replace ConfigMap {}/{}", namespace, name),
                    kube.replace_config_map(&namespace, &existing),
                )
                .await?;
        }
    }

    info!(request = %request.key(), config_map = %name, "token published");
    Ok(ConfigMapRef::new(name))
}

/// Whether the token referenced from status is present and owned by the request
pub async fn is_published(
    kube: &dyn KubeClient,
    request: &AuthTokenRequest,
    guard: &CallGuard,
) -> Result<bool, Error> {
    let expected = config_map_name(&request.name_any());
    let referenced = request
        .status
        .as_ref()
        .and_then(|s| s.token_response.as_ref())
        .is_some_and(|r| r.name == expected);
    if !referenced {
        return Ok(false);
    }

    let namespace = request.namespace().unwrap_or_default();
    let Some(cm) = guard
        .run(
            &format!("get ConfigMap {}/{}", namespace, expected),
            kube.get_config_map(&namespace, &expected),
        )
        .await?
    else {
        return Ok(false);
    };

    let has_token = cm
        .data
        .as_ref()
        .and_then(|d| d.get(KEY_TOKEN))
        .is_some_and(|t| !t.is_empty());
    Ok(owned_by(&cm, request) && has_token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::MockKubeClient;
    use crate::testing::{request_with, sample_spec, test_guard};
    use authtoken_common::crd::AuthTokenRequestStatus;
    use authtoken_common::ErrorClass;
    use chrono::{TimeZone, Utc};

    fn token() -> MintedToken {
        MintedToken {
            token: "abc.def.ghi".to_string(),
            expiration_timestamp: Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap(),
        }
    }

    fn account() -> ServiceAccountRef {
        ServiceAccountRef {
            namespace: "default".to_string(),
            name: "svc-a".to_string(),
        }
    }

    fn built(request: &AuthTokenRequest) -> ConfigMap {
        build_token_config_map(request, &token(), &account(), Some("https://10.0.0.1:6443"))
            .unwrap()
    }

    mod building {
        use super::*;

        #[test]
        fn config_map_carries_token_and_context() {
            let request = request_with(sample_spec());
            let cm = built(&request);

            assert_eq!(cm.name_any(), "ci-token-auth-token");
            assert_eq!(cm.namespace().as_deref(), Some("team-a"));
            let data = cm.data.as_ref().unwrap();
            assert_eq!(data[KEY_TOKEN], "abc.def.ghi");
            assert_eq!(data[KEY_EXPIRATION], "2030-01-02T03:04:05+00:00");
            assert_eq!(data[KEY_SERVICE_ACCOUNT], "svc-a");
            assert_eq!(data[KEY_NAMESPACE], "default");
            assert_eq!(data[KEY_CLUSTER_PROFILE], "fleet/prod-east");
            assert_eq!(data[KEY_SERVER], "https://10.0.0.1:6443");
        }

        #[test]
        fn config_map_is_owned_by_request() {
            let request = request_with(sample_spec());
            let cm = built(&request);
            let owners = cm.owner_references();
            assert_eq!(owners.len(), 1);
            assert_eq!(owners[0].kind, "AuthTokenRequest");
            assert_eq!(owners[0].uid, "uid-1");
            assert_eq!(owners[0].controller, Some(true));
            assert!(owned_by(&cm, &request));
        }

        #[test]
        fn server_key_is_omitted_when_unknown() {
            let request = request_with(sample_spec());
            let cm = build_token_config_map(&request, &token(), &account(), None).unwrap();
            assert!(!cm.data.unwrap().contains_key(KEY_SERVER));
        }

        #[test]
        fn long_request_names_are_bounded() {
            let name = config_map_name(&"x".repeat(300));
            assert!(name.len() <= MAX_OBJECT_NAME_LEN);
            assert!(name.ends_with("-auth-token"));
        }
    }

    mod publishing {
        use super::*;

        #[tokio::test]
        async fn creates_missing_config_map() {
            let request = request_with(sample_spec());
            let mut mock = MockKubeClient::new();
            mock.expect_get_config_map().returning(|_, _| Ok(None));
            mock.expect_create_config_map()
                .withf(|ns, cm| ns == "team-a" && cm.name_any() == "ci-token-auth-token")
                .times(1)
                .returning(|_, cm| Ok(cm.clone()));
            mock.expect_replace_config_map().never();

            let reference = publish(&mock, &request, built(&request), &test_guard())
                .await
                .unwrap();
            assert_eq!(reference, ConfigMapRef::new("ci-token-auth-token"));
        }

        #[tokio::test]
        async fn owned_config_map_is_overwritten() {
            let request = request_with(sample_spec());
            let mut stale = built(&request);
            stale.data = Some(BTreeMap::from([(KEY_TOKEN.to_string(), "old".to_string())]));
            stale.metadata.resource_version = Some("7".to_string());

            let mut mock = MockKubeClient::new();
            mock.expect_get_config_map()
                .returning(move |_, _| Ok(Some(stale.clone())));
            mock.expect_create_config_map().never();
            mock.expect_replace_config_map()
                .withf(|_, cm| {
                    cm.metadata.resource_version.as_deref() == Some("7")
                        && cm.data.as_ref().unwrap()[KEY_TOKEN] == "abc.def.ghi"
                })
                .times(1)
                .returning(|_, cm| Ok(cm.clone()));

            publish(&mock, &request, built(&request), &test_guard())
                .await
                .unwrap();
        }

        /// Story: a user's own ConfigMap with the same name is left alone
        #[tokio::test]
        async fn story_foreign_config_map_is_a_conflict() {
            let request = request_with(sample_spec());
            let mut foreign = ConfigMap::default();
            foreign.metadata.name = Some("ci-token-auth-token".to_string());
            foreign.metadata.namespace = Some("team-a".to_string());

            let mut mock = MockKubeClient::new();
            mock.expect_get_config_map()
                .returning(move |_, _| Ok(Some(foreign.clone())));
            mock.expect_create_config_map().never();
            mock.expect_replace_config_map().never();

            let err = publish(&mock, &request, built(&request), &test_guard())
                .await
                .unwrap_err();
            assert_eq!(err.class(), ErrorClass::Conflict);
            assert!(err.to_string().contains("team-a/ci-token-auth-token"));
        }

        #[tokio::test]
        async fn config_map_outside_request_namespace_is_refused() {
            let request = request_with(sample_spec());
            let mut cm = built(&request);
            cm.metadata.namespace = Some("elsewhere".to_string());

            let mut mock = MockKubeClient::new();
            mock.expect_get_config_map().never();
            mock.expect_create_config_map().never();

            let err = publish(&mock, &request, cm, &test_guard())
                .await
                .unwrap_err();
            assert_eq!(err.context(), Some("publisher"));
        }
    }

    mod published_check {
        use super::*;

        fn with_reference(name: &str) -> AuthTokenRequest {
            let mut request = request_with(sample_spec());
            request.status = Some(AuthTokenRequestStatus {
                token_response: Some(ConfigMapRef::new(name)),
                ..Default::default()
            });
            request
        }

        #[tokio::test]
        async fn no_reference_means_not_published() {
            let request = request_with(sample_spec());
            let mut mock = MockKubeClient::new();
            mock.expect_get_config_map().never();
            assert!(!is_published(&mock, &request, &test_guard()).await.unwrap());
        }

        #[tokio::test]
        async fn owned_config_map_with_token_is_published() {
            let request = with_reference("ci-token-auth-token");
            let cm = built(&request);
            let mut mock = MockKubeClient::new();
            mock.expect_get_config_map()
                .returning(move |_, _| Ok(Some(cm.clone())));
            assert!(is_published(&mock, &request, &test_guard()).await.unwrap());
        }

        /// Story: a deleted token ConfigMap is recreated on the next pass
        #[tokio::test]
        async fn story_deleted_config_map_is_not_published() {
            let request = with_reference("ci-token-auth-token");
            let mut mock = MockKubeClient::new();
            mock.expect_get_config_map().returning(|_, _| Ok(None));
            assert!(!is_published(&mock, &request, &test_guard()).await.unwrap());
        }

        #[tokio::test]
        async fn emptied_token_is_not_published() {
            let request = with_reference("ci-token-auth-token");
            let mut cm = built(&request);
            cm.data = Some(BTreeMap::new());
            let mut mock = MockKubeClient::new();
            mock.expect_get_config_map()
                .returning(move |_, _| Ok(Some(cm.clone())));
            assert!(!is_published(&mock, &request, &test_guard()).await.unwrap());
        }
    }
}
