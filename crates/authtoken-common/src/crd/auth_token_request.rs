//! AuthTokenRequest CRD: a service account and token provisioned in another cluster
//!
//! The request lives in a "hub" cluster and names a target cluster through a
//! [`ClusterProfileRef`]. The controller creates the service account and its
//! RBAC in the target cluster, mints a bound token, and publishes it in a
//! ConfigMap next to the request.

use std::collections::HashSet;

use k8s_openapi::api::rbac::v1::PolicyRule;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ClusterProfileRef, Condition, ConfigMapRef, RequestPhase};
use crate::Error;

/// Maximum length of `serviceAccountName`
pub const MAX_SERVICE_ACCOUNT_NAME_LEN: usize = 63;

/// Maximum number of entries in `roles` and in `clusterRoles`
pub const MAX_ROLE_ITEMS: usize = 20;

/// Request for a service account and access token in a target cluster
///
/// Example:
/// ```yaml
/// apiVersion: multicluster.x-k8s.io/v1alpha1
/// kind: AuthTokenRequest
/// metadata:
///   name: ci-token
///   namespace: team-a
/// spec:
///   targetClusterProfile:
///     apiGroup: multicluster.x-k8s.io
///     kind: ClusterProfile
///     name: prod-east
///     namespace: fleet
///   serviceAccountName: svc-a
///   roles:
///     - namespace: ns1
///       name: reader
///       rules:
///         - apiGroups: [""]
///           resources: ["pods"]
///           verbs: ["get", "list"]
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "multicluster.x-k8s.io",
    version = "v1alpha1",
    kind = "AuthTokenRequest",
    plural = "authtokenrequests",
    namespaced,
    status = "AuthTokenRequestStatus",
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.targetClusterProfile.name"}"#,
    printcolumn = r#"{"name":"ServiceAccount","type":"string","jsonPath":".spec.serviceAccountName"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AuthTokenRequestSpec {
    /// Cluster profile of the target cluster. Immutable.
    pub target_cluster_profile: ClusterProfileRef,

    /// Name of the service account to create in the target cluster. Immutable.
    pub service_account_name: String,

    /// Namespaced roles to create and bind to the service account
    ///
    /// Once present, the field must stay present. Contents may change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<Role>>,

    /// Cluster roles to create and bind to the service account
    ///
    /// Once present, the field must stay present. Contents may change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_roles: Option<Vec<ClusterRole>>,
}

/// A namespaced role granted to the service account
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    /// Namespace of the role; created in the target cluster if absent
    pub namespace: String,
    /// Name of the role
    pub name: String,
    /// Policy rules of the role
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

/// A cluster-scoped role granted to the service account
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRole {
    /// Name of the cluster role
    pub name: String,
    /// Policy rules of the cluster role
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

/// Status of an AuthTokenRequest, written only by the controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthTokenRequestStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: RequestPhase,

    /// ConfigMap holding the token, in the request's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_response: Option<ConfigMapRef>,

    /// Conditions, replaced by type and never removed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation of the spec last fully provisioned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Immutable identity accepted on the first reconcile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_spec: Option<AcceptedSpec>,
}

impl AuthTokenRequestStatus {
    /// Look up a condition by type
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// True when the condition exists and holds
    pub fn condition_is_true(&self, type_: &str) -> bool {
        self.condition(type_).is_some_and(Condition::is_true)
    }
}

/// Snapshot of the immutable parts of a spec
///
/// Admission enforces immutability with CEL rules; this snapshot lets the
/// controller re-check the same rules against what it originally accepted.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedSpec {
    /// Accepted target cluster profile
    pub target_cluster_profile: ClusterProfileRef,
    /// Accepted service account name
    pub service_account_name: String,
    /// Whether `roles` was present
    #[serde(default)]
    pub roles_set: bool,
    /// Whether `clusterRoles` was present
    #[serde(default)]
    pub cluster_roles_set: bool,
}

impl AcceptedSpec {
    /// Snapshot a spec at acceptance time
    pub fn from_spec(spec: &AuthTokenRequestSpec) -> Self {
        Self {
            target_cluster_profile: spec.target_cluster_profile.clone(),
            service_account_name: spec.service_account_name.clone(),
            roles_set: spec.roles.is_some(),
            cluster_roles_set: spec.cluster_roles.is_some(),
        }
    }

    /// Check a current spec against this snapshot
    pub fn check(&self, spec: &AuthTokenRequestSpec) -> Result<(), Error> {
        check_transition(
            &self.target_cluster_profile,
            &self.service_account_name,
            self.roles_set,
            self.cluster_roles_set,
            spec,
        )
    }

    /// Record fields that became present since acceptance
    ///
    /// Presence is one-way: once `roles` or `clusterRoles` appears it stays required.
    pub fn absorb(&mut self, spec: &AuthTokenRequestSpec) {
        self.roles_set |= spec.roles.is_some();
        self.cluster_roles_set |= spec.cluster_roles.is_some();
    }
}

impl AuthTokenRequestSpec {
    /// Structural validation of the spec
    ///
    /// Re-checks the constraints the CRD schema enforces at admission, plus
    /// uniqueness of role keys.
    pub fn validate(&self) -> Result<(), Error> {
        let profile = &self.target_cluster_profile;
        for (field, value) in [
            ("spec.targetClusterProfile.kind", &profile.kind),
            ("spec.targetClusterProfile.name", &profile.name),
            ("spec.targetClusterProfile.namespace", &profile.namespace),
        ] {
            if value.is_empty() {
                return Err(invalid(field, "cannot be empty"));
            }
        }

        validate_dns_label("spec.serviceAccountName", &self.service_account_name)?;

        if let Some(roles) = &self.roles {
            if roles.len() > MAX_ROLE_ITEMS {
                return Err(invalid(
                    "spec.roles",
                    format!("must have at most {} items", MAX_ROLE_ITEMS),
                ));
            }
            let mut seen = HashSet::new();
            for (i, role) in roles.iter().enumerate() {
                validate_dns_label(&format!("spec.roles[{}].namespace", i), &role.namespace)?;
                if role.name.is_empty() {
                    return Err(invalid(format!("spec.roles[{}].name", i), "cannot be empty"));
                }
                if !seen.insert((role.namespace.as_str(), role.name.as_str())) {
                    return Err(invalid(
                        format!("spec.roles[{}]", i),
                        format!("duplicate role {}/{}", role.namespace, role.name),
                    ));
                }
            }
        }

        if let Some(cluster_roles) = &self.cluster_roles {
            if cluster_roles.len() > MAX_ROLE_ITEMS {
                return Err(invalid(
                    "spec.clusterRoles",
                    format!("must have at most {} items", MAX_ROLE_ITEMS),
                ));
            }
            let mut seen = HashSet::new();
            for (i, role) in cluster_roles.iter().enumerate() {
                if role.name.is_empty() {
                    return Err(invalid(
                        format!("spec.clusterRoles[{}].name", i),
                        "cannot be empty",
                    ));
                }
                if !seen.insert(role.name.as_str()) {
                    return Err(invalid(
                        format!("spec.clusterRoles[{}]", i),
                        format!("duplicate cluster role {}", role.name),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Check an update from `old` to `self` against the immutability rules
    ///
    /// `targetClusterProfile` and `serviceAccountName` must be unchanged.
    /// `roles` and `clusterRoles` only have to stay present once present;
    /// their contents may change.
    pub fn validate_transition(&self, old: &AuthTokenRequestSpec) -> Result<(), Error> {
        check_transition(
            &old.target_cluster_profile,
            &old.service_account_name,
            old.roles.is_some(),
            old.cluster_roles.is_some(),
            self,
        )
    }

    /// Roles, treating an absent field as empty
    pub fn roles(&self) -> &[Role] {
        self.roles.as_deref().unwrap_or_default()
    }

    /// Cluster roles, treating an absent field as empty
    pub fn cluster_roles(&self) -> &[ClusterRole] {
        self.cluster_roles.as_deref().unwrap_or_default()
    }
}

impl AuthTokenRequest {
    /// `<namespace>/<name>` of this request
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }

    /// Validate the spec, and re-check immutability against the accepted snapshot
    pub fn validate(&self) -> Result<(), Error> {
        let key = self.key();
        self.spec.validate().map_err(|e| e.for_request(&key))?;
        if let Some(accepted) = self.status.as_ref().and_then(|s| s.accepted_spec.as_ref()) {
            accepted.check(&self.spec).map_err(|e| e.for_request(&key))?;
        }
        Ok(())
    }
}

fn check_transition(
    old_profile: &ClusterProfileRef,
    old_service_account: &str,
    old_roles_set: bool,
    old_cluster_roles_set: bool,
    new: &AuthTokenRequestSpec,
) -> Result<(), Error> {
    if &new.target_cluster_profile != old_profile {
        return Err(invalid(
            "spec.targetClusterProfile",
            "TargetClusterProfile is immutable",
        ));
    }
    if new.service_account_name != old_service_account {
        return Err(invalid(
            "spec.serviceAccountName",
            "ServiceAccountName is immutable",
        ));
    }
    if old_roles_set && new.roles.is_none() {
        return Err(invalid("spec.roles", "Roles is required once set"));
    }
    if old_cluster_roles_set && new.cluster_roles.is_none() {
        return Err(invalid(
            "spec.clusterRoles",
            "ClusterRoles is required once set",
        ));
    }
    Ok(())
}

fn invalid(field: impl Into<String>, msg: impl Into<String>) -> Error {
    Error::validation_for_field(crate::error::UNKNOWN_CONTEXT, field, msg)
}

/// Validate an RFC 1123 DNS label (namespaces, service account names)
fn validate_dns_label(field: &str, value: &str) -> Result<(), Error> {
    if value.is_empty() {
        return Err(invalid(field, "cannot be empty"));
    }
    if value.len() > MAX_SERVICE_ACCOUNT_NAME_LEN {
        return Err(invalid(
            field,
            format!("must be at most {} characters", MAX_SERVICE_ACCOUNT_NAME_LEN),
        ));
    }
    let valid_chars = value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let bounded = !value.starts_with('-') && !value.ends_with('-');
    if !valid_chars || !bounded {
        return Err(invalid(
            field,
            format!(
                "'{}' must consist of lowercase alphanumerics or '-', and start and end with an alphanumeric",
                value
            ),
        ));
    }
    Ok(())
}
