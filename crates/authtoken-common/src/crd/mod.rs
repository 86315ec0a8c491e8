//! Custom Resource Definitions for the AuthTokenRequest operator

mod auth_token_request;
mod types;

pub use auth_token_request::{
    AcceptedSpec, AuthTokenRequest, AuthTokenRequestSpec, AuthTokenRequestStatus, ClusterRole,
    Role, MAX_ROLE_ITEMS, MAX_SERVICE_ACCOUNT_NAME_LEN,
};
pub use types::{
    ClusterProfileRef, Condition, ConditionStatus, ConfigMapRef, RequestPhase,
    CLUSTER_PROFILE_KIND, CONDITION_DEGRADED, CONDITION_PROVISIONED, CONDITION_READY,
    CONDITION_TOKEN_ISSUED,
};

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;
use serde_json::{json, Value};

use crate::Error;

/// Build the AuthTokenRequest CRD with its admission rules
///
/// The derived schema carries the field shapes; this adds what the derive
/// cannot express: CEL transition rules, length and item bounds, and atomic
/// list/map types.
pub fn auth_token_request_crd() -> Result<CustomResourceDefinition, Error> {
    let mut crd = serde_json::to_value(AuthTokenRequest::crd())
        .map_err(|e| Error::serialization_for_kind("CustomResourceDefinition", e.to_string()))?;

    let versions = crd
        .pointer_mut("/spec/versions")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| Error::internal_with_context("crd", "derived CRD has no versions"))?;

    for version in versions {
        let spec = version
            .pointer_mut("/schema/openAPIV3Schema/properties/spec")
            .and_then(Value::as_object_mut)
            .ok_or_else(|| Error::internal_with_context("crd", "derived CRD has no spec schema"))?;

        spec.insert(
            "x-kubernetes-validations".to_string(),
            json!([
                {
                    "rule": "!has(oldSelf.roles) || has(self.roles)",
                    "message": "Roles is required once set"
                },
                {
                    "rule": "!has(oldSelf.clusterRoles) || has(self.clusterRoles)",
                    "message": "ClusterRoles is required once set"
                }
            ]),
        );

        let props = spec
            .get_mut("properties")
            .and_then(Value::as_object_mut)
            .ok_or_else(|| Error::internal_with_context("crd", "spec schema has no properties"))?;

        patch_property(props, "targetClusterProfile", |p| {
            p.insert("x-kubernetes-map-type".to_string(), json!("atomic"));
            p.insert(
                "x-kubernetes-validations".to_string(),
                json!([{"rule": "self == oldSelf", "message": "TargetClusterProfile is immutable"}]),
            );
        })?;
        patch_property(props, "serviceAccountName", |p| {
            p.insert("maxLength".to_string(), json!(MAX_SERVICE_ACCOUNT_NAME_LEN));
            p.insert(
                "x-kubernetes-validations".to_string(),
                json!([{"rule": "self == oldSelf", "message": "ServiceAccountName is immutable"}]),
            );
        })?;
        for list in ["roles", "clusterRoles"] {
            patch_property(props, list, |p| {
                p.insert("maxItems".to_string(), json!(MAX_ROLE_ITEMS));
                p.insert("x-kubernetes-list-type".to_string(), json!("atomic"));
            })?;
        }
    }

    serde_json::from_value(crd)
        .map_err(|e| Error::serialization_for_kind("CustomResourceDefinition", e.to_string()))
}

fn patch_property(
    props: &mut serde_json::Map<String, Value>,
    name: &str,
    patch: impl FnOnce(&mut serde_json::Map<String, Value>),
) -> Result<(), Error> {
    let prop = props
        .get_mut(name)
        .and_then(Value::as_object_mut)
        .ok_or_else(|| {
            Error::internal_with_context("crd", format!("spec schema has no property {}", name))
        })?;
    patch(prop);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_schema(crd: &CustomResourceDefinition) -> Value {
        let json = serde_json::to_value(crd).unwrap();
        json.pointer("/spec/versions/0/schema/openAPIV3Schema/properties/spec")
            .cloned()
            .unwrap()
    }

    #[test]
    fn crd_identity() {
        let crd = auth_token_request_crd().unwrap();
        assert_eq!(crd.spec.group, "multicluster.x-k8s.io");
        assert_eq!(crd.spec.names.kind, "AuthTokenRequest");
        assert_eq!(crd.spec.names.plural, "authtokenrequests");
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(crd.spec.versions[0].name, "v1alpha1");
        assert!(crd.spec.versions[0]
            .subresources
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .is_some());
    }

    /// Story: admission rejects edits to the frozen identity
    #[test]
    fn story_immutable_fields_carry_transition_rules() {
        let schema = spec_schema(&auth_token_request_crd().unwrap());

        let profile = &schema["properties"]["targetClusterProfile"];
        assert_eq!(profile["x-kubernetes-validations"][0]["rule"], "self == oldSelf");
        assert_eq!(profile["x-kubernetes-map-type"], "atomic");

        let sa = &schema["properties"]["serviceAccountName"];
        assert_eq!(sa["maxLength"], 63);
        assert_eq!(
            sa["x-kubernetes-validations"][0]["message"],
            "ServiceAccountName is immutable"
        );
    }

    /// Story: role lists may change but cannot be removed once present
    #[test]
    fn story_role_lists_are_bounded_and_presence_is_sticky() {
        let schema = spec_schema(&auth_token_request_crd().unwrap());

        for list in ["roles", "clusterRoles"] {
            let prop = &schema["properties"][list];
            assert_eq!(prop["maxItems"], 20);
            assert_eq!(prop["x-kubernetes-list-type"], "atomic");
            assert!(prop.get("x-kubernetes-validations").is_none());
        }

        let rules: Vec<&str> = schema["x-kubernetes-validations"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["rule"].as_str().unwrap())
            .collect();
        assert!(rules.contains(&"!has(oldSelf.roles) || has(self.roles)"));
        assert!(rules.contains(&"!has(oldSelf.clusterRoles) || has(self.clusterRoles)"));
    }

    #[test]
    fn crd_serializes_to_yaml() {
        let yaml = serde_yaml::to_string(&auth_token_request_crd().unwrap()).unwrap();
        assert!(yaml.contains("kind: CustomResourceDefinition"));
        assert!(yaml.contains("Roles is required once set"));
    }
}
