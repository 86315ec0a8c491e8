//! Service account and RBAC provisioning in the target cluster
//!
//! Everything here is create-if-absent. An object that already exists is
//! accepted only if it carries this request's ownership annotations; anything
//! else is a name conflict and is left untouched. Objects created before a
//! failure stay in place and the next pass picks up at the first missing one.
//!
//! Pre-existing namespaces are shared infrastructure and are never a conflict.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use k8s_openapi::api::rbac::v1::{
    ClusterRole as KubeClusterRole, ClusterRoleBinding, PolicyRule, Role as KubeRole,
    RoleBinding, RoleRef, Subject,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info};

use authtoken_common::crd::{AuthTokenRequest, AuthTokenRequestSpec, ClusterRole, Role};
use authtoken_common::kube_utils::{bounded_name, MAX_OBJECT_NAME_LEN};
use authtoken_common::{
    Error, ANNOTATION_REQUEST, ANNOTATION_REQUEST_UID, CONTROLLER_NAME, LABEL_MANAGED_BY,
};

use crate::guard::CallGuard;
use crate::target::TargetCluster;

const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// The request on whose behalf objects are created
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestIdentity {
    /// Request namespace
    pub namespace: String,
    /// Request name
    pub name: String,
    /// Request UID; a recreated request with the same name does not own the old objects
    pub uid: String,
}

impl RequestIdentity {
    /// Identity of a stored request
    pub fn of(request: &AuthTokenRequest) -> Result<Self, Error> {
        let namespace = request.namespace().ok_or_else(|| {
            Error::internal_with_context("provisioner", "AuthTokenRequest has no namespace")
        })?;
        Ok(Self {
            namespace,
            name: request.name_any(),
            uid: request.uid().unwrap_or_default(),
        })
    }

    /// `<namespace>/<name>`
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Metadata for an object created on behalf of this request
    pub fn object_meta(&self, name: &str, namespace: Option<&str>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: namespace.map(str::to_string),
            labels: Some(BTreeMap::from([(
                LABEL_MANAGED_BY.to_string(),
                CONTROLLER_NAME.to_string(),
            )])),
            annotations: Some(BTreeMap::from([
                (ANNOTATION_REQUEST.to_string(), self.key()),
                (ANNOTATION_REQUEST_UID.to_string(), self.uid.clone()),
            ])),
            ..Default::default()
        }
    }

    /// Whether an existing object was created for this request
    pub fn owns(&self, meta: &ObjectMeta) -> bool {
        let annotation = |k: &str| meta.annotations.as_ref().and_then(|a| a.get(k));
        annotation(ANNOTATION_REQUEST) == Some(&self.key())
            && annotation(ANNOTATION_REQUEST_UID) == Some(&self.uid)
    }
}

/// Fail with a conflict unless `meta` belongs to this request
fn ensure_owned(
    identity: &RequestIdentity,
    meta: &ObjectMeta,
    kind: &str,
    name: &str,
) -> Result<(), Error> {
    if identity.owns(meta) {
        return Ok(());
    }
    let owner = meta
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_REQUEST))
        .map(String::as_str);
    Err(Error::conflict(kind, name, owner))
}

/// A service account in a specific namespace
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceAccountRef {
    /// Namespace of the account
    pub namespace: String,
    /// Name of the account
    pub name: String,
}

impl std::fmt::Display for ServiceAccountRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Objects that must exist in the target cluster for a spec
#[derive(Clone, Debug, PartialEq)]
pub struct ProvisionPlan {
    /// Namespaces holding the service account; the first is the primary
    pub namespaces: Vec<String>,
    /// Service account name
    pub service_account: String,
    /// Namespaced roles
    pub roles: Vec<Role>,
    /// Cluster roles
    pub cluster_roles: Vec<ClusterRole>,
}

impl ProvisionPlan {
    /// The account that tokens are minted for and cluster roles are bound to
    pub fn primary_account(&self) -> ServiceAccountRef {
        ServiceAccountRef {
            namespace: self.namespaces.first().cloned().unwrap_or_default(),
            name: self.service_account.clone(),
        }
    }

    /// `<serviceAccountName>-<roleName>`, hashed down to a valid object name
    pub fn binding_name(&self, role_name: &str) -> String {
        bounded_name(
            &format!("{}-{}", self.service_account, role_name),
            "",
            MAX_OBJECT_NAME_LEN,
        )
    }
}

/// Derive the objects a spec requires
///
/// The service account lives in every namespace that a role is in, in order of
/// first appearance. Without roles it lives in `fallback_namespace` only.
pub fn plan(spec: &AuthTokenRequestSpec, fallback_namespace: &str) -> ProvisionPlan {
    let mut namespaces: Vec<String> = Vec::new();
    for role in spec.roles() {
        if !namespaces.contains(&role.namespace) {
            namespaces.push(role.namespace.clone());
        }
    }
    if namespaces.is_empty() {
        namespaces.push(fallback_namespace.to_string());
    }
    ProvisionPlan {
        namespaces,
        service_account: spec.service_account_name.clone(),
        roles: spec.roles().to_vec(),
        cluster_roles: spec.cluster_roles().to_vec(),
    }
}

/// What a provisioning call changed
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProvisionReport {
    /// Objects created, as `<Kind> <name>`
    pub created: Vec<String>,
    /// Owned roles whose rules were brought back in line with the spec
    pub updated: Vec<String>,
    /// Objects that already existed as required
    pub unchanged: usize,
}

/// Bring the target cluster in line with `plan`
///
/// Objects are handled in a fixed order: namespaces and service accounts,
/// then roles with their bindings, then cluster roles with their bindings.
/// The first failure stops the call; earlier objects stay.
pub async fn provision(
    target: &dyn TargetCluster,
    plan: &ProvisionPlan,
    identity: &RequestIdentity,
    guard: &CallGuard,
) -> Result<ProvisionReport, Error> {
    let mut report = ProvisionReport::default();

    for namespace in &plan.namespaces {
        ensure_namespace(target, namespace, identity, guard, &mut report).await?;
        ensure_service_account(target, namespace, plan, identity, guard, &mut report).await?;
    }

    for role in &plan.roles {
        ensure_role(target, role, identity, guard, &mut report).await?;
        ensure_role_binding(target, role, plan, identity, guard, &mut report).await?;
    }

    let primary = plan.primary_account();
    for role in &plan.cluster_roles {
        ensure_cluster_role(target, role, identity, guard, &mut report).await?;
        ensure_cluster_role_binding(target, role, plan, &primary, identity, guard, &mut report)
            .await?;
    }

    info!(
        profile = %target.profile(),
        created = report.created.len(),
        updated = report.updated.len(),
        unchanged = report.unchanged,
        "target cluster provisioned"
    );
    Ok(report)
}

async fn ensure_namespace(
    target: &dyn TargetCluster,
    name: &str,
    identity: &RequestIdentity,
    guard: &CallGuard,
    report: &mut ProvisionReport,
) -> Result<(), Error> {
    let what = format!("Namespace {}", name);
    if guard
        .run(&format!("get {}", what), target.get_namespace(name))
        .await?
        .is_some()
    {
        report.unchanged += 1;
        return Ok(());
    }
    let namespace = Namespace {
        metadata: identity.object_meta(name, None),
        ..Default::default()
    };
    guard
        .run(&format!("create {}", what), target.create_namespace(&namespace))
        .await?;
    debug!(namespace = %name, "created namespace");
    report.created.push(what);
    Ok(())
}

async fn ensure_service_account(
    target: &dyn TargetCluster,
    namespace: &str,
    plan: &ProvisionPlan,
    identity: &RequestIdentity,
    guard: &CallGuard,
    report: &mut ProvisionReport,
) -> Result<(), Error> {
    let name = &plan.service_account;
    let path = format!("{}/{}", namespace, name);
    let what = format!("ServiceAccount {}", path);
    match guard
        .run(
            &format!("get {}", what),
            target.get_service_account(namespace, name),
        )
        .await?
    {
        Some(existing) => {
            ensure_owned(identity, &existing.metadata, "ServiceAccount", &path)?;
            report.unchanged += 1;
        }
        None => {
            let account = ServiceAccount {
                metadata: identity.object_meta(name, Some(namespace)),
                ..Default::default()
            };
            guard
                .run(
                    &format!("create {}", what),
                    target.create_service_account(&account),
                )
                .await?;
            report.created.push(what);
        }
    }
    Ok(())
}

fn rules_differ(existing: Option<&Vec<PolicyRule>>, desired: &[PolicyRule]) -> bool {
    existing.map(Vec::as_slice).unwrap_or_default() != desired
}

async fn ensure_role(
    target: &dyn TargetCluster,
    role: &Role,
    identity: &RequestIdentity,
    guard: &CallGuard,
    report: &mut ProvisionReport,
) -> Result<(), Error> {
    let path = format!("{}/{}", role.namespace, role.name);
    let what = format!("Role {}", path);
    match guard
        .run(
            &format!("get {}", what),
            target.get_role(&role.namespace, &role.name),
        )
        .await?
    {
        Some(mut existing) => {
            ensure_owned(identity, &existing.metadata, "Role", &path)?;
            if rules_differ(existing.rules.as_ref(), &role.rules) {
                existing.rules = Some(role.rules.clone());
                guard
                    .run(&format!("replace {}", what), target.replace_role(&existing))
                    .await?;
                report.updated.push(what);
            } else {
                report.unchanged += 1;
            }
        }
        None => {
            let desired = KubeRole {
                metadata: identity.object_meta(&role.name, Some(&role.namespace)),
                rules: Some(role.rules.clone()),
            };
            guard
                .run(&format!("create {}", what), target.create_role(&desired))
                .await?;
            report.created.push(what);
        }
    }
    Ok(())
}

async fn ensure_role_binding(
    target: &dyn TargetCluster,
    role: &Role,
    plan: &ProvisionPlan,
    identity: &RequestIdentity,
    guard: &CallGuard,
    report: &mut ProvisionReport,
) -> Result<(), Error> {
    let name = plan.binding_name(&role.name);
    let path = format!("{}/{}", role.namespace, name);
    let what = format!("RoleBinding {}", path);
    match guard
        .run(
            &format!("get {}", what),
            target.get_role_binding(&role.namespace, &name),
        )
        .await?
    {
        Some(mut existing) => {
            ensure_owned(identity, &existing.metadata, "RoleBinding", &path)?;
            let subjects = role_binding_subjects(plan, &role.namespace);
            if existing.subjects.as_ref() != Some(&subjects) {
                existing.subjects = Some(subjects);
                guard
                    .run(
                        &format!("replace {}", what),
                        target.replace_role_binding(&existing),
                    )
                    .await?;
                report.updated.push(what);
            } else {
                report.unchanged += 1;
            }
        }
        None => {
            let binding = RoleBinding {
                metadata: identity.object_meta(&name, Some(&role.namespace)),
                role_ref: RoleRef {
                    api_group: RBAC_API_GROUP.to_string(),
                    kind: "Role".to_string(),
                    name: role.name.clone(),
                },
                subjects: Some(role_binding_subjects(plan, &role.namespace)),
            };
            guard
                .run(
                    &format!("create {}", what),
                    target.create_role_binding(&binding),
                )
                .await?;
            report.created.push(what);
        }
    }
    Ok(())
}

async fn ensure_cluster_role(
    target: &dyn TargetCluster,
    role: &ClusterRole,
    identity: &RequestIdentity,
    guard: &CallGuard,
    report: &mut ProvisionReport,
) -> Result<(), Error> {
    let what = format!("ClusterRole {}", role.name);
    match guard
        .run(&format!("get {}", what), target.get_cluster_role(&role.name))
        .await?
    {
        Some(mut existing) => {
            ensure_owned(identity, &existing.metadata, "ClusterRole", &role.name)?;
            if rules_differ(existing.rules.as_ref(), &role.rules) {
                existing.rules = Some(role.rules.clone());
                guard
                    .run(
                        &format!("replace {}", what),
                        target.replace_cluster_role(&existing),
                    )
                    .await?;
                report.updated.push(what);
            } else {
                report.unchanged += 1;
            }
        }
        None => {
            let desired = KubeClusterRole {
                metadata: identity.object_meta(&role.name, None),
                rules: Some(role.rules.clone()),
                aggregation_rule: None,
            };
            guard
                .run(
                    &format!("create {}", what),
                    target.create_cluster_role(&desired),
                )
                .await?;
            report.created.push(what);
        }
    }
    Ok(())
}

async fn ensure_cluster_role_binding(
    target: &dyn TargetCluster,
    role: &ClusterRole,
    plan: &ProvisionPlan,
    account: &ServiceAccountRef,
    identity: &RequestIdentity,
    guard: &CallGuard,
    report: &mut ProvisionReport,
) -> Result<(), Error> {
    let name = plan.binding_name(&role.name);
    let what = format!("ClusterRoleBinding {}", name);
    match guard
        .run(
            &format!("get {}", what),
            target.get_cluster_role_binding(&name),
        )
        .await?
    {
        Some(existing) => {
            ensure_owned(identity, &existing.metadata, "ClusterRoleBinding", &name)?;
            report.unchanged += 1;
        }
        None => {
            let binding = ClusterRoleBinding {
                metadata: identity.object_meta(&name, None),
                role_ref: RoleRef {
                    api_group: RBAC_API_GROUP.to_string(),
                    kind: "ClusterRole".to_string(),
                    name: role.name.clone(),
                },
                subjects: Some(vec![service_account_subject(
                    &account.namespace,
                    &account.name,
                )]),
            };
            guard
                .run(
                    &format!("create {}", what),
                    target.create_cluster_role_binding(&binding),
                )
                .await?;
            report.created.push(what);
        }
    }
    Ok(())
}

/// Subjects of a RoleBinding in `namespace`
///
/// The primary account holds the minted token, so it is bound everywhere.
/// The account in `namespace` is bound too when it is a different one.
fn role_binding_subjects(plan: &ProvisionPlan, namespace: &str) -> Vec<Subject> {
    let primary = plan.primary_account();
    let mut subjects = vec![service_account_subject(&primary.namespace, &primary.name)];
    if primary.namespace != namespace {
        subjects.push(service_account_subject(namespace, &plan.service_account));
    }
    subjects
}

fn service_account_subject(namespace: &str, name: &str) -> Subject {
    Subject {
        api_group: None,
        kind: "ServiceAccount".to_string(),
        name: name.to_string(),
        namespace: Some(namespace.to_string()),
    }
}
