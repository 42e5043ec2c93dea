use crate::errors::ControllerError;

use k8s_openapi::api::apps::v1::Deployment;
use kube::{Resource, ResourceExt};
use source_controller_apis::Application;
use std::str::FromStr;

/// Reconciliation key of a namespaced object, rendered as `{namespace}/{name}`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NamespacedName {
    pub name: String,
    pub namespace: String,
}

impl std::fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for NamespacedName {
    type Err = ControllerError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        match key.split('/').collect::<Vec<&str>>().as_slice() {
            [namespace, name] if !namespace.is_empty() && !name.is_empty() => Ok(Self {
                name: name.to_string(),
                namespace: namespace.to_string(),
            }),
            _ => Err(ControllerError::InvalidKey(key.to_string())),
        }
    }
}

impl NamespacedName {
    /// Key of a namespaced object, `None` if its name or namespace is missing.
    pub fn of<K: Resource>(o: &K) -> Option<Self> {
        let meta = o.meta();
        match (meta.namespace.as_deref(), meta.name.as_deref()) {
            (Some(namespace), Some(name)) if !namespace.is_empty() && !name.is_empty() => {
                Some(Self {
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                })
            }
            _ => None,
        }
    }
}

/// Key to enqueue for an added, updated or deleted [`Application`].
pub(crate) fn application_key(application: &Application) -> Option<NamespacedName> {
    let key = NamespacedName::of(application);
    if key.is_none() {
        warn!(
            "dropping Application event without namespace/name: {:?}",
            application.meta()
        );
    }
    key
}

/// Key of the [`Application`] controlling an added, updated or deleted
/// [`Deployment`], `None` if the Deployment is not controlled by an Application.
pub(crate) fn deployment_owner_key(deployment: &Deployment) -> Option<NamespacedName> {
    let owner = deployment
        .owner_references()
        .iter()
        .find(|r| r.controller == Some(true))?;
    if owner.kind != Application::kind(&()) || owner.api_version != Application::api_version(&())
    {
        return None;
    }
    match deployment.namespace() {
        Some(namespace) if !namespace.is_empty() && !owner.name.is_empty() => {
            Some(NamespacedName {
                name: owner.name.clone(),
                namespace,
            })
        }
        _ => {
            warn!(
                "dropping Deployment event without namespace/owner name: {:?}",
                deployment.meta()
            );
            None
        }
    }
}
