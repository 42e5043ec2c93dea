use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{Container, PodSpec, PodTemplateSpec},
    },
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::{Resource, ResourceExt, api::ObjectMeta};
use source_controller_apis::Application;
use std::collections::BTreeMap;

use crate::errors::ControllerError;

/// Replica count the API server assumes for a Deployment without `spec.replicas`.
const DEPLOYMENT_DEFAULT_REPLICAS: i32 = 1;

const WORKLOAD_CONTAINER: &'static str = "nginx";
const WORKLOAD_IMAGE: &'static str = "nginx:latest";

/// Build the Deployment managed by `application` from the fixed workload template.
pub(crate) fn new_deployment(application: &Application) -> Result<Deployment, ControllerError> {
    let mut owner = application.controller_owner_ref(&()).ok_or_else(|| {
        anyhow::anyhow!(
            "cannot reference Application {} as owner as it has no uid",
            application.id()
        )
    })?;
    owner.block_owner_deletion = Some(true);
    let labels: BTreeMap<String, String> = [
        ("app".to_string(), WORKLOAD_CONTAINER.to_string()),
        ("controller".to_string(), application.name_any()),
    ]
    .into_iter()
    .collect();
    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(application.spec.deployment_name.clone()),
            namespace: application.namespace(),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(application.spec.desired_replicas()),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: WORKLOAD_CONTAINER.to_string(),
                        image: Some(WORKLOAD_IMAGE.to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

/// Whether the controller owner reference of `deployment` points at `application`.
pub(crate) fn is_controlled_by(deployment: &Deployment, application: &Application) -> bool {
    deployment
        .owner_references()
        .iter()
        .find(|r| r.controller == Some(true))
        .map_or(false, |r| {
            r.kind == Application::kind(&())
                && r.api_version == Application::api_version(&())
                && Some(r.name.as_str()) == application.metadata.name.as_deref()
                && Some(r.uid.as_str()) == application.metadata.uid.as_deref()
        })
}

/// The replica count requested by `spec.replicas`, with the API server default applied.
pub(crate) fn deployment_replicas(deployment: &Deployment) -> i32 {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(DEPLOYMENT_DEFAULT_REPLICAS)
}

/// The available replica count reported by the Deployment controller, if any.
pub(crate) fn available_replicas(deployment: &Deployment) -> Option<i32> {
    deployment.status.as_ref().and_then(|s| s.available_replicas)
}

pub(crate) fn metric_name(name: &str) -> String {
    format!("source_controller_{}", name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::new_application;
    use k8s_openapi::{
        api::apps::v1::DeploymentStatus, apimachinery::pkg::apis::meta::v1::OwnerReference,
    };

    #[test]
    fn deployment_from_template() {
        let application = new_application("test", Some(3));
        let deployment = new_deployment(&application).unwrap();
        assert_eq!(Some("test-deployment"), deployment.metadata.name.as_deref());
        assert_eq!(Some("default"), deployment.metadata.namespace.as_deref());
        assert_eq!(3, deployment_replicas(&deployment));
        let spec = deployment.spec.as_ref().unwrap();
        let labels = spec.selector.match_labels.as_ref().unwrap();
        assert_eq!(Some(&"nginx".to_string()), labels.get("app"));
        assert_eq!(Some(&"test".to_string()), labels.get("controller"));
        let pod = spec.template.spec.as_ref().unwrap();
        assert_eq!(Some("nginx:latest"), pod.containers[0].image.as_deref());
        let owner = &deployment.owner_references()[0];
        assert_eq!("Application", owner.kind);
        assert_eq!("sourcecontroller.kubesrun.top/v1alpha1", owner.api_version);
        assert_eq!(Some(true), owner.controller);
        assert_eq!(Some(true), owner.block_owner_deletion);
        assert!(is_controlled_by(&deployment, &application));
    }

    #[test]
    fn template_applies_default_replicas() {
        let deployment = new_deployment(&new_application("test", None)).unwrap();
        assert_eq!(Some(1), deployment.spec.unwrap().replicas);
    }

    #[test]
    fn template_requires_uid() {
        let mut application = new_application("test", None);
        application.metadata.uid = None;
        assert!(new_deployment(&application).is_err());
    }

    #[test]
    fn controlled_by_other_application() {
        let application = new_application("test", Some(1));
        let other = new_application("other", Some(1));
        let deployment = new_deployment(&other).unwrap();
        assert!(!is_controlled_by(&deployment, &application));

        // Same name, but a recreated Application has a new uid.
        let mut recreated = application.clone();
        recreated.metadata.uid = Some("uid-recreated".to_string());
        let deployment = new_deployment(&recreated).unwrap();
        assert!(!is_controlled_by(&deployment, &application));
    }

    #[test]
    fn controlled_by_requires_controller_flag() {
        let application = new_application("test", Some(1));
        let mut deployment = new_deployment(&application).unwrap();
        deployment.metadata.owner_references = Some(vec![OwnerReference {
            controller: None,
            ..application.owner_ref(&()).unwrap()
        }]);
        assert!(!is_controlled_by(&deployment, &application));
        deployment.metadata.owner_references = None;
        assert!(!is_controlled_by(&deployment, &application));
    }

    #[test]
    fn replica_defaults() {
        let application = new_application("test", Some(2));
        let mut deployment = new_deployment(&application).unwrap();
        assert_eq!(None, available_replicas(&deployment));
        deployment.status = Some(DeploymentStatus {
            available_replicas: Some(2),
            ..Default::default()
        });
        assert_eq!(Some(2), available_replicas(&deployment));
        deployment.spec.as_mut().unwrap().replicas = None;
        assert_eq!(1, deployment_replicas(&deployment));
    }
}
