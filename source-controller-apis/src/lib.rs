use kube::{CustomResource, ResourceExt};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const API_GROUP: &'static str = "sourcecontroller.kubesrun.top";

pub const API_VERSION: &'static str = "v1alpha1";

/// Replica count used when [`ApplicationSpec::replicas`] is not set.
pub const DEFAULT_REPLICAS: i32 = 1;

/// Desired state of an application, reconciled into a single `apps/v1` Deployment
/// owned by the `Application` object.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "sourcecontroller.kubesrun.top",
    version = "v1alpha1",
    kind = "Application",
    derive = "PartialEq",
    status = "ApplicationStatus",
    namespaced,
    printcolumn = r#"{
        "name":"Deployment",
        "type": "string",
        "jsonPath": ".spec.deploymentName",
        "description": "Name of the managed Deployment."
    }"#,
    printcolumn = r#"{
        "name":"Desired",
        "type": "integer",
        "jsonPath": ".spec.replicas",
        "description": "Desired number of replicas, defaults to 1."
    }"#,
    printcolumn = r#"{
        "name":"Available",
        "type": "integer",
        "jsonPath": ".status.availableReplicas",
        "description": "Number of available replicas last observed on the managed Deployment."
    }"#
)]
pub struct ApplicationSpec {
    /// Name of the Deployment (in the namespace of the `Application`) managed
    /// by this object.
    #[serde(rename = "deploymentName")]
    pub deployment_name: String,
    /// Desired number of replicas. If not set the controller uses 1, an explicit
    /// `0` scales the Deployment down to zero.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

impl ApplicationSpec {
    /// The effective replica count, with the default applied.
    pub fn desired_replicas(&self) -> i32 {
        self.replicas.unwrap_or(DEFAULT_REPLICAS)
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default, JsonSchema)]
pub struct ApplicationStatus {
    /// Number of available replicas last observed on the managed Deployment.
    #[serde(rename = "availableReplicas")]
    pub available_replicas: i32,
}

impl Application {
    pub fn id(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or(""),
            self.metadata.name.as_deref().unwrap_or(""),
        )
    }

    pub fn versioned_id(&self) -> String {
        format!(
            "{}@{}",
            self.id(),
            self.metadata.resource_version.as_deref().unwrap_or("")
        )
    }

    /// Last observed available replicas, `None` if the status was never reported.
    pub fn available_replicas(&self) -> Option<i32> {
        self.status.as_ref().map(|s| s.available_replicas)
    }

    pub fn update_available_replicas(&mut self, available_replicas: i32) {
        let mut status = self.status.take().unwrap_or_default();
        status.available_replicas = available_replicas;
        self.status = Some(status);
    }

    /// The namespace of the managed Deployment, which is always the namespace
    /// of the `Application` itself.
    pub fn deployment_namespace(&self) -> String {
        self.namespace().unwrap_or_default()
    }
}
