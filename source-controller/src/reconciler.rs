use crate::{
    application_modifications::ApplicationModifications,
    client::WorkloadClient,
    errors::{ControllerError, ExtKubeApiError},
    informer::Lister,
    key_resolver::NamespacedName,
    utils::{available_replicas, deployment_replicas, is_controlled_by, new_deployment},
};

use k8s_openapi::api::apps::v1::Deployment;
use kube_runtime::events::{Event, EventType};
use source_controller_apis::Application;
use std::sync::Arc;

pub(crate) const SUCCESS_SYNCED: &'static str = "Synced";
pub(crate) const ERR_RESOURCE_EXISTS: &'static str = "ErrResourceExists";

/// Converges the Deployment of one Application towards its spec.
///
/// Every run starts from the current cache content, never from the event which
/// triggered it, so running it any number of times is safe.
pub(crate) struct Reconciler {
    applications: Arc<dyn Lister<Application>>,
    deployments: Arc<dyn Lister<Deployment>>,
    client: Arc<dyn WorkloadClient>,
}

impl Reconciler {
    pub fn new(
        applications: Arc<dyn Lister<Application>>,
        deployments: Arc<dyn Lister<Deployment>>,
        client: Arc<dyn WorkloadClient>,
    ) -> Self {
        Self {
            applications,
            deployments,
            client,
        }
    }

    pub fn has_synced(&self) -> bool {
        self.applications.has_synced() && self.deployments.has_synced()
    }

    pub fn cache_sizes(&self) -> (usize, usize) {
        (self.applications.list().len(), self.deployments.list().len())
    }

    /// Reconcile the Application identified by `key` (`namespace/name`).
    pub async fn sync(&self, key: &str) -> Result<(), ControllerError> {
        let name: NamespacedName = match key.parse() {
            Ok(name) => name,
            Err(e) => {
                // Retrying will not make the key valid.
                error!("{}", e);
                return Ok(());
            }
        };
        let application = match self.applications.get(&name.namespace, &name.name) {
            Some(application) => application,
            None => {
                debug!("Application {} in work queue no longer exists", key);
                return Ok(());
            }
        };
        let mut application = ApplicationModifications::new(application.as_ref().clone());

        let deployment_name = application.spec.deployment_name.clone();
        if deployment_name.is_empty() {
            return Err(ControllerError::InvalidSpec(format!(
                "{}: deployment name must be specified",
                key
            )));
        }

        let deployment = match self.deployments.get(&name.namespace, &deployment_name) {
            None => self.create_deployment(&application).await?,
            Some(deployment) if !is_controlled_by(&deployment, &application) => {
                let message = format!(
                    "Resource {}/{} already exists and is not managed by Application {}",
                    name.namespace, deployment_name, name.name
                );
                self.publish(
                    &application,
                    EventType::Warning,
                    ERR_RESOURCE_EXISTS,
                    message.clone(),
                )
                .await;
                return Err(ControllerError::NotControlled(message));
            }
            Some(deployment) => self.scale_deployment(&application, deployment).await?,
        };

        let available = available_replicas(&deployment)
            .or(application.available_replicas())
            .unwrap_or(0);
        application.update_available_replicas(available);
        application.replace_status(self.client.as_ref()).await?;

        self.publish(
            &application,
            EventType::Normal,
            SUCCESS_SYNCED,
            "Application synced successfully".to_string(),
        )
        .await;
        Ok(())
    }

    async fn create_deployment(
        &self,
        application: &Application,
    ) -> Result<Deployment, ControllerError> {
        let deployment = new_deployment(application)?;
        let namespace = application.deployment_namespace();
        match self
            .client
            .create_deployment(namespace.as_str(), &deployment)
            .await
        {
            Ok(created) => {
                info!(
                    "created Deployment {}/{} with {} replicas for Application {}",
                    namespace,
                    application.spec.deployment_name,
                    deployment_replicas(&created),
                    application.id()
                );
                Ok(created)
            }
            Err(e) => {
                if e.is_conflict() {
                    debug!(
                        "Deployment {}/{} was created concurrently, cache is not yet up to date: {}",
                        namespace, application.spec.deployment_name, e
                    );
                }
                Err(e.into())
            }
        }
    }

    /// Update the replica count of an owned Deployment if it drifted, leaving
    /// all other fields as they are.
    async fn scale_deployment(
        &self,
        application: &Application,
        current: Arc<Deployment>,
    ) -> Result<Deployment, ControllerError> {
        let desired = application.spec.desired_replicas();
        let actual = deployment_replicas(&current);
        if desired == actual {
            debug!(
                "Deployment {}/{} already has {} replicas",
                application.deployment_namespace(),
                application.spec.deployment_name,
                actual
            );
            return Ok(current.as_ref().clone());
        }
        let mut deployment = current.as_ref().clone();
        deployment.spec.get_or_insert_with(Default::default).replicas = Some(desired);
        let updated = self
            .client
            .update_deployment(application.deployment_namespace().as_str(), &deployment)
            .await?;
        info!(
            "scaled Deployment {}/{} of Application {} from {} to {} replicas",
            application.deployment_namespace(),
            application.spec.deployment_name,
            application.id(),
            actual,
            desired
        );
        Ok(updated)
    }

    async fn publish(
        &self,
        application: &Application,
        type_: EventType,
        reason: &str,
        note: String,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self.client.publish_event(application, event).await {
            warn!(
                "failed to publish {} event for Application {}: {}",
                reason,
                application.id(),
                e
            );
        }
    }
}
