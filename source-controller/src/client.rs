use crate::MANAGER;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    Api, Client, Resource, ResourceExt,
    api::PostParams,
};
use kube_runtime::events::{Event, Recorder, Reporter};
use source_controller_apis::Application;

/// Write operations the reconciler issues against the API server.
///
/// Reads never go through this trait, they are served by the informer caches.
#[async_trait]
pub(crate) trait WorkloadClient: Send + Sync {
    async fn create_deployment(&self, namespace: &str, deployment: &Deployment)
    -> kube::Result<Deployment>;

    /// Replace a Deployment, using its `resourceVersion` for optimistic locking.
    async fn update_deployment(&self, namespace: &str, deployment: &Deployment)
    -> kube::Result<Deployment>;

    /// Replace the status sub-resource of an Application.
    async fn update_application_status(&self, application: &Application)
    -> kube::Result<Application>;

    async fn publish_event(&self, application: &Application, event: Event) -> kube::Result<()>;
}

/// [`WorkloadClient`] talking to the Kubernetes API server.
pub(crate) struct KubeWorkloadClient {
    client: Client,
    recorder: Recorder,
}

impl KubeWorkloadClient {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: MANAGER.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client.clone(), reporter),
            client,
        }
    }

    fn post_params() -> PostParams {
        let mut pp = PostParams::default();
        pp.field_manager = Some(MANAGER.to_string());
        pp
    }
}

#[async_trait]
impl WorkloadClient for KubeWorkloadClient {
    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> kube::Result<Deployment> {
        let api = Api::<Deployment>::namespaced(self.client.clone(), namespace);
        api.create(&Self::post_params(), deployment).await
    }

    async fn update_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> kube::Result<Deployment> {
        let api = Api::<Deployment>::namespaced(self.client.clone(), namespace);
        api.replace(deployment.name_any().as_str(), &Self::post_params(), deployment)
            .await
    }

    async fn update_application_status(
        &self,
        application: &Application,
    ) -> kube::Result<Application> {
        let namespace = application.namespace().unwrap_or_default();
        let api = Api::<Application>::namespaced(self.client.clone(), namespace.as_str());
        api.replace_status(
            application.name_any().as_str(),
            &Self::post_params(),
            serde_json::to_vec(application).map_err(|e| kube::Error::SerdeError(e))?,
        )
        .await
    }

    async fn publish_event(&self, application: &Application, event: Event) -> kube::Result<()> {
        self.recorder
            .publish(&event, &application.object_ref(&()))
            .await
    }
}
