//! Test fixtures: in-memory listers standing in for the informer caches and a
//! [`WorkloadClient`] recording every write.

use crate::{
    client::WorkloadClient, errors::ControllerError, informer::Lister, reconciler::Reconciler,
    utils::new_deployment,
};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{Resource, ResourceExt, api::ObjectMeta, core::ErrorResponse};
use kube_runtime::events::Event;
use source_controller_apis::{Application, ApplicationSpec};
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering},
    },
};

pub(crate) fn new_application(name: &str, replicas: Option<i32>) -> Application {
    Application {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            uid: Some(format!("uid-{}", name)),
            ..Default::default()
        },
        spec: ApplicationSpec {
            deployment_name: format!("{}-deployment", name),
            replicas,
        },
        status: None,
    }
}

pub(crate) fn new_owned_deployment(application: &Application) -> Deployment {
    new_deployment(application).unwrap()
}

/// Fixed, always synced cache content.
pub(crate) struct FixtureStore<K> {
    objects: HashMap<(String, String), Arc<K>>,
}

impl<K: Resource> FixtureStore<K> {
    pub fn new(objects: &[K]) -> Self
    where
        K: Clone,
    {
        let objects = objects
            .iter()
            .map(|o| {
                (
                    (o.namespace().unwrap_or_default(), o.name_any()),
                    Arc::new(o.clone()),
                )
            })
            .collect();
        Self { objects }
    }
}

impl<K: Send + Sync> Lister<K> for FixtureStore<K> {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.objects
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn list(&self) -> Vec<Arc<K>> {
        self.objects.values().cloned().collect()
    }

    fn has_synced(&self) -> bool {
        true
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Action {
    CreateDeployment(Deployment),
    UpdateDeployment(Deployment),
    UpdateApplicationStatus(Application),
}

/// [`WorkloadClient`] which records writes and echoes the submitted objects.
#[derive(Default)]
pub(crate) struct RecordingClient {
    actions: Mutex<Vec<Action>>,
    events: Mutex<Vec<String>>,
    create_error: AtomicU16,
    fail_events: AtomicBool,
    creates: AtomicUsize,
}

fn api_error(code: u16) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: "injected failure".to_string(),
        reason: "Test".to_string(),
        code,
    })
}

impl RecordingClient {
    pub fn actions(&self) -> Vec<Action> {
        self.actions.lock().unwrap().clone()
    }

    /// Reasons of all published events.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Fail every create with the given HTTP status code.
    pub fn fail_creates(&self, code: u16) {
        self.create_error.store(code, Ordering::SeqCst);
    }

    pub fn fail_events(&self) {
        self.fail_events.store(true, Ordering::SeqCst);
    }

    fn record(&self, action: Action) {
        self.actions.lock().unwrap().push(action);
    }
}

#[async_trait]
impl WorkloadClient for RecordingClient {
    async fn create_deployment(
        &self,
        _namespace: &str,
        deployment: &Deployment,
    ) -> kube::Result<Deployment> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.record(Action::CreateDeployment(deployment.clone()));
        match self.create_error.load(Ordering::SeqCst) {
            0 => Ok(deployment.clone()),
            code => Err(api_error(code)),
        }
    }

    async fn update_deployment(
        &self,
        _namespace: &str,
        deployment: &Deployment,
    ) -> kube::Result<Deployment> {
        self.record(Action::UpdateDeployment(deployment.clone()));
        Ok(deployment.clone())
    }

    async fn update_application_status(
        &self,
        application: &Application,
    ) -> kube::Result<Application> {
        self.record(Action::UpdateApplicationStatus(application.clone()));
        Ok(application.clone())
    }

    async fn publish_event(&self, _application: &Application, event: Event) -> kube::Result<()> {
        if self.fail_events.load(Ordering::SeqCst) {
            return Err(api_error(403));
        }
        self.events.lock().unwrap().push(event.reason);
        Ok(())
    }
}

/// Runs the reconciler against fixed cache content and compares the recorded
/// writes with the expected ones.
#[derive(Default)]
pub(crate) struct Fixture {
    pub applications: Vec<Application>,
    pub deployments: Vec<Deployment>,
    pub client: Arc<RecordingClient>,
    expected: Vec<Action>,
}

impl Fixture {
    pub fn expect(&mut self, action: Action) {
        self.expected.push(action);
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            Arc::new(FixtureStore::new(&self.applications)),
            Arc::new(FixtureStore::new(&self.deployments)),
            self.client.clone(),
        )
    }

    pub async fn run(&self, key: &str) {
        if let Err(e) = self.reconciler().sync(key).await {
            panic!("error syncing application: {}", e);
        }
        self.check_actions();
    }

    pub async fn run_expect_error(&self, key: &str) -> ControllerError {
        let err = match self.reconciler().sync(key).await {
            Ok(()) => panic!("expected error syncing application, got none"),
            Err(e) => e,
        };
        self.check_actions();
        err
    }

    fn check_actions(&self) {
        assert_eq!(self.expected, self.client.actions());
    }
}
