#[macro_use]
extern crate log;

use k8s_openapi::{NamespaceResourceScope, api::apps::v1::Deployment};
use kube::{Api, Client, Resource};
use opentelemetry::global;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;
use prometheus_exporter::start_prometheus_metrics_server;
use source_controller_apis::Application;
use std::{collections::HashSet, net::SocketAddr, sync::Arc, time::Duration};

mod application_controller;
use application_controller::*;
mod application_modifications;
mod client;
mod errors;
mod informer;
mod key_resolver;
mod prometheus_exporter;
mod reconciler;
mod utils;
mod work_queue;

#[cfg(test)]
mod fixtures;

use client::KubeWorkloadClient;
use informer::Informer;
use key_resolver::{application_key, deployment_owner_key};
use reconciler::Reconciler;
use work_queue::WorkQueue;

/// The K8s field manager name, also used as event reporter.
const MANAGER: &'static str = "source-controller";

#[derive(Clone, Debug, PartialEq)]
struct Configuration {
    watch_namespaces: Option<HashSet<String>>,
    workers: usize,
    max_retries: u32,
    cache_sync_timeout: Duration,
    metrics_addr: SocketAddr,
}

impl Configuration {
    pub fn new() -> anyhow::Result<Self> {
        Self::from_lookup(env_var)
    }

    fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn normalize(hs: HashSet<String>) -> Option<HashSet<String>> {
            if hs.is_empty() || hs.contains("*") || hs.contains("") {
                None
            } else {
                Some(hs)
            }
        }
        let watch_namespaces: Option<HashSet<String>> = lookup("WATCH_NAMESPACES")
            .map(|v| normalize(v.split(",").map(|v| v.trim().to_string()).collect()))
            .flatten();
        let workers: usize = lookup("WORKERS")
            .map(|v| v.parse::<usize>())
            .transpose()?
            .unwrap_or(1);
        if workers == 0 {
            anyhow::bail!("WORKERS must be at least 1");
        }
        let max_retries: u32 = lookup("MAX_RETRIES")
            .map(|v| v.parse::<u32>())
            .transpose()?
            .unwrap_or(DEFAULT_MAX_RETRIES);
        let cache_sync_timeout = Duration::from_secs(
            lookup("CACHE_SYNC_TIMEOUT_SECS")
                .map(|v| v.parse::<u64>())
                .transpose()?
                .unwrap_or(60),
        );
        let metrics_addr = lookup("METRICS_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0".to_string());
        let metrics_port = lookup("METRICS_LISTEN_PORT").unwrap_or_else(|| "9000".to_string());
        let metrics_addr = format!("{}:{}", metrics_addr, metrics_port).parse::<SocketAddr>()?;
        Ok(Configuration {
            watch_namespaces,
            workers,
            max_retries,
            cache_sync_timeout,
            metrics_addr,
        })
    }

    fn is_watched_namespace(&self, namespace: &str) -> bool {
        self.watch_namespaces
            .as_ref()
            .map_or(true, |v| v.contains(namespace))
    }

    /// Api for a namespaced kind, restricted to the watched namespace if
    /// exactly one is configured.
    fn api<K>(&self, client: Client) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        let mut tmp = self.watch_namespaces.iter().flatten();
        if let (Some(ns), None) = (tmp.next(), tmp.next()) {
            // Optimize for the use-case where exactly one watch-namespace is provided.
            Api::namespaced(client, ns.as_str())
        } else {
            Api::all(client)
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;
    let configuration = Configuration::new()?;
    if let Some(namespaces) = &configuration.watch_namespaces {
        let namespaces: Vec<&str> = namespaces.iter().map(|v| v.as_str()).collect();
        info!(
            "Controller is watching resources in namespaces: {}",
            namespaces.join(",")
        );
    } else {
        info!("Controller is watching resources in all namespaces");
    }

    let registry = Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    global::set_meter_provider(SdkMeterProvider::builder().with_reader(exporter).build());
    let metrics_server = start_prometheus_metrics_server(configuration.metrics_addr, registry);

    let client = Client::try_default().await?;
    let queue = Arc::new(WorkQueue::default());
    let application_informer = Informer::new(configuration.api::<Application>(client.clone()));
    let deployment_informer = Informer::new(configuration.api::<Deployment>(client.clone()));
    let reconciler = Reconciler::new(
        Arc::new(application_informer.store()),
        Arc::new(deployment_informer.store()),
        Arc::new(KubeWorkloadClient::new(client)),
    );
    let controller = Arc::new(ApplicationController::new(
        reconciler,
        queue.clone(),
        configuration.workers,
        configuration.max_retries,
    ));

    let watched = configuration.clone();
    let application_events = tokio::spawn(application_informer.run(queue.clone(), move |o| {
        application_key(o).filter(|k| watched.is_watched_namespace(&k.namespace))
    }));
    let watched = configuration.clone();
    let deployment_events = tokio::spawn(deployment_informer.run(queue.clone(), move |o| {
        deployment_owner_key(o).filter(|k| watched.is_watched_namespace(&k.namespace))
    }));
    let mut controller = tokio::spawn(controller.run(configuration.cache_sync_timeout));

    info!("start controllers ...");
    let result = tokio::select! {
        res = &mut controller => Some(res),
        res = metrics_server => {
            res?;
            None
        }
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("received shutdown signal, draining workers ...");
            None
        }
    };
    // Stop event delivery and the worker pool together, in-flight syncs complete.
    application_events.abort();
    deployment_events.abort();
    queue.shut_down().await;
    match result {
        Some(res) => res??,
        None => controller.await??,
    }
    info!("controller stopped");
    Ok(())
}
