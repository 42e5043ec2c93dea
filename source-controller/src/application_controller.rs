use crate::{
    errors::ControllerError,
    informer::wait_for_cache_sync,
    key_resolver::NamespacedName,
    reconciler::Reconciler,
    utils::metric_name,
    work_queue::WorkQueue,
};

use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, Meter},
};
use std::{sync::Arc, time::Instant};
use tokio::{task::JoinSet, time::Duration};

const APPLICATION_CONTROLLER: &'static str = "application_controller";

/// Default number of retries of a failing key before it is dropped.
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 15;

/// Drives the worker pool: pulls keys from the [`WorkQueue`], runs the
/// [`Reconciler`] and applies the retry policy to its result.
pub(crate) struct ApplicationController {
    reconciler: Reconciler,
    queue: Arc<WorkQueue>,
    workers: usize,
    max_retries: u32,

    reconcile_count: Counter<u64>,
    reconcile_duration: Histogram<u64>,
    reconcile_errors: Counter<u64>,
    reconcile_dropped: Counter<u64>,
}

impl ApplicationController {
    pub fn new(
        reconciler: Reconciler,
        queue: Arc<WorkQueue>,
        workers: usize,
        max_retries: u32,
    ) -> Self {
        let meter: Meter = global::meter(APPLICATION_CONTROLLER);
        let reconcile_count = meter
            .u64_counter(metric_name("reconcile_count"))
            .with_description("Count of Application reconcile invocations")
            .build();
        let reconcile_duration = meter
            .u64_histogram(metric_name("reconcile_duration_ms"))
            .with_description("Reconcile duration of Application objects in milliseconds")
            .with_unit("ms")
            .build();
        let reconcile_errors = meter
            .u64_counter(metric_name("reconcile_errors"))
            .with_description("Count of failed Application reconcile invocations")
            .build();
        let reconcile_dropped = meter
            .u64_counter(metric_name("reconcile_dropped"))
            .with_description("Count of Application keys dropped after exhausting their retries")
            .build();
        Self {
            reconciler,
            queue,
            workers: workers.max(1),
            max_retries,
            reconcile_count,
            reconcile_duration,
            reconcile_errors,
            reconcile_dropped,
        }
    }

    /// Wait for the caches, then run the workers until the queue is shut down.
    ///
    /// Fails if the caches do not sync within `cache_sync_timeout`.
    pub async fn run(self: Arc<Self>, cache_sync_timeout: Duration) -> Result<(), ControllerError> {
        info!("waiting for informer caches to sync");
        let me = self.clone();
        wait_for_cache_sync(cache_sync_timeout, move || {
            me.queue.is_shutting_down() || me.reconciler.has_synced()
        })
        .await?;
        if self.queue.is_shutting_down() {
            return Ok(());
        }
        let (applications, deployments) = self.reconciler.cache_sizes();
        info!(
            "caches synced with {} Applications and {} Deployments, starting {} workers",
            applications, deployments, self.workers
        );
        let mut workers = JoinSet::new();
        for _ in 0..self.workers {
            let me = self.clone();
            workers.spawn(async move { me.run_worker().await });
        }
        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                error!("worker terminated abnormally: {}", e);
            }
        }
        info!("all workers stopped");
        Ok(())
    }

    async fn run_worker(&self) {
        while self.process_next_work_item().await {}
    }

    /// Process one key, returns `false` once the queue is shut down.
    pub(crate) async fn process_next_work_item(&self) -> bool {
        let key = match self.queue.get().await {
            Some(key) => key,
            None => return false,
        };
        let start = Instant::now();
        let result = self.reconciler.sync(key.as_str()).await;
        let duration = Instant::now() - start;

        let (namespace, name) = key
            .parse::<NamespacedName>()
            .map(|n| (n.namespace, n.name))
            .unwrap_or_default();
        let labels = &[
            KeyValue::new("object_name", name),
            KeyValue::new("object_namespace", namespace),
        ];
        self.reconcile_count.add(1, labels);
        self.reconcile_duration
            .record(duration.as_millis() as u64, labels);

        match result {
            Ok(()) => {
                debug!("successfully synced {}", key);
                self.queue.forget(key.as_str()).await;
            }
            Err(e) => {
                self.reconcile_errors.add(1, labels);
                self.handle_err(key.as_str(), e).await;
            }
        }
        self.queue.done(key.as_str()).await;
        true
    }

    async fn handle_err(&self, key: &str, e: ControllerError) {
        let retries = self.queue.num_requeues(key).await;
        if retries < self.max_retries {
            if e.is_temporary() {
                warn!("error syncing {} (retry {}): {}", key, retries + 1, e);
            } else {
                error!("error syncing {} (retry {}): {}", key, retries + 1, e);
            }
            self.queue.add_rate_limited(key.to_string()).await;
        } else {
            error!(
                "dropping {} out of the queue after {} retries: {}",
                key, retries, e
            );
            self.reconcile_dropped.add(1, &[]);
            self.queue.forget(key).await;
        }
    }
}
