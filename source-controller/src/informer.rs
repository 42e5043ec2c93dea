use crate::{errors::ControllerError, key_resolver::NamespacedName, work_queue::WorkQueue};

use futures::{Stream, StreamExt};
use kube::{Api, Resource, ResourceExt};
use kube_runtime::{
    WatchStreamExt,
    reflector::{ObjectRef, Store, reflector, store::Writer},
    watcher::{self, Event, watcher},
};
use serde::de::DeserializeOwned;
use std::{
    fmt::Debug,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::time::{Duration, interval, timeout};

/// Read-only, point in time view on the local cache of one resource kind.
pub(crate) trait Lister<K>: Send + Sync {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>>;
    fn list(&self) -> Vec<Arc<K>>;
    /// Whether the initial list of the watched resources has been received.
    fn has_synced(&self) -> bool;
}

/// [`Lister`] backed by a [`kube_runtime`] reflector store.
pub(crate) struct InformerStore<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    store: Store<K>,
    synced: Arc<AtomicBool>,
}

impl<K> Clone for InformerStore<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            synced: self.synced.clone(),
        }
    }
}

impl<K> Lister<K> for InformerStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.store.get(&ObjectRef::new(name).within(namespace))
    }

    fn list(&self) -> Vec<Arc<K>> {
        self.store.state()
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}

/// Watches one resource kind, mirrors it into an [`InformerStore`] and turns
/// every add/update/delete into a reconciliation key on the [`WorkQueue`].
pub(crate) struct Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    api: Api<K>,
    writer: Writer<K>,
    store: InformerStore<K>,
}

impl<K> Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    pub fn new(api: Api<K>) -> Self {
        let writer: Writer<K> = Default::default();
        let store = InformerStore {
            store: writer.as_reader(),
            synced: Default::default(),
        };
        Self { api, writer, store }
    }

    pub fn store(&self) -> InformerStore<K> {
        self.store.clone()
    }

    /// Run the watch loop until the task is aborted. `resolve` must not block,
    /// it only maps an object to the key of the Application to reconcile.
    pub async fn run<F>(self, queue: Arc<WorkQueue>, resolve: F)
    where
        F: Fn(&K) -> Option<NamespacedName> + Send,
    {
        let events = reflector(
            self.writer,
            watcher(self.api, watcher::Config::default()).default_backoff(),
        );
        dispatch(events, self.store, queue, resolve).await
    }
}

/// Enqueue the key of every object in `events`, a reflector stream feeding
/// `store`.
///
/// Objects which disappear during a re-list never produce a delete event, so
/// the content of the store before the re-list is kept and the keys of objects
/// missing afterwards are enqueued once the new list is complete.
pub(crate) async fn dispatch<K, S, F>(
    events: S,
    store: InformerStore<K>,
    queue: Arc<WorkQueue>,
    resolve: F,
) where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
    S: Stream<Item = watcher::Result<Event<K>>>,
    F: Fn(&K) -> Option<NamespacedName>,
{
    let kind = K::kind(&()).to_string();
    let mut relisted: Vec<Arc<K>> = vec![];
    futures::pin_mut!(events);
    while let Some(event) = events.next().await {
        match event {
            Ok(Event::Init) => {
                debug!("{} cache (re-)list started", kind);
                relisted = store.list();
            }
            Ok(Event::InitDone) => {
                for o in relisted.drain(..) {
                    if store.store.get(&ObjectRef::from_obj(o.as_ref())).is_some() {
                        continue;
                    }
                    debug!("{} {} was deleted during re-list", kind, o.name_any());
                    if let Some(key) = resolve(o.as_ref()) {
                        queue.add(key.to_string()).await;
                    }
                }
                if !store.synced.swap(true, Ordering::AcqRel) {
                    info!("{} cache synced", kind);
                }
            }
            Ok(Event::InitApply(o)) | Ok(Event::Apply(o)) | Ok(Event::Delete(o)) => {
                if let Some(key) = resolve(&o) {
                    queue.add(key.to_string()).await;
                }
            }
            Err(e) => warn!("{} watch failed: {}", kind, e),
        }
    }
}

/// Block until `synced` reports true, failing once `limit` has passed.
pub(crate) async fn wait_for_cache_sync<F>(limit: Duration, synced: F) -> Result<(), ControllerError>
where
    F: Fn() -> bool,
{
    let mut ticks = interval(Duration::from_millis(100));
    timeout(limit, async {
        loop {
            ticks.tick().await;
            if synced() {
                break;
            }
        }
    })
    .await
    .map_err(|_| ControllerError::CacheSyncTimeout(limit))
}
