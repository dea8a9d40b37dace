//! Typed watch-event dispatch
//!
//! An [`Informer`] follows a watch stream, keeps the last seen version of
//! every object, and turns the raw watcher events into add/update/delete
//! callbacks on a [`ResourceEventHandler`]. Handlers run inline: a slow
//! handler holds up the events behind it.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::controller::error::{Error, Result};

/// Callbacks for changes to one resource kind
#[async_trait]
pub trait ResourceEventHandler<K>: Send + Sync {
    async fn on_add(&self, obj: &K);

    async fn on_update(&self, old: &K, new: &K);

    async fn on_delete(&self, obj: &K);
}

/// Queue key of an object: `namespace/name`, or `name` for cluster-scoped objects
pub fn object_key<K: Resource>(obj: &K) -> String {
    match obj.namespace() {
        Some(ns) => format!("{}/{}", ns, obj.name_any()),
        None => obj.name_any(),
    }
}

/// Split a `namespace/name` key
pub fn split_key(key: &str) -> Result<(&str, &str)> {
    match key.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((ns, name))
        }
        _ => Err(Error::InvalidKey(key.to_string())),
    }
}

/// Local cache plus dispatcher for one resource kind
pub struct Informer<K, H> {
    cache: HashMap<String, K>,
    /// Keys seen since the current re-list started
    relist: Option<HashSet<String>>,
    handler: Arc<H>,
}

impl<K, H> Informer<K, H>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    <K as Resource>::DynamicType: Default,
    H: ResourceEventHandler<K>,
{
    pub fn new(handler: Arc<H>) -> Self {
        Self {
            cache: HashMap::new(),
            relist: None,
            handler,
        }
    }

    /// Cached object for a key
    pub fn get(&self, key: &str) -> Option<&K> {
        self.cache.get(key)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Store an object and dispatch add or update
    async fn upsert(&mut self, obj: K) {
        let key = object_key(&obj);
        match self.cache.insert(key.clone(), obj.clone()) {
            None => {
                trace!(%key, "add");
                self.handler.on_add(&obj).await;
            }
            Some(old) => {
                if old.resource_version().is_some()
                    && old.resource_version() == obj.resource_version()
                {
                    trace!(%key, "same resource version, skipping update");
                    return;
                }
                trace!(%key, "update");
                self.handler.on_update(&old, &obj).await;
            }
        }
    }

    /// Apply one watcher event to the cache and dispatch it
    pub async fn handle_event(&mut self, event: Event<K>) {
        match event {
            Event::Apply(obj) => self.upsert(obj).await,
            Event::Delete(obj) => {
                let key = object_key(&obj);
                let last = self.cache.remove(&key).unwrap_or(obj);
                trace!(%key, "delete");
                self.handler.on_delete(&last).await;
            }
            Event::Init => {
                debug!("re-list started");
                self.relist = Some(HashSet::new());
            }
            Event::InitApply(obj) => {
                if let Some(seen) = self.relist.as_mut() {
                    seen.insert(object_key(&obj));
                }
                self.upsert(obj).await;
            }
            Event::InitDone => {
                let Some(seen) = self.relist.take() else {
                    return;
                };
                let gone: Vec<String> = self
                    .cache
                    .keys()
                    .filter(|k| !seen.contains(*k))
                    .cloned()
                    .collect();
                for key in gone {
                    if let Some(obj) = self.cache.remove(&key) {
                        debug!(%key, "object vanished across re-list");
                        self.handler.on_delete(&obj).await;
                    }
                }
                debug!(objects = self.cache.len(), "re-list done");
            }
        }
    }

    /// Watch `api` and dispatch events until `token` is cancelled
    pub async fn run(mut self, api: Api<K>, config: watcher::Config, token: CancellationToken) {
        let stream = watcher::watcher(api, config).default_backoff();
        futures::pin_mut!(stream);

        info!(kind = %K::kind(&Default::default()), "informer started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(event)) => self.handle_event(event).await,
                    Some(Err(e)) => warn!(error = %e, "watch error"),
                    None => break,
                },
            }
        }
        info!(kind = %K::kind(&Default::default()), "informer stopped");
    }
}
