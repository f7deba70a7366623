//! The application object
//!
//! One [`App`] value owns everything a request needs: configuration,
//! token keys, the route and static tables, queue/worker registrations
//! and the backend collaborators. It is assembled once at startup
//! through [`AppBuilder`], wrapped in an `Arc`, and shared read-only
//! by every request, so there is no global registry anywhere.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

use crate::blob::BlobStore;
use crate::cache::Cache;
use crate::config::Config;
use crate::context::Context;
use crate::http::static_files::StaticEntry;
use crate::http::{Lookup, Route, StaticSpec};
use crate::pubsub::PubSub;
use crate::queue::{Queue, Worker};
use crate::store::Datastore;
use crate::token::TokenKeys;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("worker {worker:?} is bound to unregistered queue {queue:?}")]
    UnknownQueue { worker: String, queue: String },
    #[error("queue {0:?} registered twice")]
    DuplicateQueue(String),
    #[error("worker {0:?} registered twice")]
    DuplicateWorker(String),
    #[error("route {0:?} registered as both a handler and a static path")]
    RouteConflict(String),
}

/// Immutable per-process application state
pub struct App {
    config: Config,
    token_keys: TokenKeys,
    routes: HashMap<String, Route>,
    statics: HashMap<String, StaticSpec>,
    lookup: Option<Lookup>,
    queues: HashMap<String, Queue>,
    workers: HashMap<String, Worker>,
    datastore: Arc<dyn Datastore>,
    cache: Arc<dyn Cache>,
    blobs: Arc<dyn BlobStore>,
    pubsub: Arc<dyn PubSub>,
    static_cache: RwLock<HashMap<String, StaticEntry>>,
}

impl App {
    pub fn builder(config: Config, token_keys: TokenKeys) -> AppBuilder {
        AppBuilder::new(config, token_keys)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn token_keys(&self) -> &TokenKeys {
        &self.token_keys
    }

    pub fn routes(&self) -> &HashMap<String, Route> {
        &self.routes
    }

    pub fn statics(&self) -> &HashMap<String, StaticSpec> {
        &self.statics
    }

    pub fn lookup(&self) -> Option<&Lookup> {
        self.lookup.as_ref()
    }

    pub fn queues(&self) -> &HashMap<String, Queue> {
        &self.queues
    }

    pub fn workers(&self) -> &HashMap<String, Worker> {
        &self.workers
    }

    pub fn datastore(&self) -> &Arc<dyn Datastore> {
        &self.datastore
    }

    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn pubsub(&self) -> &Arc<dyn PubSub> {
        &self.pubsub
    }

    pub(crate) fn static_cache(&self) -> &RwLock<HashMap<String, StaticEntry>> {
        &self.static_cache
    }

    /// Dispatch one request outside the server, e.g. from tests
    pub fn handle(self: &Arc<Self>, request: crate::context::RequestInfo) -> crate::http::ResponseParts {
        crate::http::dispatcher::dispatch(self, request)
    }
}

/// Startup-time assembly and validation for [`App`]
pub struct AppBuilder {
    config: Config,
    token_keys: TokenKeys,
    routes: HashMap<String, Route>,
    statics: HashMap<String, StaticSpec>,
    lookup: Option<Lookup>,
    queues: Vec<Queue>,
    workers: Vec<(String, Worker)>,
    datastore: Option<Arc<dyn Datastore>>,
    cache: Option<Arc<dyn Cache>>,
    blobs: Option<Arc<dyn BlobStore>>,
    pubsub: Option<Arc<dyn PubSub>>,
}

impl AppBuilder {
    pub fn new(config: Config, token_keys: TokenKeys) -> Self {
        Self {
            config,
            token_keys,
            routes: HashMap::new(),
            statics: HashMap::new(),
            lookup: None,
            queues: Vec::new(),
            workers: Vec::new(),
            datastore: None,
            cache: None,
            blobs: None,
            pubsub: None,
        }
    }

    /// Register a handler for a leading path segment (`"/"` for the root)
    pub fn route(mut self, segment: impl Into<String>, route: Route) -> Self {
        self.routes.insert(segment.into(), route);
        self
    }

    /// Register a static asset spec for a leading path segment
    pub fn static_route(mut self, segment: impl Into<String>, spec: StaticSpec) -> Self {
        self.statics.insert(segment.into(), spec);
        self
    }

    /// Fallback resolver for path segments with no registration
    pub fn lookup(
        mut self,
        lookup: impl Fn(&Context, &str) -> Option<Route> + Send + Sync + 'static,
    ) -> Self {
        self.lookup = Some(Arc::new(lookup));
        self
    }

    pub fn queue(mut self, queue: Queue) -> Self {
        self.queues.push(queue);
        self
    }

    pub fn worker(mut self, name: impl Into<String>, worker: Worker) -> Self {
        self.workers.push((name.into(), worker));
        self
    }

    pub fn datastore(mut self, datastore: impl Datastore + 'static) -> Self {
        self.datastore = Some(Arc::new(datastore));
        self
    }

    pub fn cache(mut self, cache: impl Cache + 'static) -> Self {
        self.cache = Some(Arc::new(cache));
        self
    }

    pub fn blobs(mut self, blobs: impl BlobStore + 'static) -> Self {
        self.blobs = Some(Arc::new(blobs));
        self
    }

    pub fn pubsub(mut self, pubsub: impl PubSub + 'static) -> Self {
        self.pubsub = Some(Arc::new(pubsub));
        self
    }

    // Config tweaks, for callers that start from a parsed Config and
    // adjust a field or two (and for tests).

    pub fn dev_mode(mut self) -> Self {
        self.config.dev_mode = true;
        self
    }

    pub fn canonical_host(mut self, host: impl Into<String>) -> Self {
        self.config.canonical_host = Some(host.into());
        self
    }

    pub fn login_url(mut self, url: impl Into<String>) -> Self {
        self.config.login_url = Some(url.into());
        self
    }

    pub fn static_dir(mut self, dir: impl Into<String>) -> Self {
        self.config.static_dir = dir.into();
        self
    }

    pub fn queue_init_key(mut self, key: impl Into<String>) -> Self {
        self.config.queue_init_key = key.into();
        self
    }

    pub fn build(self) -> Result<Arc<App>, BuildError> {
        for segment in self.statics.keys() {
            if self.routes.contains_key(segment) {
                return Err(BuildError::RouteConflict(segment.clone()));
            }
        }

        let signing = self.token_keys.signing_spec().clone();
        let mut queues = HashMap::new();
        for mut queue in self.queues {
            queue.derive_secret(&signing);
            let name = queue.name().to_string();
            if queues.insert(name.clone(), queue).is_some() {
                return Err(BuildError::DuplicateQueue(name));
            }
        }
        let mut workers = HashMap::new();
        for (name, worker) in self.workers {
            if !queues.contains_key(worker.queue()) {
                return Err(BuildError::UnknownQueue {
                    worker: name,
                    queue: worker.queue().to_string(),
                });
            }
            if workers.insert(name.clone(), worker).is_some() {
                return Err(BuildError::DuplicateWorker(name));
            }
        }

        Ok(Arc::new(App {
            config: self.config,
            token_keys: self.token_keys,
            routes: self.routes,
            statics: self.statics,
            lookup: self.lookup,
            queues,
            workers,
            datastore: self
                .datastore
                .unwrap_or_else(|| Arc::new(crate::store::memory::MemoryDatastore::new())),
            cache: self.cache.unwrap_or_else(|| Arc::new(crate::cache::MemoryCache::new())),
            blobs: self.blobs.unwrap_or_else(|| Arc::new(crate::blob::MemoryBlobStore::new())),
            pubsub: self.pubsub.unwrap_or_else(|| Arc::new(crate::pubsub::MemoryPubSub::new())),
            static_cache: RwLock::new(HashMap::new()),
        }))
    }
}

#[cfg(test)]
pub(crate) fn test_app_builder() -> AppBuilder {
    use crate::token::KeySpec;
    let keys = TokenKeys::new(vec![KeySpec::new(1, "unit-test-secret")]).unwrap();
    AppBuilder::new(Config::default(), keys)
}

#[cfg(test)]
pub(crate) fn test_app() -> Arc<App> {
    test_app_builder().build().unwrap()
}

#[cfg(test)]
pub(crate) fn test_app_with(store: crate::store::memory::MemoryDatastore) -> Arc<App> {
    test_app_builder().datastore(store).build().unwrap()
}
