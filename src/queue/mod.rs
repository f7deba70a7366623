//! Background work queues
//!
//! A [`Queue`] is a named channel with a handling timeout and a secret
//! that authenticates push deliveries. A [`Worker`] binds a name to a
//! typed handler on one queue; its arguments are decoded from the JSON
//! task payload before the handler runs, so a worker never sees raw
//! wire data. Publishing goes out through the pub/sub collaborator;
//! delivery comes back in over the `/_queues/handle/...` endpoint.
//!
//! - [`push`] - the push-delivery endpoint
//! - [`provision`] - topic/subscription setup for registered queues

pub mod provision;
pub mod push;

use hmac::{Hmac, Mac};
use http::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::app::App;
use crate::context::Context;
use crate::http::Disposition;

/// Fallback handling timeout for queues that do not set their own
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// A registered work queue
#[derive(Clone)]
pub struct Queue {
    name: String,
    /// Per-task handling bound; also the push ack deadline
    timeout: Duration,
    /// Authenticates push deliveries for this queue
    secret: Vec<u8>,
}

impl Queue {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), timeout: DEFAULT_TIMEOUT, secret: Vec::new() }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn secret(&self) -> &[u8] {
        &self.secret
    }

    /// Topic the queue's tasks are published to
    pub fn topic(&self) -> String {
        format!("queue.{}", self.name)
    }

    /// Push subscription feeding the queue's workers
    pub fn subscription(&self) -> String {
        format!("worker.{}", self.name)
    }

    /// Derive the delivery secret from the current signing key. The
    /// secret never leaves the process except embedded in the push
    /// endpoint URL, and stays stable across restarts that share keys.
    pub(crate) fn derive_secret(&mut self, key: &crate::token::KeySpec) {
        let mut mac = Hmac::<Sha256>::new_from_slice(&key.secret).unwrap();
        mac.update(b"queue/");
        mac.update(self.name.as_bytes());
        self.secret = mac.finalize().into_bytes().to_vec();
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// The wire form of one queued task
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskPayload {
    #[serde(rename = "Worker")]
    pub worker: String,
    #[serde(rename = "Args")]
    pub args: Vec<serde_json::Value>,
}

/// Why a worker invocation failed
#[derive(Debug, Error)]
pub enum WorkerCallError {
    /// The payload's argument at `index` did not decode as the
    /// handler's parameter type. Retrying cannot fix this.
    #[error("couldn't decode worker argument {index}: {source}")]
    Decode {
        index: usize,
        #[source]
        source: serde_json::Error,
    },
    /// The handler itself failed; the task should be redelivered.
    #[error(transparent)]
    Handler(anyhow::Error),
}

/// Typed invocation seam between the push endpoint and a handler
pub trait WorkerAdapter: Send + Sync {
    /// Number of arguments the handler expects
    fn arity(&self) -> usize;
    fn call(&self, ctx: &Context, args: &[serde_json::Value]) -> Result<(), WorkerCallError>;
}

/// A named, typed task handler bound to one queue
#[derive(Clone)]
pub struct Worker {
    queue: String,
    adapter: Arc<dyn WorkerAdapter>,
}

impl Worker {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub(crate) fn adapter(&self) -> &Arc<dyn WorkerAdapter> {
        &self.adapter
    }

    pub fn new0<F>(queue: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Context) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self { queue: queue.into(), adapter: Arc::new(Adapter0(handler)) }
    }

    pub fn new1<A, F>(queue: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + Send + Sync + 'static,
        F: Fn(&Context, A) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self { queue: queue.into(), adapter: Arc::new(Adapter1(handler, PhantomData::<fn(A)>)) }
    }

    pub fn new2<A, B, F>(queue: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + Send + Sync + 'static,
        B: DeserializeOwned + Send + Sync + 'static,
        F: Fn(&Context, A, B) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self { queue: queue.into(), adapter: Arc::new(Adapter2(handler, PhantomData::<fn(A, B)>)) }
    }

    pub fn new3<A, B, C, F>(queue: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + Send + Sync + 'static,
        B: DeserializeOwned + Send + Sync + 'static,
        C: DeserializeOwned + Send + Sync + 'static,
        F: Fn(&Context, A, B, C) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            queue: queue.into(),
            adapter: Arc::new(Adapter3(handler, PhantomData::<fn(A, B, C)>)),
        }
    }
}

fn decode_arg<T: DeserializeOwned>(
    args: &[serde_json::Value],
    index: usize,
) -> Result<T, WorkerCallError> {
    serde_json::from_value(args[index].clone())
        .map_err(|source| WorkerCallError::Decode { index, source })
}

struct Adapter0<F>(F);

impl<F> WorkerAdapter for Adapter0<F>
where
    F: Fn(&Context) -> anyhow::Result<()> + Send + Sync,
{
    fn arity(&self) -> usize {
        0
    }

    fn call(&self, ctx: &Context, _args: &[serde_json::Value]) -> Result<(), WorkerCallError> {
        (self.0)(ctx).map_err(WorkerCallError::Handler)
    }
}

struct Adapter1<A, F>(F, PhantomData<fn(A)>);

impl<A, F> WorkerAdapter for Adapter1<A, F>
where
    A: DeserializeOwned + Send + Sync,
    F: Fn(&Context, A) -> anyhow::Result<()> + Send + Sync,
{
    fn arity(&self) -> usize {
        1
    }

    fn call(&self, ctx: &Context, args: &[serde_json::Value]) -> Result<(), WorkerCallError> {
        (self.0)(ctx, decode_arg(args, 0)?).map_err(WorkerCallError::Handler)
    }
}

struct Adapter2<A, B, F>(F, PhantomData<fn(A, B)>);

impl<A, B, F> WorkerAdapter for Adapter2<A, B, F>
where
    A: DeserializeOwned + Send + Sync,
    B: DeserializeOwned + Send + Sync,
    F: Fn(&Context, A, B) -> anyhow::Result<()> + Send + Sync,
{
    fn arity(&self) -> usize {
        2
    }

    fn call(&self, ctx: &Context, args: &[serde_json::Value]) -> Result<(), WorkerCallError> {
        (self.0)(ctx, decode_arg(args, 0)?, decode_arg(args, 1)?)
            .map_err(WorkerCallError::Handler)
    }
}

struct Adapter3<A, B, C, F>(F, PhantomData<fn(A, B, C)>);

impl<A, B, C, F> WorkerAdapter for Adapter3<A, B, C, F>
where
    A: DeserializeOwned + Send + Sync,
    B: DeserializeOwned + Send + Sync,
    C: DeserializeOwned + Send + Sync,
    F: Fn(&Context, A, B, C) -> anyhow::Result<()> + Send + Sync,
{
    fn arity(&self) -> usize {
        3
    }

    fn call(&self, ctx: &Context, args: &[serde_json::Value]) -> Result<(), WorkerCallError> {
        (self.0)(ctx, decode_arg(args, 0)?, decode_arg(args, 1)?, decode_arg(args, 2)?)
            .map_err(WorkerCallError::Handler)
    }
}

impl Context {
    /// Publish a task for `worker`, returning the message id.
    ///
    /// Arguments must match the worker's parameter types; build them
    /// with `serde_json::json!`. The task lands on the worker's queue
    /// topic and comes back through the push endpoint.
    pub fn queue_task(
        &self,
        worker: &str,
        args: Vec<serde_json::Value>,
    ) -> anyhow::Result<String> {
        let app = self.app().clone();
        let binding = app
            .workers()
            .get(worker)
            .ok_or_else(|| anyhow::anyhow!("no worker registered as {worker:?}"))?;
        if binding.adapter().arity() != args.len() {
            anyhow::bail!(
                "worker {worker:?} takes {} argument(s), got {}",
                binding.adapter().arity(),
                args.len()
            );
        }
        let queue = app
            .queues()
            .get(binding.queue())
            .ok_or_else(|| anyhow::anyhow!("no queue registered as {:?}", binding.queue()))?;
        let payload =
            serde_json::to_vec(&TaskPayload { worker: worker.to_string(), args })?;
        let ctx = self.with_timeout(app.config().datastore_timeout());
        let result = app.pubsub().publish(&ctx, &queue.topic(), payload);
        if !ctx.same_node(self) {
            ctx.cancel();
        }
        Ok(result?)
    }
}

/// `/_queues/...` endpoint router. Everything here is POST-only and
/// answers unknown shapes with the 404 page.
pub(crate) fn dispatch(app: &Arc<App>, ctx: &Context, elems: &[String]) -> Disposition {
    if ctx.request().method != Method::POST {
        return Disposition::NotFound;
    }
    match elems.first().map(|s| s.as_str()) {
        Some("init") if elems.len() == 2 => provision::init_queues(app, ctx, &elems[1]),
        Some("handle") if elems.len() == 3 => {
            push::handle_push(app, ctx, &elems[1], &elems[2])
        }
        _ => Disposition::NotFound,
    }
}
