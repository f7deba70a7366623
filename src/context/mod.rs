//! Per-request context tree with cancellation and deadline propagation
//!
//! Every request (page view or queue push) gets a root [`Context`]. Sub
//! operations that need their own bound (a single datastore call, a
//! transaction attempt, a worker invocation) derive children with
//! [`Context::with_timeout`]. Cancellation cascades strictly downward:
//! canceling a parent cancels every live descendant, canceling a child
//! only detaches it from its parent. A fired deadline timer behaves
//! like an explicit cancel with a different cause.
//!
//! The root alone owns the HTTP request and the response under
//! construction; children reach that state through a shared handle, so
//! however many timeout scopes a handler opens there is exactly one
//! source of truth for the eventual response.

mod data;
mod request;

pub use request::RequestInfo;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;

use crate::app::App;
use crate::store::{Key, StoreTransaction};

/// Why a context is no longer live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Cause {
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Cheap cloneable handle onto one node of a context tree
#[derive(Clone)]
pub struct Context {
    pub(crate) node: Arc<Node>,
}

pub(crate) struct Node {
    pub(crate) deadline: Option<Instant>,
    parent: Weak<Node>,
    pub(crate) shared: Arc<RootShared>,
    state: Mutex<NodeState>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    /// Open transaction bound at this node, if any. At most one per
    /// tree; descendants find it by walking parent links.
    pub(crate) txn: Mutex<Option<TxnSlot>>,
}

pub(crate) struct TxnSlot {
    pub(crate) txn: Box<dyn StoreTransaction>,
    /// Keys put while incomplete, resolved in place after commit
    pub(crate) pending: Vec<Key>,
}

struct NodeState {
    cause: Option<Cause>,
    children: Vec<Arc<Node>>,
    timer: Option<tokio::task::JoinHandle<()>>,
}

/// State shared by every node of one tree, owned by the root
pub(crate) struct RootShared {
    pub(crate) app: Arc<App>,
    pub(crate) request: RequestInfo,
    pub(crate) runtime: Option<tokio::runtime::Handle>,
    pub(crate) response: Mutex<ResponseState>,
    pub(crate) scratch: Mutex<Scratch>,
    pub(crate) fields: Mutex<Option<HashMap<String, Vec<String>>>>,
    pub(crate) identity: Mutex<Identity>,
    pub(crate) path_args: Mutex<Vec<String>>,
}

pub(crate) struct ResponseState {
    pub(crate) status: u16,
    pub(crate) headers: HashMap<String, String>,
    pub(crate) cookies: Vec<String>,
    pub(crate) buffer: Vec<u8>,
    pub(crate) direct: Option<Vec<u8>>,
}

impl Default for ResponseState {
    fn default() -> Self {
        Self {
            status: 200,
            headers: HashMap::new(),
            cookies: Vec::new(),
            buffer: Vec::new(),
            direct: None,
        }
    }
}

/// Free-form per-request key/value scratch space for passing state
/// between middleware and handlers
#[derive(Default)]
pub(crate) struct Scratch {
    pub(crate) strings: HashMap<String, String>,
    pub(crate) ints: HashMap<String, i64>,
    pub(crate) bools: HashMap<String, bool>,
}

#[derive(Default)]
pub(crate) struct Identity {
    pub(crate) user: UserCache,
    pub(crate) xsrf: Option<String>,
}

#[derive(Default, Clone, Copy, PartialEq)]
pub(crate) enum UserCache {
    #[default]
    Unknown,
    Anonymous,
    Id(i64),
}

impl Context {
    /// Root context for an inbound request. The overall request
    /// deadline comes from config; a zero timeout means unbounded.
    pub fn new_root(app: Arc<App>, request: RequestInfo) -> Self {
        let timeout = app.config().request_timeout();
        Self::root_with_timeout(app, request, timeout)
    }

    /// Root context for background work (no deadline, synthetic request)
    pub fn background(app: Arc<App>) -> Self {
        let host = app.config().canonical_host.clone().unwrap_or_else(|| {
            format!("{}:{}", app.config().host, app.config().port)
        });
        let request = RequestInfo::get("/").with_host(&host);
        Self::root_with_timeout(app, request, Duration::ZERO)
    }

    fn root_with_timeout(app: Arc<App>, request: RequestInfo, timeout: Duration) -> Self {
        let deadline = if timeout.is_zero() { None } else { Some(Instant::now() + timeout) };
        let (done_tx, done_rx) = watch::channel(false);
        let node = Arc::new(Node {
            deadline,
            parent: Weak::new(),
            shared: Arc::new(RootShared {
                app,
                request,
                runtime: tokio::runtime::Handle::try_current().ok(),
                response: Mutex::new(ResponseState::default()),
                scratch: Mutex::new(Scratch::default()),
                fields: Mutex::new(None),
                identity: Mutex::new(Identity::default()),
                path_args: Mutex::new(Vec::new()),
            }),
            state: Mutex::new(NodeState { cause: None, children: Vec::new(), timer: None }),
            done_tx,
            done_rx,
            txn: Mutex::new(None),
        });
        if !timeout.is_zero() {
            Node::arm_timer(&node, timeout);
        }
        Self { node }
    }

    /// Derive a child bounded by `timeout`.
    ///
    /// Deadlines never relax: when an ancestor's deadline is already
    /// tighter than `now + timeout`, this is a no-op returning a handle
    /// onto the same node. Likewise a context that is already dead
    /// hands back itself rather than spawning children it would never
    /// cancel.
    pub fn with_timeout(&self, timeout: Duration) -> Context {
        let deadline = Instant::now() + timeout;
        if let Some(existing) = self.node.deadline {
            if existing <= deadline {
                return self.clone();
            }
        }
        let (done_tx, done_rx) = watch::channel(false);
        let child = Arc::new(Node {
            deadline: Some(deadline),
            parent: Arc::downgrade(&self.node),
            shared: self.node.shared.clone(),
            state: Mutex::new(NodeState { cause: None, children: Vec::new(), timer: None }),
            done_tx,
            done_rx,
            txn: Mutex::new(None),
        });
        {
            let mut state = self.node.state.lock().unwrap();
            if state.cause.is_some() {
                return self.clone();
            }
            state.children.push(child.clone());
        }
        // Recompute in case acquiring locks burned through the budget.
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            Node::cancel(&child, true, Cause::DeadlineExceeded);
        } else {
            Node::arm_timer(&child, remaining);
        }
        Context { node: child }
    }

    /// Cancel this context and every live descendant. Idempotent.
    pub fn cancel(&self) {
        Node::cancel(&self.node, true, Cause::Canceled);
    }

    /// Signal that flips once the context dies. Await
    /// `receiver.changed()` to block on it.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.node.done_rx.clone()
    }

    /// `None` while live, otherwise why the context died
    pub fn err(&self) -> Option<Cause> {
        self.node.state.lock().unwrap().cause
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.node.deadline
    }

    pub(crate) fn app(&self) -> &Arc<App> {
        &self.node.shared.app
    }

    pub(crate) fn same_node(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    /// Number of live children, for tests and diagnostics
    pub fn live_children(&self) -> usize {
        self.node.state.lock().unwrap().children.len()
    }
}

impl Node {
    pub(crate) fn parent_arc(&self) -> Option<Arc<Node>> {
        self.parent.upgrade()
    }

    fn arm_timer(node: &Arc<Node>, remaining: Duration) {
        let Some(handle) = node.shared.runtime.as_ref() else {
            // No runtime: deadline stays recorded, nothing fires it.
            return;
        };
        let weak = Arc::downgrade(node);
        let task = handle.spawn(async move {
            tokio::time::sleep(remaining).await;
            if let Some(node) = weak.upgrade() {
                Node::cancel(&node, true, Cause::DeadlineExceeded);
            }
        });
        node.state.lock().unwrap().timer = Some(task);
    }

    fn cancel(node: &Arc<Node>, remove_from_parent: bool, cause: Cause) {
        let children = {
            let mut state = node.state.lock().unwrap();
            if state.cause.is_some() {
                return; // already dead
            }
            state.cause = Some(cause);
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            std::mem::take(&mut state.children)
        };
        let _ = node.done_tx.send(true);
        for child in children {
            Node::cancel(&child, false, cause);
        }
        if remove_from_parent {
            if let Some(parent) = node.parent.upgrade() {
                let mut state = parent.state.lock().unwrap();
                state.children.retain(|c| !Arc::ptr_eq(c, node));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::test_app;

    #[test]
    fn cancel_cascades_to_descendants() {
        let ctx = Context::background(test_app());
        let child = ctx.with_timeout(Duration::from_secs(60));
        let grandchild = child.with_timeout(Duration::from_secs(30));
        assert!(!ctx.same_node(&child));
        assert!(!child.same_node(&grandchild));
        ctx.cancel();
        assert_eq!(ctx.err(), Some(Cause::Canceled));
        assert_eq!(child.err(), Some(Cause::Canceled));
        assert_eq!(grandchild.err(), Some(Cause::Canceled));
    }

    #[test]
    fn child_cancel_leaves_parent_live() {
        let ctx = Context::background(test_app());
        let child = ctx.with_timeout(Duration::from_secs(60));
        assert_eq!(ctx.live_children(), 1);
        child.cancel();
        assert_eq!(child.err(), Some(Cause::Canceled));
        assert_eq!(ctx.err(), None);
        // Detached, so transient children do not accumulate.
        assert_eq!(ctx.live_children(), 0);
    }

    #[test]
    fn double_cancel_is_a_noop() {
        let ctx = Context::background(test_app());
        let child = ctx.with_timeout(Duration::from_secs(60));
        child.cancel();
        child.cancel();
        ctx.cancel();
        ctx.cancel();
        assert_eq!(ctx.err(), Some(Cause::Canceled));
    }

    #[test]
    fn deadlines_never_relax() {
        let ctx = Context::background(test_app());
        let tight = ctx.with_timeout(Duration::from_millis(50));
        // A looser child budget collapses onto the tighter ancestor.
        let loose = tight.with_timeout(Duration::from_secs(60));
        assert!(tight.same_node(&loose));
        assert_eq!(tight.deadline(), loose.deadline());
    }

    #[test]
    fn canceled_parent_adopts_no_children() {
        let ctx = Context::background(test_app());
        let child = ctx.with_timeout(Duration::from_secs(60));
        child.cancel();
        let grandchild = child.with_timeout(Duration::from_millis(10));
        assert!(child.same_node(&grandchild));
    }

    #[tokio::test]
    async fn timer_fires_deadline_exceeded() {
        let ctx = Context::background(test_app());
        let child = ctx.with_timeout(Duration::from_millis(20));
        let mut done = child.done();
        tokio::time::timeout(Duration::from_secs(2), done.changed())
            .await
            .expect("deadline timer never fired")
            .unwrap();
        assert_eq!(child.err(), Some(Cause::DeadlineExceeded));
        assert_eq!(ctx.err(), None);
        assert_eq!(ctx.live_children(), 0);
    }

    #[tokio::test]
    async fn racing_cancel_and_timer_settle_once() {
        let ctx = Context::background(test_app());
        for _ in 0..50 {
            let child = ctx.with_timeout(Duration::from_millis(1));
            let clone = child.clone();
            let handle = tokio::spawn(async move { clone.cancel() });
            tokio::time::sleep(Duration::from_millis(2)).await;
            child.cancel();
            handle.await.unwrap();
            assert!(child.err().is_some());
        }
        assert_eq!(ctx.err(), None);
    }
}
