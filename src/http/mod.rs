//! HTTP dispatch: routes, outcomes, the request pipeline and the server
//!
//! - [`dispatcher`] - the per-request pipeline (host/TLS policy, path
//!   match, auth/XSRF/cron checks, handler execution, recovery)
//! - [`response`] - response assembly and the error pages
//! - [`static_files`] - static asset table with etag caching
//! - [`server`] - hyper binding that feeds the pipeline

pub mod dispatcher;
pub mod response;
pub mod server;
pub mod static_files;

pub use response::ResponseParts;
pub use static_files::StaticSpec;

use std::sync::Arc;

use crate::context::Context;

/// How a handler finished
///
/// Deeply nested handler code aborts cleanly by returning one of the
/// non-`Ok` variants up the call chain; the dispatcher interprets them,
/// so no manual error threading or sentinel panics are needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Response state on the context is the response
    Ok,
    /// 301 to the given URL
    Redirect(String),
    NotFound,
    NotModified,
}

impl Outcome {
    pub fn redirect(url: impl Into<String>) -> HandlerResult {
        Ok(Outcome::Redirect(url.into()))
    }

    pub fn ok() -> HandlerResult {
        Ok(Outcome::Ok)
    }

    pub fn not_found() -> HandlerResult {
        Ok(Outcome::NotFound)
    }
}

/// What route handlers return; an `Err` becomes a logged 500
pub type HandlerResult = anyhow::Result<Outcome>;

type HandlerFn = dyn Fn(&Context) -> HandlerResult + Send + Sync;

/// One registered route: a handler plus its access policy
#[derive(Clone)]
pub struct Route {
    /// Accessible without an authenticated user
    pub anon: bool,
    /// Requires an admin identity
    pub admin: bool,
    /// Only valid when triggered by cron
    pub cron: bool,
    /// Only valid when triggered by the task queue
    pub task: bool,
    /// Requires a valid XSRF token field
    pub xsrf: bool,
    pub handler: Arc<HandlerFn>,
}

impl Route {
    /// Authenticated-users route by default; chain the builder methods
    /// to loosen or tighten the policy.
    pub fn new(handler: impl Fn(&Context) -> HandlerResult + Send + Sync + 'static) -> Self {
        Self {
            anon: false,
            admin: false,
            cron: false,
            task: false,
            xsrf: false,
            handler: Arc::new(handler),
        }
    }

    pub fn anon(mut self) -> Self {
        self.anon = true;
        self
    }

    pub fn admin(mut self) -> Self {
        self.admin = true;
        self
    }

    pub fn cron(mut self) -> Self {
        self.cron = true;
        self.anon = true;
        self
    }

    pub fn task(mut self) -> Self {
        self.task = true;
        self.anon = true;
        self
    }

    pub fn xsrf(mut self) -> Self {
        self.xsrf = true;
        self
    }
}

/// Dynamic route resolution for paths with no static registration
pub type Lookup = Arc<dyn Fn(&Context, &str) -> Option<Route> + Send + Sync>;

/// How the pipeline left the request; drives response assembly
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// Context response state is the response
    Handled,
    Redirect(String),
    NotFound,
    NotModified,
    ServerError,
}

/// Whether the Accept header prefers JSON over HTML. First listed of
/// the two media types wins; HTML is the default.
pub(crate) fn prefers_json(accept: Option<&str>) -> bool {
    let Some(accept) = accept else { return false };
    for item in accept.split(',') {
        let media = item.split(';').next().unwrap_or_default().trim();
        match media {
            "application/json" => return true,
            "text/html" => return false,
            _ => {}
        }
    }
    false
}
