//! Gantry - Web Backend Core
//!
//! The serving backbone for a request-driven web application: request
//! contexts, signed tokens, datastore transactions, HTTP dispatch and
//! background work queues, all hanging off one [`App`](app::App) value.
//!
//! # Overview
//!
//! Gantry wires the ambient concerns of a web backend so application
//! code is just handlers and workers. Every request gets a [`Context`]
//! that carries cancellation and deadlines down through every backend
//! call, accumulates the response, and exposes cookies, identity and
//! form fields. Handlers finish by returning an [`Outcome`]; the
//! dispatcher turns it, or any error or panic, into the right response.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use gantry::app::App;
//! use gantry::config::Config;
//! use gantry::http::{Outcome, Route};
//! use gantry::token::{KeySpec, TokenKeys};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let keys = TokenKeys::new(vec![KeySpec::new(1, "change-me")])?;
//!     let app = App::builder(Config::default(), keys)
//!         .route("/", Route::new(|ctx| {
//!             ctx.write_str("hello");
//!             Outcome::ok()
//!         }).anon())
//!         .build()?;
//!     app.serve().await
//! }
//! ```
//!
//! # Architecture
//!
//! - [`app`] - the application object and its builder
//! - [`context`] - cancellable, deadline-carrying request contexts
//! - [`token`] - HMAC-signed tokens with key rotation
//! - [`store`] - datastore seam with transactional retry
//! - [`http`] - routes, the dispatch pipeline and the hyper server
//! - [`queue`] - push-delivered background work with typed workers
//! - [`cache`], [`blob`], [`pubsub`] - the remaining backend seams,
//!   each with an in-memory implementation for tests and dev servers

pub mod app;
pub mod blob;
pub mod cache;
pub mod config;
pub mod context;
pub mod http;
pub mod pubsub;
pub mod queue;
pub mod store;
pub mod token;

pub use app::{App, AppBuilder};
pub use context::{Cause, Context, RequestInfo};
pub use http::{HandlerResult, Outcome, Route, StaticSpec};
pub use queue::{Queue, Worker};
