//! Minimal dev server: loads an optional TOML config, registers a
//! couple of demonstration routes and serves on the configured port.
//!
//! ```sh
//! RUST_LOG=info cargo run --bin gantry-dev -- [config.toml]
//! ```

use gantry::app::App;
use gantry::config::Config;
use gantry::http::{Outcome, Route};
use gantry::token::{KeySpec, TokenKeys};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut config = match std::env::args().nth(1) {
        Some(path) => Config::from_toml(&std::fs::read_to_string(&path)?)?,
        None => Config::default(),
    };
    config.dev_mode = true;

    // Dev-only key. Deployments load real keys from secret storage.
    let keys = TokenKeys::new(vec![KeySpec::new(1, "dev-only-secret")])?;

    let app = App::builder(config, keys)
        .route(
            "/",
            Route::new(|ctx| {
                ctx.write_str("<!doctype html>\n<h1>gantry dev server</h1>\n");
                Outcome::ok()
            })
            .anon(),
        )
        .route(
            "whoami",
            Route::new(|ctx| {
                ctx.encode_json(&serde_json::json!({
                    "user": ctx.user_id(),
                    "admin": ctx.is_admin(),
                }))?;
                Outcome::ok()
            })
            .anon(),
        )
        .build()?;

    app.serve().await
}
