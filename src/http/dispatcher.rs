//! The per-request pipeline
//!
//! `received -> host/TLS policy -> path match -> auth -> XSRF -> cron
//! -> handler -> response assembly`, with a recovery boundary around
//! the whole thing. Policy failures are answered with the 404 page:
//! they reveal nothing about which routes exist or why access was
//! refused. Only the reason is logged.

use http::Method;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use super::{response, static_files, Disposition, Outcome, ResponseParts};
use crate::app::App;
use crate::context::{Context, RequestInfo};

/// Dispatch one request through the full pipeline.
///
/// This is the synchronous, transport-agnostic entrypoint; the hyper
/// server calls it via `spawn_blocking` and tests call it directly.
pub fn dispatch(app: &Arc<App>, request: RequestInfo) -> ResponseParts {
    let ctx = Context::new_root(app.clone(), request);
    let disposition = match catch_unwind(AssertUnwindSafe(|| run(app, &ctx))) {
        Ok(disposition) => disposition,
        Err(panic) => {
            log::error!(
                "panic while handling {} {}: {}",
                ctx.request().method,
                ctx.request().path,
                panic_message(&panic),
            );
            Disposition::ServerError
        }
    };
    let parts = response::finalize(&ctx, disposition);
    // Release the request timer and any stray children.
    ctx.cancel();
    parts
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn run(app: &Arc<App>, ctx: &Context) -> Disposition {
    if let Some(redirect) = host_policy(app, ctx) {
        return redirect;
    }

    let path = ctx.request().path.clone();
    if !path.starts_with('/') {
        return Disposition::NotFound;
    }
    let elems: Vec<String> = path[1..].split('/').map(|s| s.to_string()).collect();
    let first = if path == "/" { "/" } else { elems[0].as_str() };

    // Queue endpoints live outside the route table.
    if first == "_queues" {
        return crate::queue::dispatch(app, ctx, &elems[1..]);
    }

    let args: Vec<String> = elems[1..].iter().filter(|e| !e.is_empty()).cloned().collect();
    let route = match app.routes().get(first) {
        Some(route) => Some(route.clone()),
        None => app.lookup().and_then(|lookup| lookup(ctx, first)),
    };
    let Some(route) = route else {
        if let Some(spec) = app.statics().get(first) {
            ctx.set_path_args(args);
            return static_files::serve(app, ctx, spec);
        }
        return Disposition::NotFound;
    };
    ctx.set_path_args(args);

    if route.cron && !ctx.is_cron_request() {
        log::warn!("cron route {path} hit without the cron header");
        return Disposition::NotFound;
    }
    if route.task && !ctx.is_task_request() {
        log::warn!("task route {path} hit without the task header");
        return Disposition::NotFound;
    }
    if !route.anon && ctx.user_id() == 0 {
        return match &app.config().login_url {
            Some(login) => Disposition::Redirect(format!(
                "{login}?redirect={}",
                urlencoding::encode(&path)
            )),
            None => Disposition::NotFound,
        };
    }
    if route.admin && !ctx.is_admin() {
        log::warn!("admin route {path} refused for user {}", ctx.user_id());
        return Disposition::NotFound;
    }
    if route.xsrf && !ctx.validate_xsrf() {
        log::warn!("invalid xsrf token for {path}");
        return Disposition::NotFound;
    }

    match (route.handler)(ctx) {
        Ok(Outcome::Ok) => Disposition::Handled,
        Ok(Outcome::Redirect(url)) => Disposition::Redirect(url),
        Ok(Outcome::NotFound) => Disposition::NotFound,
        Ok(Outcome::NotModified) => Disposition::NotModified,
        Err(err) => {
            log::error!("handler error for {path}: {err:#}");
            Disposition::ServerError
        }
    }
}

/// TLS/canonical-host enforcement. Outside dev mode a non-TLS request,
/// or one addressed to the wrong host (cron/task invocations exempt),
/// gets redirected: GET/HEAD keep their path, anything else lands on
/// the canonical root since replaying a non-idempotent body across a
/// redirect is unsafe.
fn host_policy(app: &Arc<App>, ctx: &Context) -> Option<Disposition> {
    if app.config().dev_mode {
        return None;
    }
    let request = ctx.request();
    let mut bad = !request.tls;
    if !bad {
        if let Some(canonical) = &app.config().canonical_host {
            if &request.host != canonical && !(ctx.is_cron_request() || ctx.is_task_request()) {
                bad = true;
            }
        }
    }
    if !bad {
        return None;
    }
    let host = app
        .config()
        .canonical_host
        .clone()
        .unwrap_or_else(|| request.host.clone());
    if request.method == Method::GET || request.method == Method::HEAD {
        let mut url = format!("https://{host}{}", request.path);
        if !request.query.is_empty() {
            url.push('?');
            url.push_str(&request.query);
        }
        Some(Disposition::Redirect(url))
    } else {
        Some(Disposition::Redirect(format!("https://{host}/")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{test_app, test_app_builder};
    use crate::http::Route;

    fn get(app: &Arc<App>, path: &str) -> ResponseParts {
        dispatch(app, RequestInfo::get(path))
    }

    #[test]
    fn unknown_path_is_404() {
        let app = test_app();
        let parts = get(&app, "/nowhere");
        assert_eq!(parts.status, 404);
    }

    #[test]
    fn route_handler_runs_with_path_args() {
        let app = test_app_builder()
            .route(
                "hello",
                Route::new(|ctx| {
                    ctx.write_str(&format!("args={}", ctx.path_args().join(",")));
                    Outcome::ok()
                })
                .anon(),
            )
            .build()
            .unwrap();
        let parts = get(&app, "/hello/a//b");
        assert_eq!(parts.status, 200);
        // Empty segments vanish, the rest become positional args.
        assert_eq!(parts.body_str(), "args=a,b");
    }

    #[test]
    fn root_path_routes_to_slash() {
        let app = test_app_builder()
            .route(
                "/",
                Route::new(|ctx| {
                    ctx.write_str("home");
                    Outcome::ok()
                })
                .anon(),
            )
            .build()
            .unwrap();
        assert_eq!(get(&app, "/").body_str(), "home");
    }

    #[test]
    fn non_tls_get_redirects_to_https() {
        let app = test_app();
        let request = RequestInfo::get("/page?x=1").with_tls(false).with_host("example.com");
        let parts = dispatch(&app, request);
        assert_eq!(parts.status, 301);
        assert_eq!(parts.header("Location"), Some("https://example.com/page?x=1"));
    }

    #[test]
    fn non_tls_post_redirects_to_root() {
        let app = test_app_builder().canonical_host("example.com").build().unwrap();
        let request = RequestInfo::post("/submit", "body").with_tls(false).with_host("example.com");
        let parts = dispatch(&app, request);
        assert_eq!(parts.status, 301);
        assert_eq!(parts.header("Location"), Some("https://example.com/"));
    }

    #[test]
    fn wrong_host_redirects_but_cron_is_exempt() {
        let app = test_app_builder()
            .canonical_host("example.com")
            .route(
                "report",
                Route::new(|ctx| {
                    ctx.write_str("ran");
                    Outcome::ok()
                })
                .cron(),
            )
            .build()
            .unwrap();
        let wrong = RequestInfo::get("/report").with_host("other.com");
        assert_eq!(dispatch(&app, wrong).status, 301);
        let cron = RequestInfo::get("/report")
            .with_host("other.com")
            .with_header("x-appengine-cron", "true");
        let parts = dispatch(&app, cron);
        assert_eq!(parts.status, 200);
        assert_eq!(parts.body_str(), "ran");
    }

    #[test]
    fn cron_route_without_header_is_404() {
        let app = test_app_builder()
            .route("report", Route::new(|_| Outcome::ok()).cron())
            .build()
            .unwrap();
        assert_eq!(get(&app, "/report").status, 404);
    }

    #[test]
    fn auth_required_route_redirects_to_login() {
        let app = test_app_builder()
            .login_url("https://example.com/login")
            .route("account", Route::new(|_| Outcome::ok()))
            .build()
            .unwrap();
        let parts = get(&app, "/account");
        assert_eq!(parts.status, 301);
        assert_eq!(
            parts.header("Location"),
            Some("https://example.com/login?redirect=%2Faccount")
        );
    }

    #[test]
    fn xsrf_route_rejects_bad_token() {
        let app = test_app_builder()
            .route("save", Route::new(|_| Outcome::ok()).anon().xsrf())
            .build()
            .unwrap();
        let request = RequestInfo::post("/save", "xsrf=bogus")
            .with_header("content-type", "application/x-www-form-urlencoded");
        assert_eq!(dispatch(&app, request).status, 404);
    }

    #[test]
    fn xsrf_route_accepts_the_request_secret() {
        let app = test_app();
        // Mint the secret the way a rendered form would have.
        let mint = Context::new_root(app.clone(), RequestInfo::get("/form"));
        let secret = mint.xsrf();
        let cookie_line = {
            let response = mint.node.shared.response.lock().unwrap();
            response.cookies[0].clone()
        };
        let cookie = cookie_line.split(';').next().unwrap().to_string();

        let app = test_app_builder()
            .route(
                "save",
                Route::new(|ctx| {
                    ctx.write_str("saved");
                    Outcome::ok()
                })
                .anon()
                .xsrf(),
            )
            .build()
            .unwrap();
        let request = RequestInfo::post("/save", format!("xsrf={secret}"))
            .with_header("content-type", "application/x-www-form-urlencoded")
            .with_header("cookie", &cookie);
        let parts = dispatch(&app, request);
        assert_eq!(parts.status, 200);
        assert_eq!(parts.body_str(), "saved");
    }

    #[test]
    fn handler_error_becomes_500() {
        let app = test_app_builder()
            .route("boom", Route::new(|_| anyhow::bail!("backend down")).anon())
            .build()
            .unwrap();
        let parts = get(&app, "/boom");
        assert_eq!(parts.status, 500);
        // Internal error text never reaches the client.
        assert!(!parts.body_str().contains("backend down"));
    }

    #[test]
    fn handler_panic_becomes_500() {
        let app = test_app_builder()
            .route("panic", Route::new(|_| panic!("unreachable state")).anon())
            .build()
            .unwrap();
        let parts = get(&app, "/panic");
        assert_eq!(parts.status, 500);
        assert!(!parts.body_str().contains("unreachable state"));
    }

    #[test]
    fn handler_outcomes_map_to_responses() {
        let app = test_app_builder()
            .route("gone", Route::new(|_| Outcome::not_found()).anon())
            .route("moved", Route::new(|_| Outcome::redirect("https://example.com/new")).anon())
            .build()
            .unwrap();
        assert_eq!(get(&app, "/gone").status, 404);
        let parts = get(&app, "/moved");
        assert_eq!(parts.status, 301);
        assert_eq!(parts.header("Location"), Some("https://example.com/new"));
    }

    #[test]
    fn dynamic_lookup_resolves_unregistered_paths() {
        let app = test_app_builder()
            .lookup(|_ctx, segment| {
                if segment == "projects" {
                    Some(
                        Route::new(|ctx| {
                            ctx.write_str("project page");
                            Outcome::ok()
                        })
                        .anon(),
                    )
                } else {
                    None
                }
            })
            .build()
            .unwrap();
        assert_eq!(get(&app, "/projects/42").body_str(), "project page");
        assert_eq!(get(&app, "/unknown").status, 404);
    }
}
