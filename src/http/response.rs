//! Response assembly and error pages
//!
//! The pipeline's [`Disposition`] plus the root context's response
//! state become concrete [`ResponseParts`]. Error pages are
//! content-negotiated between minimal HTML and JSON bodies and always
//! drop cookies, so a failure can never half-commit session state.

use http::Method;
use std::collections::HashMap;

use super::{prefers_json, Disposition};
use crate::context::Context;

const HTML_404: &str = "<!doctype html>\n<title>Page Not Found</title>\n<h1>Page Not Found</h1>\n";
const HTML_500: &str =
    "<!doctype html>\n<title>Service Unavailable</title>\n<h1>Service Unavailable</h1>\n";
const JSON_404: &str = r#"{"error": "404 page not found"}"#;
const JSON_500: &str = r#"{"error": "500 service unavailable"}"#;

/// A fully assembled response, transport-agnostic
#[derive(Debug)]
pub struct ResponseParts {
    pub status: u16,
    pub headers: HashMap<String, String>,
    /// One Set-Cookie line per entry
    pub cookies: Vec<String>,
    pub body: Vec<u8>,
}

impl ResponseParts {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|s| s.as_str())
    }

    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub(crate) fn serve_404(ctx: &Context) {
    let json = prefers_json(ctx.request().header("accept"));
    let mut response = ctx.node.shared.response.lock().unwrap();
    response.cookies.clear();
    response.headers.clear();
    response.status = 404;
    if json {
        response.headers.insert("Content-Type".into(), "application/json".into());
        response.direct = Some(JSON_404.as_bytes().to_vec());
    } else {
        response.headers.insert("Content-Type".into(), "text/html; charset=utf-8".into());
        response.direct = Some(HTML_404.as_bytes().to_vec());
    }
}

pub(crate) fn serve_500(ctx: &Context) {
    let json = prefers_json(ctx.request().header("accept"));
    let mut response = ctx.node.shared.response.lock().unwrap();
    response.cookies.clear();
    response.headers.clear();
    response.status = 500;
    if json {
        response.headers.insert("Content-Type".into(), "application/json".into());
        response.direct = Some(JSON_500.as_bytes().to_vec());
    } else {
        response.headers.insert("Content-Type".into(), "text/html; charset=utf-8".into());
        response.direct = Some(HTML_500.as_bytes().to_vec());
    }
}

/// Turn the pipeline result and accumulated context state into final
/// response parts.
pub(crate) fn finalize(ctx: &Context, disposition: Disposition) -> ResponseParts {
    match disposition {
        Disposition::Handled => {}
        Disposition::Redirect(url) => {
            let mut response = ctx.node.shared.response.lock().unwrap();
            response.buffer.clear();
            response.direct = None;
            response.headers = HashMap::from([("Location".to_string(), url)]);
            response.status = 301;
        }
        Disposition::NotFound => serve_404(ctx),
        Disposition::NotModified => {
            let mut response = ctx.node.shared.response.lock().unwrap();
            response.buffer.clear();
            response.direct = None;
            response.status = 304;
        }
        Disposition::ServerError => serve_500(ctx),
    }

    let head = ctx.request().method == Method::HEAD;
    let mut response = ctx.node.shared.response.lock().unwrap();
    let body = match response.direct.take() {
        Some(direct) => direct,
        None => std::mem::take(&mut response.buffer),
    };
    let mut headers = std::mem::take(&mut response.headers);
    let has = |headers: &HashMap<String, String>, name: &str| {
        headers.keys().any(|k| k.eq_ignore_ascii_case(name))
    };
    if !has(&headers, "content-length") {
        headers.insert("Content-Length".into(), body.len().to_string());
    }
    if !has(&headers, "content-type") {
        headers.insert("Content-Type".into(), "text/html; charset=utf-8".into());
    }
    // HEAD and 304 carry the metadata, never the body.
    let body = if head || response.status == 304 { Vec::new() } else { body };
    ResponseParts {
        status: response.status,
        headers,
        cookies: std::mem::take(&mut response.cookies),
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::test_app;
    use crate::context::{Context, RequestInfo};

    #[test]
    fn handled_defaults_content_headers() {
        let ctx = Context::new_root(test_app(), RequestInfo::get("/"));
        ctx.write_str("hello");
        let parts = finalize(&ctx, Disposition::Handled);
        assert_eq!(parts.status, 200);
        assert_eq!(parts.header("Content-Length"), Some("5"));
        assert_eq!(parts.header("Content-Type"), Some("text/html; charset=utf-8"));
        assert_eq!(parts.body_str(), "hello");
    }

    #[test]
    fn head_suppresses_body_but_keeps_length() {
        let ctx = Context::new_root(test_app(), RequestInfo::new(Method::HEAD, "/"));
        ctx.write_str("hello");
        let parts = finalize(&ctx, Disposition::Handled);
        assert_eq!(parts.header("Content-Length"), Some("5"));
        assert!(parts.body.is_empty());
    }

    #[test]
    fn not_found_negotiates_json() {
        let request = RequestInfo::get("/nope").with_header("accept", "application/json");
        let ctx = Context::new_root(test_app(), request);
        ctx.set_cookie("auth", "42");
        let parts = finalize(&ctx, Disposition::NotFound);
        assert_eq!(parts.status, 404);
        assert_eq!(parts.header("Content-Type"), Some("application/json"));
        assert!(parts.body_str().contains("404"));
        // Error responses never set cookies.
        assert!(parts.cookies.is_empty());
    }

    #[test]
    fn redirect_discards_buffered_output() {
        let ctx = Context::new_root(test_app(), RequestInfo::get("/old"));
        ctx.write_str("half a page");
        let parts = finalize(&ctx, Disposition::Redirect("https://example.com/new".into()));
        assert_eq!(parts.status, 301);
        assert_eq!(parts.header("Location"), Some("https://example.com/new"));
        assert_eq!(parts.header("Content-Length"), Some("0"));
        assert!(parts.body.is_empty());
    }

    #[test]
    fn not_modified_drops_body() {
        let ctx = Context::new_root(test_app(), RequestInfo::get("/asset"));
        ctx.write_str("cached content");
        let parts = finalize(&ctx, Disposition::NotModified);
        assert_eq!(parts.status, 304);
        assert!(parts.body.is_empty());
    }
}
