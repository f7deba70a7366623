//! Root request/response state and its accessors
//!
//! Everything here reads or mutates state owned by the tree's root:
//! the inbound request, the response under construction, cookies,
//! parsed form fields, the identity cache and the scratch maps. Any
//! node of the tree may call these; they all resolve to the same root
//! state.

use bytes::Bytes;
use http::{HeaderMap, Method};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;

use super::{Context, UserCache};
use crate::blob::BlobError;
use crate::cache::CacheError;
use crate::token::constant_time_eq;

/// The parts of an HTTP request the dispatch pipeline works with
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: Method,
    pub host: String,
    /// Path including the leading `/`
    pub path: String,
    /// Raw query string, without the `?`
    pub query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Whether the request arrived over TLS (or a trusted proxy says so)
    pub tls: bool,
}

impl RequestInfo {
    pub fn new(method: Method, path: &str) -> Self {
        let (path, query) = match path.split_once('?') {
            Some((p, q)) => (p.to_string(), q.to_string()),
            None => (path.to_string(), String::new()),
        };
        Self {
            method,
            host: "localhost".to_string(),
            path,
            query,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            tls: true,
        }
    }

    pub fn get(path: &str) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: &str, body: impl Into<Bytes>) -> Self {
        let mut req = Self::new(Method::POST, path);
        req.body = body.into();
        req
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(value) = value.parse() {
            self.headers.append(name, value);
        }
        self
    }

    /// First value of a header, as a string
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Raw cookie value from the Cookie header(s)
    fn cookie(&self, name: &str) -> Option<String> {
        for header in self.headers.get_all(http::header::COOKIE) {
            let Ok(header) = header.to_str() else { continue };
            for pair in header.split(';') {
                if let Some((k, v)) = pair.trim().split_once('=') {
                    if k == name {
                        return Some(v.to_string());
                    }
                }
            }
        }
        None
    }
}

fn parse_form(input: &str, into: &mut HashMap<String, Vec<String>>) {
    for pair in input.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        let k = urlencoding::decode(k).map(|s| s.into_owned()).unwrap_or_else(|_| k.to_string());
        let v = v.replace('+', " ");
        let v = urlencoding::decode(&v).map(|s| s.into_owned()).unwrap_or(v);
        into.entry(k).or_default().push(v);
    }
}

impl Context {
    pub fn request(&self) -> &RequestInfo {
        &self.node.shared.request
    }

    pub(crate) fn set_path_args(&self, args: Vec<String>) {
        *self.node.shared.path_args.lock().unwrap() = args;
    }

    /// Positional path segments left over after route resolution
    pub fn path_args(&self) -> Vec<String> {
        self.node.shared.path_args.lock().unwrap().clone()
    }

    fn with_fields<T>(&self, f: impl FnOnce(&HashMap<String, Vec<String>>) -> T) -> T {
        let mut fields = self.node.shared.fields.lock().unwrap();
        if fields.is_none() {
            let mut parsed = HashMap::new();
            let request = self.request();
            parse_form(&request.query, &mut parsed);
            if request.method == Method::POST {
                let form = request
                    .header(http::header::CONTENT_TYPE.as_str())
                    .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
                    .unwrap_or(false);
                if form {
                    match std::str::from_utf8(&request.body) {
                        Ok(body) => parse_form(body, &mut parsed),
                        Err(err) => log::error!("couldn't parse POST body: {err}"),
                    }
                }
            }
            *fields = Some(parsed);
        }
        f(fields.as_ref().unwrap())
    }

    /// Form/query field value; empty string when absent
    pub fn string_field(&self, name: &str) -> String {
        self.with_fields(|fields| {
            fields.get(name).and_then(|v| v.first()).cloned().unwrap_or_default()
        })
    }

    /// All values of a repeated field
    pub fn string_slice_field(&self, name: &str) -> Vec<String> {
        self.with_fields(|fields| fields.get(name).cloned().unwrap_or_default())
    }

    /// Field parsed as i64; zero when absent or malformed
    pub fn int_field(&self, name: &str) -> i64 {
        self.string_field(name).parse().unwrap_or(0)
    }

    /// Field presence as a boolean
    pub fn bool_field(&self, name: &str) -> bool {
        !self.string_field(name).is_empty()
    }

    /// Decode a JSON request body. The content type must say JSON.
    pub fn decode_json<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        let ct = self
            .request()
            .header(http::header::CONTENT_TYPE.as_str())
            .unwrap_or_default()
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        if ct != "application/json" {
            anyhow::bail!("unsupported content type for decoding JSON: {ct:?}");
        }
        Ok(serde_json::from_slice(&self.request().body)?)
    }

    /// Serialize a JSON response into the output buffer
    pub fn encode_json<T: Serialize>(&self, value: &T) -> anyhow::Result<()> {
        self.set_response_header("Content-Type", "application/json");
        let mut response = self.node.shared.response.lock().unwrap();
        serde_json::to_writer(&mut response.buffer, value)?;
        Ok(())
    }

    /// Append to the response body buffer
    pub fn write(&self, bytes: &[u8]) {
        self.node.shared.response.lock().unwrap().buffer.extend_from_slice(bytes);
    }

    pub fn write_str(&self, s: &str) {
        self.write(s.as_bytes());
    }

    /// Replace the response body wholesale, bypassing the buffer
    pub fn direct_output(&self, bytes: Vec<u8>) {
        self.node.shared.response.lock().unwrap().direct = Some(bytes);
    }

    pub fn set_response_status(&self, status: u16) {
        self.node.shared.response.lock().unwrap().status = status;
    }

    pub fn set_response_header(&self, name: &str, value: &str) {
        self.node
            .shared
            .response
            .lock()
            .unwrap()
            .headers
            .insert(name.to_string(), value.to_string());
    }

    pub fn clear_response_headers(&self) {
        let mut response = self.node.shared.response.lock().unwrap();
        response.headers.clear();
        response.cookies.clear();
    }

    /// Set ETag/Cache-Control headers and report whether the client's
    /// If-None-Match already matches (i.e. a 304 is in order).
    pub fn response_cache_public(&self, etag: &str, max_age: std::time::Duration) -> bool {
        self.set_response_header("ETag", &format!("\"{etag}\""));
        self.set_response_header(
            "Cache-Control",
            &format!("public, max-age={}", max_age.as_secs()),
        );
        match self.request().header(http::header::IF_NONE_MATCH.as_str()) {
            Some(got) => got.trim_matches('"') == etag,
            None => false,
        }
    }

    /// Signed cookie value, or empty-equivalent `None` when the cookie
    /// is absent, expired or tampered with
    pub fn get_cookie(&self, name: &str) -> Option<String> {
        let raw = self.request().cookie(name)?;
        self.parse_secure_token(&format!("cookie/{name}"), &raw)
    }

    /// Write a signed cookie. HttpOnly always; Secure outside dev mode.
    pub fn set_cookie(&self, name: &str, value: &str) {
        let app = self.app().clone();
        let token = app.token_keys().sign(
            &format!("cookie/{name}"),
            value,
            app.config().cookie_duration(),
        );
        let mut cookie = format!(
            "{name}={token}; Path=/; Max-Age={}; HttpOnly",
            app.config().cookie_seconds()
        );
        if !app.config().dev_mode {
            cookie.push_str("; Secure");
        }
        self.node.shared.response.lock().unwrap().cookies.push(cookie);
    }

    /// Instruct the client to drop a cookie
    pub fn expire_cookie(&self, name: &str) {
        let mut cookie =
            format!("{name}=; Path=/; Expires=Thu, 01 Jan 1970 00:00:00 GMT; Max-Age=0; HttpOnly");
        if !self.app().config().dev_mode {
            cookie.push_str("; Secure");
        }
        self.node.shared.response.lock().unwrap().cookies.push(cookie);
    }

    /// Sign a value under `label` with the current signing key
    pub fn secure_token(&self, label: &str, value: &str) -> String {
        let app = self.app();
        app.token_keys().sign(label, value, app.config().token_duration())
    }

    /// Verify a wire token against `label`
    pub fn parse_secure_token(&self, label: &str, wire: &str) -> Option<String> {
        self.app().token_keys().verify(label, wire)
    }

    /// The request's XSRF secret: read from the xsrf cookie, or minted
    /// (and set as a cookie) on first use.
    pub fn xsrf(&self) -> String {
        {
            let identity = self.node.shared.identity.lock().unwrap();
            if let Some(xsrf) = &identity.xsrf {
                return xsrf.clone();
            }
        }
        let xsrf = match self.get_cookie("xsrf") {
            Some(existing) => existing,
            None => {
                let mut buf = [0u8; 36];
                rand::thread_rng().fill_bytes(&mut buf);
                let minted = hex::encode(buf);
                self.set_cookie("xsrf", &minted);
                minted
            }
        };
        self.node.shared.identity.lock().unwrap().xsrf = Some(xsrf.clone());
        xsrf
    }

    /// Check the `xsrf` form field against the request's XSRF secret
    pub fn validate_xsrf(&self) -> bool {
        self.validate_xsrf_value(&self.string_field("xsrf"))
    }

    pub fn validate_xsrf_value(&self, value: &str) -> bool {
        constant_time_eq(self.xsrf().as_bytes(), value.as_bytes())
    }

    /// Whether the platform marked this request as a cron invocation.
    /// The header is trusted because the platform strips it from
    /// external traffic. Dev mode always qualifies.
    pub fn is_cron_request(&self) -> bool {
        self.app().config().dev_mode
            || self.request().header(&self.app().config().cron_header).is_some()
    }

    /// Whether this request is a task-queue invocation
    pub fn is_task_request(&self) -> bool {
        self.request().header(&self.app().config().task_header).is_some()
    }

    /// Authenticated user id from the auth cookie; 0 when anonymous.
    /// Both outcomes are cached for the life of the request.
    pub fn user_id(&self) -> i64 {
        {
            let identity = self.node.shared.identity.lock().unwrap();
            match identity.user {
                UserCache::Id(id) => return id,
                UserCache::Anonymous => return 0,
                UserCache::Unknown => {}
            }
        }
        let user = match self.get_cookie("auth").map(|v| v.parse::<i64>()) {
            Some(Ok(id)) if id > 0 => UserCache::Id(id),
            Some(Ok(_)) | None => UserCache::Anonymous,
            Some(Err(err)) => {
                log::error!("couldn't parse user id from auth cookie: {err}");
                UserCache::Anonymous
            }
        };
        self.node.shared.identity.lock().unwrap().user = user;
        match user {
            UserCache::Id(id) => id,
            _ => 0,
        }
    }

    /// Force the identity for this request (login handlers, tests)
    pub fn set_user_id(&self, id: i64) {
        self.node.shared.identity.lock().unwrap().user =
            if id > 0 { UserCache::Id(id) } else { UserCache::Anonymous };
    }

    pub fn is_admin(&self) -> bool {
        let id = self.user_id();
        id != 0 && self.app().config().admin_user_ids.contains(&id)
    }

    /// Build an absolute URL from path elements and `key=`/value pairs:
    /// `ctx.url(&["profile", "edit", "tab=", "billing"])`
    pub fn url(&self, elems: &[&str]) -> String {
        let mut path = Vec::new();
        let mut query = Vec::new();
        let mut key: Option<&str> = None;
        for elem in elems {
            if let Some(k) = key.take() {
                query.push(format!("{}={}", urlencoding::encode(k), urlencoding::encode(elem)));
            } else if let Some(k) = elem.strip_suffix('=') {
                key = Some(k);
            } else {
                path.push(*elem);
            }
        }
        let config = self.app().config();
        let scheme = if config.dev_mode { "http" } else { "https" };
        let host = match (&config.canonical_host, config.dev_mode) {
            (Some(canonical), false) => canonical.clone(),
            _ => self.request().host.clone(),
        };
        let mut url = format!("{scheme}://{host}/{}", path.join("/"));
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query.join("&"));
        }
        url
    }

    // Scratch space.

    pub fn set_string(&self, key: &str, value: &str) {
        self.node.shared.scratch.lock().unwrap().strings.insert(key.into(), value.into());
    }

    pub fn get_string(&self, key: &str) -> String {
        self.node.shared.scratch.lock().unwrap().strings.get(key).cloned().unwrap_or_default()
    }

    pub fn set_int(&self, key: &str, value: i64) {
        self.node.shared.scratch.lock().unwrap().ints.insert(key.into(), value);
    }

    pub fn get_int(&self, key: &str) -> i64 {
        self.node.shared.scratch.lock().unwrap().ints.get(key).copied().unwrap_or(0)
    }

    pub fn set_bool(&self, key: &str, value: bool) {
        self.node.shared.scratch.lock().unwrap().bools.insert(key.into(), value);
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.node.shared.scratch.lock().unwrap().bools.get(key).copied().unwrap_or(false)
    }

    // Cache collaborator. Unexpected failures are logged and treated
    // as misses, the way a memcache outage should degrade.

    pub fn cache_get(&self, key: &str) -> Option<Vec<u8>> {
        self.app().cache().get(key)
    }

    pub fn cache_get_multi(&self, keys: &[&str]) -> HashMap<String, Vec<u8>> {
        self.app().cache().get_multi(keys)
    }

    pub fn cache_set(&self, key: &str, value: Vec<u8>) {
        let ttl = self.app().config().cookie_duration();
        self.app().cache().set(key, value, ttl);
    }

    pub fn cache_set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: std::time::Duration) {
        self.app().cache().set(key, value, ttl);
    }

    pub fn cache_delete(&self, key: &str) {
        self.app().cache().delete(key);
    }

    pub fn cache_increment(&self, key: &str, delta: u64) -> Result<u64, CacheError> {
        self.app().cache().increment(key, delta)
    }

    pub fn cache_decrement(&self, key: &str, delta: u64) -> Result<u64, CacheError> {
        self.app().cache().decrement(key, delta)
    }

    pub fn cache_compare_and_swap(
        &self,
        key: &str,
        old: &[u8],
        new: Vec<u8>,
    ) -> Result<bool, CacheError> {
        self.app().cache().compare_and_swap(key, old, new)
    }

    /// Read a blob, `None` when it does not exist
    pub fn blob_read(&self, path: &str) -> Result<Option<Vec<u8>>, BlobError> {
        let app = self.app().clone();
        let ctx = self.with_timeout(app.config().datastore_timeout());
        let result = app.blobs().read(&ctx, path);
        if !ctx.same_node(self) {
            ctx.cancel();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::test_app;

    #[test]
    fn form_fields_merge_query_and_post_body() {
        let request = RequestInfo::post("/save?a=1&b=x+y", "b=z&empty=")
            .with_header("content-type", "application/x-www-form-urlencoded");
        let ctx = Context::new_root(test_app(), request);
        assert_eq!(ctx.string_field("a"), "1");
        assert_eq!(ctx.int_field("a"), 1);
        assert_eq!(ctx.string_slice_field("b"), vec!["x y".to_string(), "z".to_string()]);
        assert!(!ctx.bool_field("empty"));
        assert!(!ctx.bool_field("missing"));
    }

    #[test]
    fn signed_cookie_round_trip() {
        let app = test_app();
        let ctx = Context::new_root(app.clone(), RequestInfo::get("/"));
        ctx.set_cookie("auth", "42");
        let set_cookie = {
            let response = ctx.node.shared.response.lock().unwrap();
            response.cookies[0].clone()
        };
        assert!(set_cookie.contains("HttpOnly"));
        assert!(set_cookie.contains("Secure"));
        let token = set_cookie
            .strip_prefix("auth=")
            .unwrap()
            .split(';')
            .next()
            .unwrap()
            .to_string();

        // Replay the token on a fresh request, as a browser would.
        let request = RequestInfo::get("/").with_header("cookie", &format!("auth={token}"));
        let next = Context::new_root(app, request);
        assert_eq!(next.get_cookie("auth"), Some("42".to_string()));
        assert_eq!(next.user_id(), 42);
        // A tampered value fails closed.
        let request =
            RequestInfo::get("/").with_header("cookie", &format!("auth={token}0"));
        let bad = Context::new_root(next.app().clone(), request);
        assert_eq!(bad.get_cookie("auth"), None);
        assert_eq!(bad.user_id(), 0);
    }

    #[test]
    fn cookie_label_scoping() {
        let app = test_app();
        let ctx = Context::new_root(app.clone(), RequestInfo::get("/"));
        let token = ctx.secure_token("cookie/auth", "42");
        // A token minted for the auth cookie must not verify as xsrf.
        let request = RequestInfo::get("/").with_header("cookie", &format!("xsrf={token}"));
        let next = Context::new_root(app, request);
        assert_eq!(next.get_cookie("xsrf"), None);
    }

    #[test]
    fn xsrf_minted_once_and_validates() {
        let ctx = Context::new_root(test_app(), RequestInfo::get("/"));
        let secret = ctx.xsrf();
        assert_eq!(ctx.xsrf(), secret);
        assert!(ctx.validate_xsrf_value(&secret));
        assert!(!ctx.validate_xsrf_value("forged"));
        // The mint also set a cookie.
        assert_eq!(ctx.node.shared.response.lock().unwrap().cookies.len(), 1);
    }

    #[test]
    fn url_builder() {
        let app = test_app();
        let ctx = Context::new_root(
            app,
            RequestInfo::get("/").with_host("example.com"),
        );
        assert_eq!(
            ctx.url(&["profile", "edit", "tab=", "billing info"]),
            "https://example.com/profile/edit?tab=billing%20info"
        );
    }

    #[test]
    fn scratch_maps() {
        let ctx = Context::background(test_app());
        let child = ctx.with_timeout(std::time::Duration::from_secs(60));
        child.set_string("title", "Home");
        child.set_int("count", 3);
        child.set_bool("flag", true);
        // Stored on the root, visible from every node.
        assert_eq!(ctx.get_string("title"), "Home");
        assert_eq!(ctx.get_int("count"), 3);
        assert!(ctx.get_bool("flag"));
    }
}
