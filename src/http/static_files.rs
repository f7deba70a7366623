//! Static asset serving
//!
//! Registered specs map a leading path segment to either a single file
//! or a directory subtree. In dev mode assets come straight from disk
//! and reload when their mtime changes; otherwise they come from blob
//! storage under `static/`, are cached in memory with a sha256 etag,
//! and revalidate against the blob after a fixed window.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use super::Disposition;
use crate::app::App;
use crate::context::Context;

/// How long a cached blob entry is trusted before re-reading
const REVALIDATE_WINDOW: Duration = Duration::from_secs(2 * 60 * 60);

/// A static route registration
#[derive(Debug, Clone)]
pub struct StaticSpec {
    file: Option<String>,
    directory: Option<String>,
    /// Client-side Cache-Control max-age
    expiration: Duration,
}

impl StaticSpec {
    /// Serve exactly one file, ignoring extra path segments
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            file: Some(path.into()),
            directory: None,
            expiration: Duration::from_secs(3600),
        }
    }

    /// Serve a directory subtree; remaining path segments select the file
    pub fn directory(dir: impl Into<String>) -> Self {
        Self {
            file: None,
            directory: Some(dir.into()),
            expiration: Duration::from_secs(3600),
        }
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = expiration;
        self
    }
}

/// A cached asset
#[derive(Debug, Clone)]
pub(crate) struct StaticEntry {
    data: Vec<u8>,
    etag: String,
    mimetype: String,
    /// Disk mtime backing the entry (dev mode only)
    modified: Option<SystemTime>,
    /// When the blob should be consulted again
    valid_until: Option<Instant>,
}

/// Content type from the file extension, with a charset for text
fn mimetype_for(path: &str) -> String {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let mut mimetype = mime.to_string();
    if mime.type_() == mime_guess::mime::TEXT && !mimetype.contains("charset") {
        mimetype.push_str("; charset=utf-8");
    }
    mimetype
}

/// The relative path a spec plus the request's path args select, or
/// `None` when the request escapes the registration.
fn resolve_path(spec: &StaticSpec, args: &[String]) -> Option<String> {
    if let Some(file) = &spec.file {
        return Some(file.clone());
    }
    let dir = spec.directory.as_ref()?;
    if args.is_empty() {
        return None;
    }
    for arg in args {
        if arg == ".." || arg == "." || arg.contains('\\') {
            return None;
        }
    }
    if dir.is_empty() {
        Some(args.join("/"))
    } else {
        Some(format!("{dir}/{}", args.join("/")))
    }
}

pub(crate) fn serve(app: &Arc<App>, ctx: &Context, spec: &StaticSpec) -> Disposition {
    let Some(rel) = resolve_path(spec, &ctx.path_args()) else {
        return Disposition::NotFound;
    };
    let entry = if app.config().dev_mode {
        load_from_disk(app, &rel)
    } else {
        load_from_blobs(app, ctx, &rel)
    };
    let Some(entry) = entry else {
        return Disposition::NotFound;
    };
    ctx.set_response_header("Content-Type", &entry.mimetype);
    if ctx.response_cache_public(&entry.etag, spec.expiration) {
        return Disposition::NotModified;
    }
    ctx.direct_output(entry.data);
    Disposition::Handled
}

/// Dev-mode loader: the working tree is the source of truth, so a
/// changed mtime invalidates the cached copy immediately.
fn load_from_disk(app: &Arc<App>, rel: &str) -> Option<StaticEntry> {
    let path: PathBuf = Path::new(&app.config().static_dir).join(rel);
    let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
    {
        let cache = app.static_cache().read().unwrap();
        if let Some(entry) = cache.get(rel) {
            if entry.modified == modified && modified.is_some() {
                return Some(entry.clone());
            }
        }
    }
    let data = match std::fs::read(&path) {
        Ok(data) => data,
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                log::error!("couldn't read static file {}: {err}", path.display());
            }
            app.static_cache().write().unwrap().remove(rel);
            return None;
        }
    };
    let entry = StaticEntry {
        etag: hex::encode(Sha256::digest(&data)),
        mimetype: mimetype_for(rel),
        data,
        modified,
        valid_until: None,
    };
    app.static_cache().write().unwrap().insert(rel.to_string(), entry.clone());
    Some(entry)
}

/// Deployed loader: assets live in blob storage under `static/` and
/// cached copies are refreshed after the revalidation window.
fn load_from_blobs(app: &Arc<App>, ctx: &Context, rel: &str) -> Option<StaticEntry> {
    {
        let cache = app.static_cache().read().unwrap();
        if let Some(entry) = cache.get(rel) {
            if entry.valid_until.map(|t| Instant::now() < t).unwrap_or(false) {
                return Some(entry.clone());
            }
        }
    }
    let data = match ctx.blob_read(&format!("static/{rel}")) {
        Ok(Some(data)) => data,
        Ok(None) => {
            app.static_cache().write().unwrap().remove(rel);
            return None;
        }
        Err(err) => {
            log::error!("couldn't read static blob {rel}: {err}");
            // Serve the stale copy rather than failing the request.
            return app.static_cache().read().unwrap().get(rel).cloned();
        }
    };
    let entry = StaticEntry {
        etag: hex::encode(Sha256::digest(&data)),
        mimetype: mimetype_for(rel),
        data,
        modified: None,
        valid_until: Some(Instant::now() + REVALIDATE_WINDOW),
    };
    app.static_cache().write().unwrap().insert(rel.to_string(), entry.clone());
    Some(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{test_app_builder, App};
    use crate::blob::BlobStore;
    use crate::context::RequestInfo;
    use crate::http::dispatcher::dispatch;

    fn blob_app() -> Arc<App> {
        let app = test_app_builder()
            .static_route("assets", StaticSpec::directory("site"))
            .static_route("favicon.ico", StaticSpec::file("favicon.ico"))
            .build()
            .unwrap();
        let ctx = Context::background(app.clone());
        app.blobs().write(&ctx, "static/site/app.css", b"body { margin: 0 }".to_vec()).unwrap();
        app.blobs().write(&ctx, "static/favicon.ico", vec![0, 1, 2, 3]).unwrap();
        app
    }

    #[test]
    fn directory_asset_served_with_etag() {
        let app = blob_app();
        let parts = dispatch(&app, RequestInfo::get("/assets/app.css"));
        assert_eq!(parts.status, 200);
        assert_eq!(parts.body_str(), "body { margin: 0 }");
        assert_eq!(parts.header("Content-Type"), Some("text/css; charset=utf-8"));
        let etag = parts.header("ETag").unwrap().to_string();
        assert!(etag.starts_with('"') && etag.ends_with('"'));

        // Conditional revalidation short-circuits to 304 with no body.
        let request = RequestInfo::get("/assets/app.css").with_header("if-none-match", &etag);
        let parts = dispatch(&app, request);
        assert_eq!(parts.status, 304);
        assert!(parts.body.is_empty());
    }

    #[test]
    fn single_file_spec_ignores_missing_args() {
        let app = blob_app();
        let parts = dispatch(&app, RequestInfo::get("/favicon.ico"));
        assert_eq!(parts.status, 200);
        assert_eq!(parts.body, vec![0, 1, 2, 3]);
    }

    #[test]
    fn traversal_and_missing_paths_are_404() {
        let app = blob_app();
        assert_eq!(dispatch(&app, RequestInfo::get("/assets/../secret")).status, 404);
        assert_eq!(dispatch(&app, RequestInfo::get("/assets/absent.css")).status, 404);
        assert_eq!(dispatch(&app, RequestInfo::get("/assets")).status, 404);
    }

    #[test]
    fn dev_mode_reads_from_disk_and_tracks_mtime() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.js"), "console.log(1)").unwrap();
        let app = test_app_builder()
            .dev_mode()
            .static_dir(dir.path().to_str().unwrap())
            .static_route("js", StaticSpec::directory(""))
            .build()
            .unwrap();
        // Directory spec with an empty root serves straight from static_dir.
        let parts = dispatch(&app, RequestInfo::get("/js/app.js"));
        assert_eq!(parts.status, 200);
        assert_eq!(parts.body_str(), "console.log(1)");

        // Rewrite with a bumped mtime; the cache must notice.
        std::fs::write(dir.path().join("app.js"), "console.log(2)").unwrap();
        let future = SystemTime::now() + Duration::from_secs(5);
        let file = std::fs::File::options()
            .write(true)
            .open(dir.path().join("app.js"))
            .unwrap();
        file.set_modified(future).unwrap();
        let parts = dispatch(&app, RequestInfo::get("/js/app.js"));
        assert_eq!(parts.body_str(), "console.log(2)");
    }

    #[test]
    fn mimetypes_carry_charset_for_text() {
        assert_eq!(mimetype_for("a/app.css"), "text/css; charset=utf-8");
        assert_eq!(mimetype_for("logo.png"), "image/png");
        assert_eq!(mimetype_for("blob.bin"), "application/octet-stream");
    }
}
