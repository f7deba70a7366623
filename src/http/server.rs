//! hyper binding
//!
//! The server owns the transport only: it accepts connections, reads
//! bodies, hands [`RequestInfo`] to the pipeline on the blocking pool
//! and writes [`ResponseParts`] back. All request semantics live in
//! [`dispatcher`](super::dispatcher), which is why the pipeline stays
//! testable without a socket.

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::net::TcpListener;

use super::{dispatcher, ResponseParts};
use crate::app::App;
use crate::context::RequestInfo;

impl App {
    /// Accept loop. Runs until the listener fails.
    pub async fn serve(self: Arc<Self>) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.config().host, self.config().port);
        let listener = TcpListener::bind(&addr).await?;
        log::info!("listening on http://{addr}");
        loop {
            let (stream, remote) = listener.accept().await?;
            let app = self.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| handle(app.clone(), req));
                if let Err(err) =
                    http1::Builder::new().serve_connection(io, service).await
                {
                    log::debug!("connection from {remote} ended: {err}");
                }
            });
        }
    }
}

async fn handle(
    app: Arc<App>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            log::warn!("couldn't read request body: {err}");
            return Ok(plain_status(StatusCode::BAD_REQUEST));
        }
    };
    if body.len() > app.config().max_body_size {
        return Ok(plain_status(StatusCode::PAYLOAD_TOO_LARGE));
    }

    let host = parts
        .headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    // Behind the load balancer TLS terminates upstream and arrives as
    // a header; a dev server speaks plain HTTP on localhost.
    let tls = parts
        .headers
        .get("x-forwarded-proto")
        .map(|v| v == "https")
        .unwrap_or(false);
    let request = RequestInfo {
        method: parts.method,
        host,
        path: parts.uri.path().to_string(),
        query: parts.uri.query().unwrap_or_default().to_string(),
        headers: parts.headers,
        body,
        tls,
    };

    // The pipeline is synchronous and may block on backends, so it
    // runs on the blocking pool rather than a reactor thread.
    let response = match tokio::task::spawn_blocking(move || dispatcher::dispatch(&app, request))
        .await
    {
        Ok(response) => response,
        Err(err) => {
            log::error!("request task aborted: {err}");
            return Ok(plain_status(StatusCode::INTERNAL_SERVER_ERROR));
        }
    };
    Ok(into_hyper(response))
}

fn plain_status(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_LENGTH, "0")
        .body(Full::new(Bytes::new()))
        .unwrap()
}

fn into_hyper(parts: ResponseParts) -> Response<Full<Bytes>> {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(parts.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR));
    for (name, value) in &parts.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    for cookie in &parts.cookies {
        builder = builder.header(http::header::SET_COOKIE, cookie.as_str());
    }
    builder
        .body(Full::new(Bytes::from(parts.body)))
        .unwrap_or_else(|err| {
            log::error!("couldn't assemble response: {err}");
            plain_status(StatusCode::INTERNAL_SERVER_ERROR)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn response_conversion_keeps_headers_and_cookies() {
        let parts = ResponseParts {
            status: 200,
            headers: HashMap::from([("Content-Type".to_string(), "text/plain".to_string())]),
            cookies: vec!["a=1; HttpOnly".to_string(), "b=2; HttpOnly".to_string()],
            body: b"hi".to_vec(),
        };
        let response = into_hyper(parts);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("content-type").unwrap(), "text/plain");
        let cookies: Vec<_> = response.headers().get_all(http::header::SET_COOKIE).iter().collect();
        assert_eq!(cookies.len(), 2);
    }

    #[test]
    fn bad_status_codes_collapse_to_500() {
        let parts = ResponseParts {
            status: 9999,
            headers: HashMap::new(),
            cookies: vec![],
            body: vec![],
        };
        assert_eq!(into_hyper(parts).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
