//! Streaming HTTP forwarding to upstreams.

use std::time::Duration;

use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName};
use axum::http::Request;
use axum::response::Response;
use tracing::trace;
use url::Url;

use crate::error::{FloodgateError, Result};

/// Headers that describe one connection and must not be forwarded.
static HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// Forwards requests and streams the responses back.
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
}

impl Forwarder {
    /// Build a forwarder whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(|e| FloodgateError::Http(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Send `request` to `target` and stream the upstream response back.
    ///
    /// Fails when the upstream cannot be reached or does not answer in time.
    pub async fn forward(&self, request: Request<Body>, target: Url) -> Result<Response> {
        let (parts, body) = request.into_parts();

        let mut headers = strip_hop_by_hop(&parts.headers);
        headers.remove(header::CONTENT_LENGTH);
        if let Some(host) = parts.headers.get(header::HOST) {
            headers.insert(X_FORWARDED_HOST, host.clone());
        }

        trace!(method = %parts.method, target = %target, "Forwarding request");

        let upstream = self
            .client
            .request(parts.method, target.clone())
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await
            .map_err(|e| {
                let reason = if e.is_timeout() { "timed out" } else { "failed" };
                FloodgateError::Http(format!("upstream request to {target} {reason}: {e}"))
            })?;

        let status = upstream.status();
        let headers = strip_hop_by_hop(upstream.headers());
        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Copy `headers` without hop-by-hop headers, including any the
/// `Connection` header names.
fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if HOP_BY_HOP.contains(name) || listed.contains(name) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Request as AxumRequest;
    use axum::http::{HeaderValue, StatusCode};
    use axum::routing::any;
    use tokio::net::TcpListener;

    /// Echo server returning what it received.
    async fn spawn_echo() -> std::net::SocketAddr {
        let app = axum::Router::new().fallback(any(|request: AxumRequest| async move {
            let (parts, body) = request.into_parts();
            let body = axum::body::to_bytes(body, 1 << 20).await.unwrap();
            let header = |name: &str| {
                parts
                    .headers
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-")
                    .to_string()
            };
            let text = format!(
                "{} {} host={} xfh={} hop={} body={}",
                parts.method,
                parts.uri,
                header("host"),
                header("x-forwarded-host"),
                header("x-custom-hop"),
                String::from_utf8_lossy(&body)
            );
            ([("x-upstream", "echo"), ("connection", "close")], text)
        }));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        addr
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_forward_round_trip() {
        let addr = spawn_echo().await;
        let forwarder = Forwarder::new(Duration::from_secs(5)).unwrap();

        let request = Request::builder()
            .method("POST")
            .uri("/v1/items?x=1")
            .header("host", "api.example.com")
            .header("connection", "x-custom-hop")
            .header("x-custom-hop", "secret")
            .body(Body::from("payload"))
            .unwrap();
        let target = Url::parse(&format!("http://{addr}/items?x=1")).unwrap();

        let response = forwarder.forward(request, target).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-upstream").unwrap(), "echo");
        assert!(response.headers().get("connection").is_none());
        assert_eq!(
            body_text(response).await,
            "POST /items?x=1 host=api.example.com xfh=api.example.com hop=- body=payload"
        );
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_an_error() {
        let forwarder = Forwarder::new(Duration::from_secs(2)).unwrap();
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();

        let err = forwarder
            .forward(request, Url::parse("http://127.0.0.1:1/").unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, FloodgateError::Http(_)));
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-trace"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.append("accept", HeaderValue::from_static("text/html"));
        headers.append("accept", HeaderValue::from_static("application/json"));

        let out = strip_hop_by_hop(&headers);

        assert_eq!(out.len(), 2);
        assert_eq!(out.get_all("accept").iter().count(), 2);
    }
}
