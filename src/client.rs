//! HTTP and WebSocket plumbing shared by the REST provider adapters.
//!
//! One [`ProviderClient`] per configured backend: it injects auth headers,
//! encodes bodies, maps non-2xx responses through the error classifier, and
//! exposes streaming readers for SSE/NDJSON bodies and WebSocket upgrades.
//! It never retries; retry policy belongs to call sites.

use std::pin::Pin;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::error::{classify_http, DriverResult, ErrorContext, SandboxError};
use crate::types::{ChunkStream, ProcessChunk, Provider};

/// Extracts a human-readable message from a provider's error envelope.
/// Returning `None` falls back to the raw body text.
pub type EnvelopeFn = fn(&serde_json::Value) -> Option<String>;

/// Decodes one WebSocket frame into a process chunk. `None` drops the frame.
pub type FrameDecoder = fn(Message) -> Option<ProcessChunk>;

/// A stream of decoded text records (SSE `data:` payloads or NDJSON lines).
pub type RecordStream = Pin<Box<dyn Stream<Item = String> + Send>>;

#[derive(Clone)]
pub struct ProviderClient {
    http: reqwest::Client,
    provider: Provider,
    base_url: String,
    headers: Vec<(String, String)>,
    timeout: Duration,
    envelope: Option<EnvelopeFn>,
}

impl ProviderClient {
    pub fn new(provider: Provider, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            provider,
            base_url: base_url.into(),
            headers: Vec::new(),
            timeout,
            envelope: None,
        }
    }

    pub fn with_bearer(self, token: &str) -> Self {
        self.with_header("Authorization", format!("Bearer {token}"))
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    /// Install a provider-specific error envelope parser (for bodies like
    /// Cloudflare's `{success, errors[]}`).
    pub fn with_envelope(mut self, envelope: EnvelopeFn) -> Self {
        self.envelope = Some(envelope);
        self
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, base: &str, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", base.trim_end_matches('/'), path)
        }
    }

    fn builder(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, url).timeout(self.timeout);
        for (name, value) in &self.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        req
    }

    fn transport_error(&self, op: &str, e: reqwest::Error) -> SandboxError {
        let err = if e.is_timeout() {
            SandboxError::timeout(e.to_string())
        } else {
            SandboxError::network(e.to_string())
        };
        err.with_provider(self.provider).with_operation(op).with_source(e)
    }

    async fn check(
        &self,
        op: &str,
        response: reqwest::Response,
    ) -> DriverResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.unwrap_or_default();
        let message = self
            .envelope
            .and_then(|f| serde_json::from_str::<serde_json::Value>(&body).ok().and_then(|v| f(&v)))
            .unwrap_or_else(|| {
                let trimmed = body.trim();
                if trimmed.is_empty() {
                    status.to_string()
                } else {
                    trimmed.chars().take(400).collect()
                }
            });
        Err(classify_http(
            status.as_u16(),
            message,
            retry_after.as_deref(),
            ErrorContext {
                provider: Some(self.provider),
                operation: op.to_string(),
                ..Default::default()
            },
        ))
    }

    async fn send(
        &self,
        method: reqwest::Method,
        base: &str,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> DriverResult<reqwest::Response> {
        let op = format!("{method} {path}");
        let url = self.url(base, path);
        debug!(provider = %self.provider, %op, "provider request");
        let mut req = self.builder(method, &url);
        if let Some(body) = body {
            req = req.json(body);
        }
        let response = req.send().await.map_err(|e| self.transport_error(&op, e))?;
        self.check(&op, response).await
    }

    /// Issue a request and decode the JSON response.
    pub async fn request_json<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> DriverResult<T> {
        let op = format!("{method} {path}");
        let response = self.send(method, &self.base_url, path, body).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| self.transport_error(&op, e))
    }

    /// Issue a request and discard the response body.
    pub async fn request_empty(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> DriverResult<()> {
        self.send(method, &self.base_url, path, body).await.map(|_| ())
    }

    /// Issue a request and return the raw response bytes (downloads).
    pub async fn request_bytes(
        &self,
        method: reqwest::Method,
        path: &str,
    ) -> DriverResult<Bytes> {
        let op = format!("{method} {path}");
        let response = self.send(method, &self.base_url, path, None).await?;
        response
            .bytes()
            .await
            .map_err(|e| self.transport_error(&op, e))
    }

    /// Issue a request against a per-sandbox base URL (backends where each
    /// sandbox exposes its own HTTP endpoint).
    pub async fn sandbox_request<T: DeserializeOwned>(
        &self,
        sandbox_base: &str,
        method: reqwest::Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> DriverResult<T> {
        let op = format!("{method} {path}");
        let response = self.send(method, sandbox_base, path, body).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| self.transport_error(&op, e))
    }

    /// Same as [`sandbox_request`](Self::sandbox_request) but ignores the
    /// response body.
    pub async fn sandbox_request_empty(
        &self,
        sandbox_base: &str,
        method: reqwest::Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> DriverResult<()> {
        self.send(method, sandbox_base, path, body).await.map(|_| ())
    }

    /// Multipart upload (file APIs that take form data).
    pub async fn upload_multipart(
        &self,
        path: &str,
        field: &str,
        file_name: &str,
        data: Bytes,
    ) -> DriverResult<()> {
        let op = format!("POST {path}");
        let url = self.url(&self.base_url, path);
        let part = reqwest::multipart::Part::bytes(data.to_vec()).file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new().part(field.to_string(), part);
        let response = self
            .builder(reqwest::Method::POST, &url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.transport_error(&op, e))?;
        self.check(&op, response).await.map(|_| ())
    }

    /// Open a streaming GET and yield decoded records: the body is split on
    /// newlines, `data: ` prefixes are stripped, blanks and SSE comments are
    /// skipped.
    pub async fn stream_records(&self, path: &str) -> DriverResult<RecordStream> {
        let op = format!("GET {path}");
        let url = self.url(&self.base_url, path);
        let mut req = self.builder(reqwest::Method::GET, &url);
        // Streams outlive the per-request deadline on purpose.
        req = req.timeout(Duration::from_secs(24 * 3600));
        let response = req.send().await.map_err(|e| self.transport_error(&op, e))?;
        let response = self.check(&op, response).await?;
        Ok(records_from(response))
    }

    /// Upgrade to a WebSocket and map text/binary frames into process
    /// chunks via `decode`. Auth travels in request headers, never in the
    /// URL.
    pub async fn ws_chunks(&self, url: &str, decode: FrameDecoder) -> DriverResult<ChunkStream> {
        let op = format!("WS {url}");
        let mut request = url
            .into_client_request()
            .map_err(|e| SandboxError::validation(format!("bad websocket url: {e}")))?;
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<tokio_tungstenite::tungstenite::http::HeaderName>(),
                value.parse::<tokio_tungstenite::tungstenite::http::HeaderValue>(),
            ) {
                request.headers_mut().insert(name, value);
            }
        }
        let (socket, _) = connect_async(request).await.map_err(|e| {
            SandboxError::network(format!("websocket connect failed: {e}"))
                .with_provider(self.provider)
                .with_operation(op)
        })?;
        let (_, mut read) = futures::StreamExt::split(socket);
        let stream = async_stream::stream! {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Close(_)) | Err(_) => return,
                    Ok(message) => {
                        if let Some(chunk) = decode(message) {
                            yield chunk;
                        }
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Split a streaming response body into decoded records.
fn records_from(response: reqwest::Response) -> RecordStream {
    let mut body = response.bytes_stream();
    let stream = async_stream::stream! {
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            let Ok(chunk) = chunk else { return };
            buf.extend_from_slice(&chunk);
            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line = buf.split_to(pos + 1);
                let Ok(text) = std::str::from_utf8(&line) else { continue };
                let text = text.trim_end_matches(['\n', '\r']);
                let record = text
                    .strip_prefix("data: ")
                    .or_else(|| text.strip_prefix("data:"))
                    .unwrap_or(text);
                if record.is_empty()
                    || record.starts_with(':')
                    || record.starts_with("event:")
                    || record.starts_with("id:")
                {
                    continue;
                }
                yield record.to_string();
            }
        }
    };
    Box::pin(stream)
}

/// Subscribe to an SSE/NDJSON endpoint outside any provider client (the
/// in-sandbox agent stream).
pub async fn sse_records(url: &str) -> DriverResult<RecordStream> {
    let client = reqwest::Client::new();
    let response = client
        .get(url)
        .timeout(Duration::from_secs(24 * 3600))
        .send()
        .await
        .map_err(|e| SandboxError::network(format!("GET {url}: {e}")))?;
    if !response.status().is_success() {
        return Err(classify_http(
            response.status().as_u16(),
            format!("GET {url} answered {}", response.status()),
            None,
            ErrorContext {
                operation: format!("GET {url}"),
                ..Default::default()
            },
        ));
    }
    Ok(records_from(response))
}

/// Fetch a URL once and report whether it answered with a success status.
/// Used for agent health polling; transport failures read as "not yet".
pub async fn probe_http(url: &str, timeout: Duration) -> bool {
    let client = reqwest::Client::new();
    matches!(
        client.get(url).timeout(timeout).send().await,
        Ok(resp) if resp.status().is_success()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> ProviderClient {
        ProviderClient::new(Provider::E2b, server.uri(), Duration::from_secs(5))
            .with_bearer("key-123")
    }

    #[tokio::test]
    async fn sends_bearer_and_decodes_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sandboxes"))
            .and(header("Authorization", "Bearer key-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"sandboxID": "sbx-1"}
            ])))
            .mount(&server)
            .await;

        let got: serde_json::Value = client_for(&server)
            .request_json(reqwest::Method::GET, "/sandboxes", None)
            .await
            .unwrap();
        assert_eq!(got[0]["sandboxID"], "sbx-1");
    }

    #[tokio::test]
    async fn classifies_404() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sandboxes/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_string("sandbox not found"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .request_json::<serde_json::Value>(reqwest::Method::GET, "/sandboxes/missing", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(err.context.operation, "GET /sandboxes/missing");
        assert_eq!(err.context.provider, Some(Provider::E2b));
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sandboxes"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("Retry-After", "2")
                    .set_body_string("slow down"),
            )
            .mount(&server)
            .await;

        let err = client_for(&server)
            .request_json::<serde_json::Value>(
                reqwest::Method::POST,
                "/sandboxes",
                Some(&serde_json::json!({})),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimited);
        assert_eq!(err.retry_after_ms, Some(2000));
    }

    #[tokio::test]
    async fn envelope_parser_extracts_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
                "success": false,
                "errors": [{"code": 7003, "message": "no route for that URI"}],
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).with_envelope(|value| {
            value["errors"][0]["message"].as_str().map(str::to_string)
        });
        let err = client
            .request_json::<serde_json::Value>(reqwest::Method::GET, "/broken", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Provider);
        assert!(err.message.contains("no route for that URI"));
    }

    #[tokio::test]
    async fn stream_records_strips_sse_framing() {
        let server = MockServer::start().await;
        let body = "event: status\ndata: {\"a\":1}\n\n: keep-alive\ndata: {\"b\":2}\n";
        Mock::given(method("GET"))
            .and(path("/events"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let mut records = client_for(&server).stream_records("/events").await.unwrap();
        let mut collected = Vec::new();
        while let Some(record) = records.next().await {
            collected.push(record);
        }
        assert_eq!(collected, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[tokio::test]
    async fn sandbox_request_hits_alternate_base() {
        let control = MockServer::start().await;
        let sandbox = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/process"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&sandbox)
            .await;

        let got: serde_json::Value = client_for(&control)
            .sandbox_request(&sandbox.uri(), reqwest::Method::GET, "/process", None)
            .await
            .unwrap();
        assert_eq!(got["ok"], true);
    }
}
