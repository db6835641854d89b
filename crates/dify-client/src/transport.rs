//! HTTP transport seam and the retrying send loop.
//!
//! The client only talks to [`HttpTransport`]; [`ReqwestTransport`] is the
//! default implementation. Tests plug in a scripted transport instead.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Cursor, Read};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, warn};

use crate::errors::{ApiError, DifyError};
use crate::retry::RetryPolicy;

/// Longest raw body excerpt kept in an error message.
const ERROR_BODY_EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

/// File part of a `multipart/form-data` upload.
#[derive(Debug, Clone, PartialEq)]
pub struct MultipartUpload {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub mime: Option<String>,
    /// Plain text form fields sent next to the `file` part.
    pub fields: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(serde_json::Value),
    Multipart(MultipartUpload),
}

/// Fully described request handed to a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    /// Longest wait for the response headers or for any single body read.
    /// A body that keeps producing data is never cut off.
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: RequestBody::Empty,
            timeout: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Returns the first header value with a case-insensitive name match.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Response status plus a body that has not been read yet.
pub struct HttpResponse {
    pub status: u16,
    body: Box<dyn BufRead + Send>,
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl HttpResponse {
    pub fn new(status: u16, body: impl BufRead + Send + 'static) -> Self {
        Self {
            status,
            body: Box::new(body),
        }
    }

    /// Builds a response over an in-memory body.
    pub fn from_text(status: u16, body: impl Into<String>) -> Self {
        Self::new(status, Cursor::new(body.into().into_bytes()))
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn into_body(self) -> Box<dyn BufRead + Send> {
        self.body
    }

    /// Reads the whole body. Only use this for non-streaming responses.
    pub fn into_text(mut self) -> std::io::Result<String> {
        let mut text = String::new();
        self.body.read_to_string(&mut text)?;
        Ok(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    /// The request could not be built (bad URL, header or MIME type).
    Invalid,
    Other,
}

/// Failure to obtain any response at all.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Connect, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Invalid, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Other, message)
    }

    /// Only timeouts and connect failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorKind::Timeout | TransportErrorKind::Connect
        )
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(format!("request timed out: {err}"))
        } else if err.is_connect() {
            Self::connect(format!("connection failed: {err}"))
        } else if err.is_builder() {
            Self::invalid(format!("invalid request: {err}"))
        } else {
            Self::other(format!("request failed: {err}"))
        }
    }
}

impl From<TransportError> for DifyError {
    fn from(value: TransportError) -> Self {
        match value.kind {
            TransportErrorKind::Timeout => DifyError::Timeout {
                message: value.message,
            },
            TransportErrorKind::Invalid => DifyError::Validation(value.message),
            TransportErrorKind::Connect | TransportErrorKind::Other => DifyError::Connection {
                message: value.message,
            },
        }
    }
}

/// HTTP transport abstraction. Implement and pass to `DifyClient::with_transport`.
pub trait HttpTransport: Send + Sync {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Default transport backed by the reqwest blocking client.
///
/// Each distinct request timeout gets its own client whose timeout applies
/// per wait (connecting, receiving headers, each body read). The per-request
/// reqwest timeout is never set because it caps the body as a whole.
pub struct ReqwestTransport {
    clients: Mutex<HashMap<Option<Duration>, reqwest::blocking::Client>>,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, DifyError> {
        let transport = Self {
            clients: Mutex::new(HashMap::new()),
        };
        transport.client(None).map_err(|e| DifyError::Config(e.message))?;
        Ok(transport)
    }

    fn client(
        &self,
        timeout: Option<Duration>,
    ) -> Result<reqwest::blocking::Client, TransportError> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(&timeout) {
            return Ok(client.clone());
        }
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("dify-client/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::invalid(format!("failed to build HTTP client: {e}")))?;
        clients.insert(timeout, client.clone());
        Ok(client)
    }
}

impl HttpTransport for ReqwestTransport {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
        };
        let mut builder = self.client(request.timeout)?.request(method, &request.url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Multipart(upload) => builder.multipart(multipart_form(upload)?),
        };

        let response = builder.send().map_err(TransportError::from_reqwest)?;
        let status = response.status().as_u16();
        Ok(HttpResponse::new(status, BufReader::new(ReqwestBody(response))))
    }
}

/// Response body that reports read timeouts as `ErrorKind::TimedOut`.
struct ReqwestBody(reqwest::blocking::Response);

impl Read for ReqwestBody {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf).map_err(|e| {
            let timed_out = e
                .get_ref()
                .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
                .is_some_and(reqwest::Error::is_timeout);
            if timed_out {
                std::io::Error::new(std::io::ErrorKind::TimedOut, e)
            } else {
                e
            }
        })
    }
}

fn multipart_form(
    upload: &MultipartUpload,
) -> Result<reqwest::blocking::multipart::Form, TransportError> {
    let mut part = reqwest::blocking::multipart::Part::bytes(upload.bytes.clone())
        .file_name(upload.file_name.clone());
    if let Some(mime) = upload.mime.as_deref() {
        part = part
            .mime_str(mime)
            .map_err(|e| TransportError::invalid(format!("invalid mime type {mime}: {e}")))?;
    }
    let mut form = reqwest::blocking::multipart::Form::new();
    for (name, value) in &upload.fields {
        form = form.text(name.clone(), value.clone());
    }
    Ok(form.part("file", part))
}

/// Sends `request` until it yields a 2xx response or the policy gives up.
///
/// Only obtaining the response is retried. The returned body is unread, so a
/// streaming caller owns every failure after this point.
pub(crate) fn send_with_retry<T: HttpTransport + ?Sized>(
    transport: &T,
    request: &HttpRequest,
    policy: &RetryPolicy,
) -> Result<HttpResponse, DifyError> {
    let mut retries_done = 0;
    loop {
        debug!(
            method = request.method.as_str(),
            url = %request.url,
            attempt = retries_done + 1,
            "sending request"
        );
        match transport.send(request) {
            Ok(response) if response.is_success() => return Ok(response),
            Ok(response) => {
                let status = response.status;
                let body = response
                    .into_text()
                    .unwrap_or_else(|_| "<unreadable body>".to_string());
                let error = api_error_from_body(status, &body);
                if RetryPolicy::is_retryable_status(status) && policy.can_retry(retries_done) {
                    warn!(
                        url = %request.url,
                        status,
                        attempt = retries_done + 1,
                        delay_ms = policy.retry_delay.as_millis() as u64,
                        "retryable status, retrying"
                    );
                    policy.wait();
                    retries_done += 1;
                    continue;
                }
                return Err(DifyError::from_status(error));
            }
            Err(err) => {
                if err.is_transient() && policy.can_retry(retries_done) {
                    warn!(
                        url = %request.url,
                        error = %err,
                        attempt = retries_done + 1,
                        delay_ms = policy.retry_delay.as_millis() as u64,
                        "transport error, retrying"
                    );
                    policy.wait();
                    retries_done += 1;
                    continue;
                }
                return Err(err.into());
            }
        }
    }
}

/// Builds the error for a non-success response body.
pub(crate) fn api_error_from_body(status: u16, body: &str) -> ApiError {
    let mut message = format!("API request failed: {status}");
    let error_data = match serde_json::from_str::<serde_json::Value>(body) {
        Ok(serde_json::Value::Object(map)) => Some(map),
        _ => None,
    };
    match &error_data {
        Some(map) => {
            let detail = map
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|v| v.as_str())
                .or_else(|| map.get("message").and_then(|v| v.as_str()))
                .filter(|s| !s.trim().is_empty());
            if let Some(detail) = detail {
                message = format!("{message} - {detail}");
            }
        }
        None => {
            let trimmed = body.trim();
            if !trimmed.is_empty() {
                let excerpt: String = trimmed.chars().take(ERROR_BODY_EXCERPT_CHARS).collect();
                message = format!("{message} - {excerpt}");
            }
        }
    }
    ApiError {
        status_code: status,
        message,
        error_data,
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedTransport;
    use super::*;

    fn request() -> HttpRequest {
        HttpRequest::new(Method::Post, "http://dify.test/v1/chat-messages")
    }

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy::fixed(max_retries, Duration::ZERO)
    }

    #[test]
    fn succeeds_on_third_attempt_after_two_unavailable_responses() {
        let transport = ScriptedTransport::new()
            .respond(503, "")
            .respond(503, "")
            .respond(200, "{\"ok\":true}");
        let response = send_with_retry(&transport, &request(), &fast(2)).expect("third attempt");
        assert_eq!(response.status, 200);
        assert_eq!(transport.calls(), 3);
    }

    #[test]
    fn exhausted_rate_limit_surfaces_rate_limit_error() {
        let transport = ScriptedTransport::new()
            .respond(429, "{\"message\":\"slow down\"}")
            .respond(429, "{\"message\":\"slow down\"}");
        let err = send_with_retry(&transport, &request(), &fast(1)).expect_err("gives up");
        assert_eq!(transport.calls(), 2);
        assert!(matches!(err, DifyError::RateLimit(_)));
        assert_eq!(err.status_code(), Some(429));
    }

    #[test]
    fn client_errors_are_terminal() {
        let transport = ScriptedTransport::new()
            .respond(401, "{\"code\":\"unauthorized\",\"message\":\"bad key\"}")
            .respond(200, "");
        let err = send_with_retry(&transport, &request(), &fast(2)).expect_err("no retry");
        assert_eq!(transport.calls(), 1);
        assert!(matches!(err, DifyError::Auth(_)));

        let transport = ScriptedTransport::new().respond(400, "{\"message\":\"missing query\"}");
        let err = send_with_retry(&transport, &request(), &fast(2)).expect_err("no retry");
        assert_eq!(transport.calls(), 1);
        match err {
            DifyError::Request(api) => {
                assert_eq!(api.message, "API request failed: 400 - missing query");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn connection_errors_are_retried_then_mapped() {
        let transport = ScriptedTransport::new()
            .fail(TransportError::connect("dns failure"))
            .respond(200, "");
        assert!(send_with_retry(&transport, &request(), &fast(2)).is_ok());
        assert_eq!(transport.calls(), 2);

        let transport = ScriptedTransport::new()
            .fail(TransportError::timeout("read timed out"))
            .fail(TransportError::timeout("read timed out"));
        let err = send_with_retry(&transport, &request(), &fast(1)).expect_err("gives up");
        assert!(matches!(err, DifyError::Timeout { .. }));
    }

    #[test]
    fn non_transient_transport_errors_are_not_retried() {
        let transport = ScriptedTransport::new()
            .fail(TransportError::invalid("invalid mime type no-slash"))
            .respond(200, "");
        let err = send_with_retry(&transport, &request(), &fast(2)).expect_err("terminal");
        assert_eq!(transport.calls(), 1);
        assert!(matches!(err, DifyError::Validation(_)));

        let transport = ScriptedTransport::new()
            .fail(TransportError::other("redirect loop"))
            .respond(200, "");
        let err = send_with_retry(&transport, &request(), &fast(2)).expect_err("terminal");
        assert_eq!(transport.calls(), 1);
        assert!(matches!(err, DifyError::Connection { .. }));
    }

    #[test]
    fn invalid_mime_type_fails_before_sending() {
        let upload = MultipartUpload {
            file_name: "notes.txt".into(),
            bytes: b"hi".to_vec(),
            mime: Some("no-slash".into()),
            fields: Vec::new(),
        };
        let err = multipart_form(&upload).err().expect("bad mime");
        assert_eq!(err.kind, TransportErrorKind::Invalid);
        assert!(!err.is_transient());
    }

    #[test]
    fn error_body_prefers_nested_error_message_then_raw_excerpt() {
        let nested = api_error_from_body(500, "{\"error\":{\"message\":\"boom\"}}");
        assert_eq!(nested.message, "API request failed: 500 - boom");
        assert!(nested.error_data.is_some());

        let raw = api_error_from_body(502, &"x".repeat(500));
        assert_eq!(raw.message.len(), "API request failed: 502 - ".len() + 200);
        assert!(raw.error_data.is_none());

        let empty = api_error_from_body(404, "");
        assert_eq!(empty.message, "API request failed: 404");
    }
}
