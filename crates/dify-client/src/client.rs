//! Client facade over the app API endpoints.

use std::path::Path;

use serde_json::{Map, Value, json};
use tracing::debug;

use crate::aggregate::StreamOptions;
use crate::config::ClientConfig;
use crate::errors::DifyError;
use crate::stream::{BodyLines, EventStream};
use crate::transport::{
    HttpRequest, HttpTransport, Method, MultipartUpload, ReqwestTransport, RequestBody,
    send_with_retry,
};

/// Application family, which decides the run and stop endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppKind {
    /// Chatbot, agent and chatflow apps.
    Chat,
    Completion,
    Workflow,
}

impl AppKind {
    pub fn endpoint(&self) -> &'static str {
        match self {
            Self::Chat => "chat-messages",
            Self::Completion => "completion-messages",
            Self::Workflow => "workflows/run",
        }
    }

    pub fn stop_endpoint(&self, task_id: &str) -> String {
        match self {
            Self::Chat => format!("chat-messages/{task_id}/stop"),
            Self::Completion => format!("completion-messages/{task_id}/stop"),
            Self::Workflow => format!("workflows/tasks/{task_id}/stop"),
        }
    }

    fn takes_query(&self) -> bool {
        !matches!(self, Self::Workflow)
    }
}

/// Parameters of one streaming run.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub kind: AppKind,
    pub user: String,
    pub inputs: Map<String, Value>,
    pub query: Option<String>,
    pub conversation_id: Option<String>,
    pub files: Vec<Value>,
}

impl StreamRequest {
    pub fn new(kind: AppKind, user: impl Into<String>) -> Self {
        Self {
            kind,
            user: user.into(),
            inputs: Map::new(),
            query: None,
            conversation_id: None,
            files: Vec::new(),
        }
    }

    pub fn chat(query: impl Into<String>, user: impl Into<String>) -> Self {
        Self::new(AppKind::Chat, user).query(query)
    }

    pub fn completion(query: impl Into<String>, user: impl Into<String>) -> Self {
        Self::new(AppKind::Completion, user).query(query)
    }

    pub fn workflow(user: impl Into<String>) -> Self {
        Self::new(AppKind::Workflow, user)
    }

    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn input(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(name.into(), value.into());
        self
    }

    pub fn inputs(mut self, inputs: Map<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }

    /// Adds a file reference, for example
    /// `{"type": "image", "transfer_method": "local_file", "upload_file_id": "..."}`.
    pub fn file(mut self, file: Value) -> Self {
        self.files.push(file);
        self
    }

    pub fn validate(&self) -> Result<(), DifyError> {
        if self.user.trim().is_empty() {
            return Err(DifyError::validation("user must not be empty"));
        }
        if self.kind == AppKind::Chat
            && self.query.as_deref().is_none_or(|q| q.trim().is_empty())
        {
            return Err(DifyError::validation("chat requests need a non-empty query"));
        }
        if self.conversation_id.is_some() && self.kind != AppKind::Chat {
            return Err(DifyError::validation(
                "conversation_id is only valid for chat apps",
            ));
        }
        Ok(())
    }

    fn payload(&self) -> Value {
        let mut payload = json!({
            "inputs": self.inputs,
            "response_mode": "streaming",
            "user": self.user,
        });
        if let Value::Object(map) = &mut payload {
            if self.kind.takes_query()
                && let Some(query) = &self.query
            {
                map.insert("query".into(), json!(query));
            }
            if let Some(conversation_id) = &self.conversation_id {
                map.insert("conversation_id".into(), json!(conversation_id));
            }
            if !self.files.is_empty() {
                map.insert("files".into(), Value::Array(self.files.clone()));
            }
        }
        payload
    }
}

/// Client for the app API of one Dify application.
pub struct DifyClient<T: HttpTransport = ReqwestTransport> {
    config: ClientConfig,
    transport: T,
}

impl DifyClient<ReqwestTransport> {
    pub fn new(config: ClientConfig) -> Result<Self, DifyError> {
        Self::with_transport(config, ReqwestTransport::new()?)
    }

    /// Builds a client from `DIFY_*` environment variables.
    pub fn from_env() -> Result<Self, DifyError> {
        Self::new(ClientConfig::from_env()?)
    }
}

impl<T: HttpTransport> DifyClient<T> {
    pub fn with_transport(config: ClientConfig, transport: T) -> Result<Self, DifyError> {
        config.validate()?;
        Ok(Self { config, transport })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Starts a streaming run.
    ///
    /// Returns once response headers arrive; events are read as the returned
    /// stream is iterated.
    pub fn stream(
        &self,
        request: &StreamRequest,
        options: StreamOptions,
    ) -> Result<EventStream<BodyLines>, DifyError> {
        request.validate()?;
        let http = self
            .json_request(request.kind.endpoint(), request.payload())
            .header("Accept", "text/event-stream")
            .timeout(self.config.stream_timeout);
        debug!(kind = ?request.kind, user = %request.user, "starting stream");
        let response = send_with_retry(&self.transport, &http, &self.config.retry)?;
        Ok(EventStream::from_body(response.into_body(), options))
    }

    /// Asks the server to stop a running task. Local iteration is unaffected.
    pub fn stop(&self, kind: AppKind, task_id: &str, user: &str) -> Result<Value, DifyError> {
        if task_id.trim().is_empty() {
            return Err(DifyError::validation("task_id must not be empty"));
        }
        if user.trim().is_empty() {
            return Err(DifyError::validation("user must not be empty"));
        }
        let http = self
            .json_request(&kind.stop_endpoint(task_id), json!({ "user": user }))
            .timeout(self.config.timeout);
        self.send_json(&http)
    }

    /// Name, description and tags of the app.
    pub fn app_info(&self) -> Result<Value, DifyError> {
        let http = self
            .request(Method::Get, "info")
            .timeout(self.config.timeout);
        self.send_json(&http)
    }

    /// Input form, feature switches and defaults of the app.
    pub fn parameters(&self, user: Option<&str>) -> Result<Value, DifyError> {
        let mut http = self
            .request(Method::Get, "parameters")
            .timeout(self.config.timeout);
        if let Some(user) = user.filter(|u| !u.trim().is_empty()) {
            http = http.query("user", user);
        }
        self.send_json(&http)
    }

    /// Uploads a local file for use in later runs.
    pub fn upload_file(&self, path: impl AsRef<Path>, user: &str) -> Result<Value, DifyError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| DifyError::Io(format!("failed to read {}: {e}", path.display())))?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        self.upload_bytes(&file_name, bytes, None, user)
    }

    pub fn upload_bytes(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
        mime: Option<&str>,
        user: &str,
    ) -> Result<Value, DifyError> {
        if user.trim().is_empty() {
            return Err(DifyError::validation("user must not be empty"));
        }
        let upload = MultipartUpload {
            file_name: file_name.to_string(),
            bytes,
            mime: mime.map(str::to_string),
            fields: vec![("user".to_string(), user.to_string())],
        };
        let http = self
            .request(Method::Post, "files/upload")
            .body(RequestBody::Multipart(upload))
            .timeout(self.config.timeout);
        self.send_json(&http)
    }

    fn request(&self, method: Method, endpoint: &str) -> HttpRequest {
        HttpRequest::new(method, self.config.endpoint_url(endpoint))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
    }

    fn json_request(&self, endpoint: &str, payload: Value) -> HttpRequest {
        self.request(Method::Post, endpoint)
            .header("Content-Type", "application/json")
            .body(RequestBody::Json(payload))
    }

    fn send_json(&self, http: &HttpRequest) -> Result<Value, DifyError> {
        let response = send_with_retry(&self.transport, http, &self.config.retry)?;
        let text = response
            .into_text()
            .map_err(|e| DifyError::transport(format!("failed to read response body: {e}")))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| DifyError::Decode {
            message: format!("invalid JSON response: {e}"),
        })
    }
}
