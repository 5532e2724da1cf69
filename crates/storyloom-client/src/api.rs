//! REST collaborator: session load, message send, review and run cancel.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use storyloom_proto::{Artifact, Message, Record, Session, SessionStatus};
use thiserror::Error;
use url::Url;

use crate::config::{ClientConfig, ConfigError};
use crate::transport::{RunCanceller, TransportError};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoadedSession {
    pub session: Session,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    /// Set while a run is still producing events; the client resumes it.
    #[serde(default)]
    pub active_run_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SendMessageRequest {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Record>,
    pub client_message_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageResponse {
    pub session_id: String,
    pub run_id: String,
}

#[derive(Debug, Clone, Serialize)]
struct ReviewRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    note: Option<&'a str>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReviewResponse {
    pub status: SessionStatus,
    #[serde(default)]
    pub metadata: Option<Record>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    Approve,
    Reject,
}

impl ReviewDecision {
    fn path(self) -> &'static str {
        match self {
            ReviewDecision::Approve => "approve",
            ReviewDecision::Reject => "reject",
        }
    }
}

#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn load_session(&self, session_id: &str) -> Result<LoadedSession, ApiError>;

    /// Sends a message into `session_id`, or starts a new session when `None`.
    async fn send_message(
        &self,
        session_id: Option<&str>,
        request: &SendMessageRequest,
    ) -> Result<SendMessageResponse, ApiError>;

    async fn review(
        &self,
        session_id: &str,
        decision: ReviewDecision,
        note: Option<&str>,
    ) -> Result<ReviewResponse, ApiError>;
}

/// `base` with `segments` appended as percent-encoded path segments.
pub(crate) fn endpoint(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}

#[derive(Clone)]
pub struct HttpSessionApi {
    http: Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpSessionApi {
    pub fn new(http: Client, base_url: Url, token: Option<String>) -> Self {
        Self {
            http,
            base_url,
            token,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .build()?;
        Ok(Self::new(http, config.api_base()?, config.auth_token.clone()))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn read_json<T>(request: RequestBuilder) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let res = request.send().await?;
        if res.status().is_success() {
            Ok(res.json::<T>().await?)
        } else {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            Err(ApiError::UnexpectedStatus { status, body })
        }
    }

    pub async fn cancel(&self, run_id: &str) -> Result<(), ApiError> {
        let url = endpoint(&self.base_url, &["runs", run_id, "cancel"]);
        let res = self.authorized(self.http.post(url)).send().await?;
        if res.status().is_success() {
            Ok(())
        } else {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            Err(ApiError::UnexpectedStatus { status, body })
        }
    }
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    async fn load_session(&self, session_id: &str) -> Result<LoadedSession, ApiError> {
        let url = endpoint(&self.base_url, &["sessions", session_id]);
        tracing::debug!(target = "session.machine", %url, "loading session");
        Self::read_json(self.authorized(self.http.get(url))).await
    }

    async fn send_message(
        &self,
        session_id: Option<&str>,
        request: &SendMessageRequest,
    ) -> Result<SendMessageResponse, ApiError> {
        let url = match session_id {
            Some(id) => endpoint(&self.base_url, &["sessions", id, "messages"]),
            None => endpoint(&self.base_url, &["sessions", "messages"]),
        };
        Self::read_json(self.authorized(self.http.post(url).json(request))).await
    }

    async fn review(
        &self,
        session_id: &str,
        decision: ReviewDecision,
        note: Option<&str>,
    ) -> Result<ReviewResponse, ApiError> {
        let url = endpoint(&self.base_url, &["sessions", session_id, decision.path()]);
        let body = ReviewRequest { note };
        Self::read_json(self.authorized(self.http.post(url).json(&body))).await
    }
}

#[async_trait]
impl RunCanceller for HttpSessionApi {
    async fn cancel_run(&self, run_id: &str) -> Result<(), TransportError> {
        self.cancel(run_id)
            .await
            .map_err(|err| TransportError::Cancel(err.to_string()))
    }
}
