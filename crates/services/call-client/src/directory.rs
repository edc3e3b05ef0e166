//! Call directory REST client
//!
//! Finds calls by their shareable link, creates and ends calls, and reads the
//! call history of a user. Every request carries the bearer credential.

use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Directory client errors
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("Invalid directory URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },
}

/// Result type for directory operations
pub type DirectoryResult<T> = Result<T, DirectoryError>;

/// A call known to the directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    /// Call id, used as `call_id` on the signaling channel
    pub id: String,

    /// Shareable link of the call
    pub call_link: String,

    #[serde(default)]
    pub title: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub host_id: Option<String>,
}

/// Body of a create-call request
#[derive(Debug, Clone, Serialize)]
pub struct NewCall {
    pub title: String,
    pub description: String,
    pub host_id: String,
}

/// Body of an end-call request
#[derive(Debug, Clone, Serialize)]
pub struct CallSummary {
    /// Call length in seconds
    pub duration: u64,
    pub participant_count: usize,
    pub title: String,
}

/// One entry of a user's call history
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CallLog {
    #[serde(default)]
    pub call_id: Option<String>,

    #[serde(default)]
    pub title: Option<String>,

    /// Call length in seconds
    #[serde(default)]
    pub duration: Option<u64>,

    #[serde(default)]
    pub participant_count: Option<u64>,
}

#[derive(Deserialize)]
struct CallList {
    #[serde(default)]
    calls: Vec<CallRecord>,
}

#[derive(Deserialize)]
struct LogList {
    #[serde(default)]
    logs: Vec<CallLog>,
}

/// Single-call responses come either wrapped as `{"call": {...}}` or bare
#[derive(Deserialize)]
#[serde(untagged)]
enum CallEnvelope {
    Wrapped { call: CallRecord },
    Bare(CallRecord),
}

impl From<CallEnvelope> for CallRecord {
    fn from(envelope: CallEnvelope) -> Self {
        match envelope {
            CallEnvelope::Wrapped { call } => call,
            CallEnvelope::Bare(call) => call,
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// REST client for the call directory
pub struct DirectoryClient {
    base_url: Url,
    token: String,
    client: reqwest::Client,
}

impl DirectoryClient {
    /// Create a client
    ///
    /// # Arguments
    ///
    /// * `base_url` - API root (e.g. "http://localhost:5000")
    /// * `token` - Bearer credential
    pub fn new(base_url: &str, token: impl Into<String>) -> DirectoryResult<Self> {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(DirectoryError::InvalidUrl(format!(
                "must start with http:// or https://, got: {}",
                base_url
            )));
        }

        // A trailing slash keeps relative joins below the API root
        let normalized = format!("{}/", base_url.trim_end_matches('/'));
        let base_url =
            Url::parse(&normalized).map_err(|e| DirectoryError::InvalidUrl(e.to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            base_url,
            token: token.into(),
            client,
        })
    }

    /// Calls hosted by the authenticated user
    pub async fn list_calls(&self) -> DirectoryResult<Vec<CallRecord>> {
        let response = self.send(self.request(Method::GET, "calls/")?).await?;
        let list: CallList = parse(response).await?;
        Ok(list.calls)
    }

    /// Create a call
    pub async fn create_call(&self, call: &NewCall) -> DirectoryResult<CallRecord> {
        let request = self.request(Method::POST, "calls/")?.json(call);
        let envelope: CallEnvelope = parse(self.send(request).await?).await?;
        Ok(envelope.into())
    }

    /// Find a call by its shareable link
    pub async fn find_by_link(&self, call_link: &str) -> DirectoryResult<CallRecord> {
        let mut url = self.endpoint("calls/link/")?;
        url.path_segments_mut()
            .map_err(|_| DirectoryError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .push(call_link);

        let request = self.authorize(self.client.get(url));
        let envelope: CallEnvelope = parse(self.send(request).await?).await?;
        Ok(envelope.into())
    }

    /// Mark a call as ended
    pub async fn end_call(&self, call_id: &str, summary: &CallSummary) -> DirectoryResult<()> {
        let path = format!("calls/{}/end", call_id);
        let request = self.request(Method::PATCH, &path)?.json(summary);
        self.send(request).await?;
        Ok(())
    }

    /// Call history of a user
    pub async fn logs(&self, user_id: &str) -> DirectoryResult<Vec<CallLog>> {
        let path = format!("logs/{}", user_id);
        let response = self.send(self.request(Method::GET, &path)?).await?;
        let list: LogList = parse(response).await?;
        Ok(list.logs)
    }

    fn endpoint(&self, path: &str) -> DirectoryResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| DirectoryError::InvalidUrl(format!("{}: {}", path, e)))
    }

    fn request(&self, method: Method, path: &str) -> DirectoryResult<RequestBuilder> {
        let url = self.endpoint(path)?;
        Ok(self.authorize(self.client.request(method, url)))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(&self.token)
    }

    async fn send(&self, request: RequestBuilder) -> DirectoryResult<Response> {
        let response = request.send().await?;
        let status = response.status();
        debug!(status = status.as_u16(), url = %response.url(), "Directory response");

        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|body| body.error)
            .unwrap_or_else(|_| {
                if text.is_empty() {
                    status.canonical_reason().unwrap_or("Unknown").to_string()
                } else {
                    text
                }
            });

        Err(DirectoryError::Status {
            status: status.as_u16(),
            message,
        })
    }
}

async fn parse<T: DeserializeOwned>(response: Response) -> DirectoryResult<T> {
    Ok(response.json().await?)
}
