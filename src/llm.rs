use crate::config::Config;
use crate::history::{ConversationHistory, Turn};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Whether a rejected request may succeed if reissued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionCode {
    /// Upstream model reported a transient capacity error
    Overloaded,
    Other,
}

/// Every outcome of a completion attempt other than success
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("request timed out")]
    Timeout,
    #[error("request cancelled")]
    Cancelled,
    #[error("{message}")]
    MalformedOrRejected { message: String, code: RejectionCode },
    #[error("{0}")]
    NetworkFailure(String),
}

impl RemoteError {
    pub fn rejected(message: impl Into<String>) -> Self {
        RemoteError::MalformedOrRejected {
            message: message.into(),
            code: RejectionCode::Other,
        }
    }

    pub fn overloaded(message: impl Into<String>) -> Self {
        RemoteError::MalformedOrRejected {
            message: message.into(),
            code: RejectionCode::Overloaded,
        }
    }

    pub fn is_overloaded(&self) -> bool {
        matches!(
            self,
            RemoteError::MalformedOrRejected {
                code: RejectionCode::Overloaded,
                ..
            }
        )
    }
}

/// Request body for generateContent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Part {
    Text { text: String },
    InlineData { inline_data: InlineData },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

impl From<&Turn> for Content {
    fn from(turn: &Turn) -> Self {
        let mut parts = vec![Part::Text {
            text: turn.content().to_string(),
        }];
        if let Some(attachment) = turn.attachment() {
            parts.push(Part::InlineData {
                inline_data: InlineData {
                    mime_type: attachment.mime_type.clone(),
                    data: attachment.data_base64.clone(),
                },
            });
        }

        Content {
            role: turn.role().to_string(),
            parts,
        }
    }
}

impl From<&ConversationHistory> for GenerateContentRequest {
    fn from(history: &ConversationHistory) -> Self {
        GenerateContentRequest {
            contents: history.iter().map(Content::from).collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Default, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Default, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

/// Upstream sends a structured object; the proxy sends a bare message
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorBody {
    Detailed {
        message: Option<String>,
        status: Option<String>,
        code: Option<u16>,
    },
    Message(String),
}

/// Raw HTTP outcome handed back by a transport
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

/// Performs the physical POST of one request body
#[async_trait]
pub trait CompletionTransport: Send + Sync {
    async fn post(&self, body: &GenerateContentRequest) -> Result<TransportResponse, RemoteError>;
}

/// Where and how the HTTP transport authenticates
#[derive(Debug, Clone)]
enum Target {
    /// Direct call with the key as a query parameter
    Direct { endpoint: String, api_key: String },
    /// Same-origin proxy that holds the key server-side
    Proxy { url: String },
}

/// reqwest-backed transport
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    target: Target,
}

impl HttpTransport {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let target = match &config.proxy_url {
            Some(url) => Target::Proxy { url: url.clone() },
            None => {
                let api_key = config.get_api_key().ok_or_else(|| {
                    anyhow::anyhow!(
                        "No API key configured. Set {} or run `gemini-chat key <KEY>`.",
                        crate::config::API_KEY_ENV
                    )
                })?;
                Target::Direct {
                    endpoint: config.completion_endpoint(),
                    api_key,
                }
            }
        };

        Ok(Self::new(target))
    }

    pub fn direct(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self::new(Target::Direct {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        })
    }

    pub fn proxy(url: impl Into<String>) -> Self {
        Self::new(Target::Proxy { url: url.into() })
    }

    fn new(target: Target) -> Self {
        // Deadlines are enforced per attempt by CompletionClient, not by reqwest.
        Self {
            client: reqwest::Client::new(),
            target,
        }
    }
}

#[async_trait]
impl CompletionTransport for HttpTransport {
    async fn post(&self, body: &GenerateContentRequest) -> Result<TransportResponse, RemoteError> {
        let request = match &self.target {
            Target::Direct { endpoint, api_key } => {
                self.client.post(endpoint).query(&[("key", api_key)])
            }
            Target::Proxy { url } => self.client.post(url),
        };

        let response = request
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| RemoteError::NetworkFailure(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| RemoteError::NetworkFailure(e.to_string()))?;

        Ok(TransportResponse { status, body })
    }
}

/// Performs one request/response cycle with a per-attempt deadline and
/// cooperative cancellation.
#[derive(Clone)]
pub struct CompletionClient {
    transport: Arc<dyn CompletionTransport>,
    timeout: Duration,
    in_flight: Arc<Mutex<Option<(u64, CancellationToken)>>>,
    next_call: Arc<AtomicU64>,
}

impl CompletionClient {
    pub fn new(transport: Arc<dyn CompletionTransport>, timeout: Duration) -> Self {
        Self {
            transport,
            timeout,
            in_flight: Arc::new(Mutex::new(None)),
            next_call: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let transport = HttpTransport::from_config(config)?;
        Ok(Self::new(Arc::new(transport), config.request.timeout()))
    }

    /// Send the full history and wait for the response text.
    ///
    /// Cancelling `cancel` reports `Cancelled`; running past the deadline
    /// cancels the same attempt and reports `Timeout`. Any call still
    /// outstanding on this client is cancelled first.
    pub async fn send(
        &self,
        history: &ConversationHistory,
        cancel: &CancellationToken,
    ) -> Result<String, RemoteError> {
        let body = GenerateContentRequest::from(history);
        let call_id = self.next_call.fetch_add(1, Ordering::Relaxed);
        let attempt = cancel.child_token();

        {
            let mut slot = self.in_flight.lock().await;
            if let Some((previous, token)) = slot.replace((call_id, attempt.clone())) {
                tracing::debug!(previous, "cancelling superseded completion call");
                token.cancel();
            }
        }

        tracing::debug!(call_id, turns = body.contents.len(), "sending completion request");

        let outcome = tokio::select! {
            biased;
            _ = attempt.cancelled() => Err(RemoteError::Cancelled),
            _ = tokio::time::sleep(self.timeout) => {
                attempt.cancel();
                Err(RemoteError::Timeout)
            }
            response = self.transport.post(&body) => {
                response.and_then(|response| Self::extract_text(&response))
            }
        };

        let mut slot = self.in_flight.lock().await;
        if matches!(slot.as_ref(), Some((id, _)) if *id == call_id) {
            *slot = None;
        }

        outcome
    }

    /// Interpret an HTTP outcome as response text or a rejection
    pub fn extract_text(response: &TransportResponse) -> Result<String, RemoteError> {
        if !(200..300).contains(&response.status) {
            return Err(Self::classify_rejection(response));
        }

        let parsed: GenerateContentResponse = serde_json::from_str(&response.body)
            .map_err(|_| RemoteError::rejected("Invalid API response structure"))?;

        parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .and_then(|content| content.parts.into_iter().next())
            .and_then(|part| part.text)
            .filter(|text| !text.is_empty())
            .ok_or_else(|| RemoteError::rejected("Invalid API response structure"))
    }

    fn classify_rejection(response: &TransportResponse) -> RemoteError {
        let mut overloaded = response.status == 503;
        let mut message = None;

        if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(&response.body) {
            match envelope.error {
                ErrorBody::Detailed {
                    message: detail,
                    status,
                    code,
                } => {
                    overloaded |= status.as_deref() == Some("UNAVAILABLE") || code == Some(503);
                    message = detail;
                }
                ErrorBody::Message(detail) => message = Some(detail),
            }
        }

        let message =
            message.unwrap_or_else(|| format!("Request failed with status code {}", response.status));

        if overloaded {
            RemoteError::overloaded(message)
        } else {
            RemoteError::rejected(message)
        }
    }
}
