use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use relay_shared::{ChatMessage, ChatRequest};
use reqwest::{RequestBuilder, Response, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::decoder::Utf8Decoder;

pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
/// Applies to the response head and to every gap between body chunks.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Transport failures, rendered as the text fragment the caller sees.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Error: The request to the backend timed out.")]
    Timeout,
    #[error("Error: Could not connect to the backend service.")]
    Connect,
    #[error("Error: HTTP {status} - {body}")]
    Status { status: u16, body: String },
    #[error("Error: An unexpected error occurred: {0}")]
    Other(String),
}

impl From<reqwest::Error> for RelayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RelayError::Timeout
        } else if e.is_connect() {
            RelayError::Connect
        } else {
            RelayError::Other(e.to_string())
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayClient {
    http: reqwest::Client,
    base_url: String,
}

impl RelayClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Posts the conversation and yields the reply as it streams in.
    ///
    /// Never fails: a transport problem shows up as a single "Error: ..."
    /// fragment, after which the stream ends. Dropping the stream early
    /// closes the connection.
    pub fn send(&self, conversation: &[ChatMessage]) -> impl Stream<Item = String> + Send + 'static {
        self.send_with_timeout(conversation, QUERY_TIMEOUT)
    }

    fn send_with_timeout(
        &self,
        conversation: &[ChatMessage],
        limit: Duration,
    ) -> impl Stream<Item = String> + Send + 'static {
        let request = self
            .http
            .post(format!("{}/chat", self.base_url))
            .json(&ChatRequest::new(conversation.to_vec()));
        let message_count = conversation.len();

        async_stream::stream! {
            info!("Sending {} messages to backend", message_count);
            match open(request, limit).await {
                Ok(response) => {
                    let mut fragments = Box::pin(fragments(response.bytes_stream(), limit));
                    while let Some(fragment) = fragments.next().await {
                        yield fragment;
                    }
                }
                Err(e) => {
                    error!("Chat request failed: {:?}", e);
                    yield e.to_string();
                }
            }
        }
    }

    /// True only if `GET /health` answers 200 within the health timeout.
    pub async fn check_health(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        info!("Checking backend health at {}", url);

        match self.http.get(&url).timeout(HEALTH_CHECK_TIMEOUT).send().await {
            Ok(response) if response.status() == StatusCode::OK => {
                info!("Backend API is healthy");
                true
            }
            Ok(response) => {
                error!("Health check returned HTTP {}", response.status());
                false
            }
            Err(e) => {
                error!("Health check failed: {}", e);
                false
            }
        }
    }
}

async fn open(request: RequestBuilder, limit: Duration) -> Result<Response, RelayError> {
    let response = timeout(limit, request.send())
        .await
        .map_err(|_| RelayError::Timeout)??;

    debug!("Response status: {}", response.status());
    debug!("Response headers: {:?}", response.headers());

    let status = response.status();
    if !status.is_success() {
        let body = timeout(limit, response.text())
            .await
            .map_err(|_| RelayError::Timeout)?
            .unwrap_or_default();
        return Err(RelayError::Status {
            status: status.as_u16(),
            body,
        });
    }

    Ok(response)
}

/// Decodes a chunked body into text fragments, one per chunk that completes
/// at least one character. Ends with an error fragment if the body fails or
/// goes quiet for longer than `idle`.
fn fragments<S, E>(body: S, idle: Duration) -> impl Stream<Item = String>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Into<RelayError>,
{
    async_stream::stream! {
        let mut body = Box::pin(body);
        let mut decoder = Utf8Decoder::new();
        let mut received = 0usize;

        debug!("Stream started");
        loop {
            match timeout(idle, body.next()).await {
                Err(_) => {
                    error!("Backend went quiet for {:?}", idle);
                    yield RelayError::Timeout.to_string();
                    return;
                }
                Ok(None) => break,
                Ok(Some(Ok(chunk))) => {
                    received += chunk.len();
                    let text = decoder.decode(&chunk);
                    if !text.is_empty() {
                        yield text;
                    }
                }
                Ok(Some(Err(e))) => {
                    let e: RelayError = e.into();
                    error!("Stream failed after {} bytes: {:?}", received, e);
                    yield e.to_string();
                    return;
                }
            }
        }

        if let Some(rest) = decoder.finish() {
            yield rest;
        }
        debug!("Stream ended after {} bytes", received);
    }
}
