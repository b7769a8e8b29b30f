use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs, CreateChatCompletionStreamResponse,
    },
    Client,
};
use async_trait::async_trait;
use futures_util::{stream, Stream, StreamExt};
use relay_shared::{ChatMessage, ChatRequest, MessageRole};
use std::pin::Pin;
use thiserror::Error;
use tracing::{debug, error, info};

/// One typed event from the provider's streaming completion.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    TextDelta(String),
    Completed,
    /// Anything else the provider sends (role headers, tool deltas, ...).
    Other(String),
}

#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    #[error("rate limit exceeded: {0}")]
    RateLimited(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("{0}")]
    Other(String),
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<UpstreamEvent, UpstreamError>> + Send>>;

/// A streaming chat-completion provider.
///
/// `open_stream` must fail eagerly for anything detectable before the first
/// event; errors yielded later from the stream are mid-stream failures.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn open_stream(&self, request: &ChatRequest) -> Result<EventStream, UpstreamError>;
}

pub struct OpenAiUpstream {
    client: Client<OpenAIConfig>,
}

impl OpenAiUpstream {
    pub fn new(api_key: String) -> Self {
        Self::with_config(OpenAIConfig::new().with_api_key(api_key))
    }

    pub fn with_config(config: OpenAIConfig) -> Self {
        info!("Initializing OpenAI upstream client");
        let client = Client::with_config(config);
        Self { client }
    }
}

#[async_trait]
impl Upstream for OpenAiUpstream {
    async fn open_stream(&self, request: &ChatRequest) -> Result<EventStream, UpstreamError> {
        let messages = request
            .messages
            .iter()
            .cloned()
            .map(convert_to_openai_message)
            .collect::<Result<Vec<_>, _>>()
            .map_err(classify_error)?;

        let openai_request = CreateChatCompletionRequestArgs::default()
            .model(&request.model)
            .messages(messages)
            .temperature(request.temperature)
            .max_tokens(request.max_tokens)
            .stream(true)
            .build()
            .map_err(classify_error)?;

        debug!(
            "Opening OpenAI stream: model={}, messages={}",
            request.model,
            request.messages.len()
        );

        let mut stream = self
            .client
            .chat()
            .create_stream(openai_request)
            .await
            .map_err(|e| {
                error!("Failed to create OpenAI stream: {:?}", e);
                classify_error(e)
            })?;

        // Bad status codes and transport failures arrive as the first item
        let first = match stream.next().await {
            Some(Err(e)) => {
                error!("OpenAI stream failed before the first event: {:?}", e);
                return Err(classify_error(e));
            }
            other => other,
        };

        let events = stream::iter(first)
            .chain(stream)
            .flat_map(|item| {
                let events: Vec<Result<UpstreamEvent, UpstreamError>> = match item {
                    Ok(chunk) => events_from_chunk(&chunk).into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(classify_error(e))],
                };
                stream::iter(events)
            });

        Ok(Box::pin(events))
    }
}

/// Translates one streamed completion chunk into relay events, text first.
fn events_from_chunk(chunk: &CreateChatCompletionStreamResponse) -> Vec<UpstreamEvent> {
    let mut events = Vec::new();
    for choice in &chunk.choices {
        match &choice.delta.content {
            Some(delta) if !delta.is_empty() => events.push(UpstreamEvent::TextDelta(delta.clone())),
            _ => {}
        }
        if choice.finish_reason.is_some() {
            events.push(UpstreamEvent::Completed);
        }
    }
    if events.is_empty() {
        events.push(UpstreamEvent::Other(format!("chunk {}", chunk.id)));
    }
    events
}

fn convert_to_openai_message(msg: ChatMessage) -> Result<ChatCompletionRequestMessage, OpenAIError> {
    let message = match msg.role {
        MessageRole::System => ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(msg.content)
                .build()?,
        ),
        MessageRole::User => ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default()
                .content(msg.content)
                .build()?,
        ),
        MessageRole::Assistant => ChatCompletionRequestMessage::Assistant(
            ChatCompletionRequestAssistantMessageArgs::default()
                .content(msg.content)
                .build()?,
        ),
    };
    Ok(message)
}

fn classify_error(err: OpenAIError) -> UpstreamError {
    match err {
        OpenAIError::ApiError(api_err) => {
            let code = format!("{:?} {:?}", api_err.code, api_err.r#type);
            if code.contains("rate_limit") || code.contains("insufficient_quota") {
                UpstreamError::RateLimited(api_err.message)
            } else if code.contains("invalid_api_key") || code.contains("authentication") {
                UpstreamError::Authentication(api_err.message)
            } else {
                UpstreamError::Other(format!("OpenAI API Error: {}", api_err.message))
            }
        }
        OpenAIError::Reqwest(e) => {
            let message = e.to_string();
            match e.status().map(|s| s.as_u16()) {
                Some(429) => UpstreamError::RateLimited(message),
                Some(401) => UpstreamError::Authentication(message),
                _ if e.is_connect() || e.is_timeout() || e.is_request() => {
                    UpstreamError::Connection(message)
                }
                _ => UpstreamError::Other(message),
            }
        }
        OpenAIError::StreamError(message) => classify_stream_error(message),
        other => UpstreamError::Other(other.to_string()),
    }
}

/// Stream errors only carry the event-source error text: either
/// "Invalid status code: <status>" or the transport error's message.
fn classify_stream_error(message: String) -> UpstreamError {
    let status: Option<u16> = message
        .strip_prefix("Invalid status code: ")
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|code| code.parse().ok());
    match status {
        Some(429) => return UpstreamError::RateLimited(message),
        Some(401) => return UpstreamError::Authentication(message),
        Some(_) => return UpstreamError::Other(message),
        None => {}
    }

    let lower = message.to_lowercase();
    let transport = [
        "error sending request",
        "error trying to connect",
        "connection refused",
        "connection reset",
        "dns error",
        "timed out",
    ];
    if transport.iter().any(|needle| lower.contains(needle)) {
        UpstreamError::Connection(message)
    } else {
        UpstreamError::Other(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_openai::error::ApiError;
    use serde_json::json;

    fn chunk(content: Option<&str>, finish_reason: Option<&str>) -> CreateChatCompletionStreamResponse {
        serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "object": "chat.completion.chunk",
            "created": 1694268190,
            "model": "gpt-4",
            "choices": [{
                "index": 0,
                "delta": {"content": content},
                "finish_reason": finish_reason
            }]
        }))
        .unwrap()
    }

    #[test]
    fn content_chunk_becomes_text_delta() {
        assert_eq!(
            events_from_chunk(&chunk(Some("Hello"), None)),
            vec![UpstreamEvent::TextDelta("Hello".to_string())]
        );
    }

    #[test]
    fn finish_reason_completes_after_text() {
        assert_eq!(
            events_from_chunk(&chunk(Some("!"), Some("stop"))),
            vec![
                UpstreamEvent::TextDelta("!".to_string()),
                UpstreamEvent::Completed
            ]
        );
        assert_eq!(
            events_from_chunk(&chunk(None, Some("length"))),
            vec![UpstreamEvent::Completed]
        );
    }

    #[test]
    fn contentless_chunk_is_other() {
        assert!(matches!(
            events_from_chunk(&chunk(None, None)).as_slice(),
            [UpstreamEvent::Other(_)]
        ));
    }

    #[test]
    fn stream_errors_are_classified_by_status() {
        assert!(matches!(
            classify_stream_error("Invalid status code: 429 Too Many Requests".to_string()),
            UpstreamError::RateLimited(_)
        ));
        assert!(matches!(
            classify_stream_error("Invalid status code: 401 Unauthorized".to_string()),
            UpstreamError::Authentication(_)
        ));
        assert!(matches!(
            classify_stream_error("Invalid status code: 500 Internal Server Error".to_string()),
            UpstreamError::Other(_)
        ));
    }

    #[test]
    fn transport_failures_are_connection_errors() {
        assert!(matches!(
            classify_stream_error(
                "error sending request for url (https://api.openai.com/v1/chat/completions)".to_string()
            ),
            UpstreamError::Connection(_)
        ));
        assert!(matches!(
            classify_stream_error("unexpected EOF during chunk".to_string()),
            UpstreamError::Other(_)
        ));
    }

    #[test]
    fn api_errors_are_classified_by_code() {
        let api_error = |code: &str| -> OpenAIError {
            OpenAIError::ApiError(
                serde_json::from_value::<ApiError>(json!({
                    "message": format!("{code} happened"),
                    "type": "requests",
                    "param": null,
                    "code": code
                }))
                .unwrap(),
            )
        };

        assert!(matches!(
            classify_error(api_error("rate_limit_exceeded")),
            UpstreamError::RateLimited(_)
        ));
        assert!(matches!(
            classify_error(api_error("insufficient_quota")),
            UpstreamError::RateLimited(_)
        ));
        assert!(matches!(
            classify_error(api_error("invalid_api_key")),
            UpstreamError::Authentication(_)
        ));
        assert!(matches!(
            classify_error(api_error("model_not_found")),
            UpstreamError::Other(message) if message.contains("model_not_found happened")
        ));
    }

    fn upstream_at(api_base: String) -> OpenAiUpstream {
        OpenAiUpstream::with_config(
            OpenAIConfig::new()
                .with_api_base(api_base)
                .with_api_key("sk-test"),
        )
    }

    fn hello_request() -> ChatRequest {
        ChatRequest::new(vec![ChatMessage::new(MessageRole::User, "Say hello")])
    }

    async fn open_error(upstream: &OpenAiUpstream) -> UpstreamError {
        match upstream.open_stream(&hello_request()).await {
            Ok(_) => panic!("expected the upstream call to fail"),
            Err(e) => e,
        }
    }

    async fn failing_status(status: usize) -> UpstreamError {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(status)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":{"message":"failure","type":"requests","param":null,"code":null}}"#)
            .create_async()
            .await;

        open_error(&upstream_at(server.url())).await
    }

    #[tokio::test]
    async fn open_stream_fails_eagerly_on_rate_limit() {
        assert!(matches!(failing_status(429).await, UpstreamError::RateLimited(_)));
    }

    #[tokio::test]
    async fn open_stream_fails_eagerly_on_bad_key() {
        assert!(matches!(failing_status(401).await, UpstreamError::Authentication(_)));
    }

    #[tokio::test]
    async fn open_stream_fails_eagerly_on_server_error() {
        assert!(matches!(failing_status(500).await, UpstreamError::Other(_)));
    }

    #[tokio::test]
    async fn open_stream_fails_eagerly_when_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let upstream = upstream_at(format!("http://127.0.0.1:{port}"));
        assert!(matches!(open_error(&upstream).await, UpstreamError::Connection(_)));
    }

    #[tokio::test]
    async fn open_stream_translates_sse_chunks() {
        let mut server = mockito::Server::new_async().await;

        let sse_response = r#"data: {"id":"c","object":"chat.completion.chunk","created":1694268190,"model":"gpt-4","choices":[{"index":0,"delta":{"role":"assistant"},"finish_reason":null}]}

data: {"id":"c","object":"chat.completion.chunk","created":1694268190,"model":"gpt-4","choices":[{"index":0,"delta":{"content":"Hel"},"finish_reason":null}]}

data: {"id":"c","object":"chat.completion.chunk","created":1694268190,"model":"gpt-4","choices":[{"index":0,"delta":{"content":"lo"},"finish_reason":null}]}

data: {"id":"c","object":"chat.completion.chunk","created":1694268190,"model":"gpt-4","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}

data: [DONE]

"#;

        let mock = server
            .mock("POST", "/chat/completions")
            .match_body(mockito::Matcher::PartialJson(json!({
                "model": "gpt-3.5-turbo",
                "stream": true,
                "messages": [{"role": "user", "content": "Say hello"}]
            })))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(sse_response)
            .create_async()
            .await;

        let events = match upstream_at(server.url()).open_stream(&hello_request()).await {
            Ok(events) => events,
            Err(e) => panic!("stream failed to open: {e}"),
        };
        let events: Vec<UpstreamEvent> = events.map(|event| event.unwrap()).collect().await;

        mock.assert_async().await;
        assert_eq!(
            events,
            vec![
                UpstreamEvent::Other("chunk c".to_string()),
                UpstreamEvent::TextDelta("Hel".to_string()),
                UpstreamEvent::TextDelta("lo".to_string()),
                UpstreamEvent::Completed,
            ]
        );
    }
}
