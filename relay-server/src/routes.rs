use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use relay_shared::{ChatRequest, HealthStatus, StatusMessage};
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{AllowHeaders, AllowMethods, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::error::ApiError;
use crate::llm::{EventStream, Upstream, UpstreamEvent};

#[derive(Clone)]
pub struct AppState {
    pub upstream: Arc<dyn Upstream>,
}

pub fn app(state: AppState, allowed_origin: HeaderValue) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(allowed_origin)
        .allow_methods(AllowMethods::any())
        .allow_headers(AllowHeaders::any());

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/chat", post(chat))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn root() -> Json<StatusMessage> {
    Json(StatusMessage {
        message: "The chat app is running".to_string(),
    })
}

async fn health() -> Json<HealthStatus> {
    info!("Health check endpoint called");
    Json(HealthStatus {
        status: "ok".to_string(),
    })
}

async fn chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload.map_err(|rejection| {
        warn!("Rejected chat request: {}", rejection.body_text());
        ApiError::from(rejection)
    })?;
    info!(
        "Received chat request: model={}, messages={}",
        request.model,
        request.messages.len()
    );
    debug!("Conversation: {:?}", request.messages);

    let events = state.upstream.open_stream(&request).await.map_err(|e| {
        let api_error = ApiError::from(e.clone());
        error!("Upstream call failed: {} -> {} {}", e, api_error.status(), api_error.detail());
        api_error
    })?;
    info!("Upstream stream opened, relaying response");

    let headers = [(header::CONTENT_TYPE, "text/plain; charset=utf-8")];
    Ok((headers, Body::from_stream(relay_body(events))).into_response())
}

/// Forwards text deltas in order until the upstream completes or runs dry.
///
/// A failure after the response head has gone out cannot change the status,
/// so it is logged and the body is closed where it stands.
fn relay_body(mut events: EventStream) -> impl Stream<Item = Result<String, Infallible>> {
    async_stream::stream! {
        let mut chunks = 0usize;
        let mut completed = false;
        while let Some(event) = events.next().await {
            match event {
                Ok(UpstreamEvent::TextDelta(delta)) => {
                    chunks += 1;
                    yield Ok(delta);
                }
                Ok(UpstreamEvent::Completed) => {
                    completed = true;
                    break;
                }
                Ok(UpstreamEvent::Other(kind)) => {
                    debug!("Ignoring upstream event: {}", kind);
                }
                Err(e) => {
                    error!("Upstream failed mid-stream after {} chunks: {}", chunks, e);
                    return;
                }
            }
        }
        if completed {
            info!("Response relayed successfully ({} chunks)", chunks);
        } else {
            warn!("Upstream ended without a completion event ({} chunks)", chunks);
        }
    }
}
