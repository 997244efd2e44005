//! Local HTTP control API.
//!
//! Exposes the agent over a local listener. Transition errors map to
//! client-error statuses; the event stream is served as server-sent
//! events carrying the JSON encoding of each lifecycle event.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::agent::Agent;
use crate::container::Container;
use crate::error::Error;

/// Builds the complete router.
pub fn router(agent: Arc<Agent>) -> Router {
    Router::new()
        .route("/containers", get(list_containers))
        .route(
            "/containers/:guid",
            post(allocate).get(get_container).delete(delete_container),
        )
        .route("/containers/:guid/initialize", post(initialize))
        .route("/containers/:guid/run", post(run))
        .route("/containers/:guid/stop", post(stop))
        .route("/containers/:guid/files", get(get_files))
        .route("/events", get(events))
        .route("/resources/total", get(total_resources))
        .route("/resources/remaining", get(remaining_resources))
        .route("/ping", get(ping))
        .with_state(agent)
}

/// Serves the API on an already-bound listener until the task is
/// cancelled.
pub async fn serve(agent: Arc<Agent>, listener: tokio::net::TcpListener) -> std::io::Result<()> {
    axum::serve(listener, router(agent)).await
}

// =============================================================================
// Error Mapping
// =============================================================================

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyExists(_) | Error::InvalidTransition { .. } => StatusCode::CONFLICT,
            Error::InsufficientCapacity { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::InvalidConfiguration(_) => StatusCode::BAD_REQUEST,
            Error::RuntimeUnreachable(_) | Error::Runtime(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        debug!(status = %status, "request failed: {}", self.0);
        (
            status,
            Json(serde_json::json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn allocate(
    State(agent): State<Arc<Agent>>,
    Path(guid): Path<String>,
    Json(mut container): Json<Container>,
) -> Result<Json<Container>, ApiError> {
    container.guid = guid;
    Ok(Json(agent.allocate(container)?))
}

async fn initialize(
    State(agent): State<Arc<Agent>>,
    Path(guid): Path<String>,
) -> Result<Json<Container>, ApiError> {
    Ok(Json(agent.initialize(&guid).await?))
}

async fn run(
    State(agent): State<Arc<Agent>>,
    Path(guid): Path<String>,
) -> Result<StatusCode, ApiError> {
    agent.run(&guid)?;
    Ok(StatusCode::ACCEPTED)
}

async fn stop(
    State(agent): State<Arc<Agent>>,
    Path(guid): Path<String>,
) -> Result<StatusCode, ApiError> {
    agent.stop(&guid).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_container(
    State(agent): State<Arc<Agent>>,
    Path(guid): Path<String>,
) -> Result<StatusCode, ApiError> {
    agent.delete(&guid).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_container(
    State(agent): State<Arc<Agent>>,
    Path(guid): Path<String>,
) -> Result<Json<Container>, ApiError> {
    Ok(Json(agent.lookup(&guid)?))
}

/// Every query parameter is a tag filter.
async fn list_containers(
    State(agent): State<Arc<Agent>>,
    Query(tags): Query<BTreeMap<String, String>>,
) -> Json<Vec<Container>> {
    Json(agent.list(&tags))
}

#[derive(Deserialize)]
struct FilesQuery {
    source: String,
}

async fn get_files(
    State(agent): State<Arc<Agent>>,
    Path(guid): Path<String>,
    Query(query): Query<FilesQuery>,
) -> Result<Body, ApiError> {
    let reader = agent.get_files(&guid, &query.source).await?;
    Ok(Body::from_stream(ReaderStream::new(reader)))
}

async fn events(
    State(agent): State<Arc<Agent>>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let receiver = agent
        .subscribe()
        .ok_or_else(|| Error::InvalidConfiguration("event hub is closed".to_string()))?;

    let stream = futures::stream::unfold(receiver, |mut receiver| async move {
        let event = receiver.recv().await?;
        let sse = SseEvent::default()
            .json_data(&event)
            .unwrap_or_else(|_| SseEvent::default());
        Some((Ok(sse), receiver))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn total_resources(State(agent): State<Arc<Agent>>) -> Json<crate::capacity::Resources> {
    Json(agent.total_resources())
}

async fn remaining_resources(State(agent): State<Arc<Agent>>) -> Json<crate::capacity::Resources> {
    Json(agent.remaining_resources())
}

async fn ping(State(agent): State<Arc<Agent>>) -> Result<StatusCode, ApiError> {
    agent.ping().await?;
    Ok(StatusCode::OK)
}
