//! HTTP bridge for the KVM web console.
//!
//! - `GET /get_data?reqcmd=<command>`: forward a command to the device and
//!   answer with its output after the collection window
//! - `GET /status`: session and heartbeat snapshot as JSON

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::relay::{RelayError, RelayHandle};

/// Shared state of the HTTP handlers
pub struct AppState {
    pub relay: RelayHandle,
}

/// Query of `GET /get_data`
#[derive(Debug, Deserialize)]
pub struct GetDataParams {
    #[serde(default)]
    pub reqcmd: Option<String>,
}

/// Build the bridge router.
pub fn router(relay: RelayHandle) -> Router {
    let state = Arc::new(AppState { relay });

    // The console is served from another origin
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/get_data", get(get_data))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        match self {
            RelayError::Command(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
            RelayError::Unavailable => {
                tracing::error!("Relay loop is not running");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
            }
        }
    }
}

/// Handler for `GET /get_data`
///
/// Responds 200 with whatever the device sent during the collection window,
/// 400 when the command or peer is invalid. The window is run by the relay,
/// so a client that disconnects early does not leave its request pending.
pub async fn get_data(
    State(state): State<Arc<AppState>>,
    Query(params): Query<GetDataParams>,
) -> Response {
    tracing::debug!("Bridge command: {:?}", params.reqcmd);

    match state.relay.command(params.reqcmd).await {
        Ok(output) => (StatusCode::OK, output).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Handler for `GET /status`
pub async fn status(State(state): State<Arc<AppState>>) -> Response {
    match state.relay.status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => e.into_response(),
    }
}
