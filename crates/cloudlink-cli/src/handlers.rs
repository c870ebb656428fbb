//! Local HTTP bridge to the cloud session.
//!
//! Exposes the session's variables over a small JSON API so other local
//! processes can read and write them without speaking the cloud protocol.

use crate::metrics;
use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use cloudlink_core::{CloudSession, CloudVariable, SessionError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Shared bridge state.
pub struct AppState {
    /// The session every request acts on.
    pub session: CloudSession,
}

impl AppState {
    #[must_use]
    pub fn new(session: CloudSession) -> Self {
        Self { session }
    }
}

/// Body of `PUT /variables/{name}`.
#[derive(Debug, Deserialize)]
pub struct SetRequest {
    pub value: serde_json::Value,
}

/// A variable as returned by the bridge.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct VariableView {
    /// Name without the cloud prefix.
    pub name: String,
    pub value: String,
}

impl From<&CloudVariable> for VariableView {
    fn from(variable: &CloudVariable) -> Self {
        Self {
            name: variable.display_name().to_string(),
            value: variable.value.clone(),
        }
    }
}

/// Session errors mapped onto HTTP status codes.
#[derive(Debug)]
pub struct ApiError(SessionError);

impl From<SessionError> for ApiError {
    fn from(error: SessionError) -> Self {
        Self(error)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            SessionError::Validation(_) => StatusCode::BAD_REQUEST,
            SessionError::NotFound(_) => StatusCode::NOT_FOUND,
            SessionError::Transport(_) | SessionError::NotConnected => StatusCode::BAD_GATEWAY,
            SessionError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            SessionError::Encode(_) | SessionError::Task(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            metrics::record_error("bridge");
            warn!(error = %self.0, "Bridge request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Build the bridge router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/variables", get(list_handler))
        .route("/variables/:name", get(get_handler).put(set_handler))
        .with_state(state)
}

/// Serve the bridge on `addr` until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn run_status_server<F>(
    session: CloudSession,
    addr: SocketAddr,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(Arc::new(AppState::new(session)));

    let listener = TcpListener::bind(addr).await?;
    info!("Status endpoint listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connected": state.session.is_connected(),
        "variables": state.session.len(),
    }))
}

async fn list_handler(State(state): State<Arc<AppState>>) -> Json<Vec<VariableView>> {
    Json(
        state
            .session
            .variables()
            .iter()
            .map(VariableView::from)
            .collect(),
    )
}

async fn get_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<VariableView>, ApiError> {
    let value = state.session.get(&name)?;
    Ok(Json(VariableView::from(&CloudVariable::new(&name, value))))
}

async fn set_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(request): Json<SetRequest>,
) -> Result<Json<VariableView>, ApiError> {
    // Accept both `"42"` and `42`.
    let value = match request.value {
        serde_json::Value::String(text) => text,
        other => other.to_string(),
    };
    state.session.set(&name, &value).await?;
    Ok(Json(VariableView::from(&CloudVariable::new(&name, value))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudlink_core::{Identity, SessionConfig, ValidationError};

    fn state() -> Arc<AppState> {
        let session = CloudSession::new(
            Identity::new("alice", "1"),
            SessionConfig::with_url("ws://cloud.test/"),
        );
        Arc::new(AppState::new(session))
    }

    #[test]
    fn test_error_status_codes() {
        let cases = [
            (
                SessionError::Validation(ValidationError::Empty),
                StatusCode::BAD_REQUEST,
            ),
            (
                SessionError::NotFound("☁ score".into()),
                StatusCode::NOT_FOUND,
            ),
            (SessionError::NotConnected, StatusCode::BAD_GATEWAY),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).into_response().status(), status);
        }
    }

    #[test]
    fn test_variable_view_strips_prefix() {
        let view = VariableView::from(&CloudVariable::new("score", "7"));
        assert_eq!(view.name, "score");
        assert_eq!(view.value, "7");
    }

    #[tokio::test]
    async fn test_list_empty() {
        let Json(variables) = list_handler(State(state())).await;
        assert!(variables.is_empty());
    }

    #[tokio::test]
    async fn test_get_unknown_is_not_found() {
        let error = get_handler(State(state()), Path("score".into()))
            .await
            .unwrap_err();
        assert_eq!(error.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_set_rejects_non_numeric() {
        let request = SetRequest {
            value: json!("abc"),
        };
        let error = set_handler(State(state()), Path("score".into()), Json(request))
            .await
            .unwrap_err();
        assert_eq!(error.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_set_while_disconnected_is_bad_gateway() {
        let request = SetRequest { value: json!(42) };
        let error = set_handler(State(state()), Path("score".into()), Json(request))
            .await
            .unwrap_err();
        assert_eq!(error.status(), StatusCode::BAD_GATEWAY);
    }
}
