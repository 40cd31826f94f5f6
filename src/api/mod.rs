//! HTTP surface over [`PrecheckService`].

pub mod auth;
pub mod handlers;
pub mod views;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::PrecheckError;
use crate::service::PrecheckService;

pub use auth::AuthPolicy;
use views::MessageResponse;

#[derive(Clone)]
pub struct AppState {
    pub service: PrecheckService,
    pub auth: Arc<AuthPolicy>,
    pub container_prefix: Arc<str>,
    pub max_upload_bytes: usize,
}

/// A [`PrecheckError`] rendered as `{"message": ...}` with a matching status.
#[derive(Debug)]
pub struct ApiError(pub PrecheckError);

impl From<PrecheckError> for ApiError {
    fn from(err: PrecheckError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            PrecheckError::UploadNotFound(_)
            | PrecheckError::RunNotFound(_)
            | PrecheckError::OutputMissing(_) => StatusCode::NOT_FOUND,
            PrecheckError::Expired(_)
            | PrecheckError::NotRunning(_)
            | PrecheckError::NotCompleted { .. }
            | PrecheckError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            PrecheckError::InvalidTransition { .. }
            | PrecheckError::RunActive { .. }
            | PrecheckError::ConfigurationConflict(_) => StatusCode::CONFLICT,
            PrecheckError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            PrecheckError::Runtime(_) => StatusCode::BAD_GATEWAY,
            PrecheckError::Config(_) | PrecheckError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        (status, Json(MessageResponse::new(self.0.to_string()))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/queue", get(handlers::queue_status))
        .route(
            "/uploads",
            get(handlers::list_uploads).post(handlers::create_upload),
        )
        .route(
            "/uploads/{id}",
            get(handlers::get_upload).delete(handlers::delete_upload),
        )
        .route(
            "/prechecks",
            get(handlers::list_prechecks).post(handlers::create_precheck),
        )
        .route(
            "/prechecks/{id}",
            get(handlers::get_precheck).delete(handlers::delete_precheck),
        )
        .route("/prechecks/{id}/cancel", post(handlers::cancel_precheck))
        .route("/prechecks/{id}/logs", get(handlers::precheck_logs))
        .route("/prechecks/{id}/stats", get(handlers::precheck_stats))
        .route("/prechecks/{id}/wait", post(handlers::wait_precheck))
        .route("/prechecks/{id}/output", get(handlers::precheck_output))
        .route("/debug/prechecks/{id}", get(handlers::debug_archive))
        .route("/admin/orphans", get(handlers::list_orphans))
        .route("/admin/orphans/cleanup", post(handlers::cleanup_orphans))
        .layer(DefaultBodyLimit::max(state.max_upload_bytes))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::authorize,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
