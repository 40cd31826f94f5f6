use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use uuid::Uuid;

use crate::api::views::{
    CleanupView, CreatePrecheckRequest, DeleteParams, HealthResponse, ListParams, LogParams,
    MessageResponse, OrphanView, RunView, UploadParams, UploadView, WaitParams, WaitView,
};
use crate::api::{ApiError, AppState};
use crate::error::PrecheckError;
use crate::runtime::LogOptions;
use crate::service::LogChunk;
use crate::store::{Run, RunStatus};

type ApiResult<T> = std::result::Result<T, ApiError>;

const DEFAULT_WAIT_SECS: u64 = 300;

pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn queue_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.service.queue_status().await)
}

// Uploads

pub async fn create_upload(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> ApiResult<Json<UploadView>> {
    let upload = state
        .service
        .create_upload(&body, params.name.as_deref())
        .await?;
    Ok(Json(upload.into()))
}

pub async fn list_uploads(State(state): State<AppState>) -> impl IntoResponse {
    let uploads: Vec<UploadView> = state
        .service
        .list_uploads()
        .await
        .into_iter()
        .map(UploadView::from)
        .collect();
    Json(uploads)
}

pub async fn get_upload(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<UploadView>> {
    Ok(Json(state.service.get_upload(id).await?.into()))
}

pub async fn delete_upload(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<MessageResponse>> {
    state.service.delete_upload(id).await?;
    Ok(Json(MessageResponse::new("Upload deleted")))
}

// Prechecks

async fn run_view(state: &AppState, run: Run) -> RunView {
    let length = state.service.store().read().await.queue_length();
    RunView::new(run, length, &state.container_prefix)
}

pub async fn create_precheck(
    State(state): State<AppState>,
    Json(request): Json<CreatePrecheckRequest>,
) -> ApiResult<Json<RunView>> {
    let run = state
        .service
        .create_run(request.upload_id, &request.top_cell, request.die_id.as_deref())
        .await?;
    Ok(Json(run_view(&state, run).await))
}

/// `status=queued,running` style filter.
fn parse_statuses(filter: Option<&str>) -> Result<Vec<RunStatus>, PrecheckError> {
    let Some(filter) = filter else {
        return Ok(Vec::new());
    };
    filter
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.parse::<RunStatus>().map_err(PrecheckError::InvalidRequest))
        .collect()
}

pub async fn list_prechecks(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<RunView>>> {
    let statuses = parse_statuses(params.status.as_deref())?;
    let runs = state.service.list_runs(&statuses).await;
    let length = state.service.store().read().await.queue_length();
    Ok(Json(
        runs.into_iter()
            .map(|run| RunView::new(run, length, &state.container_prefix))
            .collect(),
    ))
}

pub async fn get_precheck(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<RunView>> {
    let run = state.service.get_run(id).await?;
    Ok(Json(run_view(&state, run).await))
}

pub async fn cancel_precheck(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<RunView>> {
    let run = state.service.cancel_run(id).await?;
    Ok(Json(run_view(&state, run).await))
}

pub async fn delete_precheck(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<DeleteParams>,
) -> ApiResult<Json<MessageResponse>> {
    state.service.delete_run(id, params.force).await?;
    Ok(Json(MessageResponse::new("Precheck deleted")))
}

pub async fn precheck_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<LogParams>,
) -> ApiResult<Json<LogChunk>> {
    let options = LogOptions {
        since: params.since.filter(|s| *s > 0),
        tail: params.tail,
        timestamps: params.timestamps,
    };
    Ok(Json(state.service.get_logs(id, &options).await?))
}

pub async fn precheck_stats(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    Ok(Json(state.service.get_stats(id).await?))
}

pub async fn wait_precheck(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<WaitParams>,
) -> ApiResult<Json<WaitView>> {
    let timeout = Duration::from_secs(params.timeout.unwrap_or(DEFAULT_WAIT_SECS));
    let run = state.service.wait(id, timeout).await?;
    Ok(Json(run.into()))
}

pub async fn precheck_output(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let path = state.service.output_artifact(id).await?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("{id}.gds"));
    let bytes = tokio::fs::read(&path).await.map_err(PrecheckError::from)?;

    Ok(attachment("application/octet-stream", &file_name, bytes))
}

pub async fn debug_archive(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let bytes = state.service.debug_archive(id).await?;
    Ok(attachment(
        "application/gzip",
        &format!("precheck-{id}.tar.gz"),
        bytes,
    ))
}

fn attachment(content_type: &'static str, file_name: &str, bytes: Vec<u8>) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{file_name}\""),
            ),
        ],
        Body::from(bytes),
    )
        .into_response()
}

// Admin

pub async fn list_orphans(State(state): State<AppState>) -> ApiResult<Json<Vec<OrphanView>>> {
    let orphans = state.service.list_orphans().await?;
    Ok(Json(
        orphans
            .into_iter()
            .map(|c| OrphanView {
                id: c.id,
                name: c.name,
                state: c.state,
            })
            .collect(),
    ))
}

pub async fn cleanup_orphans(State(state): State<AppState>) -> ApiResult<Json<CleanupView>> {
    let removed = state.service.cleanup_orphans().await?;
    Ok(Json(CleanupView { removed }))
}
