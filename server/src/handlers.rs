use crate::metrics;
use crate::response::{ApiError, ApiResponse, ApiResult};
use crate::routes::ENDPOINTS;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tablesnap_core::{Config, Error, RemoteStorageKind};
use tracing::info;

#[derive(Debug, Default, Deserialize)]
pub struct TableParams {
    pub table: Option<String>,
}

/// `freeze_one_by_one` is a flag like the restore ones.
#[derive(Debug, Default, Deserialize)]
pub struct CreateParams {
    pub table: Option<String>,
    pub name: Option<String>,
    pub freeze_one_by_one: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UploadParams {
    #[serde(rename = "diff-from")]
    pub diff_from: Option<String>,
}

/// `schema` and `data` are flags: present means set, whatever the value.
#[derive(Debug, Default, Deserialize)]
pub struct RestoreParams {
    pub table: Option<String>,
    pub schema: Option<String>,
    pub data: Option<String>,
}

#[derive(Debug, Serialize)]
struct BackupList {
    local: Vec<crate::engine::BackupSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    remote: Option<Vec<crate::engine::BackupSummary>>,
}

// ── GET / ──

pub async fn index() -> ApiResult {
    let endpoints: Vec<String> = ENDPOINTS
        .iter()
        .map(|(method, path)| format!("{} {}", method, path))
        .collect();
    Ok(Json(ApiResponse::with_result(endpoints)?))
}

// ── GET /health ──

pub async fn health() -> ApiResult {
    Ok(Json(ApiResponse::with_message("ok")))
}

// ── GET /metrics ──

pub async fn serve_metrics(State(state): State<Arc<AppState>>) -> Response {
    if !state.config.api.enable_metrics {
        return StatusCode::NOT_FOUND.into_response();
    }
    match metrics::encode(&state.registry) {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            ApiError(Error::Other(format!("unable to encode metrics: {}", e))).into_response()
        }
    }
}

// ── GET /backup/tables ──

pub async fn tables(State(state): State<Arc<AppState>>) -> ApiResult {
    let tables = state.engine.tables().await?;
    Ok(Json(ApiResponse::with_result(tables)?))
}

// ── GET /backup/list ──

pub async fn list(State(state): State<Arc<AppState>>) -> ApiResult {
    let local = state.engine.list_local().await?;
    let remote = if state.config.general.remote_storage == RemoteStorageKind::None {
        None
    } else {
        Some(state.engine.list_remote().await?)
    };
    Ok(Json(ApiResponse::with_result(BackupList { local, remote })?))
}

// ── POST /backup/create ──

pub async fn create(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CreateParams>,
) -> ApiResult {
    let _guard = state.lock.try_acquire("create")?;
    let table = params.table.unwrap_or_default();
    let name = params.name.unwrap_or_default();
    let freeze_one_by_one = params.freeze_one_by_one.is_some();
    info!(name = %name, table = %table, freeze_one_by_one, "Creating backup");

    let created = state
        .metrics
        .track(state.engine.create_backup(&name, &table, freeze_one_by_one))
        .await?;
    info!(name = %created, "Backup created");
    Ok(Json(ApiResponse::with_result(created)?))
}

// ── POST /backup/freeze ──

pub async fn freeze(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TableParams>,
) -> ApiResult {
    let _guard = state.lock.try_acquire("freeze")?;
    let table = params.table.unwrap_or_default();
    info!(table = %table, "Freezing tables");
    state.engine.freeze(&table).await?;
    Ok(Json(ApiResponse::ok()))
}

// ── POST /backup/clean ──

pub async fn clean(State(state): State<Arc<AppState>>) -> ApiResult {
    let _guard = state.lock.try_acquire("clean")?;
    state.engine.clean().await?;
    Ok(Json(ApiResponse::ok()))
}

// ── POST /backup/upload/{name} ──

pub async fn upload(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<UploadParams>,
) -> ApiResult {
    let _guard = state.lock.try_acquire("upload")?;
    let diff_from = params.diff_from.unwrap_or_default();
    info!(name = %name, diff_from = %diff_from, "Uploading backup");
    state.engine.upload(&name, &diff_from).await?;
    Ok(Json(ApiResponse::ok()))
}

// ── POST /backup/download/{name} ──

pub async fn download(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> ApiResult {
    let _guard = state.lock.try_acquire("download")?;
    info!(name = %name, "Downloading backup");
    state.engine.download(&name).await?;
    Ok(Json(ApiResponse::ok()))
}

// ── POST /backup/restore/{name} ──

pub async fn restore(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<RestoreParams>,
) -> ApiResult {
    let _guard = state.lock.try_acquire("restore")?;
    let table = params.table.unwrap_or_default();
    let schema_only = params.schema.is_some();
    let data_only = params.data.is_some();
    info!(name = %name, table = %table, schema_only, data_only, "Restoring backup");
    state.engine.restore(&name, &table, schema_only, data_only).await?;
    Ok(Json(ApiResponse::ok()))
}

// ── POST /backup/delete/{where}/{name} ──

pub async fn delete(
    State(state): State<Arc<AppState>>,
    Path((location, name)): Path<(String, String)>,
) -> ApiResult {
    if location != "local" && location != "remote" {
        let message = "backup location must be 'local' or 'remote'".to_string();
        return Err(Error::Validation(message).into());
    }
    let _guard = state.lock.try_acquire("delete")?;
    info!(name = %name, location = %location, "Deleting backup");
    if location == "local" {
        state.engine.remove_local(&name).await?;
    } else {
        state.engine.remove_remote(&name).await?;
    }
    Ok(Json(ApiResponse::ok()))
}

// ── GET /backup/config/default ──

pub async fn default_config() -> ApiResult {
    Ok(Json(ApiResponse::with_result(Config::default().to_toml_string()?)?))
}

// ── GET /backup/config ──

pub async fn current_config(State(state): State<Arc<AppState>>) -> ApiResult {
    Ok(Json(ApiResponse::with_result(state.config.to_toml_string()?)?))
}

// ── POST /backup/config ──

/// Validates the TOML body, then hands it to the control loop, which writes
/// it to the configuration file once the new generation is bound. The
/// serving generation is left untouched when validation fails.
pub async fn update_config(State(state): State<Arc<AppState>>, body: String) -> ApiResult {
    let config = Config::from_toml_str(&body)?;
    let _guard = state.lock.try_acquire("config")?;

    let listen_addr = config.api.listen_addr.clone();
    state
        .reload_tx
        .send(config)
        .await
        .map_err(|_| Error::Other("server is shutting down".to_string()))?;
    info!(listen_addr = %listen_addr, "Configuration reload requested");
    Ok(Json(ApiResponse::with_message(format!(
        "configuration accepted, restarting on {}",
        listen_addr
    ))))
}
