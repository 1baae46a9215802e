//! API route definitions.

use std::fmt::Display;
use std::str::FromStr;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};

use super::error::ApiError;
use super::state::AppState;
use crate::runs::{DateWindow, RunStatus, RunType};
use crate::storage::{RunFilter, StoreError, DEFAULT_PER_PAGE};

const DEFAULT_DIAGNOSTICS: usize = 50;
const MAX_DIAGNOSTICS: usize = 500;
const DEFAULT_PREVIEW_HOURS: u64 = 24;
const MAX_PREVIEW_HOURS: u64 = 24 * 31;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/runs", get(list_runs))
        .route("/runs/latest", get(latest_run))
        .route("/runs/{date}/{run_type}", get(get_run))
        .route("/metrics", get(metrics))
        .route("/trigger", get(trigger_state).post(trigger))
        .route("/diagnostics", get(diagnostics))
        .route("/schedules", get(list_schedules))
        .route("/schedules/preview", get(schedule_preview))
}

fn envelope(data: Value, meta: Value) -> Json<Value> {
    Json(json!({ "data": data, "meta": meta }))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, ApiError> {
    serde_json::to_value(value).map_err(|e| ApiError::internal(e.to_string()))
}

/// Run a store call on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await??)
}

/// Treats `?key=` the same as an absent key.
fn empty_as_none<'de, D, T>(de: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let raw: Option<String> = Option::deserialize(de)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

async fn health(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let store = state.store.clone();
    let runs = blocking(move || store.count()).await?;
    Ok(envelope(
        json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "runs": runs,
        }),
        json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }),
    ))
}

#[derive(Debug, Default, Deserialize)]
struct RunsQuery {
    #[serde(default, deserialize_with = "empty_as_none")]
    from: Option<NaiveDate>,
    #[serde(default, deserialize_with = "empty_as_none")]
    to: Option<NaiveDate>,
    #[serde(default, deserialize_with = "empty_as_none")]
    run_type: Option<RunType>,
    #[serde(default, deserialize_with = "empty_as_none")]
    status: Option<RunStatus>,
    #[serde(default, deserialize_with = "empty_as_none")]
    search: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    page: Option<u32>,
    #[serde(default, deserialize_with = "empty_as_none")]
    per_page: Option<u32>,
}

async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Value>, ApiError> {
    let filter = RunFilter {
        from: query.from,
        to: query.to,
        run_type: query.run_type,
        status: query.status,
        search: query.search,
        page: query.page.unwrap_or(1),
        per_page: query.per_page.unwrap_or(DEFAULT_PER_PAGE),
    };
    let store = state.store.clone();
    let page = blocking(move || store.list(&filter)).await?;
    Ok(envelope(
        to_value(&page.runs)?,
        json!({
            "total": page.total,
            "page": page.page,
            "per_page": page.per_page,
            "total_pages": page.total_pages,
        }),
    ))
}

async fn latest_run(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let store = state.store.clone();
    let latest = blocking(move || store.latest()).await?;
    let message = if latest.is_none() { "no runs recorded yet" } else { "" };
    Ok(envelope(to_value(&latest)?, json!({ "message": message })))
}

async fn get_run(
    State(state): State<AppState>,
    Path((date, run_type)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let date: NaiveDate = date
        .parse()
        .map_err(|_| ApiError::bad_request(format!("invalid date '{date}', expected YYYY-MM-DD")))?;
    let run_type: RunType = run_type.parse().map_err(|e| ApiError::bad_request(format!("{e}")))?;

    let store = state.store.clone();
    let run = blocking(move || store.get(date, run_type))
        .await?
        .ok_or_else(|| ApiError::not_found(format!("no {run_type} run on {date}")))?;
    Ok(envelope(to_value(&run)?, json!({})))
}

#[derive(Debug, Default, Deserialize)]
struct MetricsQuery {
    #[serde(default, deserialize_with = "empty_as_none")]
    from: Option<NaiveDate>,
    #[serde(default, deserialize_with = "empty_as_none")]
    to: Option<NaiveDate>,
    #[serde(default, deserialize_with = "empty_as_none")]
    days: Option<u32>,
}

impl MetricsQuery {
    /// `days` wins over an explicit range.
    fn window(&self, today: NaiveDate) -> DateWindow {
        match self.days {
            Some(days) => DateWindow::last_days(today, days),
            None => DateWindow {
                from: self.from,
                to: self.to,
            },
        }
    }
}

async fn metrics(
    State(state): State<AppState>,
    Query(query): Query<MetricsQuery>,
) -> Result<Json<Value>, ApiError> {
    let window = query.window(Local::now().date_naive());
    if let (Some(from), Some(to)) = (window.from, window.to) {
        if from > to {
            return Err(ApiError::bad_request(format!("from {from} is after to {to}")));
        }
    }
    let service = state.metrics.clone();
    let metrics = blocking(move || service.metrics(window)).await?;
    Ok(envelope(
        to_value(metrics.as_ref())?,
        json!({ "from": window.from, "to": window.to }),
    ))
}

async fn trigger_state(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let now = Local::now().naive_local();
    let current = state.trigger.state(now).await;
    Ok(envelope(to_value(&current)?, json!({})))
}

async fn trigger(State(state): State<AppState>) -> Result<(StatusCode, Json<Value>), ApiError> {
    let now = Local::now().naive_local();
    let placeholder = state.trigger.trigger(now).await?;
    state.metrics.invalidate();
    Ok((
        StatusCode::ACCEPTED,
        envelope(
            to_value(&placeholder)?,
            json!({ "message": "backup launched; progress is reported by the backup log" }),
        ),
    ))
}

#[derive(Debug, Default, Deserialize)]
struct LimitQuery {
    #[serde(default, deserialize_with = "empty_as_none")]
    limit: Option<usize>,
}

async fn diagnostics(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_DIAGNOSTICS).clamp(1, MAX_DIAGNOSTICS);
    let log = state.diagnostics.clone();
    let entries = blocking(move || log.list_recent(limit)).await?;
    let total = entries.len();
    Ok(envelope(to_value(&entries)?, json!({ "total": total, "limit": limit })))
}

async fn list_schedules(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let schedules: Vec<_> = state.schedules.schedules().collect();
    let total = schedules.len();
    Ok(envelope(to_value(&schedules)?, json!({ "total": total })))
}

#[derive(Debug, Default, Deserialize)]
struct PreviewQuery {
    #[serde(default, deserialize_with = "empty_as_none")]
    hours: Option<u64>,
}

async fn schedule_preview(
    State(state): State<AppState>,
    Query(query): Query<PreviewQuery>,
) -> Result<Json<Value>, ApiError> {
    let hours = query.hours.unwrap_or(DEFAULT_PREVIEW_HOURS).clamp(1, MAX_PREVIEW_HOURS);
    let upcoming = state.schedules.preview(Local::now(), hours);
    let total = upcoming.len();
    Ok(envelope(to_value(&upcoming)?, json!({ "hours": hours, "total": total })))
}
