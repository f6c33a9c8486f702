use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::Json;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::bus::BusFrame;
use crate::client;
use crate::error::SandboxError;
use crate::run::{RunRequest, StartReport};
use crate::store::{AgentEventRecord, ProviderKeyRecord, RunRecord, SandboxRecord};
use crate::types::{CreateOptions, Provider, RunCodeInput, RunCommand};

use super::error::ApiError;
use super::state::AppState;

/// Identity comes from the out-of-scope auth plane; the gateway forwards it
/// in a header.
fn user_id(headers: &HeaderMap) -> String {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("local")
        .to_string()
}

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn providers(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"providers": state.registry.providers()}))
}

// ── Runs ──────────────────────────────────────────────────────────────────────

pub async fn run_start(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RunRequest>,
) -> Result<Json<StartReport>, ApiError> {
    let user = user_id(&headers);
    let record_base = RunRecord {
        id: String::new(),
        user_id: user,
        repo_url: request.repo_url.clone(),
        task: request.task.clone(),
        providers: request.providers.clone(),
        status: "running".to_string(),
        started_at: chrono::Utc::now(),
    };

    let report = state.orchestrator.start(request).await?;

    let mut record = record_base;
    record.id = report.run_id.clone();
    state.store.put_run(record).await?;

    // Persist the run's events and final status as they happen so history
    // outlives the in-memory bus.
    if let Some(handle) = state.orchestrator.get(&report.run_id) {
        let store = state.store.clone();
        let run_id = report.run_id.clone();
        tokio::spawn(async move {
            let mut frames = Box::pin(handle.bus.subscribe());
            while let Some(frame) = frames.next().await {
                match frame {
                    BusFrame::Event(event) => {
                        let record = AgentEventRecord {
                            id: event.id.clone(),
                            run_id: run_id.clone(),
                            seq: event.seq,
                            event_type: event.event_type.as_str().to_string(),
                            provider: event.provider,
                            timestamp: event.timestamp,
                            data: event.data.clone(),
                        };
                        if let Err(e) = store.append_event(record).await {
                            warn!(error = %e, "failed to persist run event");
                        }
                    }
                    BusFrame::Ping => {}
                    BusFrame::Closed => break,
                }
            }
            let status = match handle.state().status {
                crate::run::RunStatus::Completed => "completed",
                crate::run::RunStatus::Failed => "failed",
                _ => "stopped",
            };
            if let Err(e) = store.set_run_status(&run_id, status).await {
                warn!(error = %e, "failed to persist run status");
            }
        });
    }

    Ok(Json(report))
}

pub async fn run_stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.stop(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn run_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let handle = state
        .orchestrator
        .get(&id)
        .ok_or_else(|| ApiError::not_found(format!("run '{id}' not found")))?;
    Ok(Json(json!(handle.state())))
}

/// SSE stream of the run's events: full replay from sequence zero, then
/// live frames, `ping` keep-alives, and a clean end at the terminal frame.
pub async fn run_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let handle = state
        .orchestrator
        .get(&id)
        .ok_or_else(|| ApiError::not_found(format!("run '{id}' not found")))?;

    let frames = handle.bus.subscribe();
    let stream = async_stream::stream! {
        let mut frames = Box::pin(frames);
        while let Some(frame) = frames.next().await {
            match frame {
                BusFrame::Event(event) => {
                    let data = serde_json::to_string(&*event)
                        .unwrap_or_else(|_| "{}".to_string());
                    yield Ok(Event::default().event(event.event_type.as_str()).data(data));
                }
                BusFrame::Ping => {
                    yield Ok(Event::default().event("ping").data("{}"));
                }
                BusFrame::Closed => break,
            }
        }
    };
    Ok(Sse::new(stream))
}

// ── Opencode proxies ──────────────────────────────────────────────────────────

fn lane_url(state: &AppState, run_id: &str, provider: Provider) -> Result<String, ApiError> {
    let handle = state
        .orchestrator
        .get(run_id)
        .ok_or_else(|| ApiError::not_found(format!("run '{run_id}' not found")))?;
    handle
        .state()
        .per_provider
        .get(provider.as_str())
        .and_then(|lane| lane.opencode_url.clone())
        .ok_or_else(|| {
            ApiError::not_found(format!(
                "no agent endpoint for provider '{provider}' in run '{run_id}'"
            ))
        })
}

fn parse_provider(raw: &str) -> Result<Provider, ApiError> {
    raw.parse::<Provider>().map_err(ApiError::from)
}

pub async fn opencode_health(
    State(state): State<AppState>,
    Path((id, provider)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let provider = parse_provider(&provider)?;
    match lane_url(&state, &id, provider) {
        Ok(url) => {
            let healthy =
                client::probe_http(&format!("{url}/health"), Duration::from_secs(5)).await;
            Ok(Json(json!({"healthy": healthy, "url": url})))
        }
        Err(_) => Ok(Json(json!({"healthy": false}))),
    }
}

async fn proxy_get(url: &str) -> Result<Json<Value>, ApiError> {
    let response = reqwest::Client::new()
        .get(url)
        .timeout(Duration::from_secs(15))
        .send()
        .await
        .map_err(|e| ApiError::from(SandboxError::network(format!("GET {url}: {e}"))))?;
    let status = response.status();
    let value: Value = response
        .json()
        .await
        .map_err(|e| ApiError::from(SandboxError::provider(format!("GET {url} decode: {e}"))))?;
    if !status.is_success() {
        return Err(ApiError::from(crate::error::classify_http(
            status.as_u16(),
            value.to_string(),
            None,
            Default::default(),
        )));
    }
    Ok(Json(value))
}

pub async fn opencode_sessions(
    State(state): State<AppState>,
    Path((id, provider)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let provider = parse_provider(&provider)?;
    let base = lane_url(&state, &id, provider)?;
    proxy_get(&format!("{base}/session")).await
}

#[derive(Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_message_limit")]
    limit: usize,
}

fn default_message_limit() -> usize {
    100
}

pub async fn opencode_messages(
    State(state): State<AppState>,
    Path((id, provider, sid)): Path<(String, String, String)>,
    Query(query): Query<MessageQuery>,
) -> Result<Json<Value>, ApiError> {
    let provider = parse_provider(&provider)?;
    let base = lane_url(&state, &id, provider)?;
    proxy_get(&format!(
        "{base}/session/{sid}/message?limit={}",
        query.limit
    ))
    .await
}

// ── Sandboxes ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateSandboxBody {
    pub provider: Provider,
    #[serde(flatten)]
    pub options: CreateOptions,
}

pub async fn sandbox_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateSandboxBody>,
) -> Result<Json<Value>, ApiError> {
    let driver = state.registry.get(body.provider)?;
    let info = driver.lifecycle().create(body.options).await?;
    let record = SandboxRecord {
        id: format!("sbx-rec-{}", uuid::Uuid::new_v4()),
        user_id: user_id(&headers),
        provider: body.provider,
        sandbox_id: info.id.clone(),
        name: info.name.clone(),
        created_at: info.created_at,
    };
    state.store.put_sandbox(record).await?;
    Ok(Json(json!(info)))
}

#[derive(Deserialize)]
pub struct ProviderQuery {
    pub provider: String,
}

pub async fn sandbox_destroy(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ProviderQuery>,
) -> Result<StatusCode, ApiError> {
    let provider = parse_provider(&query.provider)?;
    let driver = state.registry.get(provider)?;
    driver.lifecycle().destroy(&id).await?;
    if let Err(e) = state.store.delete_sandbox(&id).await {
        // The record may simply predate this server instance.
        warn!(error = %e, sandbox = %id, "no stored record for destroyed sandbox");
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct LsQuery {
    pub provider: String,
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
}

pub async fn sandbox_ls(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LsQuery>,
) -> Result<Json<Value>, ApiError> {
    let provider = parse_provider(&query.provider)?;
    let driver = state.registry.get(provider)?;
    let entries = driver
        .fs()
        .list_dir(&id, &query.path, query.recursive)
        .await?;
    Ok(Json(json!(entries)))
}

#[derive(Deserialize)]
pub struct ReadQuery {
    pub provider: String,
    pub path: String,
    pub encoding: Option<String>,
}

pub async fn sandbox_read(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ReadQuery>,
) -> Result<Json<Value>, ApiError> {
    let provider = parse_provider(&query.provider)?;
    let driver = state.registry.get(provider)?;
    match query.encoding.as_deref() {
        Some("utf8") | Some("utf-8") => {
            let text = driver.fs().read_file_utf8(&id, &query.path).await?;
            Ok(Json(json!({"path": query.path, "encoding": "utf8", "content": text})))
        }
        None | Some("base64") => {
            let bytes = driver.fs().read_file(&id, &query.path).await?;
            let encoded = {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD.encode(&bytes)
            };
            Ok(Json(json!({
                "path": query.path,
                "encoding": "base64",
                "content": encoded,
            })))
        }
        Some(other) => Err(ApiError::bad_request(format!("unknown encoding '{other}'"))),
    }
}

#[derive(Deserialize)]
pub struct RunBody {
    pub provider: Provider,
    #[serde(flatten)]
    pub command: RunCommand,
}

pub async fn sandbox_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RunBody>,
) -> Result<Json<Value>, ApiError> {
    let driver = state.registry.get(body.provider)?;
    let result = driver.process().run(&id, body.command).await?;
    Ok(Json(json!(result)))
}

#[derive(Deserialize)]
pub struct ExecBody {
    pub provider: Provider,
    #[serde(flatten)]
    pub input: RunCodeInput,
}

pub async fn sandbox_exec(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ExecBody>,
) -> Result<Json<Value>, ApiError> {
    let driver = state.registry.get(body.provider)?;
    let result = driver.code().run_code(&id, body.input).await?;
    Ok(Json(json!(result)))
}

// ── User data ─────────────────────────────────────────────────────────────────

pub async fn keys_list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let keys = state.store.keys_by_user(&user_id(&headers)).await?;
    Ok(Json(json!(keys)))
}

#[derive(Deserialize)]
pub struct CreateKeyBody {
    pub provider: Provider,
    pub key: String,
    pub label: Option<String>,
}

pub async fn keys_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateKeyBody>,
) -> Result<Json<Value>, ApiError> {
    if body.key.trim().is_empty() {
        return Err(ApiError::bad_request("key must not be empty"));
    }
    let record = ProviderKeyRecord {
        id: format!("key-{}", uuid::Uuid::new_v4()),
        user_id: user_id(&headers),
        provider: body.provider,
        label: body.label,
        secret: body.key,
        created_at: chrono::Utc::now(),
    };
    let id = record.id.clone();
    state.store.put_key(record).await?;
    Ok(Json(json!({"id": id})))
}

pub async fn keys_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.store.delete_key(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn user_sandboxes(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let records = state.store.sandboxes_by_user(&user_id(&headers)).await?;
    Ok(Json(json!(records)))
}

pub async fn user_runs(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let records = state.store.runs_by_user(&user_id(&headers)).await?;
    Ok(Json(json!(records)))
}
