use crate::app::{now_ts, AppState, Snapshot};
use crate::config;
use crate::dedup::StreamEvent;
use crate::dispatch::{dispatch_messages, DispatchOutput};
use crate::error::{AppError, AppResult};
use crate::providers;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::Json;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use tokio_stream::wrappers::UnboundedReceiverStream;

pub async fn create_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    let wants_stream = body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);
    match dispatch_messages(&state, headers, body).await {
        Ok(DispatchOutput::Json { status, body }) => {
            let status =
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            Ok((status, Json(body)).into_response())
        }
        Ok(DispatchOutput::Stream {
            rx,
            first_chunk_timeout,
        }) => {
            let timed =
                tokio_stream::StreamExt::timeout(UnboundedReceiverStream::new(rx), first_chunk_timeout);
            let stream = timed
                .scan(false, |ended, item| {
                    if *ended {
                        return futures_util::future::ready(None);
                    }
                    let event = match item {
                        Ok(event) => event_to_sse(event),
                        Err(_elapsed) => {
                            *ended = true;
                            Some(error_event(&AppError::deduplication_timeout()))
                        }
                    };
                    futures_util::future::ready(Some(event))
                })
                .filter_map(|event| {
                    futures_util::future::ready(event.map(Ok::<_, Infallible>))
                });
            Ok(Sse::new(stream).into_response())
        }
        Err(err) if wants_stream => Ok(Sse::new(error_sse_stream(err)).into_response()),
        Err(err) => Err(err),
    }
}

fn event_to_sse(event: StreamEvent) -> Option<Event> {
    match event {
        StreamEvent::Sse { event, data } => {
            let mut out = Event::default().data(data);
            if let Some(name) = event {
                out = out.event(name);
            }
            Some(out)
        }
        StreamEvent::Error(err) => Some(error_event(&err)),
        StreamEvent::Done | StreamEvent::Response { .. } => None,
    }
}

fn error_event(err: &AppError) -> Event {
    Event::default().event("error").data(
        json!({
            "type": "error",
            "error": { "type": err.code, "message": err.message }
        })
        .to_string(),
    )
}

fn error_sse_stream(
    err: AppError,
) -> impl futures_util::Stream<Item = Result<Event, Infallible>> + Send + 'static {
    futures_util::stream::iter(vec![Ok(error_event(&err))])
}

pub async fn list_models(State(state): State<AppState>) -> Response {
    let snapshot = state.snapshot.load_full();
    let mut model_ids: Vec<&str> = snapshot
        .config
        .model_routes
        .iter()
        .map(|route| route.model.as_str())
        .filter(|pattern| !pattern.contains('*'))
        .collect();
    model_ids.sort();
    model_ids.dedup();
    let data: Vec<Value> = model_ids
        .into_iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "created": 0,
                "owned_by": "switchboard"
            })
        })
        .collect();
    Json(json!({ "object": "list", "data": data })).into_response()
}

pub async fn list_providers(State(state): State<AppState>) -> Response {
    let snapshot = state.snapshot.load_full();
    let health = state.health.snapshot().await;
    let providers: Vec<Value> = snapshot
        .config
        .providers
        .iter()
        .map(|provider| {
            let key = provider.key();
            let health = health.get(&key);
            json!({
                "name": provider.name,
                "type": provider.provider_type.as_str(),
                "account_email": provider.account_email,
                "enabled": provider.enabled,
                "healthy": health.map(|h| h.healthy).unwrap_or(true),
                "consecutive_errors": health.map(|h| h.consecutive_errors).unwrap_or(0),
                "last_error_at": health.and_then(|h| h.last_error_at),
                "last_success_at": health.and_then(|h| h.last_success_at),
                "cooldown_until": health.and_then(|h| h.cooldown_until),
            })
        })
        .collect();
    Json(json!({ "providers": providers })).into_response()
}

pub async fn health_check() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

pub async fn reload_config(State(state): State<AppState>) -> AppResult<Response> {
    let config = config::load(&state.config_path)?;
    config::warn_unrecognized_keys(&config);
    state
        .oauth
        .load_persisted_accounts(&config.settings.oauth, &providers::oauth_accounts(&config))
        .await;
    let summary = json!({
        "status": "reloaded",
        "providers": config.providers.len(),
        "model_routes": config.model_routes.len(),
    });
    state.snapshot.store(std::sync::Arc::new(Snapshot::new(config)));
    tracing::info!("configuration reloaded");
    Ok(Json(summary).into_response())
}

pub async fn oauth_generate_url(State(state): State<AppState>) -> Response {
    let (auth_url, oauth_state) = state.oauth.generate_authorize_url(now_ts());
    Json(json!({
        "auth_url": auth_url,
        "state": oauth_state,
        "instructions": "open auth_url in a browser, authorize, then POST the code to /oauth/exchange-code",
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct ExchangeCodeRequest {
    pub code: String,
    pub account_email: String,
}

pub async fn oauth_exchange_code(
    State(state): State<AppState>,
    Json(payload): Json<ExchangeCodeRequest>,
) -> AppResult<Response> {
    let snapshot = state.snapshot.load_full();
    let token = state
        .oauth
        .exchange_code(
            &snapshot.config.settings.oauth,
            &payload.code,
            &payload.account_email,
            now_ts(),
        )
        .await?;
    Ok(Json(json!({
        "status": "ok",
        "account_email": payload.account_email,
        "expires_at": token.expires_at,
    }))
    .into_response())
}

pub async fn oauth_refresh(
    State(state): State<AppState>,
    Path(account_email): Path<String>,
) -> AppResult<Response> {
    let snapshot = state.snapshot.load_full();
    let token = state
        .oauth
        .refresh(&snapshot.config.settings.oauth, &account_email, now_ts())
        .await?;
    Ok(Json(json!({
        "status": "refreshed",
        "account_email": account_email,
        "expires_at": token.expires_at,
    }))
    .into_response())
}

pub async fn oauth_status(State(state): State<AppState>) -> Response {
    let accounts = state.oauth.status(now_ts()).await;
    Json(json!({ "accounts": accounts })).into_response()
}

pub async fn oauth_delete_all(State(state): State<AppState>) -> Response {
    let snapshot = state.snapshot.load_full();
    let removed = state
        .oauth
        .remove(&snapshot.config.settings.oauth, None)
        .await;
    Json(json!({ "removed": removed })).into_response()
}

pub async fn oauth_delete_one(
    State(state): State<AppState>,
    Path(account_email): Path<String>,
) -> AppResult<Response> {
    let snapshot = state.snapshot.load_full();
    let removed = state
        .oauth
        .remove(&snapshot.config.settings.oauth, Some(&account_email))
        .await;
    if removed == 0 {
        return Err(AppError::new(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no stored token for account: {account_email}"),
        ));
    }
    Ok(Json(json!({ "removed": removed })).into_response())
}
