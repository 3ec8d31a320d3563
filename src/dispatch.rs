use crate::adapter::{self, OpenAiStreamTranslator};
use crate::app::{now_ts, AppState, Snapshot};
use crate::classify::{classify, AttemptOutcome, Classification};
use crate::config::{AuthType, ProviderConfig, ProviderType, StreamingMode, TestingSettings};
use crate::dedup::{await_response, Broadcaster, JoinOutcome, StreamEvent};
use crate::error::{AppError, AppResult};
use crate::routing::{self, Candidate};
use crate::signature::request_fingerprint;
use crate::upstream::{self, ResolvedAuth};
use axum::http::{HeaderMap, StatusCode};
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// What a finished dispatch hands back to the HTTP handler.
pub enum DispatchOutput {
    Json {
        status: u16,
        body: Value,
    },
    Stream {
        rx: mpsc::UnboundedReceiver<StreamEvent>,
        first_chunk_timeout: Duration,
    },
}

/// Entry point for `/v1/messages`. Deduplicates, then either joins an
/// in-flight twin or leads a new upstream attempt chain whose output flows
/// through a broadcaster shared with any later duplicates.
pub async fn dispatch_messages(
    state: &AppState,
    headers: HeaderMap,
    body: Value,
) -> AppResult<DispatchOutput> {
    let snapshot = state.snapshot.load_full();
    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| {
            AppError::new(StatusCode::BAD_REQUEST, "invalid_request", "missing model")
        })?
        .to_string();
    let stream = body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);
    let dedup_timeout =
        Duration::from_secs(snapshot.config.settings.timeouts.caching.deduplication_timeout);

    let (broadcaster, fingerprint) = if snapshot.config.settings.deduplication.enabled {
        let fingerprint = request_fingerprint(
            &body,
            snapshot
                .config
                .settings
                .deduplication
                .include_max_tokens_in_signature,
        );
        match state.dedup.join_or_lead(&fingerprint, now_ts()) {
            JoinOutcome::Joined(rx) => {
                tracing::debug!(model = %model, fingerprint = %fingerprint, "joined in-flight duplicate");
                return finish(stream, rx, dedup_timeout).await;
            }
            JoinOutcome::Leader(broadcaster) => (broadcaster, Some(fingerprint)),
        }
    } else {
        (Broadcaster::new(), None)
    };

    // The leader consumes its own broadcaster like any duplicate would, so
    // the upstream task survives this client's disconnect as long as other
    // subscribers remain.
    let rx = broadcaster.subscribe();
    let task_state = state.clone();
    tokio::spawn(async move {
        run_leader(
            task_state,
            snapshot,
            headers,
            body,
            model,
            stream,
            broadcaster,
            fingerprint,
        )
        .await;
    });

    finish(stream, rx, dedup_timeout).await
}

async fn finish(
    stream: bool,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    dedup_timeout: Duration,
) -> AppResult<DispatchOutput> {
    if stream {
        return Ok(DispatchOutput::Stream {
            rx,
            first_chunk_timeout: dedup_timeout,
        });
    }
    let (status, body) = await_response(rx, dedup_timeout).await?;
    Ok(DispatchOutput::Json { status, body })
}

/// How the leader's attempt chain ended, which decides entry retirement.
enum LeaderOutcome {
    /// Clean completion or a pre-commit terminal error: retire now.
    Settled,
    /// Mid-stream error after bytes were committed: keep the entry for the
    /// SSE-error retention window.
    PostCommitError,
}

#[allow(clippy::too_many_arguments)]
async fn run_leader(
    state: AppState,
    snapshot: Arc<Snapshot>,
    headers: HeaderMap,
    body: Value,
    model: String,
    stream: bool,
    broadcaster: Arc<Broadcaster>,
    fingerprint: Option<String>,
) {
    let outcome = attempt_candidates(
        &state,
        &snapshot,
        &headers,
        &body,
        &model,
        stream,
        &broadcaster,
    )
    .await;

    if let Some(fingerprint) = fingerprint {
        match outcome {
            LeaderOutcome::Settled => state.dedup.retire(&fingerprint),
            LeaderOutcome::PostCommitError => state.dedup.retire_after(
                &fingerprint,
                snapshot.config.settings.deduplication.sse_error_cleanup_delay,
            ),
        }
    }
}

async fn attempt_candidates(
    state: &AppState,
    snapshot: &Snapshot,
    headers: &HeaderMap,
    body: &Value,
    model: &str,
    stream: bool,
    broadcaster: &Arc<Broadcaster>,
) -> LeaderOutcome {
    let config = &snapshot.config;
    let candidates = routing::resolve(
        config,
        &state.health,
        &state.route_cursors,
        model,
        now_ts(),
    )
    .await
    .unwrap_or_default();
    if candidates.is_empty() {
        broadcaster.close_error(AppError::no_route(model));
        return LeaderOutcome::Settled;
    }

    maybe_simulate_delay(&config.settings.testing, body).await;

    let mut last_retryable: Option<AppError> = None;
    let mut auth_skip: Option<AppError> = None;
    let mut tried = 0usize;

    for candidate in candidates {
        let provider_key = candidate.provider.key();
        let auth = match resolve_credential(state, snapshot, &candidate.provider).await {
            Ok(auth) => auth,
            Err(err) => {
                // Non-counting skip: the provider is fine, the credential is
                // not. Health stays untouched.
                tracing::warn!(provider = %provider_key, "skipping candidate: {}", err.message);
                auth_skip = Some(err);
                continue;
            }
        };
        tried += 1;

        let result = attempt_one(
            state,
            snapshot,
            &candidate,
            &auth,
            headers,
            body,
            model,
            stream,
            broadcaster,
        )
        .await;

        match result {
            AttemptResult::Completed => {
                state
                    .health
                    .record_success(&provider_key, &config.settings, now_ts())
                    .await;
                return LeaderOutcome::Settled;
            }
            AttemptResult::Retryable(err) => {
                state
                    .health
                    .record_failure(&provider_key, &config.settings, now_ts())
                    .await;
                tracing::warn!(
                    provider = %provider_key,
                    model = %model,
                    "retryable upstream failure, trying next candidate: {}",
                    err.message
                );
                last_retryable = Some(err);
            }
            AttemptResult::Terminal => {
                // Non-retryable outcome already published verbatim.
                return LeaderOutcome::Settled;
            }
            AttemptResult::PostCommitFailure => {
                state
                    .health
                    .record_failure(&provider_key, &config.settings, now_ts())
                    .await;
                return LeaderOutcome::PostCommitError;
            }
            AttemptResult::Cancelled => {
                broadcaster.close_error(AppError::new(
                    StatusCode::BAD_REQUEST,
                    "cancelled",
                    "every subscriber disconnected before completion",
                ));
                return LeaderOutcome::Settled;
            }
        }
    }

    let err = match (last_retryable, auth_skip) {
        (Some(last), _) => AppError::new(
            exhaustion_status(&last),
            "all_providers_failed",
            format!(
                "all {tried} candidate(s) for model {model} failed; last error: {}",
                last.message
            ),
        ),
        (None, Some(auth_err)) => auth_err,
        (None, None) => AppError::new(
            StatusCode::BAD_GATEWAY,
            "all_providers_failed",
            format!("no candidate for model {model} could be attempted"),
        ),
    };
    broadcaster.close_error(err);
    LeaderOutcome::Settled
}

/// The client status for exhaustion derives from the last candidate's error.
fn exhaustion_status(last: &AppError) -> StatusCode {
    match last.status {
        StatusCode::SERVICE_UNAVAILABLE => StatusCode::SERVICE_UNAVAILABLE,
        StatusCode::GATEWAY_TIMEOUT | StatusCode::REQUEST_TIMEOUT => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    }
}

async fn resolve_credential(
    state: &AppState,
    snapshot: &Snapshot,
    provider: &ProviderConfig,
) -> AppResult<ResolvedAuth> {
    if upstream::is_passthrough(provider) {
        return Ok(ResolvedAuth::Passthrough);
    }
    match provider.auth_type {
        AuthType::ApiKey | AuthType::AuthToken => {
            Ok(ResolvedAuth::Literal(provider.auth_value.clone()))
        }
        AuthType::Oauth => state
            .oauth
            .access_token(
                &snapshot.config.settings.oauth,
                provider.account_email.as_deref(),
                now_ts(),
            )
            .await
            .map(ResolvedAuth::OauthToken),
    }
}

enum AttemptResult {
    /// Response delivered and the broadcaster closed cleanly.
    Completed,
    /// Health-counting failure; nothing was published, the next candidate
    /// may be tried.
    Retryable(AppError),
    /// Non-retryable outcome; already published as the terminal result.
    Terminal,
    /// Stream failed after chunks were committed; broadcaster closed with
    /// the error sentinel.
    PostCommitFailure,
    /// Every subscriber went away mid-flight.
    Cancelled,
}

#[allow(clippy::too_many_arguments)]
async fn attempt_one(
    state: &AppState,
    snapshot: &Snapshot,
    candidate: &Candidate,
    auth: &ResolvedAuth,
    headers: &HeaderMap,
    body: &Value,
    model: &str,
    stream: bool,
    broadcaster: &Arc<Broadcaster>,
) -> AttemptResult {
    let provider = &candidate.provider;
    let settings = &snapshot.config.settings;
    let is_openai = provider.provider_type == ProviderType::Openai;

    // Background mode buffers the whole upstream response before committing
    // any byte, which keeps failover possible; it is the default wherever
    // translation is needed.
    let background = match settings.streaming_mode {
        StreamingMode::Auto => is_openai,
        StreamingMode::Direct => false,
        StreamingMode::Background => true,
    };
    let upstream_stream = stream && !background;

    let upstream_body = if is_openai {
        adapter::openai_request_from_anthropic(body, &candidate.upstream_model, upstream_stream)
    } else {
        let mut rewritten = body.clone();
        if let Some(obj) = rewritten.as_object_mut() {
            obj.insert(
                "model".to_string(),
                Value::String(candidate.upstream_model.clone()),
            );
            obj.insert("stream".to_string(), Value::Bool(upstream_stream));
        }
        rewritten
    };

    let timeout = if upstream_stream {
        Duration::from_secs(settings.timeouts.streaming.read_timeout)
    } else {
        Duration::from_secs(settings.timeouts.non_streaming.read_timeout)
    };

    let client = match state.client_for(provider).await {
        Ok(client) => client,
        Err(err) => return AttemptResult::Retryable(err),
    };

    let response = match upstream::send_request(
        &client,
        provider,
        auth,
        headers,
        &upstream_body,
        timeout,
    )
    .await
    {
        Ok(response) => response,
        Err(transport) => {
            let classification = classify(
                settings,
                &snapshot.body_patterns,
                &AttemptOutcome::Transport {
                    message: &transport.message,
                },
            );
            let err = AppError::new(StatusCode::BAD_GATEWAY, "upstream_error", transport.message);
            return match classification {
                Classification::Retryable => AttemptResult::Retryable(err),
                _ => {
                    broadcaster.close_error(err);
                    AttemptResult::Terminal
                }
            };
        }
    };

    let status = response.status();
    if upstream_stream && status.is_success() {
        return pipe_direct_stream(response, is_openai, model, broadcaster).await;
    }

    // Buffered path: non-stream requests, background mode, and any non-2xx
    // status (error bodies are small and classification needs them whole).
    let text = match response.text().await {
        Ok(text) => text,
        Err(err) => {
            let message = err.to_string();
            let classification = classify(
                settings,
                &snapshot.body_patterns,
                &AttemptOutcome::Transport { message: &message },
            );
            let err = AppError::new(StatusCode::BAD_GATEWAY, "upstream_error", message);
            return match classification {
                Classification::Retryable => AttemptResult::Retryable(err),
                _ => {
                    broadcaster.close_error(err);
                    AttemptResult::Terminal
                }
            };
        }
    };

    let classification = classify(
        settings,
        &snapshot.body_patterns,
        &AttemptOutcome::Http {
            status: status.as_u16(),
            body: &text,
        },
    );
    match classification {
        Classification::Retryable => {
            let code = upstream::extract_error_code(&text);
            AttemptResult::Retryable(AppError::new(
                status,
                code.unwrap_or_else(|| "upstream_error".to_string()),
                format!("upstream status {status}: {}", truncate(&text, 300)),
            ))
        }
        Classification::NonRetryable => {
            // 4xx pass-through: the client sees the upstream body and status
            // untouched.
            let body: Value = serde_json::from_str(&text).unwrap_or_else(|_| {
                serde_json::json!({
                    "type": "error",
                    "error": { "type": "upstream_error", "message": text }
                })
            });
            if stream {
                broadcaster.close_error(AppError::new(
                    status,
                    upstream::extract_error_code(&text)
                        .unwrap_or_else(|| "upstream_error".to_string()),
                    truncate(&text, 300).to_string(),
                ));
            } else {
                broadcaster.close_ok(StreamEvent::Response {
                    status: status.as_u16(),
                    body,
                });
            }
            AttemptResult::Terminal
        }
        Classification::Success => {
            let parsed: Value = match serde_json::from_str(&text) {
                Ok(parsed) => parsed,
                Err(err) => {
                    return AttemptResult::Retryable(AppError::new(
                        StatusCode::BAD_GATEWAY,
                        "upstream_error",
                        format!("unparseable 2xx body: {err}"),
                    ));
                }
            };
            let anthropic_body = if is_openai {
                adapter::anthropic_response_from_openai(&parsed, model)
            } else {
                parsed
            };
            if stream {
                for event in adapter::synthesize_anthropic_sse(&anthropic_body) {
                    broadcaster.publish(event);
                }
                broadcaster.close_ok(StreamEvent::Done);
            } else {
                broadcaster.close_ok(StreamEvent::Response {
                    status: status.as_u16(),
                    body: anthropic_body,
                });
            }
            AttemptResult::Completed
        }
    }
}

/// Direct mode: pipe upstream SSE frames through as they arrive. The first
/// published chunk commits the response; from then on failures surface to
/// the client instead of failing over.
async fn pipe_direct_stream(
    response: reqwest::Response,
    is_openai: bool,
    model: &str,
    broadcaster: &Arc<Broadcaster>,
) -> AttemptResult {
    let mut events = response.bytes_stream().eventsource();
    let mut translator = is_openai.then(|| OpenAiStreamTranslator::new(model));
    let mut committed = false;
    let mut terminated = false;

    while let Some(frame) = events.next().await {
        match frame {
            Ok(frame) => {
                let mut live = usize::MAX;
                match translator.as_mut() {
                    Some(translator) => {
                        for event in translator.on_data(&frame.data) {
                            if matches!(&event, StreamEvent::Sse { event: Some(name), .. } if name.as_str() == "message_stop")
                            {
                                terminated = true;
                            }
                            committed = true;
                            live = broadcaster.publish(event);
                        }
                    }
                    None => {
                        if frame.event == "error" {
                            // Mid-stream upstream error: deliver it, then
                            // close so retrying duplicates share the outcome.
                            broadcaster.publish(StreamEvent::Sse {
                                event: Some(frame.event.clone()),
                                data: frame.data.clone(),
                            });
                            broadcaster.close_error(AppError::new(
                                StatusCode::BAD_GATEWAY,
                                "upstream_error",
                                format!("upstream stream error: {}", truncate(&frame.data, 300)),
                            ));
                            return AttemptResult::PostCommitFailure;
                        }
                        if frame.event == "message_stop" {
                            terminated = true;
                        }
                        committed = true;
                        live = broadcaster.publish(StreamEvent::Sse {
                            event: (!frame.event.is_empty()).then(|| frame.event.clone()),
                            data: frame.data,
                        });
                    }
                }
                if committed && live == 0 {
                    return AttemptResult::Cancelled;
                }
            }
            Err(err) => {
                if committed {
                    broadcaster.close_error(AppError::new(
                        StatusCode::BAD_GATEWAY,
                        "upstream_error",
                        format!("upstream connection lost mid-stream: {err}"),
                    ));
                    return AttemptResult::PostCommitFailure;
                }
                return AttemptResult::Retryable(AppError::new(
                    StatusCode::BAD_GATEWAY,
                    "upstream_error",
                    err.to_string(),
                ));
            }
        }
    }

    if let Some(translator) = translator.as_mut() {
        // OpenAI streams may end without an explicit [DONE].
        let closing = translator.finish();
        if !closing.is_empty() {
            terminated = true;
            for event in closing {
                broadcaster.publish(event);
            }
        }
    }

    if terminated {
        broadcaster.close_ok(StreamEvent::Done);
        AttemptResult::Completed
    } else if committed {
        broadcaster.close_error(AppError::new(
            StatusCode::BAD_GATEWAY,
            "upstream_error",
            "upstream stream ended before completion",
        ));
        AttemptResult::PostCommitFailure
    } else {
        AttemptResult::Retryable(AppError::new(
            StatusCode::BAD_GATEWAY,
            "upstream_error",
            "upstream stream produced no events",
        ))
    }
}

async fn maybe_simulate_delay(testing: &TestingSettings, body: &Value) {
    if !testing.simulate_delay || testing.delay_seconds == 0 {
        return;
    }
    let serialized = body.to_string();
    let triggered = testing.delay_trigger_keywords.is_empty()
        || testing
            .delay_trigger_keywords
            .iter()
            .any(|keyword| serialized.contains(keyword));
    if triggered {
        tracing::debug!(seconds = testing.delay_seconds, "simulated delay triggered");
        tokio::time::sleep(Duration::from_secs(testing.delay_seconds)).await;
    }
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
