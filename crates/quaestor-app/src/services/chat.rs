//! Streaming chat orchestrator.
//!
//! The pre-stream phase authorizes the caller, reconstructs the conversation,
//! validates the request, and reserves budget headroom, all before a single
//! byte is streamed. The streaming phase bridges the blocking upstream
//! generator onto the async transport through a producer thread and a bounded
//! channel, enforcing budget mid-stream and unwinding cleanly on disconnect,
//! upstream failure, backpressure, and capacity exhaustion. Every failure path
//! still emits a well-formed error frame and the `[DONE]` sentinel.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::services::catalog::User;
use crate::services::context::AppContext;
use crate::services::costs::{
    calc_query_cost, estimate_tokens_from_text, pricing_configured, resolve_model_rates,
    CostMicros, ResolvedRates,
};
use crate::services::db::MetaStoreError;
use crate::services::history::sanitize_session_id;
use crate::services::ledger::QueryLog;
use crate::services::rag::{extract_citations, AskRequest, GroundingInfo, RagError, UsageMeta};

const HISTORY_LIMIT: usize = 50;
const MAX_TRANSCRIPT_LINES: usize = 24;
const MAX_TRANSCRIPT_CHARS: usize = 6000;
const MAX_TAGS: usize = 5;
const TAG_KEY_MAX: usize = 32;
const TAG_VALUE_MAX: usize = 128;
const METADATA_VALUE_MAX: usize = 256;
const SEMAPHORE_TIMEOUT: Duration = Duration::from_secs(2);
const CHUNK_QUEUE_CAP: usize = 20;
const CHUNK_POLL_INTERVAL: Duration = Duration::from_millis(100);
const BACKPRESSURE_PATIENCE: Duration = Duration::from_secs(1);

/// Wire-format chat request. Camel-case aliases keep older clients working.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChatRequest {
    pub question: Option<String>,
    pub messages: Vec<Value>,
    #[serde(alias = "sessionId")]
    pub session_id: Option<String>,
    #[serde(alias = "threadId")]
    pub thread_id: Option<String>,
    #[serde(alias = "storeIds")]
    pub store_ids: Vec<String>,
    #[serde(alias = "metadataFilter")]
    pub metadata_filter: Option<Value>,
    pub model: Option<String>,
    pub tags: Option<Value>,
}

/// Pre-stream rejection; each variant carries a stable machine-readable code
/// and maps onto one HTTP status. Messages stay content-free.
#[derive(Debug, Error)]
pub enum ChatRefusal {
    #[error("Missing storeIds")]
    MissingStores,
    #[error("Missing question")]
    MissingQuestion,
    #[error("Question too long (max {max} characters)")]
    QuestionTooLong { max: usize },
    #[error("Unsupported model requested")]
    ModelNotAllowed,
    #[error("{0}")]
    MetadataFilterInvalid(String),
    #[error("tags must be an object of scalar values")]
    TagsInvalid,
    #[error("Store not found")]
    StoreNotFound,
    #[error("Session not found")]
    SessionNotFound,
    #[error("Rate limit exceeded")]
    RateLimited,
    #[error("Monthly budget exhausted")]
    BudgetExhausted,
    #[error("Pricing configuration missing; contact support")]
    PricingUnconfigured,
    #[error("internal error")]
    Internal(#[from] MetaStoreError),
}

impl ChatRefusal {
    pub fn code(&self) -> &'static str {
        match self {
            ChatRefusal::MissingStores => "missing_store_ids",
            ChatRefusal::MissingQuestion => "missing_question",
            ChatRefusal::QuestionTooLong { .. } => "question_too_long",
            ChatRefusal::ModelNotAllowed => "model_not_allowed",
            ChatRefusal::MetadataFilterInvalid(_) => "metadata_filter_invalid",
            ChatRefusal::TagsInvalid => "tags_invalid",
            ChatRefusal::StoreNotFound => "store_not_found",
            ChatRefusal::SessionNotFound => "session_not_found",
            ChatRefusal::RateLimited => "rate_limited",
            ChatRefusal::BudgetExhausted => "budget_exhausted",
            ChatRefusal::PricingUnconfigured => "pricing_unconfigured",
            ChatRefusal::Internal(_) => "internal_error",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            ChatRefusal::MissingStores
            | ChatRefusal::MissingQuestion
            | ChatRefusal::QuestionTooLong { .. }
            | ChatRefusal::ModelNotAllowed
            | ChatRefusal::MetadataFilterInvalid(_)
            | ChatRefusal::TagsInvalid => 400,
            ChatRefusal::StoreNotFound | ChatRefusal::SessionNotFound => 404,
            ChatRefusal::RateLimited => 429,
            ChatRefusal::BudgetExhausted => 402,
            ChatRefusal::PricingUnconfigured | ChatRefusal::Internal(_) => 500,
        }
    }
}

/// Everything the streaming phase needs, resolved and validated up front.
#[derive(Debug, Clone)]
pub struct ChatPlan {
    pub user_id: String,
    pub session_id: String,
    pub question: String,
    pub fs_names: Vec<String>,
    pub store_id_for_history: Option<String>,
    pub store_id_for_cost: Option<String>,
    pub model: String,
    pub rates: ResolvedRates,
    /// `None` means unlimited (no budget row).
    pub remaining_budget: Option<CostMicros>,
    pub prompt_tokens_est: u64,
    pub metadata_filter: Option<Value>,
    pub tags: Option<BTreeMap<String, String>>,
}

// ---------------------------------------------------------------------------
// Pre-stream phase
// ---------------------------------------------------------------------------

pub async fn prepare_chat(
    ctx: &AppContext,
    user: &User,
    request: ChatRequest,
) -> Result<ChatPlan, ChatRefusal> {
    if !pricing_configured(
        &ctx.settings.pricing.model_pricing,
        &ctx.settings.chat.default_model,
        ctx.settings.price_overrides,
        ctx.settings.global_prices(),
    ) {
        return Err(ChatRefusal::PricingUnconfigured);
    }
    if request.store_ids.is_empty() {
        return Err(ChatRefusal::MissingStores);
    }

    let stores = ctx
        .catalog
        .stores_owned_by_user(&request.store_ids, &user.id)?
        .ok_or(ChatRefusal::StoreNotFound)?;
    let fs_names: Vec<String> = stores.iter().map(|s| s.fs_name.clone()).collect();
    let store_id_for_history = stores.first().map(|s| s.id.clone());
    let store_id_for_cost = store_id_for_history.clone();

    let session_id = sanitize_session_id(
        request
            .session_id
            .as_deref()
            .or(request.thread_id.as_deref()),
    );

    // Prior turns plus the client-supplied messages form one transcript; the
    // most recent user utterance is the effective question when none was
    // explicitly supplied.
    let history = ctx.history.load_history(
        &user.id,
        &session_id,
        store_id_for_history.as_deref(),
        HISTORY_LIMIT,
    )?;
    let mut turns: Vec<(String, String)> = history
        .iter()
        .map(|row| (row.role.clone(), row.content.clone()))
        .collect();
    for message in &request.messages {
        if let Some(text) = extract_message_text(message) {
            let role = message
                .get("role")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_ascii_lowercase();
            turns.push((role, text));
        }
    }
    let (transcript, last_user_text) = build_history_prompt(&turns);

    let mut question = request.question.clone().filter(|q| !q.trim().is_empty());
    if question.is_none() {
        question = request.messages.last().and_then(extract_message_text);
    }
    if question.is_none() {
        question = last_user_text.clone();
    }
    if let Some(transcript) = transcript {
        question = Some(format!(
            "{transcript}\n\nAssistant, respond to the latest User message using the conversation above."
        ));
    }
    let question = question.ok_or(ChatRefusal::MissingQuestion)?;

    let max = ctx.settings.chat.max_question_chars;
    if question.chars().count() > max {
        return Err(ChatRefusal::QuestionTooLong { max });
    }

    let model = request
        .model
        .clone()
        .unwrap_or_else(|| ctx.settings.chat.default_model.clone());
    if !ctx.settings.chat.allowed_models.iter().any(|m| m == &model) {
        tracing::warn!(event = "chat_model_invalid", user_id = %user.id, model = %model);
        return Err(ChatRefusal::ModelNotAllowed);
    }

    let metadata_filter = validate_metadata_filter(ctx, request.metadata_filter.as_ref())?;
    let tags = sanitize_tags(request.tags.as_ref())?;

    if !ctx.check_chat_rate_limit(&user.id) {
        return Err(ChatRefusal::RateLimited);
    }

    let rates = resolve_model_rates(
        &ctx.settings.pricing.model_pricing,
        &model,
        ctx.settings.price_overrides,
        ctx.settings.global_prices(),
    );

    // Budget pre-check under the best-effort per-user lock. The hold amount
    // reserves headroom so near-simultaneous requests do not jointly overshoot.
    let prompt_tokens_est = estimate_tokens_from_text(&question);
    let remaining_budget = {
        let _guard = ctx.budget_locks.acquire(&user.id).await;
        match ctx.ledger.user_budget(&user.id)? {
            None => None,
            Some(limit) => {
                let spend = ctx.ledger.mtd_spend(&user.id)?;
                let mut remaining = limit.saturating_sub(spend);
                if remaining.is_zero() {
                    return Err(ChatRefusal::BudgetExhausted);
                }
                let hold = CostMicros::from_usd(ctx.settings.pricing.budget_hold_usd);
                if !hold.is_zero() {
                    if remaining <= hold {
                        return Err(ChatRefusal::BudgetExhausted);
                    }
                    remaining = remaining.saturating_sub(hold);
                }
                let prompt_cost = calc_query_cost(rates, prompt_tokens_est, 0).total();
                if prompt_cost > remaining {
                    return Err(ChatRefusal::BudgetExhausted);
                }
                Some(remaining)
            }
        }
    };

    // The persisted user message is the actual utterance, not the merged
    // transcript the model sees.
    let mut user_text = None;
    for message in request.messages.iter().rev() {
        let role = message
            .get("role")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_ascii_lowercase();
        if role == "user" {
            if let Some(text) = extract_message_text(message) {
                user_text = Some(text);
                break;
            }
        }
    }
    let user_text = user_text
        .or(last_user_text)
        .unwrap_or_else(|| question.clone());

    match ctx.history.ensure_session(
        &user.id,
        store_id_for_history.as_deref(),
        &session_id,
        Some(&user_text),
    ) {
        Ok(()) => {}
        Err(MetaStoreError::NotFound(_)) => return Err(ChatRefusal::SessionNotFound),
        Err(err) => return Err(ChatRefusal::Internal(err)),
    }
    if let Err(err) = ctx.history.persist_message(
        &user.id,
        store_id_for_history.as_deref(),
        &session_id,
        "user",
        &user_text,
    ) {
        // Telemetry only; history persistence never fails the request.
        tracing::warn!(
            event = "chat_history_persist_failed",
            user_id = %user.id,
            session_id = %session_id,
            role = "user",
            error = %err
        );
    }

    Ok(ChatPlan {
        user_id: user.id.clone(),
        session_id,
        question,
        fs_names,
        store_id_for_history,
        store_id_for_cost,
        model,
        rates,
        remaining_budget,
        prompt_tokens_est,
        metadata_filter,
        tags,
    })
}

/// Pull display text from the assorted message shapes clients send: a direct
/// string field, or `content`/`parts`/`values` as a string, list of strings,
/// or list of objects with nested text.
fn extract_message_text(message: &Value) -> Option<String> {
    let mut texts: Vec<String> = Vec::new();

    for key in ["question", "text", "message", "value"] {
        if let Some(text) = message.get(key).and_then(Value::as_str) {
            let text = text.trim();
            if !text.is_empty() {
                texts.push(text.to_string());
                break;
            }
        }
    }

    for key in ["content", "parts", "values"] {
        let Some(value) = message.get(key) else {
            continue;
        };
        if let Some(text) = value.as_str() {
            let text = text.trim();
            if !text.is_empty() {
                texts.push(text.to_string());
                break;
            }
        }
        if let Some(items) = value.as_array() {
            let before = texts.len();
            for item in items {
                if let Some(text) = item.as_str() {
                    let text = text.trim();
                    if !text.is_empty() {
                        texts.push(text.to_string());
                    }
                } else if item.is_object() {
                    for nested_key in ["text", "content", "value"] {
                        if let Some(text) = item.get(nested_key).and_then(Value::as_str) {
                            let text = text.trim();
                            if !text.is_empty() {
                                texts.push(text.to_string());
                                break;
                            }
                        }
                    }
                }
            }
            if texts.len() > before {
                break;
            }
        }
    }

    let joined = texts.join(" ").trim().to_string();
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

fn role_label(role: &str) -> Option<&'static str> {
    match role {
        "user" => Some("User"),
        "assistant" | "model" => Some("Assistant"),
        _ => None,
    }
}

/// Build a lightweight transcript from role-tagged turns so the model can see
/// prior context. Returns the transcript (most recent turns only, trimmed to a
/// character budget) and the last user utterance.
fn build_history_prompt(turns: &[(String, String)]) -> (Option<String>, Option<String>) {
    let mut lines: Vec<String> = Vec::new();
    let mut last_user: Option<String> = None;
    for (role, text) in turns {
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        let Some(label) = role_label(role) else {
            continue;
        };
        lines.push(format!("{label}: {text}"));
        if role == "user" {
            last_user = Some(text.to_string());
        }
    }
    if lines.is_empty() {
        return (None, last_user);
    }
    if lines.len() > MAX_TRANSCRIPT_LINES {
        lines.drain(..lines.len() - MAX_TRANSCRIPT_LINES);
    }
    let mut transcript = lines.join("\n");
    if transcript.chars().count() > MAX_TRANSCRIPT_CHARS {
        let tail: Vec<char> = transcript.chars().collect();
        transcript = tail[tail.len() - MAX_TRANSCRIPT_CHARS..].iter().collect();
    }
    (Some(transcript), last_user)
}

fn sanitize_tags(raw: Option<&Value>) -> Result<Option<BTreeMap<String, String>>, ChatRefusal> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let Some(object) = raw.as_object() else {
        return Err(ChatRefusal::TagsInvalid);
    };
    let mut cleaned = BTreeMap::new();
    for (key, value) in object {
        if cleaned.len() >= MAX_TAGS {
            break;
        }
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let rendered = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => continue,
        };
        let key: String = key.chars().take(TAG_KEY_MAX).collect();
        let rendered: String = rendered.chars().take(TAG_VALUE_MAX).collect();
        cleaned.insert(key, rendered);
    }
    Ok(if cleaned.is_empty() { None } else { Some(cleaned) })
}

/// Allow only simple, allowlisted metadata filters when the feature is
/// enabled: scalar values or non-empty lists of scalars, strings length-capped.
fn validate_metadata_filter(
    ctx: &AppContext,
    raw: Option<&Value>,
) -> Result<Option<Value>, ChatRefusal> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    if !ctx.settings.chat.allow_metadata_filters {
        return Err(ChatRefusal::MetadataFilterInvalid(
            "Metadata filters are disabled on this deployment.".to_string(),
        ));
    }
    let Some(object) = raw.as_object() else {
        return Err(ChatRefusal::MetadataFilterInvalid(
            "metadataFilter must be an object".to_string(),
        ));
    };
    let allowed = &ctx.settings.chat.metadata_filter_allowed_keys;

    let mut cleaned = serde_json::Map::new();
    for (key, value) in object {
        let key = key.trim();
        if key.is_empty() {
            return Err(ChatRefusal::MetadataFilterInvalid(
                "metadataFilter keys must be non-empty strings".to_string(),
            ));
        }
        if !allowed.iter().any(|k| k == key) {
            return Err(ChatRefusal::MetadataFilterInvalid(format!(
                "metadataFilter key '{key}' is not allowed"
            )));
        }
        cleaned.insert(key.to_string(), coerce_metadata_value(key, value)?);
    }
    if cleaned.is_empty() {
        return Err(ChatRefusal::MetadataFilterInvalid(
            "metadataFilter must include at least one allowed key".to_string(),
        ));
    }
    Ok(Some(Value::Object(cleaned)))
}

fn coerce_metadata_value(key: &str, value: &Value) -> Result<Value, ChatRefusal> {
    match value {
        Value::String(s) => Ok(Value::String(s.chars().take(METADATA_VALUE_MAX).collect())),
        Value::Number(_) | Value::Bool(_) => Ok(value.clone()),
        Value::Array(items) => {
            if items.is_empty() {
                return Err(ChatRefusal::MetadataFilterInvalid(
                    "metadataFilter lists must include at least one value".to_string(),
                ));
            }
            let mut normalized = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => normalized
                        .push(Value::String(s.chars().take(METADATA_VALUE_MAX).collect())),
                    Value::Number(_) | Value::Bool(_) => normalized.push(item.clone()),
                    _ => {
                        return Err(ChatRefusal::MetadataFilterInvalid(
                            "metadataFilter values must be strings, numbers, booleans, or lists of those"
                                .to_string(),
                        ));
                    }
                }
            }
            Ok(Value::Array(normalized))
        }
        _ => Err(ChatRefusal::MetadataFilterInvalid(format!(
            "Invalid metadataFilter value for '{key}'"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Streaming phase
// ---------------------------------------------------------------------------

pub fn sse_json(payload: &Value) -> String {
    format!("data: {payload}\n\n")
}

pub fn sse_done() -> String {
    "data: [DONE]\n\n".to_string()
}

pub fn sse_error(code: &str, message: &str, status: Option<u16>) -> String {
    let mut payload = json!({
        "type": "error",
        "code": code,
        "message": message,
        "errorText": message,
    });
    if let Some(status) = status {
        payload["status"] = json!(status);
    }
    sse_json(&payload)
}

fn sse_keepalive() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!(": keepalive {now}\n\n")
}

enum AttemptOutcome {
    Completed,
    Disconnected,
    BudgetExceeded,
    Upstream(RagError),
}

/// Drive one chat stream to completion, emitting SSE frames into `frames`.
/// The receiver side of `frames` is the HTTP response body; it closing is the
/// disconnect signal. Always terminates the frame stream with `[DONE]` unless
/// the client is already gone.
pub async fn run_chat_stream(ctx: Arc<AppContext>, plan: ChatPlan, frames: mpsc::Sender<String>) {
    // Bounded global concurrency; a short timeout, never an indefinite block.
    let permit = match tokio::time::timeout(
        SEMAPHORE_TIMEOUT,
        ctx.stream_gate.clone().acquire_owned(),
    )
    .await
    {
        Ok(Ok(permit)) => permit,
        _ => {
            let _ = frames
                .send(sse_error(
                    "stream_capacity_exceeded",
                    "Server is busy. Please try again.",
                    Some(503),
                ))
                .await;
            let _ = frames.send(sse_done()).await;
            return;
        }
    };
    let _permit = permit;

    let keepalive = if ctx.settings.chat.keepalive_secs > 0.0 {
        Some(Duration::from_secs_f64(ctx.settings.chat.keepalive_secs))
    } else {
        None
    };
    let max_retries = ctx.settings.gemini.stream_retry_attempts;

    let message_id = Uuid::new_v4().to_string();
    let text_id = Uuid::new_v4().to_string();

    let mut stream_failed = false;
    let mut budget_exhausted = false;
    let mut last_error_code: Option<&'static str> = None;
    let mut assistant_text = String::new();
    let mut completion_tokens: u64 = 0;
    let prompt_tokens_est = plan.prompt_tokens_est;
    let mut final_grounding: Option<GroundingInfo> = None;
    let mut final_usage: Option<UsageMeta> = None;

    if !send(&frames, sse_json(&json!({"type": "start", "messageId": message_id}))).await
        || !send(&frames, sse_json(&json!({"type": "text-start", "id": text_id}))).await
    {
        return;
    }
    let mut last_send = Instant::now();

    let mut retry_count: u32 = 0;
    loop {
        if frames.is_closed() {
            tracing::info!(event = "chat_client_disconnected", user_id = %plan.user_id);
            stream_failed = true;
            break;
        }

        let (chunk_tx, mut chunk_rx) = mpsc::channel(CHUNK_QUEUE_CAP);
        let stop = Arc::new(AtomicBool::new(false));
        let overflow: Arc<StdMutex<Option<RagError>>> = Arc::new(StdMutex::new(None));
        spawn_producer(
            ctx.clone(),
            plan.ask_request(),
            chunk_tx,
            stop.clone(),
            overflow.clone(),
        );

        let outcome = loop {
            if frames.is_closed() {
                break AttemptOutcome::Disconnected;
            }
            match tokio::time::timeout(CHUNK_POLL_INTERVAL, chunk_rx.recv()).await {
                Err(_elapsed) => {
                    // Keepalive comments prevent idle-timeout disconnects on
                    // intermediaries during slow generation.
                    if let Some(interval) = keepalive {
                        if last_send.elapsed() >= interval {
                            if !send(&frames, sse_keepalive()).await {
                                break AttemptOutcome::Disconnected;
                            }
                            last_send = Instant::now();
                        }
                    }
                }
                Ok(None) => {
                    let backpressure = overflow.lock().ok().and_then(|mut slot| slot.take());
                    match backpressure {
                        Some(err) => break AttemptOutcome::Upstream(err),
                        None => break AttemptOutcome::Completed,
                    }
                }
                Ok(Some(Err(err))) => break AttemptOutcome::Upstream(err),
                Ok(Some(Ok(chunk))) => {
                    if let Some(delta) = chunk.text_delta {
                        completion_tokens += estimate_tokens_from_text(&delta);
                        if let Some(remaining) = plan.remaining_budget {
                            let projected =
                                calc_query_cost(plan.rates, prompt_tokens_est, completion_tokens)
                                    .total();
                            if projected > remaining {
                                // Hard mid-stream circuit breaker, not just a
                                // pre-check.
                                break AttemptOutcome::BudgetExceeded;
                            }
                        }
                        let frame = sse_json(&json!({
                            "type": "text-delta",
                            "id": text_id,
                            "delta": delta,
                        }));
                        if !send(&frames, frame).await {
                            break AttemptOutcome::Disconnected;
                        }
                        last_send = Instant::now();
                        assistant_text.push_str(&delta);
                    }
                    if let Some(grounding) = chunk.grounding {
                        final_grounding = Some(grounding);
                    }
                    if let Some(usage) = chunk.usage {
                        final_usage = Some(usage);
                    }
                }
            }
        };
        stop.store(true, Ordering::Relaxed);

        match outcome {
            AttemptOutcome::Completed => break,
            AttemptOutcome::Disconnected => {
                tracing::info!(event = "chat_client_disconnected", user_id = %plan.user_id);
                stream_failed = true;
                break;
            }
            AttemptOutcome::BudgetExceeded => {
                budget_exhausted = true;
                last_error_code = Some("budget_exceeded");
                let _ = send(
                    &frames,
                    sse_error("budget_exceeded", "Monthly budget exceeded", Some(402)),
                )
                .await;
                break;
            }
            AttemptOutcome::Upstream(RagError::Backpressure) => {
                tracing::warn!(event = "chat_stream_backpressure", user_id = %plan.user_id);
                stream_failed = true;
                last_error_code = Some("stream_backpressure");
                let _ = send(
                    &frames,
                    sse_error(
                        "stream_backpressure",
                        "Response consumer too slow; stream aborted.",
                        Some(503),
                    ),
                )
                .await;
                break;
            }
            AttemptOutcome::Upstream(err) if err.retryable() && retry_count < max_retries => {
                retry_count += 1;
                let delay = Duration::from_secs(2u64.saturating_pow(retry_count));
                tracing::warn!(
                    event = "chat_stream_retry",
                    user_id = %plan.user_id,
                    model = %plan.model,
                    retry = retry_count,
                    retry_delay_ms = delay.as_millis() as u64,
                    error = %err
                );
                tokio::time::sleep(delay).await;
            }
            AttemptOutcome::Upstream(err) if err.retryable() => {
                tracing::error!(
                    event = "chat_stream_failed",
                    user_id = %plan.user_id,
                    model = %plan.model,
                    retries = retry_count,
                    error = %err
                );
                stream_failed = true;
                last_error_code = Some("upstream_unavailable");
                let _ = send(
                    &frames,
                    sse_error(
                        "upstream_unavailable",
                        "Service temporarily unavailable. Please try again.",
                        Some(503),
                    ),
                )
                .await;
                break;
            }
            AttemptOutcome::Upstream(err) => {
                // Full detail stays in server logs; the client payload is
                // content-free.
                tracing::error!(
                    event = "chat_stream_exception",
                    user_id = %plan.user_id,
                    model = %plan.model,
                    error = %err
                );
                stream_failed = true;
                last_error_code = Some("unexpected_error");
                let _ = send(
                    &frames,
                    sse_error(
                        "unexpected_error",
                        "An error occurred processing your request. Please try again.",
                        Some(500),
                    ),
                )
                .await;
                break;
            }
        }
    }

    // Observability row for failures that were not a pure disconnect and not
    // the budget breaker (which intentionally logs no spend).
    if stream_failed {
        if let Some(code) = last_error_code.filter(|code| *code != "budget_exceeded") {
            let mut tags = plan.tags.clone().unwrap_or_default();
            tags.insert("error_code".to_string(), code.to_string());
            let log = QueryLog::new(
                plan.user_id.clone(),
                plan.store_id_for_cost.clone(),
                prompt_tokens_est,
                Some(completion_tokens),
                CostMicros::ZERO,
                plan.model.clone(),
                Some(tags),
            );
            if let Err(err) = ctx.ledger.append(&log) {
                tracing::error!(event = "chat_failed_stream_log_error", error = %err);
            }
        }
    }

    if stream_failed || budget_exhausted {
        let _ = send(&frames, sse_done()).await;
        return;
    }

    if !send(&frames, sse_json(&json!({"type": "text-end", "id": text_id}))).await {
        return;
    }

    if let Some(grounding) = &final_grounding {
        for (index, citation) in extract_citations(grounding).iter().enumerate() {
            let title = citation
                .title
                .clone()
                .or_else(|| citation.uri.clone())
                .unwrap_or_else(|| "Source".to_string());
            let frame = sse_json(&json!({
                "type": "source-document",
                "sourceId": format!("cit-{index}"),
                "mediaType": "file",
                "title": title,
                "snippet": citation.snippet,
            }));
            if !send(&frames, frame).await {
                return;
            }
        }
    }

    // Definitive usage: upstream metadata preferred, client-side estimate as
    // the fallback.
    let mut prompt_toks = prompt_tokens_est;
    let mut completion_toks = completion_tokens;
    match &final_usage {
        Some(usage) => {
            if let Some(tokens) = usage.prompt_tokens.filter(|t| *t > 0) {
                prompt_toks = tokens;
            }
            if let Some(tokens) = usage.completion_tokens.filter(|t| *t > 0) {
                completion_toks = tokens;
            }
        }
        None => {
            if completion_toks == 0 {
                completion_toks = estimate_tokens_from_text(&assistant_text);
            }
            tracing::warn!(
                event = "chat_usage_metadata_missing",
                user_id = %plan.user_id,
                model = %plan.model,
                prompt_tokens = prompt_toks,
                completion_tokens = completion_toks
            );
        }
    }

    let cost = calc_query_cost(plan.rates, prompt_toks, completion_toks);

    // Persist the definitive cost, then re-check the budget against the
    // actual (not estimated) spend.
    let mut over_budget = false;
    {
        let _guard = ctx.budget_locks.acquire(&plan.user_id).await;
        if !cost.total().is_zero() {
            over_budget = ctx
                .ledger
                .would_exceed_budget(&plan.user_id, cost.total())
                .unwrap_or_else(|err| {
                    tracing::error!(event = "chat_budget_check_failed", error = %err);
                    false
                });
        }
        let log = QueryLog::new(
            plan.user_id.clone(),
            plan.store_id_for_cost.clone(),
            cost.prompt_tokens,
            Some(cost.completion_tokens),
            cost.total(),
            plan.model.clone(),
            plan.tags.clone(),
        );
        if let Err(err) = ctx.ledger.append(&log) {
            tracing::error!(
                event = "chat_cost_log_failed",
                user_id = %plan.user_id,
                cost = %cost.total(),
                error = %err
            );
        }
    }

    let trimmed = assistant_text.trim();
    if !trimmed.is_empty() {
        if let Err(err) = ctx.history.persist_message(
            &plan.user_id,
            plan.store_id_for_history.as_deref(),
            &plan.session_id,
            "assistant",
            trimmed,
        ) {
            tracing::warn!(
                event = "chat_history_persist_failed",
                user_id = %plan.user_id,
                session_id = %plan.session_id,
                role = "assistant",
                error = %err
            );
        }
    }

    if over_budget {
        // The text already went out, but the caller must learn the turn
        // pushed them over budget.
        tracing::warn!(
            event = "chat_budget_exceeded_post_cost",
            user_id = %plan.user_id,
            cost = %cost.total(),
            prompt_tokens = cost.prompt_tokens,
            completion_tokens = cost.completion_tokens
        );
        let _ = send(
            &frames,
            sse_error("budget_exceeded", "Monthly budget exceeded", Some(402)),
        )
        .await;
        let _ = send(&frames, sse_done()).await;
        return;
    }

    let finish = sse_json(&json!({
        "type": "finish",
        "usage": {
            "prompt_tokens": prompt_toks,
            "completion_tokens": completion_toks,
            "model": plan.model,
        },
    }));
    let _ = send(&frames, finish).await;
    let _ = send(&frames, sse_done()).await;
}

impl ChatPlan {
    fn ask_request(&self) -> AskRequest {
        AskRequest {
            question: self.question.clone(),
            store_handles: self.fs_names.clone(),
            metadata_filter: self.metadata_filter.clone(),
            model: self.model.clone(),
        }
    }
}

async fn send(frames: &mpsc::Sender<String>, frame: String) -> bool {
    frames.send(frame).await.is_ok()
}

/// Run the blocking upstream generator on a dedicated thread, pushing chunks
/// through the bounded channel. Cancellation is cooperative via the stop flag;
/// a queue that stays full past the patience window records backpressure in
/// the overflow slot and ends the producer.
fn spawn_producer(
    ctx: Arc<AppContext>,
    request: AskRequest,
    chunk_tx: mpsc::Sender<Result<crate::services::rag::StreamChunk, RagError>>,
    stop: Arc<AtomicBool>,
    overflow: Arc<StdMutex<Option<RagError>>>,
) {
    std::thread::spawn(move || {
        let iter = match ctx.rag.ask_stream(request) {
            Ok(iter) => iter,
            Err(err) => {
                let _ = chunk_tx.blocking_send(Err(err));
                return;
            }
        };
        for item in iter {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            let mut pending = item;
            let deadline = Instant::now() + BACKPRESSURE_PATIENCE;
            loop {
                match chunk_tx.try_send(pending) {
                    Ok(()) => break,
                    Err(TrySendError::Full(back)) => {
                        if stop.load(Ordering::Relaxed) {
                            return;
                        }
                        if Instant::now() >= deadline {
                            if let Ok(mut slot) = overflow.lock() {
                                *slot = Some(RagError::Backpressure);
                            }
                            return;
                        }
                        pending = back;
                        std::thread::sleep(Duration::from_millis(20));
                    }
                    Err(TrySendError::Closed(_)) => return,
                }
            }
        }
    });
}
