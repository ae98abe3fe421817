//! HTTP handlers: the streaming chat endpoint and session listings.
//!
//! The chat handler runs the whole synchronous pre-stream phase before any
//! bytes are sent; only a fully validated plan gets a streaming response. The
//! response body is a frame channel driven by the orchestrator task, so the
//! receiver being dropped doubles as the client-disconnect signal.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{TimeZone, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::services::chat::{prepare_chat, run_chat_stream, ChatRefusal, ChatRequest};
use crate::services::{AppContext, MetaStoreError, User};

const FRAME_CHANNEL_CAP: usize = 32;

/// Uniform error payload: a stable machine-readable code plus a short,
/// content-free human message.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "invalid_token",
            "Missing or invalid bearer token",
        )
    }

    fn not_found(what: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", format!("{what} not found"))
    }
}

impl From<ChatRefusal> for ApiError {
    fn from(refusal: ChatRefusal) -> Self {
        let status =
            StatusCode::from_u16(refusal.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = match &refusal {
            // Internal detail never reaches the client payload.
            ChatRefusal::Internal(err) => {
                tracing::error!(event = "chat_internal_error", error = %err);
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };
        Self {
            status,
            code: refusal.code(),
            message,
        }
    }
}

impl From<MetaStoreError> for ApiError {
    fn from(err: MetaStoreError) -> Self {
        tracing::error!(event = "meta_store_error", error = %err);
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "Internal server error",
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "code": self.code,
            "message": self.message,
        }));
        (self.status, body).into_response()
    }
}

fn authenticate(ctx: &AppContext, headers: &HeaderMap) -> Result<User, ApiError> {
    let header = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(ApiError::unauthorized)?;
    let token = header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .ok_or_else(ApiError::unauthorized)?;
    ctx.catalog
        .get_user_by_token(token.trim())?
        .ok_or_else(ApiError::unauthorized)
}

pub async fn chat_stream(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let user = authenticate(&ctx, &headers)?;
    let plan = prepare_chat(&ctx, &user, request).await?;

    let (frames_tx, frames_rx) = mpsc::channel::<String>(FRAME_CHANNEL_CAP);
    tokio::spawn(run_chat_stream(ctx.clone(), plan, frames_tx));

    let body = Body::from_stream(ReceiverStream::new(frames_rx).map(Ok::<_, Infallible>));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache, no-transform")
        .header("x-accel-buffering", "no")
        .body(body)
        .map_err(|err| {
            tracing::error!(event = "chat_response_build_failed", error = %err);
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Internal server error",
            )
        })
}

#[derive(Debug, Deserialize)]
pub struct SessionsQuery {
    #[serde(rename = "storeId")]
    store_id: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub(crate) struct SessionRow {
    id: String,
    store_id: Option<String>,
    title: String,
    updated_at: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct MessageRow {
    id: String,
    role: String,
    content: String,
    created_at: Option<String>,
}

fn render_timestamp(ms: i64) -> Option<String> {
    Utc.timestamp_millis_opt(ms).single().map(|dt| dt.to_rfc3339())
}

pub async fn list_chat_sessions(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Query(query): Query<SessionsQuery>,
) -> Result<Json<Vec<SessionRow>>, ApiError> {
    let user = authenticate(&ctx, &headers)?;
    if let Some(store_id) = &query.store_id {
        ctx.catalog
            .stores_owned_by_user(std::slice::from_ref(store_id), &user.id)?
            .ok_or_else(|| ApiError::not_found("Store"))?;
    }
    let rows = ctx.history.list_sessions(
        &user.id,
        query.store_id.as_deref(),
        query.limit.unwrap_or(50),
    )?;
    Ok(Json(
        rows.into_iter()
            .map(|session| SessionRow {
                id: session.id,
                store_id: session.store_id,
                title: session.title.unwrap_or_default(),
                updated_at: render_timestamp(session.updated_at_ms),
            })
            .collect(),
    ))
}

pub async fn list_chat_messages(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<MessageRow>>, ApiError> {
    let user = authenticate(&ctx, &headers)?;
    let session = ctx
        .history
        .get_session(&session_id)?
        .filter(|session| session.user_id == user.id)
        .ok_or_else(|| ApiError::not_found("Session"))?;
    if let Some(store_id) = &session.store_id {
        ctx.catalog
            .stores_owned_by_user(std::slice::from_ref(store_id), &user.id)?
            .ok_or_else(|| ApiError::not_found("Session"))?;
    }

    let rows = ctx.history.list_messages(&session_id)?;
    Ok(Json(
        rows.into_iter()
            .map(|message| MessageRow {
                id: message.id,
                role: message.role,
                content: message.content,
                created_at: render_timestamp(message.created_at_ms),
            })
            .collect(),
    ))
}
