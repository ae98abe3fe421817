//! Web server entrypoints live here.

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use thiserror::Error;
use tokio::{net::TcpListener, sync::watch};

use crate::services::AppContext;

mod routes;

pub use routes::ApiError;

const HEALTHZ_PATH: &str = "/v1/healthz";
const HEALTHZ_STATUS: &str = "ok";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize, Copy, Clone, PartialEq, Eq)]
struct HealthzResponse {
    status: &'static str,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ShutdownEvent {
    Pending,
    CtrlC,
    SigTerm,
    ListenerFailed,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid listen address `{address}`: {source}")]
    InvalidListenAddr {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to determine local address: {source}")]
    LocalAddr {
        #[source]
        source: std::io::Error,
    },
    #[error("axum server error: {source}")]
    Serve {
        #[source]
        source: std::io::Error,
    },
}

pub fn build_app_router(ctx: Arc<AppContext>) -> Router {
    debug_assert!(HEALTHZ_PATH.starts_with("/v1/"));

    Router::new()
        .route(HEALTHZ_PATH, get(healthz))
        .route("/v1/chat", post(routes::chat_stream))
        .route("/v1/chat/sessions", get(routes::list_chat_sessions))
        .route(
            "/v1/chat/sessions/{session_id}/messages",
            get(routes::list_chat_messages),
        )
        .with_state(ctx)
}

pub async fn serve(ctx: Arc<AppContext>) -> Result<(), ServerError> {
    let listen_addr = parse_listen_addr(&ctx.settings.server.listen_addr)?;
    let listener = bind_listener(listen_addr).await?;

    let local_addr = listener
        .local_addr()
        .map_err(|source| ServerError::LocalAddr { source })?;
    tracing::info!(%local_addr, "quaestor server listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownEvent::Pending);
    let shutdown_future = broadcast_shutdown(shutdown_tx);

    let app = build_app_router(ctx);

    let mut server_future = Box::pin(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_future)
            .await
    });

    let drain_rx = shutdown_rx.clone();
    let mut drain_timeout = Box::pin(drain_timeout_future(drain_rx));

    tokio::select! {
        result = server_future.as_mut() => {
            if let Err(source) = result {
                return Err(ServerError::Serve { source });
            }
        }
        _ = drain_timeout.as_mut() => {
            // Timeout elapsed; dropping the server future forces termination.
        }
    }

    let final_event = *shutdown_rx.borrow();
    if final_event == ShutdownEvent::Pending {
        tracing::info!("server stopped without external shutdown signal");
    } else {
        tracing::info!(?final_event, "server shutdown complete");
    }

    Ok(())
}

async fn healthz() -> Json<HealthzResponse> {
    debug_assert_eq!(HEALTHZ_STATUS, "ok");
    Json(HealthzResponse {
        status: HEALTHZ_STATUS,
    })
}

fn parse_listen_addr(address: &str) -> Result<SocketAddr, ServerError> {
    address
        .parse()
        .map_err(|source| ServerError::InvalidListenAddr {
            address: address.to_string(),
            source,
        })
}

async fn bind_listener(address: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(address)
        .await
        .map_err(|source| ServerError::Bind {
            address: address.to_string(),
            source,
        })
}

async fn wait_for_shutdown() -> ShutdownEvent {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => ShutdownEvent::CtrlC,
            Err(error) => {
                tracing::warn!(%error, "failed to capture Ctrl+C signal");
                ShutdownEvent::ListenerFailed
            }
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => match term.recv().await {
                Some(_) => ShutdownEvent::SigTerm,
                None => ShutdownEvent::ListenerFailed,
            },
            Err(error) => {
                tracing::warn!(%error, "failed to install SIGTERM handler");
                ShutdownEvent::ListenerFailed
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<ShutdownEvent>();

    tokio::select! {
        event = ctrl_c => event,
        event = sigterm => event,
    }
}

fn broadcast_shutdown(tx: watch::Sender<ShutdownEvent>) -> impl Future<Output = ()> {
    async move {
        let event = wait_for_shutdown().await;
        tracing::info!(?event, "shutdown signal received; draining connections");
        let _ = tx.send(event);
    }
}

async fn drain_timeout_future(mut rx: watch::Receiver<ShutdownEvent>) {
    // Wait for a shutdown signal, then allow in-flight requests a bounded
    // drain window before the server future is dropped.
    loop {
        if *rx.borrow() != ShutdownEvent::Pending {
            break;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
    tokio::time::sleep(DRAIN_TIMEOUT).await;
}
