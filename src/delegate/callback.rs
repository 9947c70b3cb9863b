//! Callback ingress
//!
//! Delegate sidecars POST their result payloads here. The server performs no
//! authentication; reachability is limited to the cluster network, and a
//! sidecar that receives an error response simply retries its POST.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::to_bytes;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::result::{ResultStorage, StorageKey};

/// Header carrying the config fingerprint a payload was produced under.
pub const CONFIG_HASH_HEADER: &str = "Kudzu-Config-Hash";

/// Build the callback router over a shared result store.
pub fn callback_router(storage: Arc<dyn ResultStorage>) -> Router {
    Router::new()
        .route("/callbacks/:kind/:uid/result", post(receive_result))
        .with_state(storage)
}

/// Serve the callback router until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    storage: Arc<dyn ResultStorage>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "starting callback server");

    axum::serve(listener, callback_router(storage))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn receive_result(
    State(storage): State<Arc<dyn ResultStorage>>,
    Path((kind, uid)): Path<(String, String)>,
    request: Request,
) -> Response {
    let fingerprint = request
        .headers()
        .get(CONFIG_HASH_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    info!(%kind, %uid, config_hash = %fingerprint, "receiving callback");

    if fingerprint.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            "Missing Kudzu-Config-Hash header\n",
        )
            .into_response();
    }

    let body = match to_bytes(request.into_body(), usize::MAX).await {
        Ok(body) => body,
        Err(err) => {
            warn!(%kind, %uid, error = %err, "failed to read callback body");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to read body: {err}\n"),
            )
                .into_response();
        }
    };

    let key = StorageKey { kind, uid };
    if let Err(err) = storage.put(key, &fingerprint, body.to_vec()) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to save result: {err}\n"),
        )
            .into_response();
    }

    (StatusCode::ACCEPTED, "Result saved\n").into_response()
}
