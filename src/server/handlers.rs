use std::fs;
use std::path::PathBuf;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};

use crate::acme::Manager;

use super::state::SharedState;
use super::Result;

/// The four certificate files exposed for upload and removal.
#[derive(Debug, Clone, Copy)]
enum FileTarget {
    AccountKey,
    Cert,
    CertKey,
    CertAuthorities,
}

const FILE_ROUTES: [(&str, FileTarget); 4] = [
    ("/acme/account-key", FileTarget::AccountKey),
    ("/acme/cert", FileTarget::Cert),
    ("/acme/cert-key", FileTarget::CertKey),
    ("/acme/cert-authorities", FileTarget::CertAuthorities),
];

fn target_path(manager: &Manager, target: FileTarget) -> PathBuf {
    let paths = manager.settings().certificate_paths();
    match target {
        FileTarget::AccountKey => manager.settings().account_key_path.clone(),
        FileTarget::Cert => paths.cert,
        FileTarget::CertKey => paths.key,
        FileTarget::CertAuthorities => paths.trusted_authorities,
    }
}

pub async fn status(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.manager().status())
}

/// Starts a new cycle unless one is already in flight.
pub async fn update(State(state): State<SharedState>) -> StatusCode {
    if state.manager().any_pending() {
        return StatusCode::CONFLICT;
    }
    let manager = state.manager().clone();
    tokio::spawn(async move {
        manager.init().await;
    });
    StatusCode::OK
}

/// Uploads a file, refusing to overwrite existing material.
async fn put_file(state: SharedState, target: FileTarget, body: Bytes) -> Result<StatusCode> {
    let path = target_path(state.manager(), target);
    if path.exists() {
        return Ok(StatusCode::CONFLICT);
    }
    fs::write(&path, &body)?;
    tracing::info!(path = %path.display(), "file uploaded");
    Ok(StatusCode::OK)
}

async fn delete_file(state: SharedState, target: FileTarget) -> Result<StatusCode> {
    let path = target_path(state.manager(), target);
    fs::remove_file(&path)?;
    tracing::info!(path = %path.display(), "file removed");
    Ok(StatusCode::OK)
}

/// Control routes under `/acme`. Authentication is the dispatcher's job.
pub fn router(state: SharedState) -> Router {
    let mut router = Router::new()
        .route("/acme/status", get(status))
        .route("/acme/update", post(update));
    for (path, target) in FILE_ROUTES {
        router = router.route(
            path,
            put(move |State(state): State<SharedState>, body: Bytes| async move {
                put_file(state, target, body).await
            })
            .delete(move |State(state): State<SharedState>| async move {
                delete_file(state, target).await
            }),
        );
    }
    router.with_state(state)
}
