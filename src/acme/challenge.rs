use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{header, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::Router;
use tokio::sync::oneshot;

use super::HandlerType;

#[derive(Debug, Clone)]
pub struct ChallengeHandlerParams {
    pub type_id: HandlerType,
    pub domain_dirs: HashMap<String, PathBuf>,
}

/// Publishes http-01 challenge responses for one cycle. Resources acquired
/// for the cycle (sockets, files) are released when the handler is dropped.
pub trait ChallengeHandler: Send {
    fn add_challenge(&mut self, domain: &str, location: &str, content: &str) -> Result<()>;

    /// How long the self-check should keep polling the published URLs.
    fn self_check_duration(&self) -> Duration;
    fn self_check_interval(&self) -> Duration;
}

/// Instantiated lazily, when the first challenge of a cycle arrives, since
/// the server variant grabs port 80.
pub fn make_challenge_handler(params: ChallengeHandlerParams) -> Result<Box<dyn ChallengeHandler>> {
    match params.type_id {
        HandlerType::Server => Ok(Box::new(HttpChallengeServer::bind()?)),
        HandlerType::Files => Ok(Box::new(HttpChallengeFiles::new(params.domain_dirs))),
        HandlerType::Manual => Ok(Box::new(HttpChallengeManual)),
    }
}

#[derive(Debug, Clone)]
struct Published {
    location: String,
    content: Vec<u8>,
}

/// In-process listener on port 80 answering challenge requests directly.
pub struct HttpChallengeServer {
    challenges: Arc<RwLock<Vec<Published>>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl HttpChallengeServer {
    pub fn bind() -> Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], 80));
        let challenges: Arc<RwLock<Vec<Published>>> = Arc::default();
        let app = challenge_router(challenges.clone());
        let server = axum::Server::try_bind(&addr)
            .with_context(|| format!("binding challenge listener on {addr}"))?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let result = server
                .serve(app.into_make_service())
                .with_graceful_shutdown(async move {
                    shutdown_rx.await.ok();
                })
                .await;
            if let Err(error) = result {
                tracing::error!(error = ?error, "challenge listener failed");
            }
        });
        tracing::debug!(%addr, "challenge listener bound");
        Ok(Self {
            challenges,
            shutdown: Some(shutdown_tx),
        })
    }
}

fn challenge_router(challenges: Arc<RwLock<Vec<Published>>>) -> Router {
    Router::new().fallback(move |uri: Uri| {
        let challenges = challenges.clone();
        async move {
            let path = uri.path().to_string();
            let published = challenges.read().unwrap();
            match published.iter().find(|challenge| challenge.location == path) {
                Some(challenge) => (
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, "application/octet-stream")],
                    challenge.content.clone(),
                )
                    .into_response(),
                None => {
                    let expected: String = published
                        .iter()
                        .map(|challenge| format!("{}\n", challenge.location))
                        .collect();
                    (
                        StatusCode::NOT_FOUND,
                        format!("Resource not found. Url is {path} but expected any of\n{expected}"),
                    )
                        .into_response()
                }
            }
        }
    })
}

impl ChallengeHandler for HttpChallengeServer {
    fn add_challenge(&mut self, _domain: &str, location: &str, content: &str) -> Result<()> {
        self.challenges.write().unwrap().push(Published {
            location: location.to_string(),
            content: content.as_bytes().to_vec(),
        });
        Ok(())
    }

    // The listener is local, verification is essentially instant.
    fn self_check_duration(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn self_check_interval(&self) -> Duration {
        Duration::from_millis(250)
    }
}

impl Drop for HttpChallengeServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.send(()).ok();
        }
    }
}

/// Writes challenge files into per-domain document roots served by an
/// external HTTP server.
pub struct HttpChallengeFiles {
    dirs: HashMap<String, PathBuf>,
    written: Vec<PathBuf>,
}

impl HttpChallengeFiles {
    pub fn new(dirs: HashMap<String, PathBuf>) -> Self {
        Self {
            dirs,
            written: Vec::new(),
        }
    }
}

impl ChallengeHandler for HttpChallengeFiles {
    fn add_challenge(&mut self, domain: &str, location: &str, content: &str) -> Result<()> {
        let root = self
            .dirs
            .get(domain)
            .cloned()
            .unwrap_or_else(|| PathBuf::from("."));
        let path = root.join(location.trim_start_matches('/'));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating challenge directory {}", parent.display()))?;
        }
        fs::write(&path, content)
            .with_context(|| format!("writing challenge file {}", path.display()))?;
        self.written.push(path);
        Ok(())
    }

    fn self_check_duration(&self) -> Duration {
        Duration::from_secs(2)
    }

    fn self_check_interval(&self) -> Duration {
        Duration::from_millis(250)
    }
}

impl Drop for HttpChallengeFiles {
    fn drop(&mut self) {
        let mut parents = BTreeSet::new();
        for path in &self.written {
            if let Some(parent) = path.parent() {
                parents.insert(parent.to_path_buf());
            }
            if let Err(error) = fs::remove_file(path) {
                tracing::warn!(
                    path = %path.display(),
                    error = ?error,
                    "failed to remove challenge file"
                );
            }
        }
        for parent in parents {
            if let Err(error) = fs::remove_dir(&parent) {
                tracing::warn!(
                    path = %parent.display(),
                    error = ?error,
                    "failed to remove challenge directory"
                );
            }
        }
    }
}

/// Leaves publication to a human operator; only logs what must be served.
pub struct HttpChallengeManual;

impl ChallengeHandler for HttpChallengeManual {
    fn add_challenge(&mut self, domain: &str, location: &str, content: &str) -> Result<()> {
        tracing::debug!(
            domain,
            location,
            content,
            "please manually complete this http challenge"
        );
        Ok(())
    }

    // Long window so the operator has time to publish.
    fn self_check_duration(&self) -> Duration {
        Duration::from_secs(120)
    }

    fn self_check_interval(&self) -> Duration {
        Duration::from_secs(1)
    }
}
