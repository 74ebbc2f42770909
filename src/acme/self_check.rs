use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;

/// Polls every published challenge URL from the public side until it
/// answers once or the window closes. Best-effort: the caller proceeds to
/// the CA validation either way, this only decouples our publication from
/// the CA's verification.
pub async fn wait_for_urls(
    http: &reqwest::Client,
    urls: Vec<String>,
    duration: Duration,
    interval: Duration,
) {
    if urls.is_empty() {
        return;
    }
    let deadline = Instant::now() + duration;
    let checks = urls.into_iter().map(|url| {
        let http = http.clone();
        async move {
            loop {
                match http.get(&url).send().await {
                    Ok(response) => {
                        tracing::debug!(url, status = %response.status(), "challenge reachable");
                        return;
                    }
                    Err(error) => {
                        tracing::warn!(url, error = ?error, "challenge self-check failed");
                    }
                }
                if Instant::now() + interval >= deadline {
                    tracing::warn!(url, "challenge self-check timed out");
                    return;
                }
                tokio::time::sleep(interval).await;
            }
        }
    });
    join_all(checks).await;
}
