use std::sync::Mutex;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::Deserialize;
use thiserror::Error;

use super::crypto::AccountKey;

const REPLAY_NONCE: &str = "Replay-Nonce";

/// Endpoint map fetched from the CA's directory URL.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    pub new_nonce: String,
    pub new_account: String,
    pub new_order: String,
}

/// RFC 7807 problem document returned by ACME endpoints on failure.
#[derive(Debug, Deserialize)]
struct Problem {
    #[serde(rename = "type")]
    kind: Option<String>,
    detail: Option<String>,
}

#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{kind}: {detail} (status {status})")]
    Problem {
        kind: String,
        detail: String,
        status: u16,
    },
    #[error("missing {0} header in response")]
    MissingHeader(&'static str),
    #[error("{0}")]
    Unexpected(String),
}

pub type Result<T> = std::result::Result<T, AcmeError>;

/// Signed HTTP layer of the ACME conversation: keeps the directory, a
/// single cached replay nonce, and wraps every POST body in a JWS.
pub struct Transport {
    http: reqwest::Client,
    directory: Directory,
    nonce: Mutex<Option<String>>,
}

impl Transport {
    /// Fetches the directory document and builds the transport around it.
    pub async fn discover(http: reqwest::Client, endpoint: &str) -> Result<Self> {
        let response = http.get(endpoint).send().await?;
        if !response.status().is_success() {
            return Err(decode_problem(response).await);
        }
        let directory: Directory = response.json().await?;
        tracing::debug!(
            new_account = directory.new_account,
            new_order = directory.new_order,
            "fetched ACME directory"
        );
        Ok(Self {
            http,
            directory,
            nonce: Mutex::new(None),
        })
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    async fn take_nonce(&self) -> Result<String> {
        if let Some(nonce) = self.nonce.lock().unwrap().take() {
            return Ok(nonce);
        }
        let response = self.http.head(&self.directory.new_nonce).send().await?;
        response
            .headers()
            .get(REPLAY_NONCE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or(AcmeError::MissingHeader(REPLAY_NONCE))
    }

    fn remember_nonce(&self, response: &reqwest::Response) {
        if let Some(nonce) = response
            .headers()
            .get(REPLAY_NONCE)
            .and_then(|value| value.to_str().ok())
        {
            *self.nonce.lock().unwrap() = Some(nonce.to_string());
        }
    }

    /// JWS-signed POST. `payload` of `None` sends the empty payload of a
    /// POST-as-GET request. `kid` switches the protected header from the
    /// full JWK (account creation) to the account URL.
    pub async fn post(
        &self,
        key: &AccountKey,
        kid: Option<&str>,
        url: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let nonce = self.take_nonce().await?;
        let body = build_jws(key, kid, url, &nonce, payload);
        let response = self
            .http
            .post(url)
            .header("Content-Type", "application/jose+json")
            .body(body)
            .send()
            .await?;
        self.remember_nonce(&response);
        if !response.status().is_success() {
            return Err(decode_problem(response).await);
        }
        Ok(response)
    }
}

fn build_jws(
    key: &AccountKey,
    kid: Option<&str>,
    url: &str,
    nonce: &str,
    payload: Option<&serde_json::Value>,
) -> String {
    let protected = match kid {
        Some(kid) => serde_json::json!({
            "alg": "ES256",
            "kid": kid,
            "nonce": nonce,
            "url": url,
        }),
        None => serde_json::json!({
            "alg": "ES256",
            "jwk": key.jwk(),
            "nonce": nonce,
            "url": url,
        }),
    };
    let protected = URL_SAFE_NO_PAD.encode(protected.to_string());
    let payload = match payload {
        Some(value) => URL_SAFE_NO_PAD.encode(value.to_string()),
        None => String::new(),
    };
    let signature = key.sign(format!("{protected}.{payload}").as_bytes());
    serde_json::json!({
        "protected": protected,
        "payload": payload,
        "signature": URL_SAFE_NO_PAD.encode(signature),
    })
    .to_string()
}

async fn decode_problem(response: reqwest::Response) -> AcmeError {
    let status = response.status().as_u16();
    match response.json::<Problem>().await {
        Ok(problem) => AcmeError::Problem {
            kind: problem
                .kind
                .unwrap_or_else(|| "about:blank".to_string()),
            detail: problem.detail.unwrap_or_default(),
            status,
        },
        Err(_) => AcmeError::Unexpected(format!("HTTP {status} with unreadable body")),
    }
}

#[cfg(test)]
mod tests {
    use httptest::{matchers::request, responders::status_code, Expectation, Server};
    use serde_json::json;

    use super::*;

    fn directory_body(server: &Server) -> serde_json::Value {
        json!({
            "newNonce": server.url_str("/nonce"),
            "newAccount": server.url_str("/account"),
            "newOrder": server.url_str("/order"),
        })
    }

    #[tokio::test]
    async fn discover_fetches_directory() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/directory")).respond_with(
                status_code(200).body(directory_body(&server).to_string()),
            ),
        );

        let transport = Transport::discover(reqwest::Client::new(), &server.url_str("/directory"))
            .await
            .unwrap();
        assert_eq!(transport.directory().new_order, server.url_str("/order"));
    }

    #[tokio::test]
    async fn post_reuses_nonce_from_previous_response() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/directory")).respond_with(
                status_code(200).body(directory_body(&server).to_string()),
            ),
        );
        // One HEAD only; the second POST must reuse the nonce returned by
        // the first response.
        server.expect(
            Expectation::matching(request::method_path("HEAD", "/nonce"))
                .times(1)
                .respond_with(status_code(200).append_header("Replay-Nonce", "nonce-1")),
        );
        server.expect(
            Expectation::matching(request::method_path("POST", "/order"))
                .times(2)
                .respond_with(
                    status_code(200)
                        .append_header("Replay-Nonce", "nonce-2")
                        .body("{}"),
                ),
        );

        let transport = Transport::discover(reqwest::Client::new(), &server.url_str("/directory"))
            .await
            .unwrap();
        let key = AccountKey::generate();
        let url = server.url_str("/order");
        transport.post(&key, None, &url, None).await.unwrap();
        transport.post(&key, None, &url, None).await.unwrap();
    }

    #[tokio::test]
    async fn failures_decode_problem_documents() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/directory")).respond_with(
                status_code(200).body(directory_body(&server).to_string()),
            ),
        );
        server.expect(
            Expectation::matching(request::method_path("HEAD", "/nonce"))
                .respond_with(status_code(200).append_header("Replay-Nonce", "nonce-1")),
        );
        server.expect(
            Expectation::matching(request::method_path("POST", "/order")).respond_with(
                status_code(429).body(
                    json!({
                        "type": "urn:ietf:params:acme:error:rateLimited",
                        "detail": "too many requests",
                    })
                    .to_string(),
                ),
            ),
        );

        let transport = Transport::discover(reqwest::Client::new(), &server.url_str("/directory"))
            .await
            .unwrap();
        let key = AccountKey::generate();
        let url = server.url_str("/order");
        match transport.post(&key, None, &url, None).await {
            Err(AcmeError::Problem { kind, detail, status }) => {
                assert_eq!(kind, "urn:ietf:params:acme:error:rateLimited");
                assert_eq!(detail, "too many requests");
                assert_eq!(status, 429);
            }
            other => panic!("expected problem error, got {other:?}"),
        }
    }
}
