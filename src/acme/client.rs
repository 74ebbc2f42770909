use std::time::Duration;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;

use super::crypto::AccountKey;
use super::transport::{AcmeError, Result, Transport};

const POLL_ATTEMPTS: usize = 30;
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// External Account Binding credentials handed out by the CA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EabCredentials {
    pub kid: String,
    pub hmac: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Order {
    pub status: String,
    #[serde(default)]
    pub authorizations: Vec<String>,
    #[serde(default)]
    pub finalize: String,
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(skip)]
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct Authorization {
    status: String,
    identifier: Identifier,
    #[serde(default)]
    challenges: Vec<ChallengeObject>,
}

#[derive(Debug, Deserialize)]
struct Identifier {
    value: String,
}

#[derive(Debug, Deserialize)]
struct ChallengeObject {
    #[serde(rename = "type")]
    kind: String,
    url: String,
    token: String,
    status: String,
}

/// One http-01 challenge to publish and answer.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub domain: String,
    pub url: String,
    pub token: String,
    pub key_authorization: String,
}

impl Challenge {
    pub fn location(&self) -> String {
        format!("/.well-known/acme-challenge/{}", self.token)
    }

    /// URL the CA (and the self-check) will fetch.
    pub fn public_url(&self) -> String {
        format!("http://{}{}", self.domain, self.location())
    }
}

/// Ordered ACME operations of one certificate cycle, layered over the
/// signed transport.
pub struct Client {
    transport: Transport,
    key: AccountKey,
    account_url: Option<String>,
}

impl Client {
    pub async fn discover(http: reqwest::Client, endpoint: &str, key: AccountKey) -> Result<Self> {
        let transport = Transport::discover(http, endpoint).await?;
        Ok(Self {
            transport,
            key,
            account_url: None,
        })
    }

    fn kid(&self) -> Result<&str> {
        self.account_url
            .as_deref()
            .ok_or_else(|| AcmeError::Unexpected("account not registered".to_string()))
    }

    /// Creates or re-uses the account bound to the account key. The
    /// returned `Location` becomes the `kid` of every later request.
    pub async fn register_account(&mut self, eab: Option<&EabCredentials>) -> Result<()> {
        let new_account = self.transport.directory().new_account.clone();
        let mut payload = json!({ "termsOfServiceAgreed": true });
        if let Some(eab) = eab {
            payload["externalAccountBinding"] =
                external_account_binding(&self.key, eab, &new_account)?;
        }
        let response = self
            .transport
            .post(&self.key, None, &new_account, Some(&payload))
            .await?;
        let account_url = response
            .headers()
            .get("Location")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or(AcmeError::MissingHeader("Location"))?;
        tracing::debug!(account_url, "ACME account ready");
        self.account_url = Some(account_url);
        Ok(())
    }

    pub async fn new_order(&self, domains: &[String]) -> Result<Order> {
        let identifiers: Vec<serde_json::Value> = domains
            .iter()
            .map(|domain| json!({ "type": "dns", "value": domain }))
            .collect();
        let payload = json!({ "identifiers": identifiers });
        let new_order = self.transport.directory().new_order.clone();
        let response = self
            .transport
            .post(&self.key, Some(self.kid()?), &new_order, Some(&payload))
            .await?;
        let url = response
            .headers()
            .get("Location")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or(AcmeError::MissingHeader("Location"))?;
        let mut order: Order = response.json().await?;
        order.url = url;
        tracing::debug!(
            order_url = order.url,
            finalize_url = order.finalize,
            authorizations = order.authorizations.len(),
            "ordered certificate"
        );
        Ok(order)
    }

    async fn post_as_get<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .transport
            .post(&self.key, Some(self.kid()?), url, None)
            .await?;
        Ok(response.json().await?)
    }

    /// Fetches every authorization of the order and extracts its http-01
    /// challenge, skipping authorizations that are already valid.
    pub async fn http01_challenges(&self, order: &Order) -> Result<Vec<Challenge>> {
        let mut challenges = Vec::new();
        for auth_url in &order.authorizations {
            let authorization: Authorization = self.post_as_get(auth_url).await?;
            if authorization.status == "valid" {
                continue;
            }
            let domain = authorization.identifier.value;
            let challenge = authorization
                .challenges
                .into_iter()
                .find(|challenge| challenge.kind == "http-01")
                .ok_or_else(|| {
                    AcmeError::Unexpected(format!("no http-01 challenge offered for {domain}"))
                })?;
            if challenge.status == "valid" {
                continue;
            }
            let key_authorization = format!("{}.{}", challenge.token, self.key.thumbprint());
            challenges.push(Challenge {
                domain,
                url: challenge.url,
                token: challenge.token,
                key_authorization,
            });
        }
        Ok(challenges)
    }

    /// Tells the CA the challenge response is in place.
    pub async fn respond(&self, challenge: &Challenge) -> Result<()> {
        self.transport
            .post(&self.key, Some(self.kid()?), &challenge.url, Some(&json!({})))
            .await?;
        Ok(())
    }

    /// Polls the order until the CA has validated every challenge.
    pub async fn poll_order_ready(&self, order: &Order) -> Result<Order> {
        for _ in 0..POLL_ATTEMPTS {
            let mut polled: Order = self.post_as_get(&order.url).await?;
            polled.url = order.url.clone();
            match polled.status.as_str() {
                "ready" | "valid" => return Ok(polled),
                "invalid" => {
                    return Err(AcmeError::Unexpected("order became invalid".to_string()))
                }
                _ => tokio::time::sleep(POLL_INTERVAL).await,
            }
        }
        Err(AcmeError::Unexpected(
            "timed out waiting for order validation".to_string(),
        ))
    }

    /// Submits the CSR and polls until the certificate URL is available.
    pub async fn finalize(&self, order: &Order, csr_der: &[u8]) -> Result<Order> {
        let payload = json!({ "csr": URL_SAFE_NO_PAD.encode(csr_der) });
        let response = self
            .transport
            .post(&self.key, Some(self.kid()?), &order.finalize, Some(&payload))
            .await?;
        let mut finalized: Order = response.json().await?;
        finalized.url = order.url.clone();
        for _ in 0..POLL_ATTEMPTS {
            if finalized.status == "invalid" {
                return Err(AcmeError::Unexpected("order became invalid".to_string()));
            }
            if finalized.status == "valid" && finalized.certificate.is_some() {
                return Ok(finalized);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
            finalized = self.post_as_get(&order.url).await?;
            finalized.url = order.url.clone();
        }
        Err(AcmeError::Unexpected(
            "timed out waiting for certificate issuance".to_string(),
        ))
    }

    /// Downloads the issued PEM chain.
    pub async fn download(&self, order: &Order) -> Result<String> {
        let certificate = order
            .certificate
            .as_deref()
            .ok_or_else(|| AcmeError::Unexpected("order has no certificate URL".to_string()))?;
        let response = self
            .transport
            .post(&self.key, Some(self.kid()?), certificate, None)
            .await?;
        Ok(response.text().await?)
    }
}

/// Inner HS256 JWS binding the new account to pre-existing CA credentials
/// (RFC 8555 §7.3.4). The HMAC key is accepted in base64url or standard
/// base64 form.
fn external_account_binding(
    key: &AccountKey,
    eab: &EabCredentials,
    new_account_url: &str,
) -> Result<serde_json::Value> {
    let hmac_key = URL_SAFE_NO_PAD
        .decode(&eab.hmac)
        .or_else(|_| STANDARD.decode(&eab.hmac))
        .map_err(|_| AcmeError::Unexpected("invalid EAB HMAC key encoding".to_string()))?;
    let protected = json!({
        "alg": "HS256",
        "kid": eab.kid,
        "url": new_account_url,
    });
    let protected = URL_SAFE_NO_PAD.encode(protected.to_string());
    let payload = URL_SAFE_NO_PAD.encode(key.jwk().to_string());
    let mut mac = Hmac::<Sha256>::new_from_slice(&hmac_key)
        .map_err(|_| AcmeError::Unexpected("invalid EAB HMAC key length".to_string()))?;
    mac.update(format!("{protected}.{payload}").as_bytes());
    let signature = mac.finalize().into_bytes();
    Ok(json!({
        "protected": protected,
        "payload": payload,
        "signature": URL_SAFE_NO_PAD.encode(signature),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_location_and_public_url() {
        let challenge = Challenge {
            domain: "example.org".to_string(),
            url: "https://ca.invalid/chall/1".to_string(),
            token: "token123".to_string(),
            key_authorization: "token123.thumb".to_string(),
        };
        assert_eq!(
            challenge.location(),
            "/.well-known/acme-challenge/token123"
        );
        assert_eq!(
            challenge.public_url(),
            "http://example.org/.well-known/acme-challenge/token123"
        );
    }

    #[test]
    fn eab_signature_verifies_with_shared_secret() {
        let key = AccountKey::generate();
        let secret = b"super-secret-eab-key";
        let eab = EabCredentials {
            kid: "kid-1".to_string(),
            hmac: URL_SAFE_NO_PAD.encode(secret),
        };
        let binding =
            external_account_binding(&key, &eab, "https://ca.invalid/new-account").unwrap();

        let protected = binding["protected"].as_str().unwrap();
        let payload = binding["payload"].as_str().unwrap();
        let signature = URL_SAFE_NO_PAD
            .decode(binding["signature"].as_str().unwrap())
            .unwrap();

        let mut mac = Hmac::<Sha256>::new_from_slice(secret).unwrap();
        mac.update(format!("{protected}.{payload}").as_bytes());
        mac.verify_slice(&signature).unwrap();

        let header: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(protected).unwrap()).unwrap();
        assert_eq!(header["alg"], "HS256");
        assert_eq!(header["kid"], "kid-1");

        let jwk: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).unwrap()).unwrap();
        assert_eq!(jwk, key.jwk());
    }

    #[test]
    fn eab_rejects_undecodable_key() {
        let key = AccountKey::generate();
        let eab = EabCredentials {
            kid: "kid-1".to_string(),
            hmac: "!!! not base64 !!!".to_string(),
        };
        assert!(external_account_binding(&key, &eab, "https://ca.invalid").is_err());
    }
}
