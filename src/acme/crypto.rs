use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use p256::ecdsa::{signature::Signer, Signature, SigningKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rand_core::OsRng;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use x509_parser::pem::Pem;

/// ECDSA P-256 account key used for all JWS signatures towards the CA.
pub struct AccountKey {
    key: SigningKey,
}

impl AccountKey {
    pub fn generate() -> Self {
        Self {
            key: SigningKey::random(&mut OsRng),
        }
    }

    pub fn from_pem(pem: &str) -> Result<Self> {
        let key = SigningKey::from_pkcs8_pem(pem).context("parsing account key PEM")?;
        Ok(Self { key })
    }

    pub fn to_pem(&self) -> Result<String> {
        let pem = self
            .key
            .to_pkcs8_pem(LineEnding::LF)
            .context("encoding account key PEM")?;
        Ok(pem.to_string())
    }

    fn public_coordinates(&self) -> (Vec<u8>, Vec<u8>) {
        // Uncompressed SEC1 point: 0x04 || x (32 bytes) || y (32 bytes)
        let point = self.key.verifying_key().to_encoded_point(false);
        let bytes = point.as_bytes();
        (bytes[1..33].to_vec(), bytes[33..65].to_vec())
    }

    pub fn jwk(&self) -> serde_json::Value {
        let (x, y) = self.public_coordinates();
        serde_json::json!({
            "kty": "EC",
            "crv": "P-256",
            "x": URL_SAFE_NO_PAD.encode(x),
            "y": URL_SAFE_NO_PAD.encode(y),
        })
    }

    /// RFC 7638 thumbprint: SHA-256 over the required JWK members in
    /// lexicographic order, base64url without padding.
    pub fn thumbprint(&self) -> String {
        let (x, y) = self.public_coordinates();
        let jwk = format!(
            r#"{{"crv":"P-256","kty":"EC","x":"{}","y":"{}"}}"#,
            URL_SAFE_NO_PAD.encode(x),
            URL_SAFE_NO_PAD.encode(y)
        );
        URL_SAFE_NO_PAD.encode(Sha256::digest(jwk.as_bytes()))
    }

    /// ES256 signature in the raw `r || s` form JWS requires.
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        let signature: Signature = self.key.sign(data);
        signature.to_bytes().to_vec()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AccountKeyError {
    #[error("failed to create account key: {0}")]
    Write(#[source] anyhow::Error),
    #[error("failed to read account key: {0}")]
    Read(#[source] anyhow::Error),
}

/// Loads the account key, generating and persisting a fresh one when the
/// file does not exist yet. The key file is owner read/write only.
pub fn load_or_create_account_key(path: &Path) -> Result<AccountKey, AccountKeyError> {
    if !path.exists() {
        let key = AccountKey::generate();
        let pem = key.to_pem().map_err(AccountKeyError::Write)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))
                .map_err(AccountKeyError::Write)?;
        }
        write_restricted(path, pem.as_bytes())
            .with_context(|| format!("writing {}", path.display()))
            .map_err(AccountKeyError::Write)?;
        tracing::info!(path = %path.display(), "generated new account key");
        return Ok(key);
    }

    let pem = fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))
        .map_err(AccountKeyError::Read)?;
    AccountKey::from_pem(&pem).map_err(AccountKeyError::Read)
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Writes a secret file with mode 0600 on unix. The content lands in a
/// sibling temp file that is renamed into place, so a crash never leaves a
/// partial key behind.
pub fn write_restricted(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let staging = staging_path(path);
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&staging)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        fs::write(&staging, contents)?;
    }
    fs::rename(&staging, path)
}

/// Atomic replacement without permission restrictions: temp file in the
/// same directory, then rename.
pub fn write_replacing(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let staging = staging_path(path);
    fs::write(&staging, contents)?;
    fs::rename(&staging, path)
}

/// Generates a fresh certificate keypair and a CSR covering `domains`.
/// Returns the private key PEM and the DER-encoded request.
pub fn certificate_request(domains: &[String]) -> Result<(String, Vec<u8>)> {
    let mut params =
        CertificateParams::new(domains.to_vec()).context("building certificate request")?;
    params.distinguished_name = DistinguishedName::new();
    if let Some(first) = domains.first() {
        params
            .distinguished_name
            .push(DnType::CommonName, first.clone());
    }
    let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
    let csr = params.serialize_request(&key)?;
    Ok((key.serialize_pem(), csr.der().to_vec()))
}

/// Earliest `not_after` across every certificate in a PEM chain.
pub fn chain_expiry(fullchain: &str) -> Result<OffsetDateTime> {
    let mut expiry: Option<OffsetDateTime> = None;
    for pem in Pem::iter_from_buffer(fullchain.as_bytes()) {
        let pem = pem.context("parsing certificate PEM")?;
        if pem.label != "CERTIFICATE" {
            continue;
        }
        let cert = pem.parse_x509().context("parsing certificate")?;
        let not_after = cert.validity().not_after.to_datetime();
        if expiry.map_or(true, |current| not_after < current) {
            expiry = Some(not_after);
        }
    }
    expiry.ok_or_else(|| anyhow::anyhow!("no certificates in chain"))
}
