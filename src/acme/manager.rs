use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use super::challenge::{make_challenge_handler, ChallengeHandler};
use super::client::Client;
use super::crypto::{self, AccountKeyError};
use super::self_check;
use super::status::StatusModel;
use super::store;
use super::{CertificatePaths, Settings};

/// Flat retry interval after a failed cycle. Shorter risks CA rate limits,
/// longer delays recovery.
const RETRY_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
/// How often to look for certificate files replaced by an external tool.
const UPDATE_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Renew when one third of the remaining lifetime is left, which gives two
/// retry windows before hard expiry.
pub fn remaining_time(expiry: OffsetDateTime) -> time::Duration {
    (expiry - OffsetDateTime::now_utc()) * 2 / 3
}

#[derive(Debug, Clone, Copy)]
enum CycleStage {
    Directory,
    Account,
    Certificate,
}

/// Drives the certificate lifecycle: evaluates the on-disk state, runs ACME
/// cycles, schedules renewals, and notifies the host when new certificate
/// material becomes visible.
pub struct Manager {
    settings: Settings,
    http: reqwest::Client,
    status: RwLock<StatusModel>,
    expiry: StdMutex<Option<OffsetDateTime>>,
    renewal_timer: StdMutex<Option<JoinHandle<()>>>,
    cycle: Mutex<()>,
    updates: broadcast::Sender<CertificatePaths>,
}

impl Manager {
    pub fn new(settings: Settings) -> Arc<Self> {
        let (updates, _) = broadcast::channel(16);
        Arc::new(Self {
            settings,
            http: reqwest::Client::new(),
            status: RwLock::new(StatusModel::default()),
            expiry: StdMutex::new(None),
            renewal_timer: StdMutex::new(None),
            cycle: Mutex::new(()),
            updates,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn status(&self) -> StatusModel {
        self.status.read().unwrap().clone()
    }

    pub fn any_pending(&self) -> bool {
        self.status.read().unwrap().any_pending()
    }

    /// Fires once for every certificate that becomes visible on disk,
    /// whether through a completed ACME cycle or an external replacement.
    pub fn subscribe(&self) -> broadcast::Receiver<CertificatePaths> {
        self.updates.subscribe()
    }

    /// Kicks off the initial cycle and the periodic external-update check.
    pub fn start(self: Arc<Self>) {
        let watcher = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(UPDATE_CHECK_INTERVAL).await;
                watcher.check_external_update();
            }
        });
        tokio::spawn(async move {
            self.init().await;
        });
    }

    /// Evaluates the on-disk state and branches into expiry tracking or a
    /// fresh ACME cycle. Also the entry point for timer-driven renewals and
    /// `POST /acme/update`.
    pub async fn init(self: Arc<Self>) {
        let Ok(_guard) = self.cycle.try_lock() else {
            tracing::debug!("certificate cycle already in progress");
            return;
        };
        self.status.write().unwrap().reset();
        if !self.settings.enabled {
            tracing::debug!("ACME client disabled");
            return;
        }

        let paths = self.settings.certificate_paths();
        match (paths.cert.exists(), paths.key.exists()) {
            (true, true) => self.clone().check_expiry(paths).await,
            (false, false) => self.clone().generate_certificate(paths).await,
            (cert_exists, _) => {
                let (present, missing) = if cert_exists {
                    (&paths.cert, &paths.key)
                } else {
                    (&paths.key, &paths.cert)
                };
                // Partial state indicates operator intent we must not
                // silently overwrite; no renewal is scheduled.
                self.status.write().unwrap().certificate.stage.fail(
                    "missing",
                    json!({
                        "missing": missing.to_string_lossy(),
                        "present": present.to_string_lossy(),
                    }),
                );
                tracing::error!(missing = %missing.display(), "certificate file missing");
                tracing::error!(
                    present = %present.display(),
                    "either provide the missing file, or remove the other to generate a new certificate"
                );
            }
        }
    }

    async fn check_expiry(self: Arc<Self>, paths: CertificatePaths) {
        let certificate = store::read(&paths);
        if !certificate.is_complete() {
            let message = "failed to read certificate files";
            self.status
                .write()
                .unwrap()
                .certificate
                .stage
                .fail_with_message("invalid", message);
            tracing::error!(
                cert = %paths.cert.display(),
                key = %paths.key.display(),
                message
            );
            return;
        }
        match certificate.expiry() {
            Ok(expiry) => self.handle_renewal(expiry, paths).await,
            Err(error) => {
                self.status
                    .write()
                    .unwrap()
                    .certificate
                    .stage
                    .fail_with_message("invalid", &error.to_string());
                tracing::error!(error = ?error, "failed to read certificate expiry date");
            }
        }
    }

    async fn handle_renewal(self: Arc<Self>, expiry: OffsetDateTime, paths: CertificatePaths) {
        {
            let mut status = self.status.write().unwrap();
            status.certificate.stage.ok();
            status.certificate.expiry = Some(expiry.unix_timestamp());
        }
        *self.expiry.lock().unwrap() = Some(expiry);

        let remaining = remaining_time(expiry);
        if remaining > time::Duration::ZERO {
            self.schedule_renewal_in(remaining.unsigned_abs());
        } else {
            tracing::info!(expiry = %expiry, "certificate expired, renewing now");
            Box::pin(self.generate_certificate(paths)).await;
        }
    }

    /// One full ACME cycle. Every stage records its progress in the status
    /// document; any failure ends the cycle and arms the retry timer.
    async fn generate_certificate(self: Arc<Self>, paths: CertificatePaths) {
        tracing::info!(
            cert = %paths.cert.display(),
            key = %paths.key.display(),
            "requesting certificate"
        );

        let account_key = match crypto::load_or_create_account_key(&self.settings.account_key_path)
        {
            Ok(key) => key,
            Err(error) => {
                let kind = match &error {
                    AccountKeyError::Write(_) => "key-write",
                    AccountKeyError::Read(_) => "key-read",
                };
                return self.cycle_failed(CycleStage::Account, kind, error.to_string());
            }
        };

        self.status.write().unwrap().directory.pending();
        let mut client = match Client::discover(
            self.http.clone(),
            &self.settings.directory_endpoint,
            account_key,
        )
        .await
        {
            Ok(client) => client,
            Err(error) => {
                return self.cycle_failed(CycleStage::Directory, "acme", error.to_string())
            }
        };
        {
            let mut status = self.status.write().unwrap();
            status.directory.ok();
            status.account.pending();
        }

        if let Err(error) = client.register_account(self.settings.eab.as_ref()).await {
            return self.cycle_failed(CycleStage::Account, "acme", error.to_string());
        }
        {
            let mut status = self.status.write().unwrap();
            status.account.ok();
            status.certificate.stage.pending();
        }

        let domains = self.settings.domain_names();
        let order = match client.new_order(&domains).await {
            Ok(order) => order,
            Err(error) => {
                return self.cycle_failed(CycleStage::Certificate, "acme", error.to_string())
            }
        };
        let challenges = match client.http01_challenges(&order).await {
            Ok(challenges) => challenges,
            Err(error) => {
                return self.cycle_failed(CycleStage::Certificate, "acme", error.to_string())
            }
        };

        let mut handler: Option<Box<dyn ChallengeHandler>> = None;
        let mut self_check_urls = Vec::new();
        for challenge in &challenges {
            tracing::debug!(
                domain = challenge.domain,
                location = %challenge.location(),
                key_authorization = challenge.key_authorization,
                "received challenge"
            );
            if handler.is_none() {
                match make_challenge_handler(self.settings.challenge_params()) {
                    Ok(new_handler) => handler = Some(new_handler),
                    Err(error) => {
                        return self.cycle_failed(
                            CycleStage::Certificate,
                            "acme",
                            error.to_string(),
                        )
                    }
                }
            }
            if let Some(active) = handler.as_mut() {
                if let Err(error) = active.add_challenge(
                    &challenge.domain,
                    &challenge.location(),
                    &challenge.key_authorization,
                ) {
                    return self.cycle_failed(CycleStage::Certificate, "acme", error.to_string());
                }
            }
            self_check_urls.push(challenge.public_url());
        }

        // Best-effort reachability check before asking the CA to verify.
        if let Some(active) = &handler {
            self_check::wait_for_urls(
                &self.http,
                std::mem::take(&mut self_check_urls),
                active.self_check_duration(),
                active.self_check_interval(),
            )
            .await;
        }

        for challenge in &challenges {
            if let Err(error) = client.respond(challenge).await {
                return self.cycle_failed(CycleStage::Certificate, "acme", error.to_string());
            }
        }
        let order = match client.poll_order_ready(&order).await {
            Ok(order) => order,
            Err(error) => {
                return self.cycle_failed(CycleStage::Certificate, "acme", error.to_string())
            }
        };
        let (privkey, csr) = match crypto::certificate_request(&domains) {
            Ok(request) => request,
            Err(error) => {
                return self.cycle_failed(CycleStage::Certificate, "acme", error.to_string())
            }
        };
        let order = match client.finalize(&order, &csr).await {
            Ok(order) => order,
            Err(error) => {
                return self.cycle_failed(CycleStage::Certificate, "acme", error.to_string())
            }
        };
        let fullchain = match client.download(&order).await {
            Ok(fullchain) => fullchain,
            Err(error) => {
                return self.cycle_failed(CycleStage::Certificate, "acme", error.to_string())
            }
        };

        // The CA has verified and issued; challenge resources can go away.
        drop(handler);

        let certificate = store::Certificate { fullchain, privkey };
        if let Err(error) = store::write(&certificate, &paths) {
            tracing::error!(
                cert = %paths.cert.display(),
                key = %paths.key.display(),
                "failed to write certificate files"
            );
            return self.cycle_failed(CycleStage::Certificate, "write", error.to_string());
        }
        let expiry = match certificate.expiry() {
            Ok(expiry) => expiry,
            Err(error) => {
                return self.cycle_failed(CycleStage::Certificate, "acme", error.to_string())
            }
        };

        tracing::info!(expiry = %expiry, "certificate retrieved");
        self.updates.send(paths.clone()).ok();
        self.handle_renewal(expiry, paths).await;
    }

    fn cycle_failed(self: Arc<Self>, stage: CycleStage, kind: &str, message: String) {
        tracing::error!(stage = ?stage, kind, message, "certificate cycle failed");
        {
            let mut status = self.status.write().unwrap();
            let slot = match stage {
                CycleStage::Directory => &mut status.directory,
                CycleStage::Account => &mut status.account,
                CycleStage::Certificate => &mut status.certificate.stage,
            };
            slot.fail_with_message(kind, &message);
        }
        if let Ok(document) = serde_json::to_string(&self.status()) {
            tracing::debug!(status = %document, "status after failed cycle");
        }
        self.schedule_renewal_in(RETRY_INTERVAL);
    }

    /// Re-arms the single-shot renewal timer and records the schedule time.
    fn schedule_renewal_in(self: Arc<Self>, duration: Duration) {
        let renewal_at = OffsetDateTime::now_utc().unix_timestamp() + duration.as_secs() as i64;
        self.status.write().unwrap().certificate.renewal = Some(renewal_at);
        let manager = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            manager.init().await;
        });
        if let Some(previous) = self.renewal_timer.lock().unwrap().replace(task) {
            previous.abort();
        }
        tracing::debug!(renewal_at, "renewal scheduled");
    }

    /// Detects certificate files replaced by an external tool: when the
    /// on-disk expiry moves forward, the host is notified and the new
    /// expiry adopted. Returns whether an update was detected.
    pub fn check_external_update(&self) -> bool {
        let paths = self.settings.certificate_paths();
        if !paths.cert.exists() || !paths.key.exists() {
            return false;
        }
        let certificate = store::read(&paths);
        if !certificate.is_complete() {
            return false;
        }
        let new_expiry = match certificate.expiry() {
            Ok(expiry) => expiry,
            Err(_) => return false,
        };
        {
            let mut expiry = self.expiry.lock().unwrap();
            if !expiry.map_or(true, |current| new_expiry > current) {
                return false;
            }
            *expiry = Some(new_expiry);
        }
        tracing::info!(expiry = %new_expiry, "externally updated certificate detected");
        self.updates.send(paths).ok();
        true
    }
}
