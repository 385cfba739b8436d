use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use anyhow::{anyhow, Result};
use rcgen::KeyPair;
use serde::Deserialize;
use serde_json::{json, Value};
use time::OffsetDateTime;
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{interval, sleep},
};
use tracing::{debug, error, info};

use crate::{
    acme_client::{self, AccountError, AcmeSession, PublisherParams},
    ledger::{ErrorKind, Phase, StatusLedger, Subsystem},
    publisher::ChallengeHandlerType,
    store::{self, Certificate, CertificatePaths},
};

/// Backoff before retrying after a failed cycle.
const FAILURE_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// How often externally replaced certificate files are looked for.
const UPDATE_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// One domain to order a certificate for, together with the directory the
/// `files` challenge handler drops tokens into. Empty means the working
/// directory.
#[derive(Debug, Clone, Deserialize)]
pub struct DomainEntry {
    pub domain: String,
    #[serde(default)]
    pub directory: String,
}

/// Settings of the certificate lifecycle manager. Loaded fresh at every
/// cycle so operators can change domains or the challenge handler without a
/// restart.
#[allow(clippy::duplicated_attributes)]
#[derive(Debug, Clone, Deserialize, bon::Builder)]
#[builder(on(String, into))]
#[builder(on(PathBuf, into))]
pub struct AcmeSettings {
    /// Master switch; when off, `init` leaves the ledger untouched.
    #[serde(default)]
    #[builder(default)]
    pub enable_client: bool,
    /// Base directory for artifacts without an explicitly configured path.
    #[serde(default = "default_data_dir")]
    #[builder(default = default_data_dir())]
    pub data_dir: PathBuf,
    /// Account key file; empty means `{data_dir}/acme_account_key.pem`.
    #[serde(default)]
    #[builder(default)]
    pub account_key_path: String,
    /// Directory of the certificate artifacts; empty means `{data_dir}`.
    #[serde(default)]
    #[builder(default)]
    pub certificate_directory: String,
    #[serde(default = "default_certificate_filename")]
    #[builder(default = default_certificate_filename())]
    pub certificate_filename: String,
    #[serde(default = "default_certificate_key_filename")]
    #[builder(default = default_certificate_key_filename())]
    pub certificate_key_filename: String,
    #[serde(default = "default_certificate_authority_filename")]
    #[builder(default = default_certificate_authority_filename())]
    pub certificate_authority_filename: String,
    /// Domains to order certificates for.
    #[serde(default)]
    #[builder(default)]
    pub certificate_domains: Vec<DomainEntry>,
    /// ACME directory URL.
    #[serde(default)]
    #[builder(default)]
    pub directory_endpoint: String,
    /// External account binding key id, if the CA requires one.
    #[serde(default)]
    #[builder(default)]
    pub eab_kid: String,
    /// External account binding HMAC key, base64url encoded.
    #[serde(default)]
    #[builder(default)]
    pub eab_mac: String,
    #[serde(default)]
    #[builder(default)]
    pub challenge_handler_type: ChallengeHandlerType,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_certificate_filename() -> String {
    "cert.pem".to_string()
}

fn default_certificate_key_filename() -> String {
    "key.pem".to_string()
}

fn default_certificate_authority_filename() -> String {
    "authority.pem".to_string()
}

impl AcmeSettings {
    pub fn account_key_path(&self) -> PathBuf {
        if self.account_key_path.is_empty() {
            self.data_dir.join("acme_account_key.pem")
        } else {
            PathBuf::from(&self.account_key_path)
        }
    }

    pub fn certificate_paths(&self) -> CertificatePaths {
        let dir = if self.certificate_directory.is_empty() {
            self.data_dir.clone()
        } else {
            PathBuf::from(&self.certificate_directory)
        };
        CertificatePaths {
            cert: dir.join(&self.certificate_filename),
            key: dir.join(&self.certificate_key_filename),
            trusted_authorities: dir.join(&self.certificate_authority_filename),
        }
    }

    /// Configured domains in ASCII-compatible encoding, plus the per-domain
    /// challenge directories keyed by the encoded name.
    fn ace_domains(&self) -> Result<(Vec<String>, BTreeMap<String, PathBuf>)> {
        let mut domains = Vec::new();
        let mut dirs = BTreeMap::new();
        for entry in &self.certificate_domains {
            let ace = idna::domain_to_ascii(&entry.domain)
                .map_err(|err| anyhow!("invalid domain {:?}: {err:?}", entry.domain))?;
            let dir = if entry.directory.is_empty() {
                PathBuf::from(".")
            } else {
                PathBuf::from(&entry.directory)
            };
            dirs.insert(ace.clone(), dir);
            domains.push(ace);
        }
        Ok((domains, dirs))
    }

    fn external_account(&self) -> Option<(String, String)> {
        if self.eab_kid.is_empty() || self.eab_mac.is_empty() {
            None
        } else {
            Some((self.eab_kid.clone(), self.eab_mac.clone()))
        }
    }
}

/// Artifact files exposed over the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    AccountKey,
    Cert,
    CertKey,
    CertAuthorities,
}

/// Produces fresh settings for each cycle.
pub type SettingsLoader = Arc<dyn Fn() -> Result<AcmeSettings> + Send + Sync>;

/// Drives the certificate lifecycle: decides between loading an existing
/// certificate and ordering a new one, keeps the status ledger current, and
/// arms a single renewal timer at two thirds of the remaining validity.
pub struct AcmeManager {
    weak_self: Weak<AcmeManager>,
    load_settings: SettingsLoader,
    ledger: Mutex<StatusLedger>,
    renewal_timer: Mutex<Option<JoinHandle<()>>>,
    known_expiry: Mutex<Option<OffsetDateTime>>,
    updates: broadcast::Sender<CertificatePaths>,
}

fn remaining_time(expiry: OffsetDateTime) -> time::Duration {
    (expiry - OffsetDateTime::now_utc()) * 2 / 3
}

impl AcmeManager {
    pub fn new(load_settings: SettingsLoader) -> Arc<Self> {
        let (updates, _) = broadcast::channel(8);
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            load_settings,
            ledger: Mutex::new(StatusLedger::default()),
            renewal_timer: Mutex::new(None),
            known_expiry: Mutex::new(None),
            updates,
        })
    }

    /// Kick off the first cycle and the periodic check for externally
    /// replaced certificate files.
    pub fn start(&self) {
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            let mut timer = interval(UPDATE_CHECK_INTERVAL);
            timer.tick().await; // the first tick fires immediately
            loop {
                timer.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.check_external_update().await;
            }
        });
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            if let Some(manager) = weak.upgrade() {
                manager.init().await;
            }
        });
    }

    /// Fires on every successful certificate write and whenever externally
    /// replaced files with a later expiry are detected. Consumers re-read
    /// both files on reception.
    pub fn subscribe(&self) -> broadcast::Receiver<CertificatePaths> {
        self.updates.subscribe()
    }

    /// Snapshot of the status ledger for the status endpoint.
    pub fn status(&self) -> Value {
        self.ledger().snapshot()
    }

    /// Resolve the filesystem path backing a control-surface artifact, from
    /// fresh settings.
    pub fn artifact_path(&self, kind: ArtifactKind) -> Result<PathBuf> {
        let settings = (self.load_settings)()?;
        let paths = settings.certificate_paths();
        Ok(match kind {
            ArtifactKind::AccountKey => settings.account_key_path(),
            ArtifactKind::Cert => paths.cert,
            ArtifactKind::CertKey => paths.key,
            ArtifactKind::CertAuthorities => paths.trusted_authorities,
        })
    }

    /// Start a new cycle unless one is already in flight. Returns whether a
    /// cycle was started.
    pub fn trigger_update(&self) -> bool {
        if self.ledger().is_pending() {
            return false;
        }
        let Some(manager) = self.weak_self.upgrade() else {
            return false;
        };
        tokio::spawn(async move {
            manager.init().await;
        });
        true
    }

    /// Run one lifecycle decision: load-and-schedule, issue-new, or report a
    /// broken artifact pair.
    pub async fn init(&self) {
        self.ledger().reset();
        let settings = match (self.load_settings)() {
            Ok(settings) => settings,
            Err(err) => {
                error!("failed to load acme settings: {err:#}");
                return;
            }
        };
        if !settings.enable_client {
            return;
        }
        let paths = settings.certificate_paths();
        match (paths.cert.exists(), paths.key.exists()) {
            (true, true) => self.check_expiry(&paths, &settings).await,
            (false, false) => self.generate_certificate(&paths, &settings).await,
            (cert_exists, _) => {
                let (present, missing) = if cert_exists {
                    (&paths.cert, &paths.key)
                } else {
                    (&paths.key, &paths.cert)
                };
                self.ledger().set_error(
                    Subsystem::Certificate,
                    ErrorKind::Missing,
                    Some(json!({
                        "missing": missing.display().to_string(),
                        "present": present.display().to_string(),
                    })),
                );
                error!("certificate artifact missing: {}", missing.display());
                error!(
                    "either provide it, or remove {} to generate a new certificate",
                    present.display()
                );
            }
        }
    }

    async fn check_expiry(&self, paths: &CertificatePaths, settings: &AcmeSettings) {
        let cert = store::load_certificate(paths);
        if cert.is_empty() {
            self.ledger().set_error(
                Subsystem::Certificate,
                ErrorKind::Invalid,
                Some(json!({ "message": "failed to read certificate files" })),
            );
            error!(
                "failed to read certificate files {} and {}",
                paths.cert.display(),
                paths.key.display()
            );
            self.schedule_renewal_in(FAILURE_BACKOFF);
            return;
        }
        match store::certificate_expiry(&cert.chain_pem) {
            Ok(expiry) => self.handle_renewal(expiry, paths, settings).await,
            Err(err) => {
                self.ledger().set_error(
                    Subsystem::Certificate,
                    ErrorKind::Invalid,
                    Some(json!({ "message": format!("{err:#}") })),
                );
                error!("failed to read certificate expiry date: {err:#}");
                self.schedule_renewal_in(FAILURE_BACKOFF);
            }
        }
    }

    async fn generate_certificate(&self, paths: &CertificatePaths, settings: &AcmeSettings) {
        // Key material and local account configuration come first; protocol
        // phases only go pending once there is something to send.
        let account_key_path = settings.account_key_path();
        let credentials = match acme_client::read_account_credentials(&account_key_path) {
            Ok(credentials) => credentials,
            Err(err) => {
                error!("{err:#}");
                match err {
                    AccountError::KeyRead(_) => {
                        self.ledger().set_error(Subsystem::Account, ErrorKind::KeyRead, None);
                    }
                    err => {
                        self.ledger().set_error(
                            Subsystem::Account,
                            ErrorKind::Acme,
                            Some(json!({ "message": err.to_string() })),
                        );
                        self.schedule_renewal_in(FAILURE_BACKOFF);
                    }
                }
                return;
            }
        };
        let external_account = match settings.external_account() {
            Some((kid, mac)) => match acme_client::external_account_key(kid, &mac) {
                Ok(key) => Some(key),
                Err(err) => {
                    error!("{err:#}");
                    self.ledger().set_error(
                        Subsystem::Account,
                        ErrorKind::Acme,
                        Some(json!({ "message": err.to_string() })),
                    );
                    self.schedule_renewal_in(FAILURE_BACKOFF);
                    return;
                }
            },
            None => None,
        };
        {
            // Directory resolution and account registration share one
            // library round-trip, so both phases go pending up front and a
            // status poll during the registration observes them.
            let mut ledger = self.ledger();
            ledger.set(Subsystem::Directory, Phase::Pending);
            ledger.set(Subsystem::Account, Phase::Pending);
        }
        let session = match AcmeSession::connect(
            credentials,
            &account_key_path,
            &settings.directory_endpoint,
            external_account,
        )
        .await
        {
            Ok(session) => session,
            Err(err) => {
                error!("{err:#}");
                match err {
                    AccountError::Directory(err) => {
                        let mut ledger = self.ledger();
                        ledger.set(Subsystem::Account, Phase::Unknown);
                        ledger.set_error(
                            Subsystem::Directory,
                            ErrorKind::Acme,
                            Some(json!({ "message": err.to_string() })),
                        );
                        drop(ledger);
                        self.schedule_renewal_in(FAILURE_BACKOFF);
                    }
                    // The server answered and rejected the registration.
                    AccountError::Account(err) => {
                        let mut ledger = self.ledger();
                        ledger.set(Subsystem::Directory, Phase::Ok);
                        ledger.set_error(
                            Subsystem::Account,
                            ErrorKind::Acme,
                            Some(json!({ "message": err.to_string() })),
                        );
                        drop(ledger);
                        self.schedule_renewal_in(FAILURE_BACKOFF);
                    }
                    AccountError::KeyWrite(_) => {
                        let mut ledger = self.ledger();
                        ledger.set(Subsystem::Directory, Phase::Ok);
                        ledger.set_error(Subsystem::Account, ErrorKind::KeyWrite, None);
                    }
                    AccountError::KeyRead(_) => {
                        let mut ledger = self.ledger();
                        ledger.set(Subsystem::Directory, Phase::Unknown);
                        ledger.set_error(Subsystem::Account, ErrorKind::KeyRead, None);
                    }
                }
                return;
            }
        };
        {
            let mut ledger = self.ledger();
            ledger.set(Subsystem::Directory, Phase::Ok);
            ledger.set(Subsystem::Account, Phase::Ok);
            ledger.set(Subsystem::Certificate, Phase::Pending);
        }

        let issued = self.order_certificate(&session, settings).await;
        let cert = match issued {
            Ok(cert) => cert,
            Err(err) => {
                self.ledger().set_error(
                    Subsystem::Certificate,
                    ErrorKind::Acme,
                    Some(json!({ "message": format!("{err:#}") })),
                );
                error!("certificate order failed: {err:#}");
                self.schedule_renewal_in(FAILURE_BACKOFF);
                return;
            }
        };

        if let Err(err) = store::write_certificate(&cert, paths) {
            self.ledger().set_error(
                Subsystem::Certificate,
                ErrorKind::Write,
                Some(json!({ "message": format!("{err:#}") })),
            );
            error!(
                "failed to write certificate files {} and {}: {err:#}",
                paths.cert.display(),
                paths.key.display()
            );
            self.schedule_renewal_in(FAILURE_BACKOFF);
            return;
        }
        let _ = self.updates.send(paths.clone());
        match store::certificate_expiry(&cert.chain_pem) {
            Ok(expiry) => {
                info!("certificate retrieved, expires on {expiry}");
                self.handle_renewal(expiry, paths, settings).await;
            }
            Err(err) => {
                self.ledger().set_error(
                    Subsystem::Certificate,
                    ErrorKind::Invalid,
                    Some(json!({ "message": format!("{err:#}") })),
                );
                error!("issued certificate has no readable expiry: {err:#}");
                self.schedule_renewal_in(FAILURE_BACKOFF);
            }
        }
    }

    async fn order_certificate(
        &self,
        session: &AcmeSession,
        settings: &AcmeSettings,
    ) -> Result<Certificate> {
        let (domains, domain_dirs) = settings.ace_domains()?;
        let key_pem = KeyPair::generate()
            .map_err(|err| anyhow!("failed to generate certificate key: {err}"))?
            .serialize_pem();
        let params = PublisherParams {
            kind: settings.challenge_handler_type,
            domain_dirs,
        };
        let chain_pem = session
            .request_certificate(&key_pem, &domains, &params)
            .await?;
        Ok(Certificate { chain_pem, key_pem })
    }

    async fn handle_renewal(
        &self,
        expiry: OffsetDateTime,
        paths: &CertificatePaths,
        settings: &AcmeSettings,
    ) {
        {
            let mut ledger = self.ledger();
            ledger.set(Subsystem::Certificate, Phase::Ok);
            ledger.set_expiry(expiry.unix_timestamp());
        }
        *self.known_expiry.lock().expect("expiry lock poisoned") = Some(expiry);

        let remaining = remaining_time(expiry);
        if remaining.is_positive() {
            self.schedule_renewal_in(remaining.unsigned_abs());
        } else {
            Box::pin(self.generate_certificate(paths, settings)).await;
        }
    }

    /// Arm the renewal timer, cancelling any previously armed one.
    fn schedule_renewal_in(&self, duration: Duration) {
        let mut timer = self.renewal_timer.lock().expect("renewal timer lock poisoned");
        if let Some(handle) = timer.take() {
            handle.abort();
        }
        let renew_at = OffsetDateTime::now_utc() + duration;
        self.ledger().set_renewal(renew_at.unix_timestamp());
        debug!("renewal scheduled for {renew_at}");
        let weak = self.weak_self.clone();
        *timer = Some(tokio::spawn(async move {
            sleep(duration).await;
            if let Some(manager) = weak.upgrade() {
                manager.init().await;
            }
        }));
    }

    /// Adopt certificate files an operator replaced out of band, when both
    /// exist and carry a strictly later expiry than the last known one.
    pub(crate) async fn check_external_update(&self) {
        let settings = match (self.load_settings)() {
            Ok(settings) => settings,
            Err(err) => {
                error!("failed to load acme settings: {err:#}");
                return;
            }
        };
        let paths = settings.certificate_paths();
        if !(paths.cert.exists() && paths.key.exists()) {
            return;
        }
        let cert = store::load_certificate(&paths);
        if cert.is_empty() {
            return;
        }
        let Ok(new_expiry) = store::certificate_expiry(&cert.chain_pem) else {
            return;
        };
        let newer = {
            let known = self.known_expiry.lock().expect("expiry lock poisoned");
            match *known {
                Some(old_expiry) => old_expiry < new_expiry,
                None => true,
            }
        };
        if !newer {
            return;
        }
        info!("externally updated certificate found, expires on {new_expiry}");
        let _ = self.updates.send(paths.clone());
        let cycle_in_flight = self.ledger().is_pending();
        if cycle_in_flight {
            // A cycle is in flight; just adopt the expiry and let the cycle
            // finish on its own terms.
            *self.known_expiry.lock().expect("expiry lock poisoned") = Some(new_expiry);
        } else {
            self.handle_renewal(new_expiry, &paths, &settings).await;
        }
    }

    fn ledger(&self) -> MutexGuard<'_, StatusLedger> {
        self.ledger.lock().expect("status ledger lock poisoned")
    }
}
