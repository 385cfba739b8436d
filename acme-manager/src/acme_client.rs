use std::{collections::BTreeMap, path::{Path, PathBuf}, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use base64::Engine;
use fs_err as fs;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, ExternalAccountKey,
    Identifier, NewAccount, NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::{
    publisher::{make_challenge_handler, ChallengeHandler, ChallengeHandlerType, ChallengePublisher},
    self_check, store,
};

pub(crate) const CHALLENGE_PATH_PREFIX: &str = "/.well-known/acme-challenge/";

/// How the cycle publishes challenges once the order hands them out.
pub(crate) struct PublisherParams {
    pub kind: ChallengeHandlerType,
    pub domain_dirs: BTreeMap<String, PathBuf>,
}

/// Failures while establishing the ACME account, split so the orchestrator
/// can attribute them to the right status subsystem.
#[derive(Debug, Error)]
pub(crate) enum AccountError {
    #[error("failed to read account key file: {0}")]
    KeyRead(anyhow::Error),
    #[error("failed to write account key file: {0}")]
    KeyWrite(anyhow::Error),
    #[error("ACME directory request failed: {0}")]
    Directory(anyhow::Error),
    #[error("invalid account material: {0}")]
    Account(anyhow::Error),
}

/// A connected ACME account, ready to order certificates.
pub(crate) struct AcmeSession {
    account: Account,
}

struct PublishedChallenge {
    acme_url: String,
    self_check_url: String,
}

/// Read the persisted account credentials, if any. Purely local; runs
/// before any protocol phase is reported as pending.
pub(crate) fn read_account_credentials(
    key_path: &Path,
) -> Result<Option<AccountCredentials>, AccountError> {
    if !key_path.exists() {
        return Ok(None);
    }
    let encoded = fs::read_to_string(key_path).map_err(|err| AccountError::KeyRead(err.into()))?;
    let credentials = serde_json::from_str(&encoded)
        .map_err(|err| AccountError::Account(anyhow!("invalid account credentials: {err}")))?;
    Ok(Some(credentials))
}

/// Build the external account binding key from its configured parts.
pub(crate) fn external_account_key(
    kid: String,
    mac: &str,
) -> Result<ExternalAccountKey, AccountError> {
    let hmac = decode_eab_hmac(mac).map_err(AccountError::Account)?;
    Ok(ExternalAccountKey::new(kid, &hmac))
}

/// A problem document means the server answered and rejected the account;
/// anything else means the directory was never usable in the first place.
fn split_acme_error(err: instant_acme::Error) -> AccountError {
    match err {
        instant_acme::Error::Api(problem) => {
            AccountError::Account(anyhow!("account rejected by server: {problem}"))
        }
        err => AccountError::Directory(anyhow!(err)),
    }
}

impl AcmeSession {
    /// Resolve the directory and take over the persisted account, or
    /// register a new one and persist its credentials with owner-only
    /// permissions.
    pub(crate) async fn connect(
        credentials: Option<AccountCredentials>,
        key_path: &Path,
        directory_url: &str,
        external_account: Option<ExternalAccountKey>,
    ) -> Result<Self, AccountError> {
        match credentials {
            Some(credentials) => {
                let account = Account::from_credentials(credentials)
                    .await
                    .map_err(split_acme_error)?;
                debug!("loaded ACME account from {}", key_path.display());
                Ok(Self { account })
            }
            None => {
                let (account, credentials) = Account::create(
                    &NewAccount {
                        contact: &[],
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    directory_url,
                    external_account.as_ref(),
                )
                .await
                .map_err(split_acme_error)?;
                let encoded = serde_json::to_string(&credentials)
                    .map_err(|err| AccountError::Account(anyhow!(err)))?;
                store::write_secret(key_path, encoded.as_bytes()).map_err(AccountError::KeyWrite)?;
                info!("created new ACME account, key stored at {}", key_path.display());
                Ok(Self { account })
            }
        }
    }

    /// Order a certificate for the given domains, publishing each HTTP-01
    /// challenge through the configured handler.
    ///
    /// Returns the issued chain in PEM format. The challenge handler is
    /// constructed lazily on the first challenge and disposed on every exit
    /// path, so published artifacts never outlive the order.
    pub(crate) async fn request_certificate(
        &self,
        key_pem: &str,
        domains: &[String],
        params: &PublisherParams,
    ) -> Result<String> {
        let mut publisher = None;
        let result = self
            .request_certificate_inner(key_pem, domains, params, &mut publisher)
            .await;
        if publisher.is_some() {
            debug!("disposing challenge publisher");
            drop(publisher);
        }
        result
    }

    async fn request_certificate_inner(
        &self,
        key_pem: &str,
        domains: &[String],
        params: &PublisherParams,
        publisher: &mut Option<ChallengeHandler>,
    ) -> Result<String> {
        debug!("requesting new certificate for {}", domains.join(", "));
        let identifiers = domains
            .iter()
            .map(|name| Identifier::Dns(name.clone()))
            .collect::<Vec<_>>();
        let mut order = self
            .account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .context("failed to create new order")?;
        let mut challenges_ready = false;
        loop {
            order.refresh().await.context("failed to refresh order")?;
            match order.state().status {
                // Publish the challenges, confirm our own reachability, then
                // tell the server to validate.
                OrderStatus::Pending => {
                    if challenges_ready {
                        debug!("challenges are ready, waiting for order to become ready");
                        sleep(Duration::from_secs(2)).await;
                        continue;
                    }
                    let challenges = self
                        .authorize(&mut order, publisher, params)
                        .await
                        .context("failed to authorize")?;
                    if challenges.is_empty() {
                        bail!("no pending challenges found");
                    }
                    debug!(
                        "ordered certificate: {} domains, {} challenges",
                        domains.len(),
                        challenges.len()
                    );
                    if let Some(handler) = publisher.as_ref() {
                        let urls = challenges
                            .iter()
                            .map(|challenge| challenge.self_check_url.clone())
                            .collect();
                        self_check::wait_for_urls(
                            urls,
                            handler.self_check_duration(),
                            handler.self_check_interval(),
                        )
                        .await;
                    }
                    for challenge in &challenges {
                        debug!("setting challenge ready for {}", challenge.acme_url);
                        order
                            .set_challenge_ready(&challenge.acme_url)
                            .await
                            .context("failed to set challenge ready")?;
                    }
                    challenges_ready = true;
                    continue;
                }
                // To upload the CSR
                OrderStatus::Ready => {
                    debug!("order is ready, uploading CSR");
                    let csr = make_csr(key_pem, domains)?;
                    order
                        .finalize(csr.as_ref())
                        .await
                        .context("failed to finalize order")?;
                    continue;
                }
                // Waiting for the server to accept the CSR
                OrderStatus::Processing => {
                    debug!("order is processing, waiting for the CSR to be accepted");
                    sleep(Duration::from_secs(2)).await;
                    continue;
                }
                // Certificate is ready
                OrderStatus::Valid => {
                    debug!("order is valid, getting certificate");
                    return extract_certificate(order).await;
                }
                // Something went wrong
                OrderStatus::Invalid => bail!("order is invalid"),
            }
        }
    }

    async fn authorize(
        &self,
        order: &mut Order,
        publisher: &mut Option<ChallengeHandler>,
        params: &PublisherParams,
    ) -> Result<Vec<PublishedChallenge>> {
        let mut published = Vec::new();
        let authorizations = order
            .authorizations()
            .await
            .context("failed to get authorizations")?;
        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                _ => bail!("unsupported authorization status: {:?}", authz.status),
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .context("no http-01 challenge found")?;

            let Identifier::Dns(identifier) = &authz.identifier;

            let key_authorization = order.key_authorization(challenge);
            let url_path = format!("{CHALLENGE_PATH_PREFIX}{}", challenge.token);
            debug!("got http-01 challenge for {identifier} at {url_path}");
            let handler = match publisher {
                Some(handler) => handler,
                None => publisher
                    .insert(make_challenge_handler(params.kind, params.domain_dirs.clone()).await?),
            };
            handler
                .add_challenge(identifier, &url_path, key_authorization.as_str())
                .await;
            published.push(PublishedChallenge {
                acme_url: challenge.url.clone(),
                self_check_url: format!("http://{identifier}{url_path}"),
            });
        }
        Ok(published)
    }
}

fn make_csr(key: &str, names: &[String]) -> Result<Vec<u8>> {
    let mut params =
        CertificateParams::new(names).context("failed to create certificate params")?;
    params.distinguished_name = DistinguishedName::new();
    let key = KeyPair::from_pem(key).context("failed to parse private key")?;
    let csr = params
        .serialize_request(&key)
        .context("failed to serialize certificate request")?;
    Ok(csr.der().as_ref().to_vec())
}

async fn extract_certificate(mut order: Order) -> Result<String> {
    let mut tries = 0;
    let cert_chain_pem = loop {
        tries += 1;
        if tries > 5 {
            bail!("failed to get certificate");
        }
        match order
            .certificate()
            .await
            .context("failed to get certificate")?
        {
            Some(cert_chain_pem) => break cert_chain_pem,
            None => sleep(Duration::from_secs(1)).await,
        }
    };
    Ok(cert_chain_pem)
}

/// EAB HMAC keys are handed out base64url encoded; some CAs use standard
/// base64 instead.
fn decode_eab_hmac(mac: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(mac)
        .or_else(|_| base64::engine::general_purpose::STANDARD.decode(mac))
        .context("invalid external account binding HMAC key")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ensure_crypto_provider() {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }

    #[test]
    fn csr_from_generated_key() {
        let key = KeyPair::generate().unwrap().serialize_pem();
        let csr = make_csr(&key, &["example.test".to_string()]).unwrap();
        assert!(!csr.is_empty());
    }

    #[test]
    fn csr_rejects_bad_key() {
        assert!(make_csr("not a key", &["example.test".to_string()]).is_err());
    }

    #[test]
    fn eab_hmac_accepts_both_alphabets() {
        let url_safe = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode([0xfbu8, 0xef, 0x01]);
        let standard = base64::engine::general_purpose::STANDARD.encode([0xfbu8, 0xef, 0x01]);
        assert_eq!(decode_eab_hmac(&url_safe).unwrap(), vec![0xfb, 0xef, 0x01]);
        assert_eq!(decode_eab_hmac(&standard).unwrap(), vec![0xfb, 0xef, 0x01]);
        assert!(decode_eab_hmac("***").is_err());
    }

    #[tokio::test]
    async fn unreachable_directory_is_a_directory_error() {
        ensure_crypto_provider();
        let dir = tempfile::TempDir::new().unwrap();
        let key_path = dir.path().join("acme_account_key.pem");
        let credentials = read_account_credentials(&key_path).unwrap();
        assert!(credentials.is_none());
        let err = AcmeSession::connect(credentials, &key_path, "http://127.0.0.1:9/directory", None)
            .await
            .err()
            .expect("directory at port 9 must be unreachable");
        assert!(matches!(err, AccountError::Directory(_)));
        // No account material may be left behind on failure.
        assert!(!key_path.exists());
    }

    #[test]
    fn corrupt_credentials_are_an_account_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let key_path = dir.path().join("acme_account_key.pem");
        fs::write(&key_path, "not json").unwrap();
        let err = read_account_credentials(&key_path)
            .err()
            .expect("corrupt credentials must fail");
        assert!(matches!(err, AccountError::Account(_)));
    }

    #[test]
    fn eab_key_from_configured_parts() {
        let mac = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode([1u8, 2, 3, 4]);
        assert!(external_account_key("kid-1".to_string(), &mac).is_ok());
        assert!(matches!(
            external_account_key("kid-1".to_string(), "***"),
            Err(AccountError::Account(_))
        ));
    }
}
