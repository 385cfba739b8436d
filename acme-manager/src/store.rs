use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs_err as fs;
use time::OffsetDateTime;
use tracing::debug;
use x509_parser::prelude::Pem;

/// Filesystem locations of the served certificate artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub trusted_authorities: PathBuf,
}

/// A certificate chain and private key pair, both PEM encoded.
///
/// Loading never fails; an unreadable or absent file yields an empty string,
/// and [`is_empty`](Self::is_empty) tells callers the pair is unusable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Certificate {
    pub chain_pem: String,
    pub key_pem: String,
}

impl Certificate {
    pub fn is_empty(&self) -> bool {
        self.chain_pem.is_empty() || self.key_pem.is_empty()
    }
}

fn read_all(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_default()
}

pub fn load_certificate(paths: &CertificatePaths) -> Certificate {
    Certificate {
        chain_pem: read_all(&paths.cert),
        key_pem: read_all(&paths.key),
    }
}

/// Write both artifacts. Each file is written atomically, but there is no
/// cross-file atomicity; consumers must re-read both files when notified.
pub fn write_certificate(cert: &Certificate, paths: &CertificatePaths) -> Result<()> {
    safe_write(&paths.cert, cert.chain_pem.as_bytes())
        .with_context(|| format!("failed to write {}", paths.cert.display()))?;
    safe_write(&paths.key, cert.key_pem.as_bytes())
        .with_context(|| format!("failed to write {}", paths.key.display()))?;
    debug!(
        "stored certificate chain at {} and key at {}",
        paths.cert.display(),
        paths.key.display()
    );
    Ok(())
}

/// The `notAfter` instant of the first certificate in the chain.
pub fn certificate_expiry(chain_pem: &str) -> Result<OffsetDateTime> {
    let pem = Pem::iter_from_buffer(chain_pem.as_bytes())
        .next()
        .transpose()
        .context("invalid pem")?
        .context("no certificate in pem")?;
    let cert = pem.parse_x509().context("invalid x509 certificate")?;
    Ok(cert.validity().not_after.to_datetime())
}

/// Write `data` to a sibling temporary file and rename it into place, so a
/// concurrent reader never observes a half-written file.
pub(crate) fn safe_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = tmp_path(path);
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Atomic write with owner-only permissions, for key material.
pub(crate) fn write_secret(path: &Path, data: &[u8]) -> Result<()> {
    safe_write(path, data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair};
    use tempfile::TempDir;

    fn test_paths(dir: &TempDir) -> CertificatePaths {
        CertificatePaths {
            cert: dir.path().join("cert.pem"),
            key: dir.path().join("key.pem"),
            trusted_authorities: dir.path().join("authority.pem"),
        }
    }

    fn self_signed(not_after: OffsetDateTime) -> Certificate {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["example.test".to_string()]).unwrap();
        params.not_before = OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_after = not_after;
        let cert = params.self_signed(&key).unwrap();
        Certificate {
            chain_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        }
    }

    #[test]
    fn write_then_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let paths = test_paths(&dir);
        let cert = self_signed(OffsetDateTime::now_utc() + time::Duration::days(90));

        write_certificate(&cert, &paths).unwrap();
        let loaded = load_certificate(&paths);
        assert_eq!(loaded, cert);
        assert!(!loaded.is_empty());
    }

    #[test]
    fn load_missing_files_is_empty() {
        let dir = TempDir::new().unwrap();
        let loaded = load_certificate(&test_paths(&dir));
        assert!(loaded.is_empty());
        assert_eq!(loaded.chain_pem, "");
    }

    #[test]
    fn expiry_matches_not_after() {
        let not_after = OffsetDateTime::now_utc() + time::Duration::days(30);
        let cert = self_signed(not_after);
        let parsed = certificate_expiry(&cert.chain_pem).unwrap();
        assert!((parsed - not_after).whole_seconds().abs() <= 1);
    }

    #[test]
    fn expiry_rejects_garbage() {
        assert!(certificate_expiry("not a pem").is_err());
        assert!(certificate_expiry("").is_err());
    }

    #[test]
    fn safe_write_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/deeper/file.pem");
        safe_write(&path, b"data").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"data");
        assert!(!tmp_path(&path).exists());
    }

    #[cfg(unix)]
    #[test]
    fn secret_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("account.pem");
        write_secret(&path, b"secret").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
