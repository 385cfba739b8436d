use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info};

/// Phase of one subsystem of the certificate lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Unknown,
    Pending,
    Ok,
    Error,
}

/// Structured error categories surfaced over the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Missing,
    Write,
    Invalid,
    KeyRead,
    KeyWrite,
    Acme,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Write => "write",
            Self::Invalid => "invalid",
            Self::KeyRead => "key-read",
            Self::KeyWrite => "key-write",
            Self::Acme => "acme",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    Directory,
    Account,
    Certificate,
}

impl Subsystem {
    fn name(self) -> &'static str {
        match self {
            Self::Directory => "directory",
            Self::Account => "account",
            Self::Certificate => "certificate",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ErrorRecord {
    #[serde(rename = "type")]
    kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Default)]
struct Entry {
    status: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expiry: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    renewal: Option<i64>,
}

/// Per-subsystem phase and error record of the certificate lifecycle.
///
/// Recorded errors are sticky until the next [`reset`](Self::reset), so the
/// status endpoint keeps reporting what went wrong until a new cycle starts.
#[derive(Debug, Clone, Serialize, Default)]
pub struct StatusLedger {
    directory: Entry,
    account: Entry,
    certificate: Entry,
}

impl StatusLedger {
    /// Return all subsystems to `unknown` and drop recorded errors.
    pub fn reset(&mut self) {
        *self = Self::default();
        debug!("status ledger reset");
    }

    pub fn set(&mut self, sub: Subsystem, phase: Phase) {
        self.entry_mut(sub).status = phase;
        info!("acme {}: {:?}", sub.name(), phase);
    }

    pub fn set_error(&mut self, sub: Subsystem, kind: ErrorKind, data: Option<Value>) {
        match &data {
            Some(data) => error!("acme {}: {} error: {data}", sub.name(), kind.as_str()),
            None => error!("acme {}: {} error", sub.name(), kind.as_str()),
        }
        let entry = self.entry_mut(sub);
        entry.status = Phase::Error;
        entry.error = Some(ErrorRecord { kind, data });
    }

    /// Record the certificate expiry as seconds since the UNIX epoch.
    pub fn set_expiry(&mut self, epoch_seconds: i64) {
        self.certificate.expiry = Some(epoch_seconds);
    }

    /// Record the scheduled renewal instant as seconds since the UNIX epoch.
    pub fn set_renewal(&mut self, epoch_seconds: i64) {
        self.certificate.renewal = Some(epoch_seconds);
    }

    pub fn phase(&self, sub: Subsystem) -> Phase {
        self.entry(sub).status
    }

    pub fn error_kind(&self, sub: Subsystem) -> Option<ErrorKind> {
        self.entry(sub).error.as_ref().map(|record| record.kind)
    }

    pub fn renewal(&self) -> Option<i64> {
        self.certificate.renewal
    }

    pub fn expiry(&self) -> Option<i64> {
        self.certificate.expiry
    }

    /// A cycle is in flight while any subsystem is `pending`.
    pub fn is_pending(&self) -> bool {
        [&self.directory, &self.account, &self.certificate]
            .iter()
            .any(|entry| entry.status == Phase::Pending)
    }

    /// Immutable serializable view for the status endpoint.
    pub fn snapshot(&self) -> Value {
        serde_json::to_value(self).expect("status ledger is always serializable")
    }

    fn entry(&self, sub: Subsystem) -> &Entry {
        match sub {
            Subsystem::Directory => &self.directory,
            Subsystem::Account => &self.account,
            Subsystem::Certificate => &self.certificate,
        }
    }

    fn entry_mut(&mut self, sub: Subsystem) -> &mut Entry {
        match sub {
            Subsystem::Directory => &mut self.directory,
            Subsystem::Account => &mut self.account,
            Subsystem::Certificate => &mut self.certificate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snapshot_starts_unknown() {
        let ledger = StatusLedger::default();
        assert_eq!(
            ledger.snapshot(),
            json!({
                "directory": { "status": "unknown" },
                "account": { "status": "unknown" },
                "certificate": { "status": "unknown" },
            })
        );
    }

    #[test]
    fn error_payload_shape() {
        let mut ledger = StatusLedger::default();
        ledger.set_error(
            Subsystem::Certificate,
            ErrorKind::Missing,
            Some(json!({ "missing": "/etc/cert.pem", "present": "/etc/key.pem" })),
        );
        let snapshot = ledger.snapshot();
        assert_eq!(snapshot["certificate"]["status"], "error");
        assert_eq!(snapshot["certificate"]["error"]["type"], "missing");
        assert_eq!(
            snapshot["certificate"]["error"]["data"]["missing"],
            "/etc/cert.pem"
        );
    }

    #[test]
    fn errors_are_sticky_until_reset() {
        let mut ledger = StatusLedger::default();
        ledger.set_error(Subsystem::Account, ErrorKind::KeyRead, None);
        ledger.set(Subsystem::Account, Phase::Ok);
        assert_eq!(ledger.error_kind(Subsystem::Account), Some(ErrorKind::KeyRead));

        ledger.reset();
        assert_eq!(ledger.error_kind(Subsystem::Account), None);
        assert_eq!(ledger.phase(Subsystem::Account), Phase::Unknown);
    }

    #[test]
    fn pending_in_any_subsystem() {
        let mut ledger = StatusLedger::default();
        assert!(!ledger.is_pending());
        ledger.set(Subsystem::Directory, Phase::Pending);
        assert!(ledger.is_pending());
        ledger.set(Subsystem::Directory, Phase::Ok);
        assert!(!ledger.is_pending());
    }

    #[test]
    fn expiry_and_renewal_in_snapshot() {
        let mut ledger = StatusLedger::default();
        ledger.set(Subsystem::Certificate, Phase::Ok);
        ledger.set_expiry(1_700_000_000);
        ledger.set_renewal(1_690_000_000);
        let snapshot = ledger.snapshot();
        assert_eq!(snapshot["certificate"]["expiry"], 1_700_000_000_i64);
        assert_eq!(snapshot["certificate"]["renewal"], 1_690_000_000_i64);
        assert!(snapshot["directory"].get("expiry").is_none());
    }
}
