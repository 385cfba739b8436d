//! Automated ACME certificate lifecycle management for a long-running
//! server process.
//!
//! This library keeps a valid TLS certificate chain on disk for a set of
//! configured domains: it registers an ACME account, orders certificates,
//! answers HTTP-01 challenges through a pluggable publisher, confirms its
//! own challenge URLs are reachable before asking the CA to validate, and
//! renews at two thirds of the remaining certificate lifetime. Certificates
//! an operator drops in place out of band are picked up too.
//!
//! # Usage
//!
//! The manager reads its settings fresh at every cycle through a loader
//! closure, so the embedding server can let operators reconfigure domains
//! or the challenge handler without a restart:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use acme_manager::{AcmeManager, AcmeSettings, SettingsLoader};
//!
//! #[tokio::main]
//! async fn main() {
//!     let loader: SettingsLoader = Arc::new(|| {
//!         Ok(AcmeSettings::builder()
//!             .enable_client(true)
//!             .data_dir("/var/lib/certd")
//!             .directory_endpoint("https://acme-v02.api.letsencrypt.org/directory")
//!             .build())
//!     });
//!     let manager = AcmeManager::new(loader);
//!     let mut updates = manager.subscribe();
//!     manager.start();
//!     while let Ok(paths) = updates.recv().await {
//!         println!("certificate updated at {}", paths.cert.display());
//!     }
//! }
//! ```
//!
//! Progress and failures are reported through a queryable status ledger,
//! one entry per protocol stage (`directory`, `account`, `certificate`);
//! see [`AcmeManager::status`].

pub use ledger::{ErrorKind, Phase, StatusLedger, Subsystem};
pub use manager::{AcmeManager, AcmeSettings, ArtifactKind, DomainEntry, SettingsLoader};
pub use publisher::ChallengeHandlerType;
pub use store::{load_certificate, write_certificate, Certificate, CertificatePaths};

mod acme_client;
mod ledger;
mod manager;
mod publisher;
mod self_check;
mod store;
