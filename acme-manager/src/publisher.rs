use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result};
use enum_dispatch::enum_dispatch;
use fs_err as fs;
use rocket::{
    figment::Figment,
    get,
    http::{
        uri::{fmt::Path as UriPath, Segments},
        ContentType,
    },
    request::FromSegments,
    response::status,
    routes, State,
};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

/// Port the embedded challenge server binds; HTTP-01 validation always
/// arrives on port 80.
pub(crate) const HTTP_CHALLENGE_PORT: u16 = 80;

/// Which challenge publisher a cycle constructs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeHandlerType {
    #[default]
    Server,
    Files,
    Manual,
}

/// Makes challenge tokens reachable at `http://{domain}{url_path}`.
///
/// Each variant reports how long the self-check poller should wait for its
/// publication to become visible, and at which interval to re-check.
#[enum_dispatch]
pub(crate) trait ChallengePublisher {
    async fn add_challenge(&mut self, domain: &str, url_path: &str, content: &str);
    fn self_check_duration(&self) -> Duration;
    fn self_check_interval(&self) -> Duration;
}

#[enum_dispatch(ChallengePublisher)]
pub(crate) enum ChallengeHandler {
    Server(HttpChallengeServer),
    Files(ChallengeFiles),
    Manual(ManualChallenge),
}

pub(crate) async fn make_challenge_handler(
    kind: ChallengeHandlerType,
    domain_dirs: BTreeMap<String, PathBuf>,
) -> Result<ChallengeHandler> {
    Ok(match kind {
        ChallengeHandlerType::Server => HttpChallengeServer::bind(HTTP_CHALLENGE_PORT)
            .await?
            .into(),
        ChallengeHandlerType::Files => ChallengeFiles::new(domain_dirs).into(),
        ChallengeHandlerType::Manual => ManualChallenge.into(),
    })
}

struct ServedChallenge {
    url_path: String,
    content: Vec<u8>,
}

#[derive(Clone, Default)]
struct ChallengeSet(Arc<Mutex<Vec<ServedChallenge>>>);

/// An HTTP listener on the wildcard address serving registered challenges
/// for the lifetime of the instance.
pub(crate) struct HttpChallengeServer {
    challenges: ChallengeSet,
    shutdown: rocket::Shutdown,
}

impl HttpChallengeServer {
    pub(crate) async fn bind(port: u16) -> Result<Self> {
        let challenges = ChallengeSet::default();
        let figment = Figment::from(rocket::Config::default())
            .merge(("address", "0.0.0.0"))
            .merge(("port", port))
            .merge(("log_level", "critical"))
            .merge(("shutdown.ctrlc", false));
        let rocket = rocket::custom(figment)
            .manage(challenges.clone())
            .mount("/", routes![serve_challenge])
            .ignite()
            .await
            .context("failed to set up challenge server")?;
        let shutdown = rocket.shutdown();
        debug!("challenge server listening on port {port}");
        tokio::spawn(async move {
            if let Err(err) = rocket.launch().await {
                error!("challenge server on port {port} failed: {err}");
            }
        });
        Ok(Self {
            challenges,
            shutdown,
        })
    }
}

impl ChallengePublisher for HttpChallengeServer {
    async fn add_challenge(&mut self, _domain: &str, url_path: &str, content: &str) {
        self.challenges
            .0
            .lock()
            .expect("challenge set lock poisoned")
            .push(ServedChallenge {
                url_path: url_path.to_string(),
                content: content.as_bytes().to_vec(),
            });
    }

    fn self_check_duration(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn self_check_interval(&self) -> Duration {
        Duration::from_millis(250)
    }
}

impl Drop for HttpChallengeServer {
    fn drop(&mut self) {
        debug!("shutting down challenge server");
        self.shutdown.clone().notify();
    }
}

/// Raw request path, joined back from its segments. The stock `PathBuf`
/// guard rejects dotfile segments, which would 404 `/.well-known/...`.
struct RawPath(String);

impl<'r> FromSegments<'r> for RawPath {
    type Error = std::convert::Infallible;

    fn from_segments(segments: Segments<'r, UriPath>) -> Result<Self, Self::Error> {
        let mut path = String::new();
        for segment in segments {
            path.push('/');
            path.push_str(segment);
        }
        if path.is_empty() {
            path.push('/');
        }
        Ok(Self(path))
    }
}

#[get("/<path..>")]
fn serve_challenge(
    path: RawPath,
    challenges: &State<ChallengeSet>,
) -> Result<(ContentType, Vec<u8>), status::NotFound<String>> {
    let challenges = challenges.0.lock().expect("challenge set lock poisoned");
    match challenges.iter().find(|c| c.url_path == path.0) {
        Some(challenge) => Ok((ContentType::Binary, challenge.content.clone())),
        None => {
            let expected = challenges
                .iter()
                .map(|c| c.url_path.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            Err(status::NotFound(format!(
                "Resource not found. Url is {} but expected any of\n{expected}",
                path.0
            )))
        }
    }
}

/// Drops challenge files into per-domain directories, typically the
/// document roots of an already running web server.
pub(crate) struct ChallengeFiles {
    dirs: BTreeMap<String, PathBuf>,
    created: Vec<PathBuf>,
}

impl ChallengeFiles {
    pub(crate) fn new(dirs: BTreeMap<String, PathBuf>) -> Self {
        Self {
            dirs,
            created: Vec::new(),
        }
    }
}

impl ChallengePublisher for ChallengeFiles {
    async fn add_challenge(&mut self, domain: &str, url_path: &str, content: &str) {
        let base = self
            .dirs
            .get(domain)
            .cloned()
            .unwrap_or_else(|| PathBuf::from("."));
        let path = base.join(url_path.trim_start_matches('/'));
        let written = (|| -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, content)
        })();
        match written {
            Ok(()) => {
                debug!("wrote challenge file {}", path.display());
                self.created.push(path);
            }
            Err(err) => error!("failed to write challenge file {}: {err}", path.display()),
        }
    }

    fn self_check_duration(&self) -> Duration {
        Duration::from_secs(2)
    }

    fn self_check_interval(&self) -> Duration {
        Duration::from_millis(250)
    }
}

impl Drop for ChallengeFiles {
    fn drop(&mut self) {
        let mut dirs = BTreeSet::new();
        for path in &self.created {
            if let Some(parent) = path.parent() {
                dirs.insert(parent.to_path_buf());
            }
            if let Err(err) = fs::remove_file(path) {
                warn!("failed to remove challenge file {}: {err}", path.display());
            }
        }
        for dir in dirs {
            if let Err(err) = fs::remove_dir(&dir) {
                warn!("failed to remove challenge directory {}: {err}", dir.display());
            }
        }
    }
}

/// No publication at all; tells the operator what to put where and gives
/// them two minutes to do it.
pub(crate) struct ManualChallenge;

impl ChallengePublisher for ManualChallenge {
    async fn add_challenge(&mut self, domain: &str, url_path: &str, content: &str) {
        info!(
            "please publish this http-01 challenge manually:\n  domain: {domain}\n  location: {url_path}\n  content: {content}"
        );
    }

    fn self_check_duration(&self) -> Duration {
        Duration::from_secs(120)
    }

    fn self_check_interval(&self) -> Duration {
        Duration::from_secs(1)
    }
}
