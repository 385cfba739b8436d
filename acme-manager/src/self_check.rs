use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Poll every URL with GETs at least `interval` apart until it answers 2xx
/// or `duration` elapses. Returns the URLs that never answered; the caller
/// proceeds either way, this is only there to avoid offering a challenge
/// before it is actually reachable.
pub(crate) async fn wait_for_urls(
    urls: Vec<String>,
    duration: Duration,
    interval: Duration,
) -> Vec<String> {
    if urls.is_empty() {
        return Vec::new();
    }
    let client = match reqwest::Client::builder().timeout(duration).build() {
        Ok(client) => client,
        Err(err) => {
            warn!("failed to create self-check client: {err}");
            return urls;
        }
    };
    let deadline = Instant::now() + duration;
    let mut unsettled = urls;
    loop {
        sleep(interval).await;
        let mut still_unsettled = Vec::new();
        for url in unsettled {
            let reachable = match client.get(&url).send().await {
                Ok(response) => response.status().is_success(),
                Err(err) => {
                    debug!("self-check request to {url} failed: {err}");
                    false
                }
            };
            if reachable {
                debug!("challenge self-check passed for {url}");
            } else {
                still_unsettled.push(url);
            }
        }
        unsettled = still_unsettled;
        if unsettled.is_empty() {
            return Vec::new();
        }
        if Instant::now() >= deadline {
            for url in &unsettled {
                warn!("challenge self-check timed out for {url}");
            }
            return unsettled;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::{ChallengePublisher, HttpChallengeServer};

    #[tokio::test]
    async fn empty_url_set_completes_immediately() {
        let started = Instant::now();
        let left = wait_for_urls(Vec::new(), Duration::from_secs(5), Duration::from_millis(100)).await;
        assert!(left.is_empty());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn unreachable_url_times_out_and_completes() {
        // Port 9 is the discard service; nothing listens there.
        let urls = vec!["http://127.0.0.1:9/.well-known/acme-challenge/x".to_string()];
        let left = wait_for_urls(urls.clone(), Duration::from_millis(600), Duration::from_millis(100)).await;
        assert_eq!(left, urls);
    }

    #[tokio::test]
    async fn served_challenge_settles() {
        let mut server = HttpChallengeServer::bind(48617).await.unwrap();
        server
            .add_challenge(
                "example.test",
                "/.well-known/acme-challenge/self-check",
                "self-check.thumbprint",
            )
            .await;

        let urls = vec!["http://127.0.0.1:48617/.well-known/acme-challenge/self-check".to_string()];
        let left = wait_for_urls(urls, Duration::from_secs(5), Duration::from_millis(100)).await;
        assert!(left.is_empty());
    }
}
