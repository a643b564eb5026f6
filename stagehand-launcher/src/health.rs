//! HTTP readiness polling
//!
//! A service is healthy when its readiness endpoint answers with a 2xx-3xx
//! status. Connection refusals and per-attempt timeouts are expected while a
//! service boots and are absorbed by the polling loop; only the overall
//! deadline elapsing is a failure.

use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, trace};

/// Fixed interval between readiness polls.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Per-attempt timeout, also used when probing reuse candidates.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Attempts between progress callbacks, to keep the event log readable.
const PROGRESS_EVERY: u32 = 5;

/// Build the probe client. Redirects are not followed so a 3xx counts as a
/// response from the service itself.
pub fn probe_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap_or_default()
}

/// One bounded probe. True on any 2xx-3xx response.
pub async fn probe_once(client: &reqwest::Client, url: &str, timeout: Duration) -> bool {
    match client.get(url).timeout(timeout).send().await {
        Ok(resp) => {
            let status = resp.status();
            let healthy = status.is_success() || status.is_redirection();
            trace!("Probe {} -> {}", url, status);
            healthy
        }
        Err(e) => {
            trace!("Probe {} failed: {}", url, e);
            false
        }
    }
}

/// Poll `url` until it reports healthy or `total_timeout` elapses.
///
/// `progress` is invoked every fifth attempt with the attempt count so the
/// caller can emit periodic events without one event per poll.
pub async fn wait_healthy(
    client: &reqwest::Client,
    url: &str,
    total_timeout: Duration,
    mut progress: impl FnMut(u32),
) -> bool {
    let deadline = Instant::now() + total_timeout;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        if probe_once(client, url, PROBE_TIMEOUT).await {
            debug!("{} healthy after {} attempt(s)", url, attempt);
            return true;
        }
        if attempt.is_multiple_of(PROGRESS_EVERY) {
            progress(attempt);
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        // Shorten the last sleep so one final probe lands at the deadline
        sleep(POLL_INTERVAL.min(deadline - now)).await;
    }
}
