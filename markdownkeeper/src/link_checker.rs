//! External link checker: per-domain rate-limited HTTP validation for links
//! classified `is_external` by the parser; local links are checked against
//! the filesystem relative to their owning document.
//!
//! No rate-limiter crate (governor, ratelimit) appears anywhere in the
//! pack's dependency trees, so the per-host delay is a small hand-rolled
//! timestamp map rather than a new dependency. `reqwest` is the teacher's own
//! HTTP client, used the same way it builds clients in `connector_s3.rs` and
//! `lua_runtime.rs` (timeout + bounded redirect policy).

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use markdownkeeper_core::error::{CoreError, CoreResult};
use markdownkeeper_core::models::LinkStatus;

use crate::sqlite_store::SqliteStore;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_MIN_DELAY: Duration = Duration::from_millis(1000);

/// Per-domain rate-limited HTTP link checker (§5's "a per-domain limiter
/// enforces a minimum inter-request delay").
pub struct LinkChecker {
    client: Client,
    min_delay: Duration,
    last_request: Mutex<HashMap<String, Instant>>,
}

impl LinkChecker {
    pub fn new() -> CoreResult<Self> {
        Self::with_min_delay(DEFAULT_MIN_DELAY)
    }

    pub fn with_min_delay(min_delay: Duration) -> CoreResult<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| CoreError::Backend(format!("failed to build link-checker HTTP client: {e}")))?;
        Ok(Self { client, min_delay, last_request: Mutex::new(HashMap::new()) })
    }

    fn host_of(target: &str) -> Option<String> {
        reqwest::Url::parse(target).ok().and_then(|u| u.host_str().map(str::to_string))
    }

    async fn wait_for_slot(&self, host: &str) {
        let wait = {
            let mut last = self.last_request.lock().await;
            let now = Instant::now();
            let wait = match last.get(host) {
                Some(prev) if now.duration_since(*prev) < self.min_delay => {
                    self.min_delay - now.duration_since(*prev)
                }
                _ => Duration::ZERO,
            };
            last.insert(host.to_string(), now + wait);
            wait
        };
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }

    /// Checks one link target: HEAD first, GET retried on `405`. Targets
    /// whose host can't be parsed are reported `Unknown` rather than broken.
    pub async fn check(&self, target: &str) -> LinkStatus {
        let Some(host) = Self::host_of(target) else {
            return LinkStatus::Unknown;
        };

        self.wait_for_slot(&host).await;
        match self.client.head(target).send().await {
            Ok(resp) if resp.status() == StatusCode::METHOD_NOT_ALLOWED => {
                self.wait_for_slot(&host).await;
                self.get_status(target).await
            }
            Ok(resp) if is_reachable(resp.status()) => LinkStatus::Ok,
            Ok(_) => LinkStatus::Broken,
            Err(_) => LinkStatus::Broken,
        }
    }

    async fn get_status(&self, target: &str) -> LinkStatus {
        match self.client.get(target).send().await {
            Ok(resp) if is_reachable(resp.status()) => LinkStatus::Ok,
            _ => LinkStatus::Broken,
        }
    }
}

fn is_reachable(status: StatusCode) -> bool {
    status.is_success() || status.is_redirection()
}

/// Runs `check-links`: walks every link in the Store, checking external
/// targets over HTTP (only when `check_external`) and local targets against
/// the filesystem relative to their owning document's directory. Returns the
/// number of links now `broken`.
pub async fn check_links(
    store: &SqliteStore,
    checker: &LinkChecker,
    check_external: bool,
) -> CoreResult<u64> {
    let links = store.list_links().await?;
    let mut broken = 0u64;

    for link in &links {
        let status = if link.is_external {
            if !check_external {
                continue;
            }
            checker.check(&link.target).await
        } else {
            let base = store
                .document_by_id(link.document_id)
                .await?
                .and_then(|d| Path::new(&d.path).parent().map(Path::to_path_buf))
                .unwrap_or_default();
            check_local(&base, &link.target)
        };

        if status == LinkStatus::Broken {
            broken += 1;
        }
        store.set_link_status(link.document_id, &link.target, status).await?;
    }

    Ok(broken)
}

fn check_local(base_dir: &Path, target: &str) -> LinkStatus {
    let path_part = target.split('#').next().unwrap_or(target);
    if path_part.is_empty() {
        return LinkStatus::Ok;
    }
    if base_dir.join(path_part).exists() || Path::new(path_part).exists() {
        LinkStatus::Ok
    } else {
        LinkStatus::Broken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_of_parses_https_url() {
        assert_eq!(LinkChecker::host_of("https://example.com/a"), Some("example.com".to_string()));
    }

    #[test]
    fn host_of_returns_none_for_relative_path() {
        assert_eq!(LinkChecker::host_of("./nope.md"), None);
    }

    #[test]
    fn check_local_detects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(check_local(dir.path(), "nope.md"), LinkStatus::Broken);
    }

    #[test]
    fn check_local_ignores_anchor_only_links() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(check_local(dir.path(), "#section"), LinkStatus::Ok);
    }

    #[test]
    fn check_local_finds_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sibling.md"), "# Sibling").unwrap();
        assert_eq!(check_local(dir.path(), "sibling.md"), LinkStatus::Ok);
    }
}
