//! Per-source HTTP gateway: concurrency cap, token-bucket rate limiting,
//! transient-error retry, browser header rotation, and bot-defense
//! detection.
//!
//! Every network call a scraper makes goes through its `Gateway`. The
//! semaphore bounds queue depth and the token bucket smooths issuance; the
//! two are separate knobs and must stay separate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use leaky_bucket::RateLimiter;
use metrics::counter;
use rand::seq::SliceRandom;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::config::{SourceConfig, POOL_KEEPALIVE_CONNECTIONS};
use crate::errors::FetchError;

/// A `reqwest` client shared between every gateway.
pub type SharedHttpClient = Arc<reqwest::Client>;

/// Create the shared HTTP client with a keep-alive connection pool.
/// Per-source request caps are enforced by the gateways, not the pool.
pub fn shared_http_client() -> SharedHttpClient {
    Arc::new(
        reqwest::Client::builder()
            .pool_max_idle_per_host(POOL_KEEPALIVE_CONNECTIONS)
            .gzip(true)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .expect("TLS backend should always initialize"),
    )
}

// A small pool of current desktop browser identities, rotated per request.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36 Edg/123.0.0.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36 Edg/123.0.0.0",
];

fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

/// Which canned header set to send.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HeaderKind {
    /// Full navigation headers, for HTML pages.
    Browser,
    /// JSON-accept headers, for API-style endpoints.
    Api,
}

/// Realistic request headers with a rotated user agent.
pub fn rotating_headers(kind: HeaderKind) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let insert = |headers: &mut HeaderMap, name: &'static str, value: &str| {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    };

    insert(&mut headers, "user-agent", random_user_agent());
    insert(&mut headers, "accept-language", "en-US,en;q=0.9");
    insert(&mut headers, "accept-encoding", "gzip, deflate, br");
    insert(&mut headers, "dnt", "1");
    insert(&mut headers, "connection", "keep-alive");

    match kind {
        HeaderKind::Browser => {
            insert(
                &mut headers,
                "accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
            );
            insert(&mut headers, "upgrade-insecure-requests", "1");
            insert(&mut headers, "sec-fetch-dest", "document");
            insert(&mut headers, "sec-fetch-mode", "navigate");
            insert(&mut headers, "sec-fetch-site", "none");
            insert(&mut headers, "sec-fetch-user", "?1");
            insert(&mut headers, "cache-control", "max-age=0");
        }
        HeaderKind::Api => {
            insert(&mut headers, "accept", "application/json, text/plain, */*");
        }
    }

    headers
}

// Markers that identify bot-defense interstitials rather than real content.
const CAPTCHA_MARKERS: &[&str] = &[
    "captcha",
    "recaptcha",
    "hcaptcha",
    "cf-turnstile",
    "challenge-platform",
    "cf-chl-bypass",
    "challenge-form",
    "just a moment...",
    "checking your browser",
    "access denied",
    "automated access",
];

/// Check whether a response body is a CAPTCHA / challenge page.
pub fn detect_captcha(body: &str) -> bool {
    let lower = body.to_lowercase();
    CAPTCHA_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// A fetched page, after all gateway checks passed.
#[derive(Debug)]
pub struct Fetched {
    pub status: u16,
    /// The final URL after redirects.
    pub url: String,
    pub text: String,
}

impl Fetched {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// One source's gateway over the shared client.
pub struct Gateway {
    config: SourceConfig,
    client: SharedHttpClient,
    limiter: RateLimiter,
    semaphore: Semaphore,
    request_count: AtomicU64,
    block_count: AtomicU64,
}

impl Gateway {
    pub fn new(config: SourceConfig, client: SharedHttpClient) -> Gateway {
        // The bucket holds roughly one second's worth of tokens so a quiet
        // source can't save up a large burst.
        let (refill, interval) = if config.requests_per_second >= 1.0 {
            (
                config.requests_per_second.round() as usize,
                Duration::from_secs(1),
            )
        } else {
            (1, Duration::from_secs_f64(1.0 / config.requests_per_second))
        };
        let capacity = refill.max(1);
        let limiter = RateLimiter::builder()
            .initial(capacity)
            .max(capacity)
            .refill(refill)
            .interval(interval)
            // All requests belong to the same scraping job, so don't worry
            // about fair scheduling between worker tasks.
            .fair(false)
            .build();

        Gateway {
            semaphore: Semaphore::new(config.max_concurrent),
            limiter,
            config,
            client,
            request_count: AtomicU64::new(0),
            block_count: AtomicU64::new(0),
        }
    }

    pub fn source_name(&self) -> &'static str {
        self.config.name
    }

    /// Requests issued and blocks seen so far, for diagnostics.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.request_count.load(Ordering::Relaxed),
            self.block_count.load(Ordering::Relaxed),
        )
    }

    /// Rate-limited, retried GET.
    ///
    /// Retries apply only to connect/timeout classes; status failures and
    /// bot-defense pages surface immediately as their own `FetchError`
    /// variants. Statuses other than 403/429 are returned to the adapter,
    /// which decides whether the page is usable.
    pub async fn get(
        &self,
        url: &str,
        kind: HeaderKind,
        referer: Option<&str>,
        params: &[(&str, String)],
    ) -> Result<Fetched, FetchError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("gateway semaphore never closes");
        self.limiter.acquire_one().await;
        self.request_count.fetch_add(1, Ordering::Relaxed);
        counter!("agentfinder.requests.total", 1, "source" => self.config.name);

        let mut headers = rotating_headers(kind);
        if let Some(referer) = referer {
            if let Ok(value) = HeaderValue::from_str(referer) {
                headers.insert(reqwest::header::REFERER, value);
            }
        }

        let fetched = self.fetch_with_retry(url, headers, params).await?;

        if fetched.status == 403 {
            self.record_block();
            return Err(FetchError::Blocked);
        }
        if fetched.status == 429 {
            self.record_block();
            return Err(FetchError::RateLimited);
        }
        if detect_captcha(&fetched.text) {
            self.record_block();
            return Err(FetchError::Captcha);
        }

        Ok(fetched)
    }

    fn record_block(&self) {
        self.block_count.fetch_add(1, Ordering::Relaxed);
        counter!("agentfinder.blocks.total", 1, "source" => self.config.name);
    }

    async fn fetch_with_retry(
        &self,
        url: &str,
        headers: HeaderMap,
        params: &[(&str, String)],
    ) -> Result<Fetched, FetchError> {
        let mut failures: u32 = 0;
        loop {
            let result = self.fetch_once(url, headers.clone(), params).await;
            match result {
                Err(err) if is_transient(&err) && failures < self.config.max_retries => {
                    failures += 1;
                    let wait = retry_wait(failures);
                    debug!(
                        source = self.config.name,
                        "retrying transient error (waiting {}s): {}",
                        wait.as_secs(),
                        err
                    );
                    counter!("agentfinder.retries.total", 1, "source" => self.config.name);
                    tokio::time::sleep(wait).await;
                }
                Err(err) => return Err(FetchError::Transport(err)),
                Ok(fetched) => return Ok(fetched),
            }
        }
    }

    async fn fetch_once(
        &self,
        url: &str,
        headers: HeaderMap,
        params: &[(&str, String)],
    ) -> Result<Fetched, reqwest::Error> {
        let mut request = self
            .client
            .get(url)
            .headers(headers)
            .timeout(Duration::from_secs(self.config.timeout_seconds));
        if !params.is_empty() {
            request = request.query(params);
        }
        let response = request.send().await?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let text = response.text().await?;
        Ok(Fetched {
            status,
            url: final_url,
            text,
        })
    }
}

fn is_transient(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Exponential backoff capped between 2s and 15s.
fn retry_wait(attempt: u32) -> Duration {
    let secs = 1u64 << attempt.min(6);
    Duration::from_secs(secs.clamp(2, 15))
}

/// Counter-gated switch that disables a consistently failing source.
///
/// Per-source, per-process, never persisted. The circuit closes again on
/// the first success.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    consecutive_failures: u32,
    open: bool,
}

impl CircuitBreaker {
    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.open = false;
    }

    /// Record a failure; returns true when this failure opened the circuit.
    pub fn record_failure(&mut self, threshold: u32) -> bool {
        self.consecutive_failures += 1;
        if !self.open && self.consecutive_failures >= threshold {
            self.open = true;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CIRCUIT_BREAKER_THRESHOLD;

    #[test]
    fn captcha_markers_match_case_insensitively() {
        assert!(detect_captcha("<html>Just a Moment...</html>"));
        assert!(detect_captcha("please solve this reCAPTCHA"));
        assert!(detect_captcha("cf-chl-bypass=1"));
        assert!(!detect_captcha("<html>123 Main St listing</html>"));
    }

    #[test]
    fn retry_wait_stays_between_two_and_fifteen_seconds() {
        assert_eq!(retry_wait(1), Duration::from_secs(2));
        assert_eq!(retry_wait(2), Duration::from_secs(4));
        assert_eq!(retry_wait(3), Duration::from_secs(8));
        assert_eq!(retry_wait(4), Duration::from_secs(15));
        assert_eq!(retry_wait(30), Duration::from_secs(15));
    }

    #[test]
    fn breaker_opens_at_threshold_and_closes_on_success() {
        let mut breaker = CircuitBreaker::default();
        for _ in 0..CIRCUIT_BREAKER_THRESHOLD - 1 {
            assert!(!breaker.record_failure(CIRCUIT_BREAKER_THRESHOLD));
        }
        assert!(!breaker.is_open());
        assert!(breaker.record_failure(CIRCUIT_BREAKER_THRESHOLD));
        assert!(breaker.is_open());
        breaker.record_success();
        assert!(!breaker.is_open());
    }

    #[test]
    fn browser_headers_carry_navigation_fields() {
        let headers = rotating_headers(HeaderKind::Browser);
        assert!(headers.get("user-agent").is_some());
        assert!(headers.get("sec-fetch-mode").is_some());
        let api = rotating_headers(HeaderKind::Api);
        assert_eq!(api.get("accept").unwrap(), "application/json, text/plain, */*");
    }
}
