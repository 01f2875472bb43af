//! Error-handling utilities.

use anyhow::Error;

/// Display an error, plus all the underlying "causes" (ie, wrapped errors), plus a
/// backtrace.
pub fn display_causes_and_backtrace(err: &Error) {
    eprintln!("Error: {}", err);
    for cause in err.chain().skip(1) {
        eprintln!("  caused by: {}", cause);
    }
    eprintln!("{}", err.backtrace());
}

/// Failure taxonomy for one upstream fetch. Adapters see only this type;
/// everything below (reqwest internals, bot-defense pages) is classified
/// here so the engine can count circuit-breaker failures uniformly.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Upstream answered 403.
    #[error("blocked (403)")]
    Blocked,

    /// Upstream answered 429.
    #[error("rate limited (429)")]
    RateLimited,

    /// The body contained a CAPTCHA / challenge marker.
    #[error("CAPTCHA detected")]
    Captcha,

    /// Connect/timeout/DNS class failure, already retried by the gateway.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The upstream payload was not parseable at all. Missing fields inside
    /// an otherwise well-formed payload are "not found", not this.
    #[error("malformed upstream payload: {0}")]
    Schema(String),
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> FetchError {
        FetchError::Schema(err.to_string())
    }
}
