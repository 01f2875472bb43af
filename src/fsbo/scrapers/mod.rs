//! FSBO area scrapers.
//!
//! Each source implements [`FsboSource`]: criteria in, listings out.
//! Criteria filters are applied during parsing so non-matching listings
//! never leave the adapter. Pagination is capped at
//! [`FSBO_MAX_PAGES`](crate::config::FSBO_MAX_PAGES) per source.

use std::sync::Mutex;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::{SourceConfig, CIRCUIT_BREAKER_THRESHOLD};
use crate::errors::FetchError;
use crate::fsbo::{FsboListing, FsboSearchCriteria};
use crate::gateway::{CircuitBreaker, Gateway, SharedHttpClient};

pub mod craigslist;
pub mod forsalebyowner;
pub mod fsbo_com;
pub mod realtor_fsbo;
pub mod zillow_fsbo;

/// Abstract FSBO area-search interface.
#[async_trait]
pub trait FsboSource: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Search for FSBO listings matching the criteria. An open circuit
    /// yields an empty list without touching the network.
    async fn search_area(
        &self,
        criteria: &FsboSearchCriteria,
    ) -> Result<Vec<FsboListing>, FetchError>;
}

/// Gateway plus circuit breaker, shared by every FSBO scraper.
pub(crate) struct FsboCore {
    gateway: Gateway,
    breaker: Mutex<CircuitBreaker>,
}

impl FsboCore {
    pub(crate) fn new(config: SourceConfig, client: SharedHttpClient) -> FsboCore {
        FsboCore {
            gateway: Gateway::new(config, client),
            breaker: Mutex::new(CircuitBreaker::default()),
        }
    }

    pub(crate) fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub(crate) fn name(&self) -> &'static str {
        self.gateway.source_name()
    }

    pub(crate) fn is_circuit_open(&self) -> bool {
        self.breaker.lock().unwrap().is_open()
    }

    pub(crate) fn record_success(&self) {
        self.breaker.lock().unwrap().record_success();
    }

    pub(crate) fn record_failure(&self) {
        let opened = self
            .breaker
            .lock()
            .unwrap()
            .record_failure(CIRCUIT_BREAKER_THRESHOLD);
        if opened {
            tracing::warn!("{}: circuit breaker opened", self.name());
        }
    }
}

/// Apply the criteria's numeric filters. A listing only fails a filter
/// when both the criterion and the parsed value are present.
pub(crate) fn passes_filters(
    criteria: &FsboSearchCriteria,
    price: Option<i64>,
    beds: Option<u32>,
    baths: Option<f64>,
    days_on_market: Option<i64>,
) -> bool {
    if let (Some(min), Some(price)) = (criteria.min_price, price) {
        if price < min {
            return false;
        }
    }
    if let (Some(max), Some(price)) = (criteria.max_price, price) {
        if price > max {
            return false;
        }
    }
    if let (Some(min), Some(beds)) = (criteria.min_beds, beds) {
        if beds < min {
            return false;
        }
    }
    if let (Some(min), Some(baths)) = (criteria.min_baths, baths) {
        if baths < min {
            return false;
        }
    }
    if let (Some(max), Some(dom)) = (criteria.max_days_on_market, days_on_market) {
        if dom > max {
            return false;
        }
    }
    true
}

static DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\d]").unwrap());
static FIRST_INT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)").unwrap());
static FIRST_FLOAT: Lazy<Regex> = Lazy::new(|| Regex::new(r"([\d.]+)").unwrap());
static ADDRESS_TAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([^,]+),\s*([A-Z]{2})\s*(\d{5})?").unwrap());

/// Strip everything but digits and parse, for "$250,000"-style text.
pub(crate) fn parse_price_text(text: &str) -> Option<i64> {
    let digits = DIGITS.replace_all(text, "");
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

pub(crate) fn parse_first_int(text: &str) -> Option<i64> {
    FIRST_INT.captures(text).and_then(|c| c[1].parse().ok())
}

pub(crate) fn parse_first_float(text: &str) -> Option<f64> {
    FIRST_FLOAT.captures(text).and_then(|c| c[1].parse().ok())
}

/// Parse the trailing "City, ST 85001" of a display address.
pub(crate) fn parse_city_state_zip(address: &str) -> (String, String, String) {
    match ADDRESS_TAIL.captures(address) {
        Some(caps) => (
            caps[1].trim().to_owned(),
            caps[2].to_owned(),
            caps.get(3).map(|m| m.as_str().to_owned()).unwrap_or_default(),
        ),
        None => (String::new(), String::new(), String::new()),
    }
}

/// Recursively mine a JSON tree for listing-page URLs, depth-capped.
/// Used when a site renders its results exclusively through `__NEXT_DATA__`.
pub(crate) fn find_listing_urls_in_json(
    node: &serde_json::Value,
    needles: &[&str],
    base_url: &str,
    urls: &mut Vec<String>,
    depth: u32,
) {
    if depth > 8 {
        return;
    }
    match node {
        serde_json::Value::String(s) => {
            let is_path = s.starts_with('/') || s.starts_with("http");
            if is_path && s.len() < 300 && needles.iter().any(|n| s.contains(n)) {
                let full = if s.starts_with("http") {
                    s.clone()
                } else {
                    format!("{}{}", base_url, s)
                };
                if !urls.contains(&full) {
                    urls.push(full);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                find_listing_urls_in_json(item, needles, base_url, urls, depth + 1);
            }
        }
        serde_json::Value::Object(map) => {
            for value in map.values() {
                find_listing_urls_in_json(value, needles, base_url, urls, depth + 1);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsbo::LocationType;
    use serde_json::json;

    #[test]
    fn filters_only_reject_known_values() {
        let mut criteria =
            FsboSearchCriteria::for_location("85001", LocationType::Zip);
        criteria.max_price = Some(300_000);
        criteria.min_beds = Some(3);

        assert!(passes_filters(&criteria, Some(250_000), Some(3), None, None));
        assert!(!passes_filters(&criteria, Some(350_000), Some(3), None, None));
        assert!(!passes_filters(&criteria, Some(250_000), Some(2), None, None));
        // Unknown values pass.
        assert!(passes_filters(&criteria, None, None, None, None));
    }

    #[test]
    fn text_parsers() {
        assert_eq!(parse_price_text("$250,000"), Some(250_000));
        assert_eq!(parse_price_text("Call us"), None);
        assert_eq!(parse_first_int("3 beds"), Some(3));
        assert_eq!(parse_first_float("2.5 baths"), Some(2.5));
    }

    #[test]
    fn city_state_zip_parsing() {
        let (city, state, zip) =
            parse_city_state_zip("123 Main St, Phoenix, AZ 85001");
        assert_eq!((city.as_str(), state.as_str(), zip.as_str()), ("Phoenix", "AZ", "85001"));
        let (city, state, zip) = parse_city_state_zip("123 Main St, Phoenix, AZ");
        assert_eq!((city.as_str(), state.as_str(), zip.as_str()), ("Phoenix", "AZ", ""));
    }

    #[test]
    fn url_mining_dedupes_and_joins() {
        let data = json!({
            "a": "/listing/1",
            "b": {"c": ["/listing/1", "https://x.test/property/2", "/other/3"]},
        });
        let mut urls = vec![];
        find_listing_urls_in_json(
            &data,
            &["/listing/", "/property/"],
            "https://base.test",
            &mut urls,
            0,
        );
        assert_eq!(
            urls,
            vec!["https://base.test/listing/1", "https://x.test/property/2"]
        );
    }
}
