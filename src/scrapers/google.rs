//! Google Custom Search fallback — last-resort agent source, only enabled
//! when an API key and engine id are configured.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::config::{GOOGLE_CSE_URL, GOOGLE_SEARCH};
use crate::errors::FetchError;
use crate::gateway::{Gateway, HeaderKind, SharedHttpClient};
use crate::models::{AgentInfo, Property};
use crate::normalize::{clean_email, clean_name, clean_phone};
use crate::scrapers::AgentSource;

static PHONE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}").unwrap());
static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").unwrap());

static NAME_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"[Ll]isted?\s+by\s+([A-Z][a-z]+\s+[A-Z][a-z]+)",
        r"[Ll]isting\s+[Aa]gent:?\s*([A-Z][a-z]+\s+[A-Z][a-z]+)",
        r"[Aa]gent:?\s*([A-Z][a-z]+\s+[A-Z][a-z]+)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static BROKER_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)(?:courtesy of|brokered by|offered by)\s+(.+?)(?:\.|,|$)",
        r"([A-Z][a-zA-Z\s]+(?:Realty|Real Estate|Properties|Group|Associates|Brokers))",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

const LISTING_SITES: &[&str] = &["redfin.com", "realtor.com", "zillow.com"];

pub struct GoogleSearchSource {
    gateway: Gateway,
    api_key: String,
    cse_id: String,
}

impl GoogleSearchSource {
    pub fn new(client: SharedHttpClient, api_key: String, cse_id: String) -> GoogleSearchSource {
        GoogleSearchSource {
            gateway: Gateway::new(GOOGLE_SEARCH, client),
            api_key,
            cse_id,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty() && !self.cse_id.is_empty()
    }
}

#[async_trait]
impl AgentSource for GoogleSearchSource {
    fn name(&self) -> &str {
        self.gateway.source_name()
    }

    async fn search(&self, prop: &Property) -> Result<Option<AgentInfo>, FetchError> {
        if !self.is_configured() {
            return Ok(None);
        }

        let query = format!("\"{}\" listing agent real estate", prop.search_query());
        let params = [
            ("key", self.api_key.clone()),
            ("cx", self.cse_id.clone()),
            ("q", query),
            ("num", "5".to_owned()),
        ];
        let page = self
            .gateway
            .get(GOOGLE_CSE_URL, HeaderKind::Api, None, &params)
            .await?;
        if !page.is_ok() {
            return Ok(None);
        }

        let data: Value = serde_json::from_str(&page.text)?;
        let Some(items) = data["items"].as_array() else {
            return Ok(None);
        };
        Ok(parse_results(items))
    }
}

/// Mine the result snippets for phone, email, and named-entity patterns.
fn parse_results(items: &[Value]) -> Option<AgentInfo> {
    let mut agent_name = String::new();
    let mut brokerage = String::new();
    let mut phone = String::new();
    let mut email = String::new();
    let mut listing_url = String::new();

    for item in items {
        let snippet = item["snippet"].as_str().unwrap_or("");
        let link = item["link"].as_str().unwrap_or("");

        if LISTING_SITES.iter().any(|site| link.contains(site)) {
            listing_url = link.to_owned();
        }

        if phone.is_empty() {
            if let Some(m) = PHONE.find(snippet) {
                phone = m.as_str().to_owned();
            }
        }
        if email.is_empty() {
            if let Some(m) = EMAIL.find(snippet) {
                email = m.as_str().to_owned();
            }
        }
        if agent_name.is_empty() {
            for pattern in NAME_PATTERNS.iter() {
                if let Some(caps) = pattern.captures(snippet) {
                    agent_name = caps[1].to_owned();
                    break;
                }
            }
        }
        if brokerage.is_empty() {
            for pattern in BROKER_PATTERNS.iter() {
                if let Some(caps) = pattern.captures(snippet) {
                    brokerage = caps[1].trim().to_owned();
                    break;
                }
            }
        }
    }

    if agent_name.is_empty() {
        return None;
    }

    Some(AgentInfo {
        agent_name: clean_name(&agent_name),
        brokerage,
        phone: clean_phone(&phone),
        email: clean_email(&email),
        source: "google_search".to_owned(),
        listing_url,
        ..AgentInfo::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_snippet_entities() {
        let items = vec![json!({
            "title": "123 Main St - Springfield",
            "link": "https://www.redfin.com/IL/Springfield/123-Main-St",
            "snippet": "Listed by Jane Doe with ABC Realty. Call (555) 111-2222 or jane.doe@abcrealty.com today.",
        })];
        let info = parse_results(&items).unwrap();
        assert_eq!(info.agent_name, "Jane Doe");
        assert_eq!(info.phone, "(555) 111-2222");
        assert_eq!(info.email, "jane.doe@abcrealty.com");
        assert!(info.brokerage.contains("ABC Realty"));
        assert!(info.listing_url.contains("redfin.com"));
        assert_eq!(info.source, "google_search");
    }

    #[test]
    fn no_name_means_none() {
        let items = vec![json!({
            "snippet": "Beautiful 3 bed 2 bath home, call (555) 999-0000",
            "link": "https://example.com",
        })];
        assert!(parse_results(&items).is_none());
    }
}
