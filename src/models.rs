//! Core types shared by the resolution engine and the output layers.

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::normalize::normalize_address;

/// Outcome of a lookup for a single property.
#[derive(
    Clone, Copy, Debug, Display, EnumString, Eq, PartialEq, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LookupStatus {
    /// Agent name plus at least one contact channel.
    Found,
    /// Agent name but no phone or email.
    Partial,
    NotFound,
    Error,
    /// Served from the cache without any network calls.
    Cached,
    Pending,
}

/// A property address to look up.
///
/// Created once at input parsing and immutable afterwards. Only
/// `raw_address` is guaranteed non-empty; the parsed components may all be
/// blank for free-form inputs.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub raw_address: String,
    pub address_line: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
    /// Original row position, used to join results back onto the input file.
    pub row_index: usize,
}

impl Property {
    /// The full address assembled from whatever components we have.
    pub fn normalized(&self) -> String {
        let parts = [
            &self.address_line,
            &self.city,
            &self.state,
            &self.zip_code,
        ];
        parts
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// The canonical query string used both as the cache key and as the
    /// primary search input.
    pub fn search_query(&self) -> String {
        let full = self.normalized();
        if full.is_empty() {
            normalize_address(&self.raw_address)
        } else {
            normalize_address(&full)
        }
    }
}

/// Listing agent information found for a property.
///
/// All fields are plain strings; empty means "unknown". `merge` is the only
/// way two of these combine, and it is receiver-wins by design of the
/// waterfall: the earlier (higher-priority) source keeps its values.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_name: String,
    pub brokerage: String,
    pub phone: String,
    pub email: String,
    /// Provenance tag chain, e.g. `redfin+realtor+enriched`.
    pub source: String,
    pub listing_url: String,
    pub list_date: String,
    pub days_on_market: String,
    pub listing_price: String,
}

impl AgentInfo {
    pub fn has_contact_info(&self) -> bool {
        !self.phone.is_empty() || !self.email.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        !self.agent_name.is_empty() && self.has_contact_info()
    }

    /// Merge another source's result into this one, filling in only the
    /// fields we are missing. The source tags concatenate with `+` so the
    /// provenance chain records every contributor.
    pub fn merge(&self, other: &AgentInfo) -> AgentInfo {
        fn pick(ours: &str, theirs: &str) -> String {
            if ours.is_empty() {
                theirs.to_owned()
            } else {
                ours.to_owned()
            }
        }

        let source = if other.source.is_empty() {
            self.source.clone()
        } else {
            format!("{}+{}", self.source, other.source)
        };

        AgentInfo {
            agent_name: pick(&self.agent_name, &other.agent_name),
            brokerage: pick(&self.brokerage, &other.brokerage),
            phone: pick(&self.phone, &other.phone),
            email: pick(&self.email, &other.email),
            source,
            listing_url: pick(&self.listing_url, &other.listing_url),
            list_date: pick(&self.list_date, &other.list_date),
            days_on_market: pick(&self.days_on_market, &other.days_on_market),
            listing_price: pick(&self.listing_price, &other.listing_price),
        }
    }
}

/// Result of a scrape attempt for a single property.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScrapeResult {
    pub property: Property,
    pub agent_info: Option<AgentInfo>,
    pub status: LookupStatus,
    /// Sources consulted, in waterfall order.
    pub sources_tried: Vec<String>,
    pub error_message: String,
    /// Agreement-based confidence in `[0.0, 1.0]`.
    pub confidence: f64,
    /// True when two or more sources agreed on the agent name.
    pub verified: bool,
    /// Sources that returned a non-empty agent name.
    pub sources_matched: Vec<String>,
}

impl ScrapeResult {
    pub fn new(property: Property) -> ScrapeResult {
        ScrapeResult {
            property,
            agent_info: None,
            status: LookupStatus::Pending,
            sources_tried: vec![],
            error_message: String::new(),
            confidence: 0.0,
            verified: false,
            sources_matched: vec![],
        }
    }

    pub fn found(&self) -> bool {
        matches!(
            self.status,
            LookupStatus::Found | LookupStatus::Partial | LookupStatus::Cached
        )
    }
}

/// One progress update, appended to a job's event log and streamed to SSE
/// subscribers. Counts are cumulative for the job.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub completed: usize,
    pub total: usize,
    pub cached: usize,
    pub found: usize,
    pub partial: usize,
    pub not_found: usize,
    pub errors: usize,
    pub current_address: String,
    pub current_status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str, phone: &str, email: &str, source: &str) -> AgentInfo {
        AgentInfo {
            agent_name: name.to_owned(),
            phone: phone.to_owned(),
            email: email.to_owned(),
            source: source.to_owned(),
            ..AgentInfo::default()
        }
    }

    #[test]
    fn merge_prefers_receiver_and_chains_sources() {
        let a = info("Jane Doe", "(555) 111-2222", "", "redfin");
        let b = info("J. Doe", "", "jane@abcrealty.com", "realtor");
        let merged = a.merge(&b);
        assert_eq!(merged.agent_name, "Jane Doe");
        assert_eq!(merged.phone, "(555) 111-2222");
        assert_eq!(merged.email, "jane@abcrealty.com");
        assert_eq!(merged.source, "redfin+realtor");
        assert!(merged.is_complete());
    }

    #[test]
    fn merge_is_idempotent_modulo_source_tag() {
        let a = info("Jane Doe", "(555) 111-2222", "", "redfin");
        let merged = a.merge(&a);
        assert_eq!(merged.agent_name, a.agent_name);
        assert_eq!(merged.phone, a.phone);
        assert_eq!(merged.email, a.email);
        assert_eq!(merged.source, "redfin+redfin");
    }

    #[test]
    fn contact_predicates() {
        assert!(!info("Jane Doe", "", "", "redfin").has_contact_info());
        assert!(!info("Jane Doe", "", "", "redfin").is_complete());
        assert!(info("", "555", "", "x").has_contact_info());
        assert!(!info("", "555", "", "x").is_complete());
    }

    #[test]
    fn search_query_prefers_components_over_raw() {
        let prop = Property {
            raw_address: "123 main street, springfield, il 62704".to_owned(),
            address_line: "123 MAIN STREET".to_owned(),
            city: "SPRINGFIELD".to_owned(),
            state: "IL".to_owned(),
            zip_code: "62704".to_owned(),
            row_index: 0,
        };
        assert_eq!(prop.search_query(), "123 MAIN ST, SPRINGFIELD, IL 62704");
    }

    #[test]
    fn status_round_trips_through_strings() {
        assert_eq!(LookupStatus::NotFound.to_string(), "not_found");
        assert_eq!(
            "cached".parse::<LookupStatus>().unwrap(),
            LookupStatus::Cached
        );
    }
}
