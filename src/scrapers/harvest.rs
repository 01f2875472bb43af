//! Realtor.com search-API adapter ("harvest") — the secondary agent
//! source.
//!
//! The underlying client is synchronous, so every search runs on the
//! blocking pool behind a concurrency cap. Listing types are tried in
//! order (`for_sale`, `sold`, `pending`) because recently listed homes
//! are sometimes categorized under the wrong one, and the best matching
//! row is selected by normalized-address comparison.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::config::{SourceConfig, HARVEST};
use crate::errors::FetchError;
use crate::gateway::{detect_captcha, rotating_headers, HeaderKind};
use crate::models::{AgentInfo, Property};
use crate::normalize::{
    clean_email, clean_name, clean_phone, compute_days_on_market, normalize_address,
};
use crate::scrapers::{format_price, json_leaf_to_string, json_str, AgentSource};

const SEARCH_ENDPOINT: &str =
    "https://www.realtor.com/api/v1/rdc_search_srp?client_id=rdc-search-for-sale-search&schema=vesta";

const SEARCH_QUERY: &str = r#"query ConsumerSearchQuery($query: HomeSearchCriteria!, $limit: Int, $offset: Int) {
  home_search(query: $query, limit: $limit, offset: $offset) {
    results {
      permalink
      href
      status
      list_price
      list_date
      days_on_market
      location {
        address { line city state_code postal_code }
      }
      advertisers {
        type
        name
        email
        phones { number }
        office { name phones { number } }
      }
    }
  }
}"#;

static BLOCKING_CLIENT: Lazy<reqwest::blocking::Client> = Lazy::new(|| {
    reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(HARVEST.timeout_seconds))
        .gzip(true)
        .build()
        .expect("TLS backend should always initialize")
});

pub struct HarvestSource {
    config: SourceConfig,
    semaphore: Semaphore,
}

impl HarvestSource {
    pub fn new() -> HarvestSource {
        HarvestSource {
            config: HARVEST,
            semaphore: Semaphore::new(HARVEST.max_concurrent),
        }
    }
}

impl Default for HarvestSource {
    fn default() -> Self {
        HarvestSource::new()
    }
}

#[async_trait]
impl AgentSource for HarvestSource {
    fn name(&self) -> &str {
        self.config.name
    }

    async fn search(&self, prop: &Property) -> Result<Option<AgentInfo>, FetchError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("harvest semaphore never closes");
        let prop = prop.clone();
        tokio::task::spawn_blocking(move || sync_search(&prop))
            .await
            .map_err(|err| FetchError::Schema(format!("harvest worker failed: {}", err)))?
    }
}

fn sync_search(prop: &Property) -> Result<Option<AgentInfo>, FetchError> {
    let location = prop.search_query();
    let mut last_error: Option<FetchError> = None;
    let mut saw_clean_response = false;

    for listing_type in ["for_sale", "sold", "pending"] {
        let rows = match fetch_rows_blocking(&location, listing_type) {
            Ok(rows) => {
                saw_clean_response = true;
                rows
            }
            Err(err @ (FetchError::Blocked | FetchError::RateLimited | FetchError::Captcha)) => {
                return Err(err)
            }
            Err(err) => {
                debug!("harvest {} search failed for {:?}: {}", listing_type, location, err);
                last_error = Some(err);
                continue;
            }
        };
        if rows.is_empty() {
            continue;
        }
        let Some(row) = find_best_match(&rows, prop) else {
            continue;
        };
        if let Some(agent_info) = agent_from_row(row) {
            return Ok(Some(agent_info));
        }
    }

    if saw_clean_response {
        Ok(None)
    } else if let Some(err) = last_error {
        Err(err)
    } else {
        Ok(None)
    }
}

/// One synchronous search against the Realtor search API, returning
/// flattened result rows. Shared with the FSBO area scraper that uses the
/// same backend.
pub(crate) fn fetch_rows_blocking(
    location: &str,
    listing_type: &str,
) -> Result<Vec<Value>, FetchError> {
    let body = json!({
        "query": SEARCH_QUERY,
        "variables": {
            "query": {
                "search_location": { "location": location },
                "status": [listing_type],
            },
            "limit": 50,
            "offset": 0,
        },
    });

    let response = BLOCKING_CLIENT
        .post(SEARCH_ENDPOINT)
        .headers(rotating_headers(HeaderKind::Api))
        .json(&body)
        .send()?;

    let status = response.status().as_u16();
    if status == 403 {
        return Err(FetchError::Blocked);
    }
    if status == 429 {
        return Err(FetchError::RateLimited);
    }
    let text = response.text()?;
    if detect_captcha(&text) {
        return Err(FetchError::Captcha);
    }
    if status != 200 {
        return Ok(vec![]);
    }

    let data: Value = serde_json::from_str(&text)?;
    let results = &data["data"]["home_search"]["results"];
    let Some(results) = results.as_array() else {
        return Ok(vec![]);
    };
    Ok(results.iter().map(flatten_result).collect())
}

/// Flatten one search result into the flat row shape the extraction
/// helpers probe. Key names are kept compatible with the several
/// generations of the upstream schema.
fn flatten_result(result: &Value) -> Value {
    let address = &result["location"]["address"];

    // The seller-side advertiser carries the listing agent.
    let advertiser = result["advertisers"]
        .as_array()
        .and_then(|ads| {
            ads.iter()
                .find(|ad| {
                    matches!(ad["type"].as_str(), Some("seller") | Some("agent") | None)
                })
                .or_else(|| ads.first())
        })
        .cloned()
        .unwrap_or(Value::Null);

    let phone = {
        let agent_phone = advertiser["phones"]
            .as_array()
            .and_then(|p| p.first())
            .map(|p| json_str(p, &["number"]))
            .unwrap_or_default();
        if agent_phone.is_empty() {
            advertiser["office"]["phones"]
                .as_array()
                .and_then(|p| p.first())
                .map(|p| json_str(p, &["number"]))
                .unwrap_or_default()
        } else {
            agent_phone
        }
    };

    let url = {
        let href = json_str(result, &["href"]);
        if href.is_empty() {
            let permalink = json_str(result, &["permalink"]);
            if permalink.is_empty() {
                String::new()
            } else {
                format!("https://www.realtor.com/realestateandhomes-detail/{}", permalink)
            }
        } else {
            href
        }
    };

    json!({
        "full_street_line": json_str(address, &["line"]),
        "city": json_str(address, &["city"]),
        "state": json_str(address, &["state_code"]),
        "zip_code": json_str(address, &["postal_code"]),
        "agent_name": json_str(&advertiser, &["name"]),
        "agent_phone": phone,
        "agent_email": json_str(&advertiser, &["email"]),
        "broker_name": json_str(&advertiser, &["office", "name"]),
        "property_url": url,
        "list_date": json_str(result, &["list_date"]),
        "days_on_market": json_leaf_to_string(&result["days_on_market"]),
        "list_price": json_leaf_to_string(&result["list_price"]),
    })
}

/// Probe a flat row for the first present, non-NA value among candidate
/// column names.
pub(crate) fn row_field(row: &Value, candidates: &[&str]) -> String {
    for candidate in candidates {
        if let Some(value) = row.get(candidate) {
            let s = json_leaf_to_string(value);
            let trimmed = s.trim();
            let lower = trimmed.to_lowercase();
            if !trimmed.is_empty()
                && !matches!(lower.as_str(), "nan" | "none" | "<na>" | "na")
            {
                return trimmed.to_owned();
            }
        }
    }
    String::new()
}

const ADDRESS_COLUMNS: &[&str] = &[
    "full_street_line",
    "street_address",
    "address",
    "address_line",
];

/// Select the row that best matches the target address: normalized
/// substring containment first, then leading street number, then a sole
/// row as last resort.
fn find_best_match<'a>(rows: &'a [Value], prop: &Property) -> Option<&'a Value> {
    let target_line = if prop.address_line.is_empty() {
        &prop.raw_address
    } else {
        &prop.address_line
    };
    let mut target = normalize_address(target_line);
    if target.is_empty() {
        target = normalize_address(&prop.raw_address);
    }

    for row in rows {
        let row_addr = normalize_address(&row_field(row, ADDRESS_COLUMNS));
        if row_addr.is_empty() {
            continue;
        }
        if target.contains(&row_addr) || row_addr.contains(&target) {
            return Some(row);
        }
    }

    // Fallback: compare just the leading street number.
    let number: String = target.chars().take_while(|c| c.is_ascii_digit()).collect();
    if !number.is_empty() {
        for row in rows {
            let row_addr = row_field(row, ADDRESS_COLUMNS);
            if row_addr.trim().starts_with(&number) {
                return Some(row);
            }
        }
    }

    if rows.len() == 1 {
        return rows.first();
    }
    None
}

fn agent_from_row(row: &Value) -> Option<AgentInfo> {
    let agent_name = row_field(row, &["agent_name", "agent", "list_agent_name"]);
    if agent_name.is_empty() {
        return None;
    }

    let phone = row_field(row, &["agent_phone", "agent_phones", "list_agent_phone"]);
    let email = row_field(row, &["agent_email", "list_agent_email"]);
    let broker = row_field(row, &["broker_name", "broker", "brokerage", "office_name"]);
    let listing_url = row_field(row, &["property_url", "url", "detail_url"]);
    let list_date = row_field(row, &["list_date", "listed_date", "date_listed"]);

    let mut days_on_market = row_field(row, &["days_on_market", "dom", "days_on_mls"]);
    if days_on_market.is_empty() && !list_date.is_empty() {
        days_on_market = compute_days_on_market(&list_date);
    }

    let price_raw = row_field(
        row,
        &["list_price", "price", "listing_price", "sale_price", "sold_price"],
    );
    let listing_price = if price_raw.is_empty() {
        String::new()
    } else {
        format_price(&Value::String(price_raw))
    };

    Some(AgentInfo {
        agent_name: clean_name(&agent_name),
        brokerage: broker.trim().to_owned(),
        phone: clean_phone(&phone),
        email: clean_email(&email),
        source: "homeharvest".to_owned(),
        listing_url,
        list_date,
        days_on_market,
        listing_price,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(line: &str, agent: &str) -> Value {
        json!({
            "full_street_line": line,
            "agent_name": agent,
            "agent_phone": "5551112222",
            "broker_name": "ABC Realty",
            "list_price": "450000",
        })
    }

    fn prop(line: &str) -> Property {
        Property {
            raw_address: line.to_owned(),
            address_line: line.to_owned(),
            ..Property::default()
        }
    }

    #[test]
    fn best_match_by_normalized_containment() {
        let rows = vec![
            row("999 Elsewhere Dr", "Wrong Agent"),
            row("123 Main Street", "Jane Doe"),
        ];
        let matched = find_best_match(&rows, &prop("123 MAIN ST")).unwrap();
        assert_eq!(matched["agent_name"], "Jane Doe");
    }

    #[test]
    fn best_match_by_street_number() {
        let rows = vec![
            row("999 Elsewhere Dr", "Wrong Agent"),
            row("123 Totally Renamed Pkwy", "Jane Doe"),
        ];
        let matched = find_best_match(&rows, &prop("123 MAIN ST")).unwrap();
        assert_eq!(matched["agent_name"], "Jane Doe");
    }

    #[test]
    fn sole_row_fallback() {
        let rows = vec![row("1 Somewhere Ct", "Jane Doe")];
        assert!(find_best_match(&rows, &prop("500 UNRELATED AVE")).is_some());
        let two = vec![
            row("1 Somewhere Ct", "A"),
            row("2 Somewhere Ct", "B"),
        ];
        assert!(find_best_match(&two, &prop("500 UNRELATED AVE")).is_none());
    }

    #[test]
    fn row_field_skips_na_values() {
        let r = json!({"agent_name": "nan", "agent": "Jane Doe"});
        assert_eq!(row_field(&r, &["agent_name", "agent"]), "Jane Doe");
    }

    #[test]
    fn agent_extraction_formats_fields() {
        let info = agent_from_row(&row("123 Main St", "jane doe")).unwrap();
        assert_eq!(info.agent_name, "Jane Doe");
        assert_eq!(info.phone, "(555) 111-2222");
        assert_eq!(info.listing_price, "$450,000");
        assert_eq!(info.source, "homeharvest");

        assert!(agent_from_row(&json!({"full_street_line": "1 X St"})).is_none());
    }

    #[test]
    fn flatten_prefers_seller_advertiser() {
        let result = json!({
            "permalink": "123-Main-St_Springfield_IL_62704_M123",
            "list_price": 450000,
            "days_on_market": 12,
            "location": {"address": {"line": "123 Main St", "city": "Springfield", "state_code": "IL", "postal_code": "62704"}},
            "advertisers": [
                {"type": "seller", "name": "Jane Doe", "phones": [{"number": "5551112222"}], "office": {"name": "ABC Realty"}}
            ],
        });
        let flat = flatten_result(&result);
        assert_eq!(flat["agent_name"], "Jane Doe");
        assert_eq!(flat["broker_name"], "ABC Realty");
        assert_eq!(flat["days_on_market"], "12");
        assert!(flat["property_url"]
            .as_str()
            .unwrap()
            .contains("realestateandhomes-detail"));
    }
}
