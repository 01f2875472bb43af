//! Zillow FSBO area scraper — searches the owner-listed (`/fsbo/`) path
//! and mines the embedded search payload.
//!
//! Zillow restructures `__NEXT_DATA__` often; rather than a fixed path we
//! search for the known listing-array keys, depth-capped.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::{ZILLOW_BASE_URL, ZILLOW_FSBO};
use crate::errors::FetchError;
use crate::fsbo::scrapers::{passes_filters, FsboCore, FsboSource};
use crate::fsbo::{ContactStatus, FsboListing, FsboSearchCriteria};
use crate::gateway::{HeaderKind, SharedHttpClient};
use crate::normalize::{clean_name, clean_phone};
use crate::scrapers::{json_leaf_to_string, json_str, next_data_json};

const LIST_KEYS: &[&str] = &["listResults", "list_results", "searchResults", "mapResults"];

pub struct ZillowFsboSource {
    core: FsboCore,
}

impl ZillowFsboSource {
    pub fn new(client: SharedHttpClient) -> ZillowFsboSource {
        ZillowFsboSource {
            core: FsboCore::new(ZILLOW_FSBO, client),
        }
    }
}

#[async_trait]
impl FsboSource for ZillowFsboSource {
    fn name(&self) -> &str {
        self.core.name()
    }

    async fn search_area(
        &self,
        criteria: &FsboSearchCriteria,
    ) -> Result<Vec<FsboListing>, FetchError> {
        if self.core.is_circuit_open() {
            return Ok(vec![]);
        }

        let location = criteria.primary_location();
        let search_url = format!(
            "{}/homes/fsbo/{}_rb/",
            ZILLOW_BASE_URL,
            urlencoding::encode(&location).replace("%20", "+")
        );
        let referer = format!("{}/", ZILLOW_BASE_URL);

        let result = self
            .core
            .gateway()
            .get(&search_url, HeaderKind::Browser, Some(&referer), &[])
            .await
            .map_err(|err| {
                self.core.record_failure();
                err
            })?;
        if !result.is_ok() {
            self.core.record_success();
            return Ok(vec![]);
        }

        let listings = parse_search_results(&result.text, criteria);
        self.core.record_success();
        info!("zillow_fsbo: found {} listings", listings.len());
        Ok(listings)
    }
}

fn parse_search_results(html: &str, criteria: &FsboSearchCriteria) -> Vec<FsboListing> {
    let data = match next_data_json(html) {
        Ok(Some(data)) => data,
        Ok(None) => {
            info!("zillow_fsbo: no embedded payload in response");
            return vec![];
        }
        Err(err) => {
            warn!("zillow_fsbo: payload parse failed: {}", err);
            return vec![];
        }
    };

    let items = find_list_results(&data, 0);
    if items.is_empty() {
        info!("zillow_fsbo: listing array empty or not found");
        return vec![];
    }

    items
        .iter()
        .filter_map(|item| item_to_listing(item, criteria))
        .collect()
}

/// Find a list of property objects anywhere in the payload: either under
/// one of the known listing-array keys, or any array whose members look
/// like property records.
fn find_list_results(node: &Value, depth: u32) -> Vec<Value> {
    if depth > 8 {
        return vec![];
    }
    match node {
        Value::Array(items) => {
            if let Some(first) = items.first() {
                if first.is_object()
                    && (first.get("zpid").is_some()
                        || first.get("address").is_some()
                        || first.get("detailUrl").is_some())
                {
                    return items.clone();
                }
            }
            for item in items {
                let found = find_list_results(item, depth + 1);
                if !found.is_empty() {
                    return found;
                }
            }
            vec![]
        }
        Value::Object(map) => {
            for key in LIST_KEYS {
                if let Some(Value::Array(items)) = map.get(*key) {
                    if !items.is_empty() {
                        return items.clone();
                    }
                }
            }
            for value in map.values() {
                let found = find_list_results(value, depth + 1);
                if !found.is_empty() {
                    return found;
                }
            }
            vec![]
        }
        _ => vec![],
    }
}

fn item_to_listing(item: &Value, criteria: &FsboSearchCriteria) -> Option<FsboListing> {
    let address = {
        let a = json_str(item, &["address"]);
        if a.is_empty() {
            json_str(item, &["streetAddress"])
        } else {
            a
        }
    };
    if address.is_empty() {
        return None;
    }

    let price = {
        let raw = json_leaf_to_string(&item["price"]);
        let raw = if raw.is_empty() {
            json_leaf_to_string(&item["unformattedPrice"])
        } else {
            raw
        };
        let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
        digits.parse::<i64>().ok()
    };

    let beds = numeric_field(item, &["beds", "bedrooms"]).map(|n| n as u32);
    let baths = float_field(item, &["baths", "bathrooms"]);
    let days_on_market = numeric_field(item, &["daysOnZillow", "timeOnZillow"]);

    if !passes_filters(criteria, price, beds, baths, days_on_market) {
        return None;
    }

    let detail_url = {
        let url = json_str(item, &["detailUrl"]);
        if url.starts_with('/') {
            format!("{}{}", ZILLOW_BASE_URL, url)
        } else {
            url
        }
    };

    // Zillow occasionally exposes the seller's phone for FSBO listings.
    let phone = {
        let raw = json_str(item, &["hdpData", "homeInfo", "phone"]);
        if raw.is_empty() {
            None
        } else {
            Some(clean_phone(&raw)).filter(|p| !p.is_empty())
        }
    };

    // For FSBO the "agent" attribution is the seller.
    let owner_name = {
        let name = {
            let attributed = json_str(item, &["attributionInfo", "agentName"]);
            if attributed.is_empty() {
                json_str(item, &["ownerName"])
            } else {
                attributed
            }
        };
        if name.is_empty() {
            None
        } else {
            Some(clean_name(&name)).filter(|n| !n.is_empty())
        }
    };

    let city = json_str(item, &["city"]);
    let state = json_str(item, &["state"]);
    let zip_code = {
        let z = json_str(item, &["zipcode"]);
        if z.is_empty() {
            json_str(item, &["zip"])
        } else {
            z
        }
    };

    let full_address = if !city.is_empty() && !state.is_empty() {
        format!("{}, {}, {} {}", address, city, state, zip_code)
            .trim()
            .to_owned()
    } else {
        address
    };

    let sqft = numeric_field(item, &["livingArea"]).map(|n| n as u32);
    let property_type = {
        let t = json_str(item, &["homeType"]);
        if t.is_empty() {
            None
        } else {
            Some(t)
        }
    };

    let mut listing = FsboListing {
        address: full_address,
        city,
        state,
        zip_code,
        price,
        beds,
        baths,
        sqft,
        property_type,
        days_on_market,
        owner_name,
        phone,
        email: None,
        listing_url: detail_url,
        source: "zillow_fsbo".to_owned(),
        contact_status: ContactStatus::None,
    };
    listing.contact_status = listing.compute_contact_status();
    Some(listing)
}

fn numeric_field(item: &Value, keys: &[&str]) -> Option<i64> {
    for key in keys {
        let value = &item[*key];
        if let Some(n) = value.as_i64() {
            return Some(n);
        }
        if let Some(f) = value.as_f64() {
            return Some(f as i64);
        }
        if let Some(s) = value.as_str() {
            if let Ok(parsed) = s.trim().parse::<f64>() {
                return Some(parsed as i64);
            }
        }
    }
    None
}

fn float_field(item: &Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        let value = &item[*key];
        if let Some(f) = value.as_f64() {
            return Some(f);
        }
        if let Some(s) = value.as_str() {
            if let Ok(parsed) = s.trim().parse::<f64>() {
                return Some(parsed);
            }
        }
    }
    None
}
