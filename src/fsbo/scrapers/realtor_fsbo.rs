//! Realtor.com FSBO area scraper, on the same synchronous search backend
//! as the agent-side harvest adapter.
//!
//! FSBO filtering is heuristic: rows that clearly name a professional
//! agent *and* a brokerage are excluded; rows with no agent attribution
//! are likely owner-listed.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::config::{SourceConfig, REALTOR_FSBO};
use crate::errors::FetchError;
use crate::fsbo::scrapers::{passes_filters, FsboSource};
use crate::fsbo::{ContactStatus, FsboListing, FsboSearchCriteria};
use crate::normalize::{clean_email, clean_name, clean_phone};
use crate::scrapers::harvest::{fetch_rows_blocking, row_field};

pub struct RealtorFsboSource {
    config: SourceConfig,
    semaphore: Semaphore,
}

impl RealtorFsboSource {
    pub fn new() -> RealtorFsboSource {
        RealtorFsboSource {
            config: REALTOR_FSBO,
            semaphore: Semaphore::new(REALTOR_FSBO.max_concurrent),
        }
    }
}

impl Default for RealtorFsboSource {
    fn default() -> Self {
        RealtorFsboSource::new()
    }
}

#[async_trait]
impl FsboSource for RealtorFsboSource {
    fn name(&self) -> &str {
        self.config.name
    }

    async fn search_area(
        &self,
        criteria: &FsboSearchCriteria,
    ) -> Result<Vec<FsboListing>, FetchError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("realtor_fsbo semaphore never closes");
        let criteria = criteria.clone();
        let results = tokio::task::spawn_blocking(move || sync_search(&criteria))
            .await
            .map_err(|err| {
                FetchError::Schema(format!("realtor_fsbo worker failed: {}", err))
            })??;
        info!("realtor_fsbo: found {} listings", results.len());
        Ok(results)
    }
}

fn sync_search(criteria: &FsboSearchCriteria) -> Result<Vec<FsboListing>, FetchError> {
    let location = criteria.primary_location();
    let rows = match fetch_rows_blocking(&location, "for_sale") {
        Ok(rows) => rows,
        Err(err @ (FetchError::Blocked | FetchError::RateLimited | FetchError::Captcha)) => {
            return Err(err)
        }
        Err(err) => {
            debug!("realtor_fsbo search failed for {:?}: {}", location, err);
            return Ok(vec![]);
        }
    };

    Ok(rows
        .iter()
        .filter_map(|row| row_to_listing(row, criteria))
        .collect())
}

fn row_to_listing(row: &Value, criteria: &FsboSearchCriteria) -> Option<FsboListing> {
    // Rows with a clearly named agent and brokerage are agent-represented,
    // not FSBO.
    let agent_name_raw = row_field(row, &["agent_name", "list_agent_name"]);
    let broker_raw = row_field(row, &["broker_name", "brokerage"]);
    if agent_name_raw.len() > 3 && broker_raw.len() > 3 {
        return None;
    }

    let address = row_field(row, &["full_street_line", "street_address"]);
    if address.is_empty() {
        return None;
    }

    let city = row_field(row, &["city"]);
    let state = row_field(row, &["state"]);
    let zip_code = row_field(row, &["zip_code", "postal_code"]);

    let price = row_field(row, &["list_price", "price"])
        .parse::<f64>()
        .ok()
        .map(|f| f as i64);
    let beds = row_field(row, &["beds", "bedrooms"])
        .parse::<f64>()
        .ok()
        .map(|f| f as u32);
    let baths = row_field(row, &["baths", "bathrooms"]).parse::<f64>().ok();
    let days_on_market = row_field(row, &["days_on_market", "dom"])
        .parse::<f64>()
        .ok()
        .map(|f| f as i64);

    if !passes_filters(criteria, price, beds, baths, days_on_market) {
        return None;
    }

    // Seller contact is occasionally visible on FSBO rows.
    let phone = Some(clean_phone(&row_field(
        row,
        &["agent_phone", "list_agent_phone"],
    )))
    .filter(|p| !p.is_empty());
    let email = Some(clean_email(&row_field(
        row,
        &["agent_email", "list_agent_email"],
    )))
    .filter(|e| !e.is_empty());
    let owner_name = if agent_name_raw.is_empty() {
        None
    } else {
        Some(clean_name(&agent_name_raw)).filter(|n| !n.is_empty())
    };

    let listing_url = row_field(row, &["property_url", "url"]);
    let full_address = format!("{}, {}, {} {}", address, city, state, zip_code)
        .trim()
        .trim_matches(',')
        .to_owned();

    let mut listing = FsboListing {
        address: full_address,
        city,
        state,
        zip_code,
        price,
        beds,
        baths,
        sqft: None,
        property_type: None,
        days_on_market,
        owner_name,
        phone,
        email,
        listing_url,
        source: "realtor".to_owned(),
        contact_status: ContactStatus::None,
    };
    listing.contact_status = listing.compute_contact_status();
    Some(listing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsbo::LocationType;
    use serde_json::json;

    fn criteria() -> FsboSearchCriteria {
        FsboSearchCriteria::for_location("85001", LocationType::Zip)
    }

    #[test]
    fn rows_with_named_agent_and_brokerage_are_excluded() {
        let row = json!({
            "full_street_line": "123 Main St",
            "city": "Phoenix", "state": "AZ", "zip_code": "85001",
            "agent_name": "Jane Doe",
            "broker_name": "ABC Realty",
            "list_price": "250000",
        });
        assert!(row_to_listing(&row, &criteria()).is_none());
    }

    #[test]
    fn unattributed_rows_become_listings() {
        let row = json!({
            "full_street_line": "123 Main St",
            "city": "Phoenix", "state": "AZ", "zip_code": "85001",
            "agent_name": "",
            "broker_name": "",
            "list_price": "250000",
            "beds": "3",
            "agent_phone": "5551112222",
        });
        let listing = row_to_listing(&row, &criteria()).unwrap();
        assert_eq!(listing.address, "123 Main St, Phoenix, AZ 85001");
        assert_eq!(listing.price, Some(250_000));
        assert_eq!(listing.beds, Some(3));
        assert_eq!(listing.phone.as_deref(), Some("(555) 111-2222"));
        assert_eq!(listing.source, "realtor");
        assert_eq!(listing.contact_status, ContactStatus::PhoneOnly);
    }

    #[test]
    fn filters_apply() {
        let mut c = criteria();
        c.max_days_on_market = Some(30);
        let row = json!({
            "full_street_line": "123 Main St",
            "city": "Phoenix", "state": "AZ", "zip_code": "85001",
            "days_on_market": "45",
        });
        assert!(row_to_listing(&row, &c).is_none());
    }
}
