//! FSBO aggregation engine: fan the criteria out to every area scraper
//! concurrently, then dedup-and-merge by canonical address.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future;
use serde::Serialize;
use tracing::{info, warn};

use crate::fsbo::scrapers::craigslist::CraigslistFsboSource;
use crate::fsbo::scrapers::forsalebyowner::ForSaleByOwnerSource;
use crate::fsbo::scrapers::fsbo_com::FsboComSource;
use crate::fsbo::scrapers::realtor_fsbo::RealtorFsboSource;
use crate::fsbo::scrapers::zillow_fsbo::ZillowFsboSource;
use crate::fsbo::scrapers::FsboSource;
use crate::fsbo::{FsboListing, FsboSearchCriteria};
use crate::gateway::SharedHttpClient;
use crate::normalize::normalize_address;

/// One progress update per scraper completion.
#[derive(Clone, Debug, Serialize)]
pub struct FsboProgressEvent {
    pub scrapers_done: usize,
    pub scrapers_total: usize,
    pub listings_found: usize,
    pub current_source: String,
    pub source_count: usize,
    /// "running" until the last scraper settles, then "complete".
    pub status: String,
}

pub type FsboProgressCallback = Arc<dyn Fn(FsboProgressEvent) + Send + Sync>;

/// Runs all five FSBO scrapers concurrently and merges their results.
pub struct FsboAggregator {
    sources: Vec<Arc<dyn FsboSource>>,
    progress: Option<FsboProgressCallback>,
    /// Extend the dedup key with city and ZIP. Off by default: the
    /// street-line key matches the established cross-source behavior, but
    /// it can over-merge same-street listings in different towns.
    city_zip_key: bool,
}

impl FsboAggregator {
    pub fn new(
        client: &SharedHttpClient,
        progress: Option<FsboProgressCallback>,
    ) -> FsboAggregator {
        let sources: Vec<Arc<dyn FsboSource>> = vec![
            Arc::new(FsboComSource::new(client.clone())),
            Arc::new(ForSaleByOwnerSource::new(client.clone())),
            Arc::new(ZillowFsboSource::new(client.clone())),
            Arc::new(RealtorFsboSource::new()),
            Arc::new(CraigslistFsboSource::new(client.clone())),
        ];
        FsboAggregator {
            sources,
            progress,
            city_zip_key: false,
        }
    }

    /// Test seam: run with a custom source list.
    pub fn with_sources(
        sources: Vec<Arc<dyn FsboSource>>,
        progress: Option<FsboProgressCallback>,
    ) -> FsboAggregator {
        FsboAggregator {
            sources,
            progress,
            city_zip_key: false,
        }
    }

    pub fn with_city_zip_key(mut self, enabled: bool) -> FsboAggregator {
        self.city_zip_key = enabled;
        self
    }

    /// Run every scraper to completion and return the deduplicated
    /// listings. Scraper failures are logged and contribute nothing.
    pub async fn run(&self, criteria: &FsboSearchCriteria) -> Vec<FsboListing> {
        let total = self.sources.len();
        // (scrapers done, listings found) shared by the completion events.
        let counters = Mutex::new((0usize, 0usize));

        let per_source = future::join_all(self.sources.iter().map(|source| {
            let source = source.clone();
            let counters = &counters;
            async move {
                let results = match source.search_area(criteria).await {
                    Ok(results) => results,
                    Err(err) => {
                        warn!("FSBO scraper {} raised: {}", source.name(), err);
                        vec![]
                    }
                };
                let (done, found) = {
                    let mut counters = counters.lock().unwrap();
                    counters.0 += 1;
                    counters.1 += results.len();
                    *counters
                };
                if let Some(callback) = &self.progress {
                    callback(FsboProgressEvent {
                        scrapers_done: done,
                        scrapers_total: total,
                        listings_found: found,
                        current_source: source.name().to_owned(),
                        source_count: results.len(),
                        status: if done == total {
                            "complete".to_owned()
                        } else {
                            "running".to_owned()
                        },
                    });
                }
                results
            }
        }))
        .await;

        let all: Vec<FsboListing> = per_source.into_iter().flatten().collect();
        let merged = self.deduplicate_and_merge(all);
        info!(
            "FSBO aggregation: {} scrapers, {} listings after dedup",
            total,
            merged.len()
        );
        merged
    }

    /// Group by the dedup key and merge duplicates, receiver-wins for the
    /// first-seen listing. Output preserves first-seen order.
    fn deduplicate_and_merge(&self, listings: Vec<FsboListing>) -> Vec<FsboListing> {
        let mut order: Vec<String> = vec![];
        let mut seen: HashMap<String, FsboListing> = HashMap::new();

        for listing in listings {
            let key = self.dedup_key(&listing);
            match seen.entry(key) {
                Entry::Occupied(mut existing) => {
                    let merged = existing.get().merge(&listing);
                    existing.insert(merged);
                }
                Entry::Vacant(slot) => {
                    order.push(slot.key().clone());
                    slot.insert(listing);
                }
            }
        }

        order
            .into_iter()
            .filter_map(|key| seen.remove(&key))
            .collect()
    }

    /// The dedup key: normalized street line when long enough to be
    /// trustworthy, else the listing URL, else the raw address.
    fn dedup_key(&self, listing: &FsboListing) -> String {
        let street = normalize_address(
            listing.address.split(',').next().unwrap_or("").trim(),
        );
        if street.len() < 4 {
            return if listing.listing_url.is_empty() {
                listing.address.clone()
            } else {
                listing.listing_url.clone()
            };
        }
        if self.city_zip_key {
            format!(
                "{}|{}|{}",
                street,
                listing.city.to_uppercase(),
                listing.zip_code
            )
        } else {
            street
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsbo::ContactStatus;

    fn listing(address: &str, source: &str) -> FsboListing {
        FsboListing {
            address: address.to_owned(),
            city: String::new(),
            state: String::new(),
            zip_code: String::new(),
            price: None,
            beds: None,
            baths: None,
            sqft: None,
            property_type: None,
            days_on_market: None,
            owner_name: None,
            phone: None,
            email: None,
            listing_url: String::new(),
            source: source.to_owned(),
            contact_status: ContactStatus::None,
        }
    }

    fn aggregator() -> FsboAggregator {
        FsboAggregator::with_sources(vec![], None)
    }

    #[test]
    fn merges_same_street_line_across_sources() {
        let mut a = listing("123 Main Street, Phoenix, AZ 85001", "fsbo.com");
        a.price = Some(250_000);
        let mut b = listing("123 MAIN ST, Phoenix, AZ", "zillow_fsbo");
        b.phone = Some("(555) 111-2222".to_owned());

        let merged = aggregator().deduplicate_and_merge(vec![a, b]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].price, Some(250_000));
        assert_eq!(merged[0].phone.as_deref(), Some("(555) 111-2222"));
        assert_eq!(merged[0].source, "fsbo.com+zillow_fsbo");
    }

    #[test]
    fn short_street_lines_fall_back_to_listing_url() {
        let mut a = listing("9, Phoenix, AZ", "fsbo.com");
        a.listing_url = "https://a.test/1".to_owned();
        let mut b = listing("9, Phoenix, AZ", "zillow_fsbo");
        b.listing_url = "https://b.test/2".to_owned();

        // Different URLs: kept apart even though the street line matches.
        let merged = aggregator().deduplicate_and_merge(vec![a, b]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn city_zip_knob_separates_same_street_in_different_towns() {
        let mut a = listing("123 Main St, Phoenix, AZ 85001", "fsbo.com");
        a.city = "Phoenix".to_owned();
        a.zip_code = "85001".to_owned();
        let mut b = listing("123 Main St, Tucson, AZ 85701", "zillow_fsbo");
        b.city = "Tucson".to_owned();
        b.zip_code = "85701".to_owned();

        let merged = aggregator().deduplicate_and_merge(vec![a.clone(), b.clone()]);
        assert_eq!(merged.len(), 1);

        let merged = aggregator()
            .with_city_zip_key(true)
            .deduplicate_and_merge(vec![a, b]);
        assert_eq!(merged.len(), 2);
    }
}
