//! Craigslist "real estate - by owner" scraper.
//!
//! Craigslist relays email through anonymized addresses, which we do not
//! collect on principle: contact status is `phone_only` when a phone turns
//! up in the post body, `anonymous` otherwise. Area resolution uses a
//! baked-in city-to-subdomain map; unknown areas skip the source entirely.

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use tracing::{debug, info};

use crate::config::{CRAIGSLIST_FSBO, FSBO_MAX_PAGES};
use crate::errors::FetchError;
use crate::fsbo::scrapers::{passes_filters, FsboCore, FsboSource};
use crate::fsbo::{ContactStatus, FsboListing, FsboSearchCriteria, LocationType};
use crate::gateway::{HeaderKind, SharedHttpClient};
use crate::normalize::clean_phone;

/// City to Craigslist subdomain. Craigslist areas cover metros, so the
/// biggest markets carry most lookups; unknown cities skip the source.
const CRAIGSLIST_AREAS: &[(&str, &str)] = &[
    ("albuquerque", "albuquerque"),
    ("atlanta", "atlanta"),
    ("austin", "austin"),
    ("baltimore", "baltimore"),
    ("boise", "boise"),
    ("boston", "boston"),
    ("charlotte", "charlotte"),
    ("chicago", "chicago"),
    ("cincinnati", "cincinnati"),
    ("cleveland", "cleveland"),
    ("columbus", "columbus"),
    ("dallas", "dallas"),
    ("denver", "denver"),
    ("detroit", "detroit"),
    ("el paso", "elpaso"),
    ("fort worth", "dallas"),
    ("fresno", "fresno"),
    ("houston", "houston"),
    ("indianapolis", "indianapolis"),
    ("jacksonville", "jacksonville"),
    ("kansas city", "kansascity"),
    ("las vegas", "lasvegas"),
    ("long beach", "losangeles"),
    ("los angeles", "losangeles"),
    ("louisville", "louisville"),
    ("memphis", "memphis"),
    ("mesa", "phoenix"),
    ("miami", "miami"),
    ("milwaukee", "milwaukee"),
    ("minneapolis", "minneapolis"),
    ("nashville", "nashville"),
    ("new orleans", "neworleans"),
    ("new york", "newyork"),
    ("oakland", "sfbay"),
    ("oklahoma city", "oklahomacity"),
    ("omaha", "omaha"),
    ("orlando", "orlando"),
    ("philadelphia", "philadelphia"),
    ("phoenix", "phoenix"),
    ("pittsburgh", "pittsburgh"),
    ("portland", "portland"),
    ("raleigh", "raleigh"),
    ("sacramento", "sacramento"),
    ("salt lake city", "saltlakecity"),
    ("san antonio", "sanantonio"),
    ("san diego", "sandiego"),
    ("san francisco", "sfbay"),
    ("san jose", "sfbay"),
    ("seattle", "seattle"),
    ("springfield", "springfieldil"),
    ("st louis", "stlouis"),
    ("tampa", "tampa"),
    ("tucson", "tucson"),
    ("tulsa", "tulsa"),
    ("virginia beach", "norfolk"),
    ("washington", "washingtondc"),
    ("wichita", "wichita"),
];

static PHONE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}").unwrap());
static PRICE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\s*([\d,]+)").unwrap());
static BEDS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(\d+)\s*(?:bd|bed|BR)").unwrap());
static BATHS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)([\d.]+)\s*(?:ba|bath|BTH)").unwrap());
static TRAILING_STATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+[a-z]{2}$").unwrap());

pub struct CraigslistFsboSource {
    core: FsboCore,
}

impl CraigslistFsboSource {
    pub fn new(client: SharedHttpClient) -> CraigslistFsboSource {
        CraigslistFsboSource {
            core: FsboCore::new(CRAIGSLIST_FSBO, client),
        }
    }

    /// Map a search location to a Craigslist subdomain.
    fn resolve_area(criteria: &FsboSearchCriteria) -> Option<&'static str> {
        let location = criteria.location.to_lowercase().trim().to_owned();
        let city = location.split(',').next().unwrap_or("").trim().to_owned();
        let city = TRAILING_STATE.replace(&city, "").trim().to_owned();

        for candidate in [location.as_str(), city.as_str()] {
            if let Some((_, area)) =
                CRAIGSLIST_AREAS.iter().find(|(key, _)| *key == candidate)
            {
                return Some(area);
            }
        }

        // Partial match for "phoenix metro"-style inputs.
        if city.len() > 3 {
            for (key, area) in CRAIGSLIST_AREAS {
                if key.starts_with(&city) || city.starts_with(key) {
                    return Some(area);
                }
            }
        }

        info!("craigslist: no area found for location {:?}", criteria.location);
        None
    }

    async fn scrape_area(
        &self,
        area: &str,
        criteria: &FsboSearchCriteria,
    ) -> Result<Vec<FsboListing>, FetchError> {
        let base = format!("https://{}.craigslist.org", area);
        let mut results = vec![];

        for page in 0..FSBO_MAX_PAGES {
            // Craigslist shows 120 results per page.
            let offset = page * 120;
            let mut params: Vec<(&str, String)> = vec![("s", offset.to_string())];
            if criteria.location_type == LocationType::Zip {
                params.push(("query", criteria.primary_location()));
            }

            let search_url = format!("{}/search/reo", base);
            let result = self
                .core
                .gateway()
                .get(&search_url, HeaderKind::Browser, None, &params)
                .await?;
            if !result.is_ok() {
                break;
            }

            let post_links = post_links(&result.text, &base);
            if post_links.is_empty() {
                break;
            }

            for (link, posted_date) in post_links {
                // The post date lets us skip stale posts before fetching.
                if let (Some(max_dom), Some(posted)) =
                    (criteria.max_days_on_market, posted_date)
                {
                    let days_ago = (Local::now().naive_local() - posted).num_days();
                    if days_ago > max_dom {
                        continue;
                    }
                }

                match self.scrape_post(&link, posted_date, criteria).await {
                    Ok(Some(listing)) => results.push(listing),
                    Ok(None) => {}
                    Err(err) => {
                        debug!("craigslist post failed {}: {}", link, err);
                    }
                }
            }
        }

        Ok(results)
    }

    async fn scrape_post(
        &self,
        url: &str,
        posted_date: Option<NaiveDateTime>,
        criteria: &FsboSearchCriteria,
    ) -> Result<Option<FsboListing>, FetchError> {
        let result = self
            .core
            .gateway()
            .get(url, HeaderKind::Browser, None, &[])
            .await?;
        if !result.is_ok() {
            return Ok(None);
        }
        Ok(parse_post(&result.text, url, posted_date, criteria))
    }
}

#[async_trait]
impl FsboSource for CraigslistFsboSource {
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
        let Some(area) = Self::resolve_area(criteria) else {
            return Ok(vec![]);
        };

        match self.scrape_area(area, criteria).await {
            Ok(results) => {
                self.core.record_success();
                info!("craigslist: found {} listings in {:?}", results.len(), area);
                Ok(results)
            }
            Err(err) => {
                self.core.record_failure();
                Err(err)
            }
        }
    }
}

/// Extract post links and their dates from a search results page. The
/// selectors cover the current and the previous Craigslist layouts.
fn post_links(html: &str, base: &str) -> Vec<(String, Option<NaiveDateTime>)> {
    let document = Html::parse_document(html);

    let item_selectors = [
        "li.cl-search-result",
        "li.result-row",
        ".cl-search-view-mode-list li",
    ];
    let mut items = vec![];
    for css in item_selectors {
        let Ok(selector) = Selector::parse(css) else {
            continue;
        };
        items = document.select(&selector).collect();
        if !items.is_empty() {
            break;
        }
    }
    if items.is_empty() {
        return vec![];
    }

    let anchor_selectors = [
        "a.cl-app-anchor",
        "a.result-title",
        "a[href*='/d/']",
        "a",
    ];
    let date_selectors = ["time", ".result-date", "[datetime]"];

    let mut links = vec![];
    for item in items {
        let mut href = None;
        for css in anchor_selectors {
            let Ok(selector) = Selector::parse(css) else {
                continue;
            };
            if let Some(found) = item
                .select(&selector)
                .next()
                .and_then(|el| el.value().attr("href"))
            {
                if !found.is_empty() {
                    href = Some(found.to_owned());
                    break;
                }
            }
        }
        let Some(href) = href else {
            continue;
        };
        let full = if href.starts_with("http") {
            href
        } else {
            format!("{}{}", base, href)
        };

        let mut posted = None;
        for css in date_selectors {
            let Ok(selector) = Selector::parse(css) else {
                continue;
            };
            if let Some(el) = item.select(&selector).next() {
                let stamp = el
                    .value()
                    .attr("datetime")
                    .or_else(|| el.value().attr("title"))
                    .unwrap_or("");
                if !stamp.is_empty() {
                    let head: String = stamp.chars().take(19).collect();
                    posted =
                        NaiveDateTime::parse_from_str(&head, "%Y-%m-%dT%H:%M:%S").ok();
                    break;
                }
            }
        }

        links.push((full, posted));
    }
    links
}

fn parse_post(
    html: &str,
    url: &str,
    posted_date: Option<NaiveDateTime>,
    criteria: &FsboSearchCriteria,
) -> Option<FsboListing> {
    let document = Html::parse_document(html);
    let select_text = |css: &str| -> Option<String> {
        let selector = Selector::parse(css).ok()?;
        document
            .select(&selector)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_owned())
    };

    let title = select_text("#titletextonly")
        .or_else(|| select_text("h1.postingtitle"))
        .unwrap_or_default();
    let body = select_text("#postingbody")
        .or_else(|| select_text(".postingbody"))
        .unwrap_or_default();
    let full_text = format!("{} {}", title, body);

    let price = PRICE.captures(&full_text).and_then(|caps| {
        let digits: String = caps[1].chars().filter(|c| c.is_ascii_digit()).collect();
        digits.parse::<i64>().ok()
    });
    let beds = BEDS
        .captures(&full_text)
        .and_then(|c| c[1].parse::<u32>().ok());
    let baths = BATHS
        .captures(&full_text)
        .and_then(|c| c[1].parse::<f64>().ok());

    let days_on_market = posted_date
        .map(|posted| (Local::now().naive_local() - posted).num_days().max(0));

    if !passes_filters(criteria, price, beds, baths, days_on_market) {
        return None;
    }

    let phone = PHONE
        .find(&body)
        .map(|m| clean_phone(m.as_str()))
        .filter(|p| !p.is_empty());

    // Address from the map block when present; the title otherwise.
    let raw_address = select_text(".mapaddress")
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| title.clone());

    // Relay emails are never collected.
    let contact_status = if phone.is_some() {
        ContactStatus::PhoneOnly
    } else {
        ContactStatus::Anonymous
    };

    Some(FsboListing {
        address: raw_address,
        city: String::new(),
        state: String::new(),
        zip_code: String::new(),
        price,
        beds,
        baths,
        sqft: None,
        property_type: None,
        days_on_market,
        owner_name: None,
        phone,
        email: None,
        listing_url: url.to_owned(),
        source: "craigslist".to_owned(),
        contact_status,
    })
}
