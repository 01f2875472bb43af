//! FSBO.com area scraper — dedicated FSBO site with owner contact info.
//!
//! Search pages are paginated and yield listing URLs; each listing page is
//! then fetched for contact and property details. When the search markup
//! comes back empty the embedded `__NEXT_DATA__` payload is mined for
//! listing URLs instead.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use tracing::{debug, info};

use crate::config::{FSBO_COM, FSBO_COM_BASE_URL, FSBO_MAX_PAGES};
use crate::errors::FetchError;
use crate::fsbo::scrapers::{
    find_listing_urls_in_json, parse_city_state_zip, parse_first_float,
    parse_first_int, parse_price_text, passes_filters, FsboCore, FsboSource,
};
use crate::fsbo::{ContactStatus, FsboListing, FsboSearchCriteria, LocationType};
use crate::gateway::{HeaderKind, SharedHttpClient};
use crate::normalize::{clean_email, clean_name, clean_phone};
use crate::scrapers::hrefs_by_selectors;

const SEARCH_LINK_SELECTORS: &[&str] = &[
    "a[href*='/listing/']",
    "a[href*='/property/']",
    ".listing-card a",
    ".property-card a",
    "[class*='listing'] a[href]",
    "[class*='property'] a[href]",
];

static DOM_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d+)\s*days?\s*on\s*market").unwrap());

pub struct FsboComSource {
    core: FsboCore,
}

impl FsboComSource {
    pub fn new(client: SharedHttpClient) -> FsboComSource {
        FsboComSource {
            core: FsboCore::new(FSBO_COM, client),
        }
    }

    async fn listing_urls(
        &self,
        criteria: &FsboSearchCriteria,
    ) -> Result<Vec<String>, FetchError> {
        let mut urls = vec![];
        for page in 1..=FSBO_MAX_PAGES {
            let page_urls = self.scrape_search_page(criteria, page).await?;
            if page_urls.is_empty() {
                break;
            }
            urls.extend(page_urls);
        }
        Ok(urls)
    }

    async fn scrape_search_page(
        &self,
        criteria: &FsboSearchCriteria,
        page: u32,
    ) -> Result<Vec<String>, FetchError> {
        let mut params: Vec<(&str, String)> = vec![("page", page.to_string())];
        match criteria.location_type {
            LocationType::Zip => params.push(("zip", criteria.primary_location())),
            LocationType::CityState => {
                let mut parts = criteria.location.splitn(2, ',');
                params.push(("city", parts.next().unwrap_or("").trim().to_owned()));
                if let Some(state) = parts.next() {
                    params.push(("state", state.trim().to_owned()));
                }
            }
        }
        if let Some(min_price) = criteria.min_price {
            params.push(("min_price", min_price.to_string()));
        }
        if let Some(max_price) = criteria.max_price {
            params.push(("max_price", max_price.to_string()));
        }
        if let Some(min_beds) = criteria.min_beds {
            params.push(("min_beds", min_beds.to_string()));
        }

        let url = format!("{}/search", FSBO_COM_BASE_URL);
        let result = self
            .core
            .gateway()
            .get(&url, HeaderKind::Browser, None, &params)
            .await?;
        if !result.is_ok() {
            info!("fsbo.com: non-200 response on page {}: {}", page, result.status);
            return Ok(vec![]);
        }

        let hrefs = hrefs_by_selectors(&result.text, SEARCH_LINK_SELECTORS);
        if !hrefs.is_empty() {
            return Ok(hrefs
                .into_iter()
                .map(|href| absolutize(&href))
                .collect());
        }

        // Empty markup; try the embedded payload before giving up.
        match crate::scrapers::next_data_json(&result.text) {
            Ok(Some(data)) => {
                let mut urls = vec![];
                find_listing_urls_in_json(
                    &data,
                    &["/listing/", "/property/"],
                    FSBO_COM_BASE_URL,
                    &mut urls,
                    0,
                );
                urls.truncate(50);
                info!("fsbo.com: mined {} listing URLs from page payload", urls.len());
                Ok(urls)
            }
            _ => Ok(vec![]),
        }
    }

    async fn scrape_listing(
        &self,
        url: &str,
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
        Ok(parse_listing(&result.text, url, criteria))
    }
}

fn absolutize(href: &str) -> String {
    if href.starts_with("http") {
        href.to_owned()
    } else {
        format!("{}{}", FSBO_COM_BASE_URL, href)
    }
}

#[async_trait]
impl FsboSource for FsboComSource {
    fn name(&self) -> &str {
        self.core.name()
    }

    async fn search_area(
        &self,
        criteria: &FsboSearchCriteria,
    ) -> Result<Vec<FsboListing>, FetchError> {
        if self.core.is_circuit_open() {
            info!("fsbo.com: circuit open, skipping");
            return Ok(vec![]);
        }

        let urls = match self.listing_urls(criteria).await {
            Ok(urls) => urls,
            Err(err) => {
                self.core.record_failure();
                return Err(err);
            }
        };

        let mut results = vec![];
        for url in urls {
            match self.scrape_listing(&url, criteria).await {
                Ok(Some(listing)) => results.push(listing),
                Ok(None) => {}
                Err(err) => {
                    self.core.record_failure();
                    debug!("fsbo.com listing failed {}: {}", url, err);
                }
            }
        }
        self.core.record_success();
        info!("fsbo.com: found {} listings", results.len());
        Ok(results)
    }
}

/// Parse a listing page, applying criteria filters inline.
fn parse_listing(
    html: &str,
    url: &str,
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

    let raw_address = select_text("h1.listing-address")
        .or_else(|| select_text("[class*='address']"))
        .or_else(|| select_text("h1"))?;

    let price = select_text("[class*='price']")
        .or_else(|| select_text(".listing-price"))
        .and_then(|text| parse_price_text(&text));

    let beds = select_text("[class*='bed']")
        .and_then(|text| parse_first_int(&text))
        .and_then(|n| u32::try_from(n).ok());
    let baths = select_text("[class*='bath']").and_then(|text| parse_first_float(&text));

    let days_on_market = DOM_TEXT
        .captures(html)
        .and_then(|caps| caps[1].parse::<i64>().ok());

    if !passes_filters(criteria, price, beds, baths, days_on_market) {
        return None;
    }

    // Owner contact lives in the contact/owner block when present.
    let mut owner_name = None;
    let mut phone = None;
    let mut email = None;
    let contact_selector = Selector::parse("[class*='contact'], [class*='owner']").ok()?;
    if let Some(contact) = document.select(&contact_selector).next() {
        let inner = |css: &str| -> Option<String> {
            let selector = Selector::parse(css).ok()?;
            contact
                .select(&selector)
                .next()
                .map(|el| el.text().collect::<String>().trim().to_owned())
        };
        if let Some(name) = inner("[class*='name']").or_else(|| inner("strong")) {
            let cleaned = clean_name(&name);
            if !cleaned.is_empty() {
                owner_name = Some(cleaned);
            }
        }
        if let Some(tel) = contact
            .select(&Selector::parse("[href^='tel:']").ok()?)
            .next()
            .and_then(|el| el.value().attr("href"))
        {
            let cleaned = clean_phone(tel.trim_start_matches("tel:"));
            if !cleaned.is_empty() {
                phone = Some(cleaned);
            }
        }
        if phone.is_none() {
            if let Some(text) = inner("[class*='phone']") {
                let cleaned = clean_phone(&text);
                if !cleaned.is_empty() {
                    phone = Some(cleaned);
                }
            }
        }
        if let Some(mailto) = contact
            .select(&Selector::parse("[href^='mailto:']").ok()?)
            .next()
            .and_then(|el| el.value().attr("href"))
        {
            let cleaned = clean_email(mailto.trim_start_matches("mailto:"));
            if !cleaned.is_empty() {
                email = Some(cleaned);
            }
        }
    }

    let (city, state, zip_code) = parse_city_state_zip(&raw_address);

    let mut listing = FsboListing {
        address: raw_address,
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
        listing_url: url.to_owned(),
        source: "fsbo.com".to_owned(),
        contact_status: ContactStatus::None,
    };
    listing.contact_status = listing.compute_contact_status();
    Some(listing)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING_HTML: &str = r#"<html><body>
        <h1 class="listing-address">123 Main St, Phoenix, AZ 85001</h1>
        <div class="listing-price">$250,000</div>
        <span class="beds">3 beds</span>
        <span class="baths">2 baths</span>
        <p>Only 14 days on market!</p>
        <div class="contact-box">
            <strong>Pat Owner</strong>
            <a href="tel:5551112222">call</a>
            <a href="mailto:pat@example.com">email</a>
        </div>
    </body></html>"#;

    #[test]
    fn parses_full_listing() {
        let criteria = FsboSearchCriteria::for_location("85001", LocationType::Zip);
        let listing =
            parse_listing(LISTING_HTML, "https://www.fsbo.com/listing/1", &criteria)
                .unwrap();
        assert_eq!(listing.address, "123 Main St, Phoenix, AZ 85001");
        assert_eq!(listing.city, "Phoenix");
        assert_eq!(listing.state, "AZ");
        assert_eq!(listing.zip_code, "85001");
        assert_eq!(listing.price, Some(250_000));
        assert_eq!(listing.beds, Some(3));
        assert_eq!(listing.baths, Some(2.0));
        assert_eq!(listing.days_on_market, Some(14));
        assert_eq!(listing.owner_name.as_deref(), Some("Pat Owner"));
        assert_eq!(listing.phone.as_deref(), Some("(555) 111-2222"));
        assert_eq!(listing.email.as_deref(), Some("pat@example.com"));
        assert_eq!(listing.contact_status, ContactStatus::Complete);
    }

    #[test]
    fn price_filter_discards_at_parse_time() {
        let mut criteria = FsboSearchCriteria::for_location("85001", LocationType::Zip);
        criteria.max_price = Some(200_000);
        assert!(parse_listing(LISTING_HTML, "u", &criteria).is_none());

        criteria.max_price = Some(300_000);
        assert!(parse_listing(LISTING_HTML, "u", &criteria).is_some());
    }

    #[test]
    fn listing_without_address_is_none() {
        let criteria = FsboSearchCriteria::for_location("85001", LocationType::Zip);
        assert!(parse_listing("<html><body></body></html>", "u", &criteria).is_none());
    }
}
