//! ForSaleByOwner.com area scraper — the secondary dedicated FSBO site.
//! Same search-then-listing-pages approach as fsbo.com, with this site's
//! URL scheme and looser page markup.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use tracing::{debug, info};

use crate::config::{FORSALEBYOWNER_BASE_URL, FORSALEBYOWNER_COM, FSBO_MAX_PAGES};
use crate::errors::FetchError;
use crate::fsbo::scrapers::{
    find_listing_urls_in_json, parse_city_state_zip, passes_filters, FsboCore,
    FsboSource,
};
use crate::fsbo::{ContactStatus, FsboListing, FsboSearchCriteria, LocationType};
use crate::gateway::{HeaderKind, SharedHttpClient};
use crate::normalize::{clean_email, clean_name, clean_phone};
use crate::scrapers::hrefs_by_selectors;

const SEARCH_LINK_SELECTORS: &[&str] = &[
    "a[href*='/homes/']",
    "a[href*='/listing/']",
    ".property-card a",
    ".listing-card a",
    "[class*='property'] a[href]",
    "[class*='listing'] a[href]",
    "h2 a",
    "h3 a",
];

static BEDS_TEXT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(\d+)\s*bed").unwrap());
static BATHS_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)([\d.]+)\s*bath").unwrap());
static DOM_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d+)\s*days?\s*on\s*market").unwrap());
static PHONE_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}").unwrap());
static PRICE_DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\d]").unwrap());

pub struct ForSaleByOwnerSource {
    core: FsboCore,
}

impl ForSaleByOwnerSource {
    pub fn new(client: SharedHttpClient) -> ForSaleByOwnerSource {
        ForSaleByOwnerSource {
            core: FsboCore::new(FORSALEBYOWNER_COM, client),
        }
    }

    fn search_url(&self, criteria: &FsboSearchCriteria, page: u32) -> String {
        match criteria.location_type {
            LocationType::Zip => format!(
                "{}/homes/search/?zip={}&page={}",
                FORSALEBYOWNER_BASE_URL,
                criteria.primary_location(),
                page
            ),
            LocationType::CityState => {
                let mut parts = criteria.location.splitn(2, ',');
                let city = parts
                    .next()
                    .unwrap_or("")
                    .trim()
                    .to_lowercase()
                    .replace(' ', "-");
                let state = parts.next().unwrap_or("").trim().to_lowercase();
                format!(
                    "{}/homes/for-sale/{}/{}/?page={}",
                    FORSALEBYOWNER_BASE_URL, state, city, page
                )
            }
        }
    }

    async fn scrape_search_page(
        &self,
        criteria: &FsboSearchCriteria,
        page: u32,
    ) -> Result<Vec<String>, FetchError> {
        let url = self.search_url(criteria, page);
        let result = self
            .core
            .gateway()
            .get(&url, HeaderKind::Browser, None, &[])
            .await?;
        if !result.is_ok() {
            return Ok(vec![]);
        }

        let hrefs = hrefs_by_selectors(&result.text, SEARCH_LINK_SELECTORS);
        if !hrefs.is_empty() {
            return Ok(hrefs.into_iter().map(|href| absolutize(&href)).collect());
        }

        match crate::scrapers::next_data_json(&result.text) {
            Ok(Some(data)) => {
                let mut urls = vec![];
                find_listing_urls_in_json(
                    &data,
                    &["/homes/"],
                    FORSALEBYOWNER_BASE_URL,
                    &mut urls,
                    0,
                );
                urls.truncate(50);
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
        format!("{}{}", FORSALEBYOWNER_BASE_URL, href)
    }
}

#[async_trait]
impl FsboSource for ForSaleByOwnerSource {
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

        let mut urls = vec![];
        for page in 1..=FSBO_MAX_PAGES {
            match self.scrape_search_page(criteria, page).await {
                Ok(page_urls) if page_urls.is_empty() => break,
                Ok(page_urls) => urls.extend(page_urls),
                Err(err) => {
                    self.core.record_failure();
                    return Err(err);
                }
            }
        }

        let mut results = vec![];
        for url in urls {
            match self.scrape_listing(&url, criteria).await {
                Ok(Some(listing)) => results.push(listing),
                Ok(None) => {}
                Err(err) => {
                    self.core.record_failure();
                    debug!("forsalebyowner.com listing failed {}: {}", url, err);
                }
            }
        }
        self.core.record_success();
        info!("forsalebyowner.com: found {} listings", results.len());
        Ok(results)
    }
}

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

    let raw_address =
        select_text("h1").or_else(|| select_text("[class*='address']"))?;
    if raw_address.is_empty() {
        return None;
    }

    let price = select_text("[class*='price']").and_then(|text| {
        let digits = PRICE_DIGITS.replace_all(&text, "");
        digits.parse::<i64>().ok()
    });

    let page_text = document.root_element().text().collect::<String>();
    let beds = BEDS_TEXT
        .captures(&page_text)
        .and_then(|c| c[1].parse::<u32>().ok());
    let baths = BATHS_TEXT
        .captures(&page_text)
        .and_then(|c| c[1].parse::<f64>().ok());
    let days_on_market = DOM_TEXT
        .captures(&page_text)
        .and_then(|c| c[1].parse::<i64>().ok());

    if !passes_filters(criteria, price, beds, baths, days_on_market) {
        return None;
    }

    let mut phone = document
        .select(&Selector::parse("a[href^='tel:']").ok()?)
        .next()
        .and_then(|el| el.value().attr("href"))
        .map(|href| clean_phone(href.trim_start_matches("tel:")))
        .filter(|p| !p.is_empty());
    if phone.is_none() {
        phone = PHONE_TEXT
            .find(&page_text)
            .map(|m| clean_phone(m.as_str()))
            .filter(|p| !p.is_empty());
    }

    let email = document
        .select(&Selector::parse("a[href^='mailto:']").ok()?)
        .next()
        .and_then(|el| el.value().attr("href"))
        .map(|href| clean_email(href.trim_start_matches("mailto:")))
        .filter(|e| !e.is_empty());

    let owner_name = select_text("[class*='seller']")
        .or_else(|| select_text("[class*='owner-name']"))
        .map(|name| clean_name(&name))
        .filter(|n| !n.is_empty());

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
        source: "forsalebyowner.com".to_owned(),
        contact_status: ContactStatus::None,
    };
    listing.contact_status = listing.compute_contact_status();
    Some(listing)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_url_shapes() {
        let source = ForSaleByOwnerSource::new(crate::gateway::shared_http_client());
        let zip = FsboSearchCriteria::for_location("85001,85002", LocationType::Zip);
        assert_eq!(
            source.search_url(&zip, 2),
            "https://www.forsalebyowner.com/homes/search/?zip=85001&page=2"
        );
        let city =
            FsboSearchCriteria::for_location("Sioux Falls, SD", LocationType::CityState);
        assert_eq!(
            source.search_url(&city, 1),
            "https://www.forsalebyowner.com/homes/for-sale/sd/sioux-falls/?page=1"
        );
    }

    #[test]
    fn parses_listing_with_text_mined_fields() {
        let html = r#"<html><body>
            <h1>9 Elm Ter, Boston, MA 02134</h1>
            <div class="price-tag">$399,000</div>
            <p>Charming 4 bed, 1.5 bath. 21 days on market.</p>
            <p>Call (555) 222-3333. <span class="seller">sam seller</span></p>
        </body></html>"#;
        let criteria = FsboSearchCriteria::for_location("02134", LocationType::Zip);
        let listing = parse_listing(html, "https://x/1", &criteria).unwrap();
        assert_eq!(listing.price, Some(399_000));
        assert_eq!(listing.beds, Some(4));
        assert_eq!(listing.baths, Some(1.5));
        assert_eq!(listing.days_on_market, Some(21));
        assert_eq!(listing.phone.as_deref(), Some("(555) 222-3333"));
        assert_eq!(listing.owner_name.as_deref(), Some("Sam Seller"));
        assert_eq!(listing.contact_status, ContactStatus::Partial);
    }
}
