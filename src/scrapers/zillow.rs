//! Zillow adapter — search by address, then parse the detail page's
//! `attributionInfo` for agent data.

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde_json::Value;

use crate::config::{ZILLOW, ZILLOW_BASE_URL};
use crate::errors::FetchError;
use crate::gateway::{Gateway, HeaderKind, SharedHttpClient};
use crate::models::{AgentInfo, Property};
use crate::normalize::{clean_email, clean_name, clean_phone, compute_days_on_market};
use crate::scrapers::{
    deep_find, first_href, format_price, json_leaf_to_string, json_str, next_data_json,
    AgentSource,
};

pub struct ZillowSource {
    gateway: Gateway,
}

impl ZillowSource {
    pub fn new(client: SharedHttpClient) -> ZillowSource {
        ZillowSource {
            gateway: Gateway::new(ZILLOW, client),
        }
    }

    /// Find the property's detail page URL via the public search path.
    async fn search_property(&self, prop: &Property) -> Result<Option<String>, FetchError> {
        let query = prop.search_query();
        let search_url = format!(
            "{}/homes/{}_rb/",
            ZILLOW_BASE_URL,
            urlencoding::encode(&query).replace("%20", "+")
        );
        let referer = format!("{}/", ZILLOW_BASE_URL);
        let page = self
            .gateway
            .get(&search_url, HeaderKind::Browser, Some(&referer), &[])
            .await?;
        if !page.is_ok() {
            return Ok(None);
        }

        // A single-hit search redirects straight to the detail page.
        if page.url.contains("/homedetails/") {
            return Ok(Some(page.url.clone()));
        }

        // Otherwise probe the embedded search results.
        if let Some(data) = next_data_json(&page.text)? {
            let results = &data["props"]["pageProps"]["searchPageState"]["cat1"]
                ["searchResults"]["listResults"];
            if let Some(first) = results.as_array().and_then(|r| r.first()) {
                let detail_url = json_str(first, &["detailUrl"]);
                if !detail_url.is_empty() {
                    return Ok(Some(absolute(&detail_url)));
                }
            }
        }

        // Last resort: any detail link in the page.
        Ok(first_href(&page.text, "a[href*='/homedetails/']").map(|href| absolute(&href)))
    }

    async fn fetch_detail_page(&self, url: &str) -> Result<Option<AgentInfo>, FetchError> {
        let referer = format!("{}/", ZILLOW_BASE_URL);
        let page = self
            .gateway
            .get(url, HeaderKind::Browser, Some(&referer), &[])
            .await?;
        if !page.is_ok() {
            return Ok(None);
        }
        parse_zillow_page(&page.text, url)
    }
}

#[async_trait]
impl AgentSource for ZillowSource {
    fn name(&self) -> &str {
        self.gateway.source_name()
    }

    async fn search(&self, prop: &Property) -> Result<Option<AgentInfo>, FetchError> {
        let Some(detail_url) = self.search_property(prop).await? else {
            return Ok(None);
        };
        self.fetch_detail_page(&detail_url).await
    }
}

fn absolute(href: &str) -> String {
    if href.starts_with('/') {
        format!("{}{}", ZILLOW_BASE_URL, href)
    } else {
        href.to_owned()
    }
}

/// The property payload is either directly under `pageProps.property` or
/// stashed inside the (sometimes double-encoded) `gdpClientCache`.
fn property_payload(data: &Value) -> Value {
    let page_props = &data["props"]["pageProps"];
    let direct = &page_props["property"];
    if direct["attributionInfo"].is_object() {
        return direct.clone();
    }

    let gdp_cache = &page_props["componentProps"]["gdpClientCache"];
    let decoded: Value = match gdp_cache {
        Value::String(raw) => serde_json::from_str(raw).unwrap_or(Value::Null),
        other => other.clone(),
    };
    if let Some(map) = decoded.as_object() {
        for nested in map.values() {
            if nested["property"].is_object() {
                return nested["property"].clone();
            }
        }
    }

    direct.clone()
}

fn parse_zillow_page(html: &str, listing_url: &str) -> Result<Option<AgentInfo>, FetchError> {
    let mut agent_name = String::new();
    let mut brokerage = String::new();
    let mut phone = String::new();
    let email = String::new();
    let mut list_date = String::new();
    let mut days_on_market = String::new();
    let mut listing_price = String::new();

    // `next_data_json` errors here mean the tag is unparseable; the deep
    // fallback below still gets a chance, so treat it as absent.
    let next_data = next_data_json(html).unwrap_or(None);

    if let Some(data) = &next_data {
        let property_data = property_payload(data);

        // Path 1: attributionInfo (primary).
        let attr = &property_data["attributionInfo"];
        if attr.is_object() {
            agent_name = json_str(attr, &["agentName"]);
            phone = json_str(attr, &["agentPhoneNumber"]);
            brokerage = json_str(attr, &["brokerName"]);
            if phone.is_empty() {
                phone = json_str(attr, &["brokerPhoneNumber"]);
            }
        }

        // Path 2: listingAgent.
        if agent_name.is_empty() {
            let listing_agent = &property_data["listingAgent"];
            if listing_agent.is_object() {
                agent_name = json_str(listing_agent, &["name"]);
                let agent_phone = json_str(listing_agent, &["phone"]);
                if !agent_phone.is_empty() {
                    phone = agent_phone;
                }
            }
        }

        let zprop = &data["props"]["pageProps"]["property"];
        list_date = first_non_empty(&[
            json_str(zprop, &["datePosted"]),
            json_str(zprop, &["dateSold"]),
        ]);
        days_on_market = first_non_empty(&[
            json_str(zprop, &["daysOnZillow"]),
            json_str(zprop, &["timeOnZillow"]),
        ]);
        listing_price = [
            &zprop["price"],
            &zprop["listingPrice"],
            &zprop["list_price"],
            &property_data["price"],
        ]
        .iter()
        .find(|v| !v.is_null())
        .map(|v| format_price(v))
        .unwrap_or_default();
    }

    // Fallback: deep-search every embedded JSON blob for `agentName`.
    if agent_name.is_empty() {
        for blob in embedded_json_blobs(html) {
            if let Some(found) = deep_find(&blob, "agentName", 10) {
                agent_name = json_leaf_to_string(found);
                if !agent_name.is_empty() {
                    phone = deep_find(&blob, "agentPhoneNumber", 10)
                        .map(json_leaf_to_string)
                        .unwrap_or_default();
                    brokerage = deep_find(&blob, "brokerName", 10)
                        .map(json_leaf_to_string)
                        .unwrap_or_default();
                    break;
                }
            }
        }
    }

    if agent_name.is_empty() {
        return Ok(None);
    }

    if days_on_market.is_empty() && !list_date.is_empty() {
        days_on_market = compute_days_on_market(&list_date);
    }

    Ok(Some(AgentInfo {
        agent_name: clean_name(&agent_name),
        brokerage: brokerage.trim().to_owned(),
        phone: clean_phone(&phone),
        email: clean_email(&email),
        source: "zillow".to_owned(),
        listing_url: listing_url.to_owned(),
        list_date,
        days_on_market,
        listing_price,
    }))
}

fn embedded_json_blobs(html: &str) -> Vec<Value> {
    let document = Html::parse_document(html);
    let selector =
        Selector::parse("script[type='application/json']").expect("static selector parses");
    document
        .select(&selector)
        .filter_map(|script| {
            let raw = script.text().collect::<String>();
            serde_json::from_str(&raw).ok()
        })
        .collect()
}

fn first_non_empty(candidates: &[String]) -> String {
    candidates
        .iter()
        .find(|s| !s.is_empty())
        .cloned()
        .unwrap_or_default()
}
