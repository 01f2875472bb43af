//! Realtor.com direct adapter — parses the `__NEXT_DATA__` JSON embedded
//! in property detail pages.
//!
//! When the input has enough components we build the deterministic slugged
//! detail URL; otherwise we hit the search-results page and follow the
//! first detail link.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::config::{REALTOR, REALTOR_BASE_URL};
use crate::errors::FetchError;
use crate::gateway::{Gateway, HeaderKind, SharedHttpClient};
use crate::models::{AgentInfo, Property};
use crate::normalize::{
    clean_email, clean_name, clean_phone, compute_days_on_market, normalize_state,
};
use crate::scrapers::{first_href, format_price, json_str, next_data_json, AgentSource};

static SLUG_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-zA-Z0-9]+").unwrap());
static QUERY_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-zA-Z0-9\s,-]").unwrap());

fn slug(text: &str) -> String {
    SLUG_CHARS
        .replace_all(text.trim(), "-")
        .trim_matches('-')
        .to_owned()
}

pub struct RealtorSource {
    gateway: Gateway,
}

impl RealtorSource {
    pub fn new(client: SharedHttpClient) -> RealtorSource {
        RealtorSource {
            gateway: Gateway::new(REALTOR, client),
        }
    }

    /// Deterministic detail URL, when the address components allow one.
    fn build_url(&self, prop: &Property) -> Option<String> {
        let address = if prop.address_line.is_empty() {
            &prop.raw_address
        } else {
            &prop.address_line
        };
        if address.is_empty() {
            return None;
        }
        let addr_slug = slug(address);
        let state = normalize_state(&prop.state);

        if !prop.city.is_empty() && !state.is_empty() {
            let mut url = format!(
                "{}/realestateandhomes-detail/{}_{}_{}",
                REALTOR_BASE_URL,
                addr_slug,
                slug(&prop.city),
                state
            );
            if !prop.zip_code.is_empty() {
                url.push('_');
                url.push_str(&prop.zip_code);
            }
            return Some(url);
        }

        if !prop.zip_code.is_empty() {
            return Some(format!(
                "{}/realestateandhomes-detail/{}_{}",
                REALTOR_BASE_URL, addr_slug, prop.zip_code
            ));
        }

        None
    }

    async fn fetch_and_parse(&self, url: &str) -> Result<Option<AgentInfo>, FetchError> {
        let page = self
            .gateway
            .get(url, HeaderKind::Browser, Some(REALTOR_BASE_URL), &[])
            .await?;
        if !page.is_ok() {
            return Ok(None);
        }
        parse_next_data(&page.text)
    }

    async fn search_and_parse(&self, prop: &Property) -> Result<Option<AgentInfo>, FetchError> {
        let query = prop.search_query();
        let clean_query = QUERY_CHARS.replace_all(&query, "").into_owned();
        let search_url = format!(
            "{}/realestateandhomes-search/{}",
            REALTOR_BASE_URL,
            clean_query
                .replace(' ', "-")
                .replace(',', "")
                .replace("--", "-")
        );

        let page = self
            .gateway
            .get(&search_url, HeaderKind::Browser, Some(REALTOR_BASE_URL), &[])
            .await?;
        if !page.is_ok() {
            return Ok(None);
        }

        let Some(href) = first_href(&page.text, "a[href*='/realestateandhomes-detail/']")
        else {
            return Ok(None);
        };
        let detail_url = if href.starts_with('/') {
            format!("{}{}", REALTOR_BASE_URL, href)
        } else {
            href
        };
        self.fetch_and_parse(&detail_url).await
    }
}

#[async_trait]
impl AgentSource for RealtorSource {
    fn name(&self) -> &str {
        self.gateway.source_name()
    }

    async fn search(&self, prop: &Property) -> Result<Option<AgentInfo>, FetchError> {
        let mut agent_info = None;
        if let Some(url) = self.build_url(prop) {
            agent_info = self.fetch_and_parse(&url).await?;
        }

        // The slugged URL guesses wrong often enough that the search page
        // is always worth a try.
        if agent_info.is_none() {
            agent_info = self.search_and_parse(prop).await?;
        }

        Ok(agent_info)
    }
}

fn parse_next_data(html: &str) -> Result<Option<AgentInfo>, FetchError> {
    let Some(data) = next_data_json(html)? else {
        return Ok(None);
    };
    let page_props = &data["props"]["pageProps"];

    // The payload shape varies; probe the known homes of the property data.
    let mut property_data = &page_props["property"];
    if !property_data.is_object() {
        property_data =
            &page_props["initialState"]["propertyDetails"]["propertyDetails"];
    }
    if !property_data.is_object() {
        return Ok(None);
    }

    let listing = &property_data["listing"];
    let list_agent = &listing["list_agent"];
    let list_office = &listing["list_office"];

    let mut agent_name = if !json_str(list_agent, &["name"]).is_empty() {
        json_str(list_agent, &["name"])
    } else {
        json_str(list_agent, &["agent_name"])
    };
    let mut phone = json_str(list_agent, &["phone"]);
    if phone.is_empty() {
        if let Some(phones) = list_agent["phones"].as_array() {
            if let Some(first) = phones.first() {
                phone = json_str(first, &["number"]);
            }
        }
    }
    let email = json_str(list_agent, &["email"]);
    let mut brokerage = if !json_str(list_office, &["name"]).is_empty() {
        json_str(list_office, &["name"])
    } else {
        json_str(list_office, &["office_name"])
    };

    // Alternate path: the branding array.
    if agent_name.is_empty() {
        if let Some(branding) = property_data["branding"].as_array() {
            for brand in branding {
                match brand["type"].as_str() {
                    Some("Agent") => agent_name = json_str(brand, &["name"]),
                    Some("Office") => brokerage = json_str(brand, &["name"]),
                    _ => {}
                }
                let brand_phone = json_str(brand, &["phone"]);
                if !brand_phone.is_empty() {
                    phone = brand_phone;
                }
            }
        }
    }

    if agent_name.is_empty() {
        return Ok(None);
    }

    let description = &property_data["description"];
    let list_date = first_non_empty(&[
        json_str(listing, &["list_date"]),
        json_str(description, &["list_date"]),
        json_str(property_data, &["list_date"]),
    ]);
    let mut days_on_market = first_non_empty(&[
        json_str(description, &["days_on_market"]),
        json_str(property_data, &["days_on_market"]),
    ]);
    if days_on_market.is_empty() && !list_date.is_empty() {
        days_on_market = compute_days_on_market(&list_date);
    }

    let listing_price = [
        &listing["list_price"],
        &description["list_price"],
        &property_data["list_price"],
        &property_data["price"],
    ]
    .iter()
    .find(|v| !v.is_null())
    .map(|v| format_price(v))
    .unwrap_or_default();

    Ok(Some(AgentInfo {
        agent_name: clean_name(&agent_name),
        brokerage: brokerage.trim().to_owned(),
        phone: clean_phone(&phone),
        email: clean_email(&email),
        source: "realtor".to_owned(),
        listing_url: String::new(),
        list_date,
        days_on_market,
        listing_price,
    }))
}

fn first_non_empty(candidates: &[String]) -> String {
    candidates
        .iter()
        .find(|s| !s.is_empty())
        .cloned()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrap_next_data(inner: &str) -> String {
        format!(
            r#"<html><script id="__NEXT_DATA__" type="application/json">{}</script></html>"#,
            inner
        )
    }

    #[test]
    fn parses_list_agent_path() {
        let html = wrap_next_data(
            r#"{"props":{"pageProps":{"property":{
                "listing":{
                    "list_agent":{"name":"JANE DOE","phones":[{"number":"555-111-2222"}],"email":"JANE@ABC.COM"},
                    "list_office":{"name":"ABC Realty"},
                    "list_price":450000,
                    "list_date":"2024-02-01"
                },
                "description":{"days_on_market":9}
            }}}}"#,
        );
        let info = parse_next_data(&html).unwrap().unwrap();
        assert_eq!(info.agent_name, "Jane Doe");
        assert_eq!(info.phone, "(555) 111-2222");
        assert_eq!(info.email, "jane@abc.com");
        assert_eq!(info.brokerage, "ABC Realty");
        assert_eq!(info.days_on_market, "9");
        assert_eq!(info.listing_price, "$450,000");
    }

    #[test]
    fn parses_branding_fallback() {
        let html = wrap_next_data(
            r#"{"props":{"pageProps":{"property":{
                "branding":[
                    {"type":"Agent","name":"bob smith","phone":"5553334444"},
                    {"type":"Office","name":"XYZ Group"}
                ]
            }}}}"#,
        );
        let info = parse_next_data(&html).unwrap().unwrap();
        assert_eq!(info.agent_name, "Bob Smith");
        assert_eq!(info.brokerage, "XYZ Group");
        assert_eq!(info.phone, "(555) 333-4444");
    }

    #[test]
    fn missing_payload_is_none() {
        assert!(parse_next_data("<html></html>").unwrap().is_none());
        let html = wrap_next_data(r#"{"props":{"pageProps":{}}}"#);
        assert!(parse_next_data(&html).unwrap().is_none());
    }

    #[test]
    fn url_construction() {
        let source = RealtorSource::new(crate::gateway::shared_http_client());
        let prop = Property {
            raw_address: "123 Main St".to_owned(),
            address_line: "123 MAIN ST".to_owned(),
            city: "SPRINGFIELD".to_owned(),
            state: "ILLINOIS".to_owned(),
            zip_code: "62704".to_owned(),
            row_index: 0,
        };
        assert_eq!(
            source.build_url(&prop).unwrap(),
            "https://www.realtor.com/realestateandhomes-detail/123-MAIN-ST_SPRINGFIELD_IL_62704"
        );

        let partial = Property {
            raw_address: "123 Main St".to_owned(),
            address_line: "123 MAIN ST".to_owned(),
            zip_code: "62704".to_owned(),
            ..Property::default()
        };
        assert_eq!(
            source.build_url(&partial).unwrap(),
            "https://www.realtor.com/realestateandhomes-detail/123-MAIN-ST_62704"
        );

        let empty = Property::default();
        assert!(source.build_url(&empty).is_none());
    }
}
