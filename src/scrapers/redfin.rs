//! Redfin Stingray API adapter — the primary agent source.
//!
//! Three-step dance: location autocomplete resolves the property's URL
//! path, `initialInfo` turns that into property/listing ids, and
//! `belowTheFold` carries the agent attribution. Stingray responses are
//! the literal bytes `{}&&` followed by JSON; strip the prefix before
//! parsing.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::config::{REDFIN, REDFIN_BASE_URL, REDFIN_STINGRAY_BASE};
use crate::errors::FetchError;
use crate::gateway::{Gateway, HeaderKind, SharedHttpClient};
use crate::models::{AgentInfo, Property};
use crate::normalize::{clean_name, clean_phone, compute_days_on_market, query_variants};
use crate::scrapers::{format_price, json_leaf_to_string, json_str, AgentSource};

pub struct RedfinSource {
    gateway: Gateway,
}

impl RedfinSource {
    pub fn new(client: SharedHttpClient) -> RedfinSource {
        RedfinSource {
            gateway: Gateway::new(REDFIN, client),
        }
    }

    async fn search_property(&self, query: &str) -> Result<Option<String>, FetchError> {
        let url = format!("{}/do/location-autocomplete", REDFIN_STINGRAY_BASE);
        let params = [
            ("location", query.to_owned()),
            ("start", "0".to_owned()),
            ("count", "5".to_owned()),
            ("v", "2".to_owned()),
            ("al", "1".to_owned()),
            ("iss", "false".to_owned()),
            ("ooa", "true".to_owned()),
            ("mrs", "false".to_owned()),
        ];
        let page = self
            .gateway
            .get(&url, HeaderKind::Api, Some(REDFIN_BASE_URL), &params)
            .await?;
        if !page.is_ok() {
            return Ok(None);
        }

        let data = parse_stingray(&page.text)?;
        let payload = &data["payload"];

        let exact_url = json_str(payload, &["exactMatch", "url"]);
        if !exact_url.is_empty() {
            return Ok(Some(exact_url));
        }

        // Fall back to the sectioned results; row type "1" is an address.
        if let Some(sections) = payload.get("sections").and_then(Value::as_array) {
            for section in sections {
                if let Some(rows) = section.get("rows").and_then(Value::as_array) {
                    for row in rows {
                        let row_type = json_str(row, &["type"]);
                        let url = json_str(row, &["url"]);
                        if row_type == "1" && !url.is_empty() {
                            return Ok(Some(url));
                        }
                    }
                }
            }
        }

        Ok(None)
    }

    async fn get_ids(
        &self,
        url_path: &str,
    ) -> Result<(Option<String>, Option<String>), FetchError> {
        let url = format!("{}/api/home/details/initialInfo", REDFIN_STINGRAY_BASE);
        let params = [("path", url_path.to_owned())];
        let referer = format!("{}{}", REDFIN_BASE_URL, url_path);
        let page = self
            .gateway
            .get(&url, HeaderKind::Api, Some(&referer), &params)
            .await?;
        if !page.is_ok() {
            return Ok((None, None));
        }

        let data = parse_stingray(&page.text)?;
        let payload = &data["payload"];
        let property_id = non_empty(json_leaf_to_string(&payload["propertyId"]));
        let listing_id = non_empty(json_leaf_to_string(&payload["listingId"]));
        Ok((property_id, listing_id))
    }

    async fn get_agent_details(
        &self,
        property_id: &str,
        listing_id: Option<&str>,
        url_path: &str,
    ) -> Result<Option<AgentInfo>, FetchError> {
        let url = format!("{}/api/home/details/belowTheFold", REDFIN_STINGRAY_BASE);
        let mut params = vec![("propertyId", property_id.to_owned())];
        if let Some(listing_id) = listing_id {
            params.push(("listingId", listing_id.to_owned()));
        }
        let page = self
            .gateway
            .get(&url, HeaderKind::Api, Some(REDFIN_BASE_URL), &params)
            .await?;
        if !page.is_ok() {
            return Ok(None);
        }

        let data = parse_stingray(&page.text)?;
        Ok(extract_agent_from_payload(&data["payload"], url_path))
    }
}

#[async_trait]
impl AgentSource for RedfinSource {
    fn name(&self) -> &str {
        self.gateway.source_name()
    }

    async fn search(&self, prop: &Property) -> Result<Option<AgentInfo>, FetchError> {
        let mut last_error: Option<FetchError> = None;
        let mut saw_clean_miss = false;

        for query in query_variants(prop) {
            let attempt = async {
                let Some(url_path) = self.search_property(&query).await? else {
                    return Ok(None);
                };
                let (property_id, listing_id) = self.get_ids(&url_path).await?;
                let Some(property_id) = property_id else {
                    return Ok(None);
                };
                self.get_agent_details(&property_id, listing_id.as_deref(), &url_path)
                    .await
            };

            match attempt.await {
                Ok(Some(agent_info)) => return Ok(Some(agent_info)),
                Ok(None) => saw_clean_miss = true,
                // Block-class failures apply to every variant equally;
                // stop early so the engine can count them.
                Err(err @ (FetchError::Blocked | FetchError::RateLimited | FetchError::Captcha)) => {
                    return Err(err)
                }
                Err(err) => {
                    debug!("redfin variant {:?} failed: {}", query, err);
                    last_error = Some(err);
                }
            }
        }

        if saw_clean_miss {
            Ok(None)
        } else if let Some(err) = last_error {
            Err(err)
        } else {
            Ok(None)
        }
    }
}

/// Strip the `{}&&` anti-hijacking prefix and parse the remainder.
fn parse_stingray(text: &str) -> Result<Value, FetchError> {
    let stripped = text.strip_prefix("{}&&").unwrap_or(text);
    Ok(serde_json::from_str(stripped)?)
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Probe every known payload location for agent attribution, in order of
/// how often Redfin actually populates them.
fn extract_agent_from_payload(payload: &Value, url_path: &str) -> Option<AgentInfo> {
    let mut agent_name = String::new();
    let mut brokerage = String::new();
    let mut phone = String::new();
    let mut list_date = String::new();
    let mut days_on_market = String::new();

    // Path 1: listingBroker (most common for active listings).
    let broker_info = &payload["listingBroker"];
    if broker_info.is_object() {
        agent_name = json_str(broker_info, &["listingAgentName"]);
        brokerage = or_field(broker_info, &["brokerName", "listingBrokerName"]);
        phone = or_field(broker_info, &["listingAgentPhone", "brokerPhone"]);
        list_date = json_str(broker_info, &["listingDate"]);
    }

    // Path 2: propertyHistoryInfo events of type Listed.
    if agent_name.is_empty() {
        if let Some(event) = listed_event(payload) {
            agent_name = json_str(event, &["listingAgentName"]);
            brokerage = json_str(event, &["listingBrokerName"]);
            if list_date.is_empty() {
                list_date = json_str(event, &["eventDate"]);
            }
        }
    }

    // Listed events carry the list date even when the agent came from
    // somewhere else.
    if list_date.is_empty() {
        if let Some(event) = listed_event(payload) {
            list_date = json_str(event, &["eventDate"]);
        }
    }

    // Path 3: mainHouseInfo.
    let main_info = &payload["mainHouseInfo"];
    if agent_name.is_empty() {
        agent_name = json_str(main_info, &["listingAgentName"]);
        brokerage = json_str(main_info, &["listingBrokerName"]);
    }
    if days_on_market.is_empty() {
        days_on_market = or_field(main_info, &["daysOnMarket", "timeOnRedfin"]);
    }

    // Path 4: publicRecordsInfo.
    if agent_name.is_empty() {
        let pr_info = &payload["publicRecordsInfo"];
        agent_name = json_str(pr_info, &["listingAgentName"]);
        brokerage = json_str(pr_info, &["listingBrokerName"]);
    }

    // Path 5: aboveTheFoldInfo, directly or via its nested listingBroker.
    if agent_name.is_empty() {
        let atf = &payload["aboveTheFoldInfo"];
        agent_name = json_str(atf, &["listingAgentName"]);
        brokerage = json_str(atf, &["listingBrokerName"]);
        if agent_name.is_empty() {
            let atf_broker = &atf["listingBroker"];
            if atf_broker.is_object() {
                agent_name = json_str(atf_broker, &["listingAgentName"]);
                brokerage = json_str(atf_broker, &["brokerName"]);
            }
        }
    }

    // Path 6: root-level listingAgent.
    if agent_name.is_empty() {
        let listing_agent = &payload["listingAgent"];
        if listing_agent.is_object() {
            agent_name = or_field(listing_agent, &["name", "agentName"]);
            if phone.is_empty() {
                phone = json_str(listing_agent, &["phone"]);
            }
            if brokerage.is_empty() {
                brokerage = json_str(listing_agent, &["officeName"]);
            }
        }
    }

    if agent_name.is_empty() {
        return None;
    }

    if days_on_market.is_empty() && !list_date.is_empty() {
        days_on_market = compute_days_on_market(&list_date);
    }

    let listing_price = price_from_payload(payload);
    let listing_url = if url_path.is_empty() {
        String::new()
    } else {
        format!("{}{}", REDFIN_BASE_URL, url_path)
    };

    Some(AgentInfo {
        agent_name: clean_name(&agent_name),
        brokerage: brokerage.trim().to_owned(),
        phone: clean_phone(&phone),
        email: String::new(),
        source: "redfin".to_owned(),
        listing_url,
        list_date,
        days_on_market,
        listing_price,
    })
}

fn listed_event(payload: &Value) -> Option<&Value> {
    payload["propertyHistoryInfo"]["events"]
        .as_array()?
        .iter()
        .find(|event| {
            matches!(
                event["eventType"].as_str(),
                Some("Listed") | Some("listed") | Some("Listing")
            )
        })
}

fn or_field(value: &Value, keys: &[&str]) -> String {
    for key in keys {
        let found = json_str(value, &[key]);
        if !found.is_empty() {
            return found;
        }
    }
    String::new()
}

fn price_from_payload(payload: &Value) -> String {
    let candidates = [
        &payload["listingPrice"],
        &payload["price"],
        &payload["mainHouseInfo"]["listingPrice"],
        &payload["mainHouseInfo"]["price"],
        &payload["aboveTheFoldInfo"]["price"],
        &payload["aboveTheFoldInfo"]["listingPrice"],
    ];
    for candidate in candidates {
        if !candidate.is_null() {
            let formatted = format_price(candidate);
            if !formatted.is_empty() {
                return formatted;
            }
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stingray_prefix_is_stripped() {
        let parsed = parse_stingray(r#"{}&&{"payload":{"propertyId":42}}"#).unwrap();
        assert_eq!(parsed["payload"]["propertyId"], json!(42));
        // Plain JSON (no prefix) also parses.
        assert!(parse_stingray(r#"{"payload":{}}"#).is_ok());
        assert!(parse_stingray("{}&&not json").is_err());
    }

    #[test]
    fn agent_from_listing_broker_path() {
        let payload = json!({
            "listingBroker": {
                "listingAgentName": "JANE DOE",
                "brokerName": "ABC Realty",
                "listingAgentPhone": "5551112222",
                "listingDate": "2024-01-15",
            },
            "mainHouseInfo": {"daysOnMarket": 12},
            "listingPrice": 450000,
        });
        let info = extract_agent_from_payload(&payload, "/IL/Springfield/123-Main-St").unwrap();
        assert_eq!(info.agent_name, "Jane Doe");
        assert_eq!(info.brokerage, "ABC Realty");
        assert_eq!(info.phone, "(555) 111-2222");
        assert_eq!(info.days_on_market, "12");
        assert_eq!(info.listing_price, "$450,000");
        assert_eq!(info.source, "redfin");
        assert!(info.listing_url.ends_with("/IL/Springfield/123-Main-St"));
    }

    #[test]
    fn agent_from_history_events() {
        let payload = json!({
            "propertyHistoryInfo": {
                "events": [
                    {"eventType": "Sold", "listingAgentName": "WRONG"},
                    {
                        "eventType": "Listed",
                        "listingAgentName": "bob smith",
                        "listingBrokerName": "XYZ Group",
                        "eventDate": "2000-01-01",
                    },
                ],
            },
        });
        let info = extract_agent_from_payload(&payload, "").unwrap();
        assert_eq!(info.agent_name, "Bob Smith");
        assert_eq!(info.brokerage, "XYZ Group");
        // DOM computed from the listing date when not given directly.
        let dom: i64 = info.days_on_market.parse().unwrap();
        assert!(dom > 8000);
    }

    #[test]
    fn missing_agent_is_none() {
        assert!(extract_agent_from_payload(&json!({}), "").is_none());
        assert!(extract_agent_from_payload(
            &json!({"mainHouseInfo": {"daysOnMarket": 3}}),
            ""
        )
        .is_none());
    }
}
