//! Listing-agent source adapters.
//!
//! Every adapter implements [`AgentSource`]: given one property, return
//! agent info or `None`. Adapters return `Ok(None)` when the upstream
//! answered but had nothing for us, and an error only for transport
//! failures, blocks, CAPTCHAs, or payloads we cannot parse at all. They
//! are idempotent and side-effect-free, and every network call goes
//! through the source's [`Gateway`](crate::gateway::Gateway).

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde_json::Value;

use crate::errors::FetchError;
use crate::models::{AgentInfo, Property};

pub mod google;
pub mod harvest;
pub mod redfin;
pub mod realtor;
pub mod zillow;

/// Abstract listing-agent lookup interface.
#[async_trait]
pub trait AgentSource: Send + Sync + 'static {
    /// Short source name used in provenance tags and circuit-breaker keys.
    fn name(&self) -> &str;

    /// Look up the listing agent for one property.
    async fn search(&self, prop: &Property) -> Result<Option<AgentInfo>, FetchError>;
}

/// Extract the embedded `__NEXT_DATA__` JSON payload from an HTML page.
///
/// Returns `None` when the script tag is absent (site variant without the
/// payload), and a schema error when the tag exists but its JSON is
/// unparseable.
pub(crate) fn next_data_json(html: &str) -> Result<Option<Value>, FetchError> {
    let document = Html::parse_document(html);
    let selector =
        Selector::parse("script#__NEXT_DATA__").expect("static selector parses");
    let Some(script) = document.select(&selector).next() else {
        return Ok(None);
    };
    let raw = script.text().collect::<String>();
    if raw.trim().is_empty() {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(&raw)?;
    Ok(Some(value))
}

/// First `href` matching a CSS selector, if any.
pub(crate) fn first_href(html: &str, css: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse(css).ok()?;
    document
        .select(&selector)
        .next()
        .and_then(|el| el.value().attr("href"))
        .map(|href| href.to_owned())
}

/// Every `href` matching any of the given CSS selectors, deduplicated in
/// document order. Selectors are tried as fallbacks: the first one that
/// matches anything wins.
pub(crate) fn hrefs_by_selectors(html: &str, selectors: &[&str]) -> Vec<String> {
    let document = Html::parse_document(html);
    for css in selectors {
        let Ok(selector) = Selector::parse(css) else {
            continue;
        };
        let mut seen = std::collections::HashSet::new();
        let hrefs: Vec<String> = document
            .select(&selector)
            .filter_map(|el| el.value().attr("href"))
            .filter(|href| !href.is_empty() && seen.insert((*href).to_owned()))
            .map(|href| href.to_owned())
            .collect();
        if !hrefs.is_empty() {
            return hrefs;
        }
    }
    vec![]
}

/// Navigate a JSON value by object keys, returning a string leaf or "".
pub(crate) fn json_str(value: &Value, path: &[&str]) -> String {
    let mut current = value;
    for key in path {
        match current.get(key) {
            Some(next) => current = next,
            None => return String::new(),
        }
    }
    json_leaf_to_string(current)
}

/// Render a JSON leaf as the string the scrapers want: strings pass
/// through, numbers stringify, everything else is "".
pub(crate) fn json_leaf_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

/// Recursively search a JSON tree for the first non-empty value under
/// `key`, depth-capped. The listing sites restructure their payloads
/// often enough that fixed paths need this as a fallback.
pub(crate) fn deep_find<'a>(value: &'a Value, key: &str, max_depth: u32) -> Option<&'a Value> {
    if max_depth == 0 {
        return None;
    }
    match value {
        Value::Object(map) => {
            if let Some(found) = map.get(key) {
                let non_empty = match found {
                    Value::String(s) => !s.is_empty(),
                    Value::Null => false,
                    _ => true,
                };
                if non_empty {
                    return Some(found);
                }
            }
            map.values()
                .find_map(|v| deep_find(v, key, max_depth - 1))
        }
        Value::Array(items) => items
            .iter()
            .find_map(|item| deep_find(item, key, max_depth - 1)),
        _ => None,
    }
}

/// Format a raw price value as `$1,234,567`. Non-numeric inputs pass
/// through as their string form.
pub(crate) fn format_price(value: &Value) -> String {
    let as_int = match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f as i64),
        _ => None,
    };
    match as_int {
        Some(n) => format!("${}", thousands(n)),
        None => json_leaf_to_string(value),
    }
}

fn thousands(n: i64) -> String {
    let digits = n.abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    if n < 0 {
        format!("-{}", grouped)
    } else {
        grouped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn next_data_extraction() {
        let html = r#"<html><body>
            <script id="__NEXT_DATA__" type="application/json">{"props":{"ok":true}}</script>
        </body></html>"#;
        let value = next_data_json(html).unwrap().unwrap();
        assert_eq!(value["props"]["ok"], json!(true));

        assert!(next_data_json("<html></html>").unwrap().is_none());
        assert!(next_data_json(
            r#"<script id="__NEXT_DATA__">{broken</script>"#
        )
        .is_err());
    }

    #[test]
    fn href_selection_falls_back_across_selectors() {
        let html = r#"<div><h3><a href="/listing/1">one</a></h3>
                      <h3><a href="/listing/2">two</a></h3>
                      <h3><a href="/listing/1">dup</a></h3></div>"#;
        let hrefs = hrefs_by_selectors(html, &["a[href*='/nope/']", "h3 a"]);
        assert_eq!(hrefs, vec!["/listing/1", "/listing/2"]);
    }

    #[test]
    fn deep_find_skips_empty_strings() {
        let value = json!({
            "a": {"agentName": ""},
            "b": [{"c": {"agentName": "Jane Doe"}}],
        });
        let found = deep_find(&value, "agentName", 10).unwrap();
        assert_eq!(found, &json!("Jane Doe"));
        assert!(deep_find(&value, "missing", 10).is_none());
    }

    #[test]
    fn price_formatting() {
        assert_eq!(format_price(&json!(450000)), "$450,000");
        assert_eq!(format_price(&json!(1234567)), "$1,234,567");
        assert_eq!(format_price(&json!("999")), "$999");
        assert_eq!(format_price(&json!("call for price")), "call for price");
    }
}
