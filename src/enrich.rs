//! Contact enrichment — fills in phone/email when the waterfall produced
//! an agent name without a contact channel.
//!
//! Two strategies, in order: fetch the agent-search page of a recognized
//! national brokerage and mine it for contact patterns, then fall back to
//! guessing `first.last@<brokerage-domain>` where the domain is known.
//! Guessed emails are best-effort and should be verified before outreach.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::gateway::{rotating_headers, HeaderKind, SharedHttpClient};
use crate::models::AgentInfo;
use crate::normalize::{clean_email, clean_phone};

// Agent-search pages for the national franchises, keyed by a substring of
// the brokerage name.
const NATIONAL_BROKERAGES: &[(&str, &str)] = &[
    ("keller williams", "https://www.kw.com/agent/search?q="),
    ("coldwell banker", "https://www.coldwellbanker.com/agent/search?q="),
    ("re/max", "https://www.remax.com/real-estate-agents/search?q="),
    ("century 21", "https://www.century21.com/real-estate-agents/search?q="),
    ("compass", "https://www.compass.com/agents/?q="),
    ("sotheby", "https://www.sothebysrealty.com/eng/associates?q="),
    ("exp realty", "https://www.exprealty.com/agents.html?search="),
    ("berkshire hathaway", "https://www.bhhs.com/agent-search?q="),
];

// Known email domains per franchise, for the pattern guess.
const BROKERAGE_DOMAINS: &[(&str, &str)] = &[
    ("keller williams", "kw.com"),
    ("coldwell banker", "cbexchange.com"),
    ("re/max", "remax.net"),
    ("century 21", "century21.com"),
    ("compass", "compass.com"),
    ("sotheby", "sothebysrealty.com"),
    ("exp realty", "exprealty.com"),
    ("berkshire hathaway", "bhhsmail.com"),
    ("douglas elliman", "elliman.com"),
];

// Mailbox prefixes that are never an individual agent.
const SKIP_EMAIL_PREFIXES: &[&str] = &[
    "info@",
    "support@",
    "admin@",
    "webmaster@",
    "noreply@",
    "contact@",
];

static PHONE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}").unwrap());
static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").unwrap());
static NON_ALPHA: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z]").unwrap());

/// Attempt to fill in missing phone/email for an agent. Never fails; on
/// any trouble the input comes back unchanged.
pub async fn enrich_contact_info(
    agent_info: &AgentInfo,
    client: &SharedHttpClient,
) -> AgentInfo {
    if agent_info.is_complete() {
        return agent_info.clone();
    }

    let mut enriched = agent_info.clone();

    // Strategy 1: the brokerage's own agent search.
    if !agent_info.brokerage.is_empty()
        && (agent_info.phone.is_empty() || agent_info.email.is_empty())
    {
        if let Some((phone, email)) =
            search_brokerage_site(&agent_info.agent_name, &agent_info.brokerage, client)
                .await
        {
            if enriched.phone.is_empty() && !phone.is_empty() {
                enriched.phone = clean_phone(&phone);
            }
            if enriched.email.is_empty() && !email.is_empty() {
                enriched.email = clean_email(&email);
            }
        }
    }

    // Strategy 2: guess the standard franchise email pattern.
    if enriched.email.is_empty() && !agent_info.brokerage.is_empty() {
        enriched.email = guess_email(&agent_info.agent_name, &agent_info.brokerage);
    }

    let gained = (!enriched.phone.is_empty() && agent_info.phone.is_empty())
        || (!enriched.email.is_empty() && agent_info.email.is_empty());
    if gained {
        enriched.source = format!("{}+enriched", agent_info.source);
    }

    enriched
}

async fn search_brokerage_site(
    agent_name: &str,
    brokerage: &str,
    client: &SharedHttpClient,
) -> Option<(String, String)> {
    let brokerage_lower = brokerage.to_lowercase();
    let search_url = NATIONAL_BROKERAGES
        .iter()
        .find(|(key, _)| brokerage_lower.contains(key))
        .map(|(_, url)| *url)?;

    let url = format!("{}{}", search_url, agent_name.replace(' ', "+"));
    let response = client
        .get(&url)
        .headers(rotating_headers(HeaderKind::Browser))
        .timeout(Duration::from_secs(15))
        .send()
        .await;

    match response {
        Ok(response) if response.status().as_u16() == 200 => {
            let html = response.text().await.ok()?;
            extract_contact_from_html(&html)
        }
        Ok(_) => None,
        Err(err) => {
            debug!("brokerage search failed for {:?}: {}", agent_name, err);
            None
        }
    }
}

/// Pull the first phone and the first non-boilerplate email out of a page.
fn extract_contact_from_html(html: &str) -> Option<(String, String)> {
    let phone = PHONE
        .find(html)
        .map(|m| m.as_str().to_owned())
        .unwrap_or_default();

    let mut email = String::new();
    for m in EMAIL.find_iter(html) {
        let candidate = m.as_str().to_lowercase();
        if !SKIP_EMAIL_PREFIXES
            .iter()
            .any(|skip| candidate.starts_with(skip))
        {
            email = candidate;
            break;
        }
    }

    if phone.is_empty() && email.is_empty() {
        None
    } else {
        Some((phone, email))
    }
}

/// Guess `first.last@domain` for the known franchises.
fn guess_email(agent_name: &str, brokerage: &str) -> String {
    let parts: Vec<&str> = agent_name.split_whitespace().collect();
    if parts.len() < 2 {
        return String::new();
    }
    let first = NON_ALPHA
        .replace_all(&parts[0].to_lowercase(), "")
        .into_owned();
    let last = NON_ALPHA
        .replace_all(&parts[parts.len() - 1].to_lowercase(), "")
        .into_owned();
    if first.is_empty() || last.is_empty() {
        return String::new();
    }

    let brokerage_lower = brokerage.to_lowercase();
    let domain = BROKERAGE_DOMAINS
        .iter()
        .find(|(key, _)| brokerage_lower.contains(key))
        .map(|(_, domain)| *domain);

    match domain {
        Some(domain) => format!("{}.{}@{}", first, last, domain),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_guessing_uses_known_domains() {
        assert_eq!(
            guess_email("Jane Doe", "Keller Williams Phoenix"),
            "jane.doe@kw.com"
        );
        assert_eq!(
            guess_email("Bob J. Smith", "Douglas Elliman Real Estate"),
            "bob.smith@elliman.com"
        );
        assert_eq!(guess_email("Jane Doe", "Local Boutique Realty"), "");
        assert_eq!(guess_email("Cher", "Compass"), "");
    }

    #[test]
    fn html_extraction_skips_boilerplate_mailboxes() {
        let html = r#"<div>
            Call us: (555) 111-2222
            <a href="mailto:info@kw.com">info@kw.com</a>
            <a href="mailto:jane.doe@kw.com">jane.doe@kw.com</a>
        </div>"#;
        let (phone, email) = extract_contact_from_html(html).unwrap();
        assert_eq!(phone, "(555) 111-2222");
        assert_eq!(email, "jane.doe@kw.com");

        assert!(extract_contact_from_html("<p>nothing here</p>").is_none());
    }
}
