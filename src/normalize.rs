//! Address canonicalization and the string cleanup helpers shared by every
//! scraper.
//!
//! `normalize_address` output is load-bearing: it is both the cache key and
//! the primary search query, so the rewrite rules must be stable across
//! releases or existing caches are silently invalidated.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::Property;

/// Street suffix rewrites, longest-established USPS abbreviations.
pub const STREET_SUFFIXES: &[(&str, &str)] = &[
    ("STREET", "ST"),
    ("AVENUE", "AVE"),
    ("BOULEVARD", "BLVD"),
    ("DRIVE", "DR"),
    ("LANE", "LN"),
    ("ROAD", "RD"),
    ("COURT", "CT"),
    ("CIRCLE", "CIR"),
    ("PLACE", "PL"),
    ("TERRACE", "TER"),
    ("WAY", "WAY"),
    ("TRAIL", "TRL"),
    ("PARKWAY", "PKWY"),
    ("HIGHWAY", "HWY"),
];

const DIRECTIONALS: &[(&str, &str)] = &[
    // Compounds first so NORTH does not eat the NORTH in NORTHEAST.
    ("NORTHEAST", "NE"),
    ("NORTHWEST", "NW"),
    ("SOUTHEAST", "SE"),
    ("SOUTHWEST", "SW"),
    ("NORTH", "N"),
    ("SOUTH", "S"),
    ("EAST", "E"),
    ("WEST", "W"),
];

const STATE_ABBREVS: &[(&str, &str)] = &[
    ("ALABAMA", "AL"),
    ("ALASKA", "AK"),
    ("ARIZONA", "AZ"),
    ("ARKANSAS", "AR"),
    ("CALIFORNIA", "CA"),
    ("COLORADO", "CO"),
    ("CONNECTICUT", "CT"),
    ("DELAWARE", "DE"),
    ("FLORIDA", "FL"),
    ("GEORGIA", "GA"),
    ("HAWAII", "HI"),
    ("IDAHO", "ID"),
    ("ILLINOIS", "IL"),
    ("INDIANA", "IN"),
    ("IOWA", "IA"),
    ("KANSAS", "KS"),
    ("KENTUCKY", "KY"),
    ("LOUISIANA", "LA"),
    ("MAINE", "ME"),
    ("MARYLAND", "MD"),
    ("MASSACHUSETTS", "MA"),
    ("MICHIGAN", "MI"),
    ("MINNESOTA", "MN"),
    ("MISSISSIPPI", "MS"),
    ("MISSOURI", "MO"),
    ("MONTANA", "MT"),
    ("NEBRASKA", "NE"),
    ("NEVADA", "NV"),
    ("NEW HAMPSHIRE", "NH"),
    ("NEW JERSEY", "NJ"),
    ("NEW MEXICO", "NM"),
    ("NEW YORK", "NY"),
    ("NORTH CAROLINA", "NC"),
    ("NORTH DAKOTA", "ND"),
    ("OHIO", "OH"),
    ("OKLAHOMA", "OK"),
    ("OREGON", "OR"),
    ("PENNSYLVANIA", "PA"),
    ("RHODE ISLAND", "RI"),
    ("SOUTH CAROLINA", "SC"),
    ("SOUTH DAKOTA", "SD"),
    ("TENNESSEE", "TN"),
    ("TEXAS", "TX"),
    ("UTAH", "UT"),
    ("VERMONT", "VT"),
    ("VIRGINIA", "VA"),
    ("WASHINGTON", "WA"),
    ("WEST VIRGINIA", "WV"),
    ("WISCONSIN", "WI"),
    ("WYOMING", "WY"),
    ("DISTRICT OF COLUMBIA", "DC"),
];

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

fn word_rewrites(table: &[(&str, &str)]) -> Vec<(Regex, String)> {
    table
        .iter()
        .map(|(full, abbr)| {
            (
                Regex::new(&format!(r"\b{}\b", full)).unwrap(),
                (*abbr).to_owned(),
            )
        })
        .collect()
}

static UNIT_REWRITES: Lazy<Vec<(Regex, String)>> = Lazy::new(|| {
    word_rewrites(&[
        ("SUITE", "STE"),
        ("APARTMENT", "APT"),
        ("BUILDING", "BLDG"),
        ("FLOOR", "FL"),
    ])
});

// Name prefixes rewrite before street suffixes: SAINT -> ST must happen
// while STREET is still spelled out, or ST STREET inputs go wrong.
static PREFIX_REWRITES: Lazy<Vec<(Regex, String)>> = Lazy::new(|| {
    word_rewrites(&[("MOUNT", "MT"), ("SAINT", "ST"), ("FORT", "FT")])
});

static DIRECTIONAL_REWRITES: Lazy<Vec<(Regex, String)>> =
    Lazy::new(|| word_rewrites(DIRECTIONALS));

static SUFFIX_REWRITES: Lazy<Vec<(Regex, String)>> =
    Lazy::new(|| word_rewrites(STREET_SUFFIXES));

/// Canonicalize a free-form U.S. address.
///
/// Uppercase, collapse whitespace, strip periods, expand `#` to `APT`, then
/// rewrite unit designators, name prefixes, directionals, and street
/// suffixes, in that order. Canonical output is a fixed point of this
/// function.
pub fn normalize_address(address: &str) -> String {
    if address.is_empty() {
        return String::new();
    }

    let mut addr = address.to_uppercase().trim().to_owned();
    addr = WHITESPACE.replace_all(&addr, " ").into_owned();
    addr = addr.replace('.', "").replace('#', "APT ");

    for (re, abbr) in UNIT_REWRITES.iter() {
        addr = re.replace_all(&addr, abbr.as_str()).into_owned();
    }
    for (re, abbr) in PREFIX_REWRITES.iter() {
        addr = re.replace_all(&addr, abbr.as_str()).into_owned();
    }
    for (re, abbr) in DIRECTIONAL_REWRITES.iter() {
        addr = re.replace_all(&addr, abbr.as_str()).into_owned();
    }
    for (re, abbr) in SUFFIX_REWRITES.iter() {
        addr = re.replace_all(&addr, abbr.as_str()).into_owned();
    }

    // The `#` expansion can introduce doubled spaces; collapse once more so
    // canonical output is a fixed point.
    WHITESPACE.replace_all(&addr, " ").trim().to_owned()
}

/// Convert a full state name to its 2-letter abbreviation. Already-short
/// and unknown inputs pass through uppercased.
pub fn normalize_state(state: &str) -> String {
    if state.is_empty() {
        return String::new();
    }
    let upper = state.to_uppercase().trim().to_owned();
    if upper.len() == 2 {
        return upper;
    }
    STATE_ABBREVS
        .iter()
        .find(|(full, _)| *full == upper)
        .map(|(_, abbr)| (*abbr).to_owned())
        .unwrap_or(upper)
}

static UNIT_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\s*(APT|APARTMENT|STE|SUITE|UNIT|BLDG|BUILDING|FL|FLOOR|#)\s*\S+")
        .unwrap()
});

static LEADING_STREET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+\s+\S+(?:\s+\S+)?)").unwrap());

fn join_with_components(line: &str, prop: &Property) -> String {
    let mut parts = vec![line.to_owned()];
    for p in [&prop.city, &prop.state, &prop.zip_code] {
        if !p.is_empty() {
            parts.push(p.clone());
        }
    }
    parts.join(", ")
}

/// Query variants for a single source's search, tried in order:
/// the canonical form, the unit-stripped form, and one suffix swap
/// (abbreviated back to the spelled-out word). At most three.
pub fn query_variants(prop: &Property) -> Vec<String> {
    let mut variants = vec![prop.search_query()];

    let addr = if prop.address_line.is_empty() {
        &prop.raw_address
    } else {
        &prop.address_line
    };

    // Variant: strip unit/apt tokens.
    let stripped = UNIT_TOKEN.replace_all(addr, "").trim().to_owned();
    if !stripped.is_empty() && stripped != *addr {
        let variant = join_with_components(&stripped, prop);
        if !variants.contains(&variant) {
            variants.push(variant);
        }
    }

    // Variant: swap one abbreviated suffix back to its full spelling.
    let addr_upper = addr.to_uppercase();
    for (full, abbr) in STREET_SUFFIXES {
        let has = addr_upper.contains(&format!(" {} ", abbr))
            || addr_upper.ends_with(&format!(" {}", abbr));
        if has {
            let full_title = title_case(full);
            let re = Regex::new(&format!(r"(?i)\b{}\b", abbr)).unwrap();
            let alt = re.replace_all(addr, full_title.as_str()).into_owned();
            if alt != *addr {
                let variant = join_with_components(&alt, prop);
                if !variants.contains(&variant) {
                    variants.push(variant);
                }
            }
            // Only try one suffix swap.
            break;
        }
    }

    variants.truncate(3);
    variants
}

/// Simplified variants for the second retry pass over not-found rows:
/// unit-stripped, then just street number + name + ZIP.
pub fn retry_variants(prop: &Property) -> Vec<String> {
    let mut variants = vec![];
    let addr = if prop.address_line.is_empty() {
        &prop.raw_address
    } else {
        &prop.address_line
    };

    let stripped = UNIT_TOKEN.replace_all(addr, "").trim().to_owned();
    if !stripped.is_empty() && stripped != *addr {
        variants.push(join_with_components(&stripped, prop));
    }

    if !prop.zip_code.is_empty() {
        if let Some(m) = LEADING_STREET.captures(addr) {
            let simple = format!("{}, {}", &m[1], prop.zip_code);
            if !variants.contains(&simple) {
                variants.push(simple);
            }
        }
    }

    variants
}

fn title_case(word: &str) -> String {
    let lower = word.to_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

static NON_DIGIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\D").unwrap());

/// Normalize a phone number to `(XXX) XXX-XXXX`. Inputs that don't have
/// ten digits (after dropping a leading 1) pass through trimmed.
pub fn clean_phone(phone: &str) -> String {
    if phone.is_empty() {
        return String::new();
    }
    let mut digits = NON_DIGIT.replace_all(phone, "").into_owned();
    if digits.len() == 11 && digits.starts_with('1') {
        digits.remove(0);
    }
    if digits.len() == 10 {
        format!("({}) {}-{}", &digits[..3], &digits[3..6], &digits[6..])
    } else {
        phone.trim().to_owned()
    }
}

static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").unwrap()
});

/// Validate and lowercase an email address; anything that doesn't look
/// like one becomes empty.
pub fn clean_email(email: &str) -> String {
    if email.is_empty() {
        return String::new();
    }
    let email = email.trim().to_lowercase();
    if EMAIL.is_match(&email) {
        email
    } else {
        String::new()
    }
}

static DRE_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s*DRE\s*#?\s*\d+").unwrap());
static LICENSE_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s*(?:lic|license)\s*#?\s*\d+").unwrap());

/// Clean up an agent name: strip license numbers, title-case the rest.
pub fn clean_name(name: &str) -> String {
    if name.is_empty() {
        return String::new();
    }
    let mut name = name.trim().to_owned();
    name = DRE_NUMBER.replace_all(&name, "").into_owned();
    name = LICENSE_NUMBER.replace_all(&name, "").into_owned();
    name.split_whitespace()
        .map(title_case)
        .collect::<Vec<_>>()
        .join(" ")
}

static NON_LETTER: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-zA-Z\s]").unwrap());

// Professional designations that routinely trail agent names on listings.
const NAME_DESIGNATIONS: &[&str] = &[
    "jr", "sr", "iii", "ii", "iv", "pa", "gri", "crs", "abr", "srs", "crb",
    "green", "epro", "rea",
];

fn normalize_name_for_comparison(name: &str) -> String {
    let mut n = NON_LETTER
        .replace_all(name, "")
        .trim()
        .to_lowercase();
    for suffix in NAME_DESIGNATIONS {
        let re = Regex::new(&format!(r"\b{}\b", suffix)).unwrap();
        n = re.replace_all(&n, "").into_owned();
    }
    WHITESPACE.replace_all(&n, " ").trim().to_owned()
}

/// Fuzzy agent-name comparison: equal after normalization, or an
/// edit-distance ratio of at least `threshold` on a 0-100 scale.
pub fn names_match(name1: &str, name2: &str) -> bool {
    names_match_threshold(name1, name2, 85)
}

pub fn names_match_threshold(name1: &str, name2: &str, threshold: u32) -> bool {
    if name1.is_empty() || name2.is_empty() {
        return false;
    }
    let n1 = normalize_name_for_comparison(name1);
    let n2 = normalize_name_for_comparison(name2);
    if n1 == n2 {
        return true;
    }
    let ratio = strsim::normalized_levenshtein(&n1, &n2) * 100.0;
    ratio >= threshold as f64
}

// Corporate suffixes dropped before comparing brokerage names.
const BROKERAGE_SUFFIXES: &[&str] = &[
    "LLC",
    "INC",
    "CORP",
    "CORPORATION",
    "CO",
    "COMPANY",
    "GROUP",
    "ASSOCIATES",
    "REALTORS",
];

const BRAND_ALIASES: &[(&str, &str)] = &[
    ("KW", "KELLER WILLIAMS"),
    ("BHHS", "BERKSHIRE HATHAWAY"),
    ("CB", "COLDWELL BANKER"),
    ("C21", "CENTURY 21"),
];

/// Normalize a brokerage name for comparison: drop corporate suffixes and
/// expand the common franchise abbreviations.
pub fn normalize_brokerage(name: &str) -> String {
    if name.is_empty() {
        return String::new();
    }
    let mut n = name.to_uppercase().trim().to_owned();
    for suffix in BROKERAGE_SUFFIXES {
        let re = Regex::new(&format!(r"\b{}\b\.?", suffix)).unwrap();
        n = re.replace_all(&n, "").into_owned();
    }
    for (alias, full) in BRAND_ALIASES {
        let re = Regex::new(&format!(r"^{}\b", alias)).unwrap();
        if re.is_match(&n) {
            n = re.replace(&n, *full).into_owned();
        }
    }
    WHITESPACE.replace_all(&n, " ").trim().to_owned()
}

/// Compute days-on-market from a listing date string. Handles the date
/// formats the listing sites actually emit plus raw epoch stamps; returns
/// an empty string when nothing parses.
pub fn compute_days_on_market(date_str: &str) -> String {
    use chrono::{Local, NaiveDate, NaiveDateTime};

    let date_str = date_str.trim();
    if date_str.is_empty() {
        return String::new();
    }
    let truncated: String = date_str.chars().take(26).collect();
    let now = Local::now().naive_local();

    let date_formats = ["%Y-%m-%d", "%m/%d/%Y", "%m-%d-%Y", "%b %d, %Y"];
    for fmt in date_formats {
        if let Ok(parsed) = NaiveDate::parse_from_str(&truncated, fmt) {
            let days = (now.date() - parsed).num_days().max(0);
            return days.to_string();
        }
    }

    let datetime_formats = [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M:%SZ",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.fZ",
    ];
    for fmt in datetime_formats {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(&truncated, fmt) {
            let days = (now - parsed).num_days().max(0);
            return days.to_string();
        }
    }

    // Epoch seconds or milliseconds.
    if let Ok(mut ts) = date_str.parse::<i64>() {
        if ts > 1_000_000_000_000 {
            ts /= 1000;
        }
        if let Some(parsed) = chrono::DateTime::from_timestamp(ts, 0) {
            let days = (now - parsed.naive_local()).num_days().max(0);
            return days.to_string();
        }
    }

    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_applies_rewrites_in_order() {
        // SAINT -> ST must run before STREET -> ST.
        assert_eq!(
            normalize_address("123 Saint James Street"),
            "123 ST JAMES ST"
        );
        assert_eq!(
            normalize_address("456  north MAIN avenue."),
            "456 N MAIN AVE"
        );
        assert_eq!(normalize_address("789 Oak Blvd #12"), "789 OAK BLVD APT 12");
        assert_eq!(
            normalize_address("10 Mount Vernon Boulevard, Suite 4"),
            "10 MT VERNON BLVD, STE 4"
        );
    }

    #[test]
    fn normalize_is_idempotent_on_canonical_output() {
        for raw in [
            "123 Saint James Street",
            "456 Oak Ave APT 3B, Boston, MA",
            "789 northwest Elm Terrace # 2",
        ] {
            let once = normalize_address(raw);
            assert_eq!(normalize_address(&once), once);
        }
    }

    #[test]
    fn compound_directionals_survive() {
        assert_eq!(
            normalize_address("12 Northwest Pine Road"),
            "12 NW PINE RD"
        );
    }

    #[test]
    fn state_normalization() {
        assert_eq!(normalize_state("Illinois"), "IL");
        assert_eq!(normalize_state("il"), "IL");
        assert_eq!(normalize_state("Puerto Rico"), "PUERTO RICO");
        assert_eq!(normalize_state(""), "");
    }

    fn prop(line: &str, city: &str, state: &str, zip: &str) -> Property {
        Property {
            raw_address: line.to_owned(),
            address_line: line.to_owned(),
            city: city.to_owned(),
            state: state.to_owned(),
            zip_code: zip.to_owned(),
            row_index: 0,
        }
    }

    #[test]
    fn query_variants_strip_units_and_swap_suffixes() {
        let p = prop("456 OAK AVE APT 3B", "BOSTON", "MA", "");
        let variants = query_variants(&p);
        assert_eq!(variants.len(), 3);
        assert_eq!(variants[0], "456 OAK AVE APT 3B, BOSTON, MA");
        assert_eq!(variants[1], "456 OAK AVE, BOSTON, MA");
        assert_eq!(variants[2], "456 OAK Avenue APT 3B, BOSTON, MA");
    }

    #[test]
    fn query_variants_cap_at_three() {
        let p = prop("456 OAK AVE STE 9", "BOSTON", "MA", "02134");
        assert!(query_variants(&p).len() <= 3);
    }

    #[test]
    fn retry_variants_prefer_unit_strip_then_street_number() {
        let p = prop("456 OAK AVE APT 3B", "BOSTON", "MA", "02134");
        let variants = retry_variants(&p);
        assert_eq!(variants[0], "456 OAK AVE, BOSTON, MA, 02134");
        assert_eq!(variants[1], "456 OAK AVE, 02134");
    }

    #[test]
    fn phone_cleanup() {
        assert_eq!(clean_phone("5551112222"), "(555) 111-2222");
        assert_eq!(clean_phone("1-555-111-2222"), "(555) 111-2222");
        assert_eq!(clean_phone("(555) 111-2222"), "(555) 111-2222");
        assert_eq!(clean_phone("ext 12"), "ext 12");
    }

    #[test]
    fn email_cleanup() {
        assert_eq!(clean_email(" Jane.Doe@KW.com "), "jane.doe@kw.com");
        assert_eq!(clean_email("not-an-email"), "");
    }

    #[test]
    fn name_cleanup_strips_license_numbers() {
        assert_eq!(clean_name("JANE DOE DRE# 012345"), "Jane Doe");
        assert_eq!(clean_name("jane doe lic #99"), "Jane Doe");
    }

    #[test]
    fn fuzzy_name_matching() {
        assert!(names_match("Jane Doe", "jane doe"));
        assert!(names_match("Jane Doe GRI", "Jane Doe"));
        assert!(names_match("Jane Doe", "Jane Does"));
        assert!(!names_match("Jane Doe", "Robert Smith"));
        assert!(!names_match("", "Jane Doe"));
    }

    #[test]
    fn brokerage_normalization() {
        assert_eq!(
            normalize_brokerage("KW Phoenix LLC"),
            "KELLER WILLIAMS PHOENIX"
        );
        assert_eq!(
            normalize_brokerage("Keller Williams Phoenix"),
            "KELLER WILLIAMS PHOENIX"
        );
    }

    #[test]
    fn days_on_market_from_dates() {
        assert_eq!(compute_days_on_market(""), "");
        assert_eq!(compute_days_on_market("not a date"), "");
        // A date far in the past parses to a large positive number.
        let days: i64 = compute_days_on_market("2000-01-01").parse().unwrap();
        assert!(days > 8000);
        // Future dates clamp to zero.
        assert_eq!(compute_days_on_market("2999-01-01"), "0");
    }
}
