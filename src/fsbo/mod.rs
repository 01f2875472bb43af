//! For-sale-by-owner discovery: models, area scrapers, the concurrent
//! aggregator, and the search/listings store.

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

pub mod pipeline;
pub mod scrapers;
pub mod store;

/// How the `location` field should be read.
#[derive(Clone, Copy, Debug, Display, EnumString, Eq, PartialEq, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LocationType {
    /// One or more ZIP codes, comma separated.
    Zip,
    /// A "City, ST" pair.
    CityState,
}

/// Search parameters submitted by the user.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FsboSearchCriteria {
    /// "85001", "85001,85002", or "Phoenix, AZ".
    pub location: String,
    pub location_type: LocationType,
    #[serde(default = "default_radius")]
    pub radius_miles: u32,
    #[serde(default)]
    pub min_price: Option<i64>,
    #[serde(default)]
    pub max_price: Option<i64>,
    #[serde(default)]
    pub min_beds: Option<u32>,
    #[serde(default)]
    pub min_baths: Option<f64>,
    /// "single_family" | "condo" | "multi_family" | "land".
    #[serde(default)]
    pub property_type: Option<String>,
    #[serde(default)]
    pub max_days_on_market: Option<i64>,
}

fn default_radius() -> u32 {
    25
}

impl FsboSearchCriteria {
    pub fn for_location(location: &str, location_type: LocationType) -> FsboSearchCriteria {
        FsboSearchCriteria {
            location: location.to_owned(),
            location_type,
            radius_miles: default_radius(),
            min_price: None,
            max_price: None,
            min_beds: None,
            min_baths: None,
            property_type: None,
            max_days_on_market: None,
        }
    }

    /// The single location token sources that can't handle lists should
    /// use: the first ZIP, or the location as given.
    pub fn primary_location(&self) -> String {
        match self.location_type {
            LocationType::Zip => self
                .location
                .split(',')
                .next()
                .unwrap_or("")
                .trim()
                .to_owned(),
            LocationType::CityState => self.location.trim().to_owned(),
        }
    }
}

/// How much owner contact a listing carries.
#[derive(
    Clone, Copy, Debug, Display, EnumString, Eq, PartialEq, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ContactStatus {
    /// Name, phone, and email.
    Complete,
    /// Name plus one channel.
    Partial,
    PhoneOnly,
    /// The source hides contact behind a relay on principle.
    Anonymous,
    None,
}

/// A single FSBO listing result.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FsboListing {
    pub address: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
    pub price: Option<i64>,
    pub beds: Option<u32>,
    pub baths: Option<f64>,
    pub sqft: Option<u32>,
    pub property_type: Option<String>,
    pub days_on_market: Option<i64>,
    pub owner_name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub listing_url: String,
    pub source: String,
    pub contact_status: ContactStatus,
}

impl FsboListing {
    /// Derive `contact_status` from the populated fields. The `Anonymous`
    /// status is never derived; sources assign it directly.
    pub fn compute_contact_status(&self) -> ContactStatus {
        let has = |field: &Option<String>| {
            field
                .as_ref()
                .map(|value| !value.trim().is_empty())
                .unwrap_or(false)
        };
        let has_name = has(&self.owner_name);
        let has_phone = has(&self.phone);
        let has_email = has(&self.email);

        if has_name && has_phone && has_email {
            ContactStatus::Complete
        } else if has_name && (has_phone || has_email) {
            ContactStatus::Partial
        } else if has_phone && !has_email {
            ContactStatus::PhoneOnly
        } else {
            ContactStatus::None
        }
    }

    /// Merge another source's copy of the same listing into this one,
    /// receiver-wins, recomputing the contact status afterwards.
    pub fn merge(&self, other: &FsboListing) -> FsboListing {
        fn pick<T: Clone>(ours: &Option<T>, theirs: &Option<T>) -> Option<T> {
            ours.clone().or_else(|| theirs.clone())
        }

        let mut merged = FsboListing {
            owner_name: pick(&self.owner_name, &other.owner_name),
            phone: pick(&self.phone, &other.phone),
            email: pick(&self.email, &other.email),
            price: pick(&self.price, &other.price),
            beds: pick(&self.beds, &other.beds),
            baths: pick(&self.baths, &other.baths),
            sqft: pick(&self.sqft, &other.sqft),
            property_type: pick(&self.property_type, &other.property_type),
            days_on_market: pick(&self.days_on_market, &other.days_on_market),
            source: if other.source.is_empty() || other.source == self.source {
                self.source.clone()
            } else {
                format!("{}+{}", self.source, other.source)
            },
            ..self.clone()
        };
        merged.contact_status = merged.compute_contact_status();
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn contact_status_derivation() {
        let mut l = listing("123 Main St", "fsbo.com");
        assert_eq!(l.compute_contact_status(), ContactStatus::None);

        l.phone = Some("(555) 111-2222".to_owned());
        assert_eq!(l.compute_contact_status(), ContactStatus::PhoneOnly);

        l.owner_name = Some("Pat Owner".to_owned());
        assert_eq!(l.compute_contact_status(), ContactStatus::Partial);

        l.email = Some("pat@example.com".to_owned());
        assert_eq!(l.compute_contact_status(), ContactStatus::Complete);
    }

    #[test]
    fn merge_fills_missing_and_recomputes_status() {
        let mut a = listing("123 Main St, Phoenix, AZ 85001", "fsbo.com");
        a.price = Some(250_000);
        a.owner_name = Some("Pat Owner".to_owned());

        let mut b = listing("123 Main St, Phoenix, AZ 85001", "zillow_fsbo");
        b.price = Some(260_000);
        b.phone = Some("(555) 111-2222".to_owned());

        let merged = a.merge(&b);
        // Receiver wins on conflicts, absorbs what it lacked.
        assert_eq!(merged.price, Some(250_000));
        assert_eq!(merged.phone.as_deref(), Some("(555) 111-2222"));
        assert_eq!(merged.source, "fsbo.com+zillow_fsbo");
        assert_eq!(merged.contact_status, ContactStatus::Partial);
    }

    #[test]
    fn criteria_primary_location() {
        let criteria =
            FsboSearchCriteria::for_location("85001,85002", LocationType::Zip);
        assert_eq!(criteria.primary_location(), "85001");
        let criteria =
            FsboSearchCriteria::for_location("Phoenix, AZ", LocationType::CityState);
        assert_eq!(criteria.primary_location(), "Phoenix, AZ");
    }

    #[test]
    fn criteria_deserializes_with_defaults() {
        let criteria: FsboSearchCriteria = serde_json::from_str(
            r#"{"location": "85001", "location_type": "zip", "max_price": 300000}"#,
        )
        .unwrap();
        assert_eq!(criteria.radius_miles, 25);
        assert_eq!(criteria.max_price, Some(300_000));
        assert_eq!(criteria.min_beds, None);
    }
}
