//! Core domain model for Homepedia listings.

pub mod normalize;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "homepedia-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Dvf,
    Bienici,
    Seloger,
}

impl Source {
    pub const ALL: [Source; 3] = [Source::Dvf, Source::Bienici, Source::Seloger];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Dvf => "dvf",
            Source::Bienici => "bienici",
            Source::Seloger => "seloger",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        Self::ALL
            .into_iter()
            .find(|source| source.as_str().eq_ignore_ascii_case(value))
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Canonical property kind. Stored with its French label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PropertyType {
    House,
    Flat,
    Loft,
    Townhouse,
    Castle,
    Other(String),
}

impl PropertyType {
    pub fn from_label(label: &str) -> Self {
        match label.trim() {
            "maison" => PropertyType::House,
            "appartement" => PropertyType::Flat,
            "loft" => PropertyType::Loft,
            "maison de ville" => PropertyType::Townhouse,
            "château" => PropertyType::Castle,
            other => PropertyType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PropertyType::House => "maison",
            PropertyType::Flat => "appartement",
            PropertyType::Loft => "loft",
            PropertyType::Townhouse => "maison de ville",
            PropertyType::Castle => "château",
            PropertyType::Other(label) => label,
        }
    }
}

impl From<String> for PropertyType {
    fn from(value: String) -> Self {
        PropertyType::from_label(&value)
    }
}

impl From<PropertyType> for String {
    fn from(value: PropertyType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Canonical listing, keyed by `listing_url`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub listing_url: String,
    pub source: Source,
    pub department: String,
    pub city: String,
    pub postal_code: String,
    pub address: String,
    pub price: f64,
    pub price_per_m2: f64,
    pub surface_m2: f64,
    pub rooms: Option<i32>,
    pub bedrooms: Option<i32>,
    pub property_type: PropertyType,
    pub features: JsonValue,
    pub description: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub update_count: i32,
    pub is_active: bool,
}

impl Property {
    /// A freshly observed listing with every descriptive field empty.
    pub fn observed(listing_url: impl Into<String>, source: Source, seen_at: DateTime<Utc>) -> Self {
        Self {
            listing_url: listing_url.into(),
            source,
            department: String::new(),
            city: String::new(),
            postal_code: String::new(),
            address: String::new(),
            price: 0.0,
            price_per_m2: 0.0,
            surface_m2: 0.0,
            rooms: None,
            bedrooms: None,
            property_type: PropertyType::Other("autre".to_string()),
            features: JsonValue::Array(Vec::new()),
            description: String::new(),
            first_seen_at: seen_at,
            last_seen_at: seen_at,
            update_count: 1,
            is_active: true,
        }
    }

    /// Describes the first storage constraint this row would violate, if any.
    pub fn constraint_violation(&self) -> Option<String> {
        if self.listing_url.trim().is_empty() {
            return Some("listing_url is empty".to_string());
        }
        for (name, value) in [
            ("price", self.price),
            ("price_per_m2", self.price_per_m2),
            ("surface_m2", self.surface_m2),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Some(format!("{name} must be a finite non-negative number, got {value}"));
            }
        }
        for (name, value) in [("rooms", self.rooms), ("bedrooms", self.bedrooms)] {
            if matches!(value, Some(v) if v < 0) {
                return Some(format!("{name} must be non-negative"));
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Finished,
    Shutdown,
    AdapterFailure,
    StoreFailure,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::Finished => "finished",
            TerminationReason::Shutdown => "shutdown",
            TerminationReason::AdapterFailure => "adapter_error",
            TerminationReason::StoreFailure => "store_error",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One row of the `scraping_stats` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatistics {
    pub run_id: Uuid,
    pub source: Source,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub total_properties: u64,
    pub new_properties: u64,
    pub updated_properties: u64,
    pub failed_writes: u64,
    pub rejected_records: u64,
    pub total_pages: u64,
    pub properties_per_page: f64,
    pub time_per_property: f64,
    /// Departments (or DVF years) whose pages could not all be fetched.
    pub incomplete_departments: Vec<String>,
    pub reason: TerminationReason,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_type_labels_round_trip_through_strings() {
        for label in ["maison", "appartement", "loft", "maison de ville", "château", "studio"] {
            assert_eq!(PropertyType::from_label(label).as_str(), label);
        }
        assert_eq!(PropertyType::from_label("studio"), PropertyType::Other("studio".into()));
    }

    #[test]
    fn source_parse_is_case_insensitive() {
        assert_eq!(Source::parse("BienIci"), Some(Source::Bienici));
        assert_eq!(Source::parse(" dvf "), Some(Source::Dvf));
        assert_eq!(Source::parse("leboncoin"), None);
    }

    #[test]
    fn observed_listing_starts_active_with_one_observation() {
        let seen_at = Utc::now();
        let property = Property::observed("dvf_1_1", Source::Dvf, seen_at);
        assert_eq!(property.first_seen_at, seen_at);
        assert_eq!(property.last_seen_at, seen_at);
        assert_eq!(property.update_count, 1);
        assert!(property.is_active);
        assert!(property.constraint_violation().is_none());
    }

    #[test]
    fn constraint_violation_flags_negative_and_missing_keys() {
        let mut property = Property::observed("x", Source::Seloger, Utc::now());
        property.price = -1.0;
        assert!(property.constraint_violation().is_some());

        let property = Property::observed("  ", Source::Seloger, Utc::now());
        assert!(property.constraint_violation().is_some());
    }
}
