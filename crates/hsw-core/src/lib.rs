//! Core domain model for HSW: tracked records, statuses, and change events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "hsw-core";

/// Entity type recorded on allocation batch events.
pub const ENTITY_ALLOCATION: &str = "allocation";
/// Entity type recorded on delivery batch events.
pub const ENTITY_DELIVERY_BATCH: &str = "delivery_batch";
/// Entity type recorded on failed ingestion runs.
pub const ENTITY_INGEST: &str = "ingest";
/// Sentinel entity id for batch-level events.
pub const BATCH_ENTITY_ID: &str = "bulk";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStatus {
    Conditional,
    Confirmed,
}

impl AllocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conditional => "conditional",
            Self::Confirmed => "confirmed",
        }
    }
}

impl std::str::FromStr for AllocationStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conditional" => Ok(Self::Conditional),
            "confirmed" => Ok(Self::Confirmed),
            other => Err(ValidationError::UnknownStatus {
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Planned,
    Shipped,
    Received,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Shipped => "shipped",
            Self::Received => "received",
        }
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planned" => Ok(Self::Planned),
            "shipped" => Ok(Self::Shipped),
            "received" => Ok(Self::Received),
            other => Err(ValidationError::UnknownStatus {
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("quantity must be positive, got {0}")]
    NonPositiveQuantity(f64),
    #[error("unknown status `{value}`")]
    UnknownStatus { value: String },
}

/// Incoming allocation payload: everything but the server-assigned timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationUpsert {
    pub id: String,
    pub allocated_to: String,
    pub kg: f64,
    pub status: AllocationStatus,
    #[serde(default)]
    pub allocation_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub delivery_window_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub delivery_window_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub source_doc_id: Option<String>,
}

impl AllocationUpsert {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::MissingField("id"));
        }
        if self.allocated_to.trim().is_empty() {
            return Err(ValidationError::MissingField("allocated_to"));
        }
        if !(self.kg > 0.0) {
            return Err(ValidationError::NonPositiveQuantity(self.kg));
        }
        Ok(())
    }
}

/// Persisted allocation row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: String,
    pub allocated_to: String,
    pub kg: f64,
    pub status: AllocationStatus,
    pub allocation_date: Option<DateTime<Utc>>,
    pub delivery_window_start: Option<DateTime<Utc>>,
    pub delivery_window_end: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub source_doc_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryBatchUpsert {
    pub id: String,
    pub allocation_id: String,
    pub kg: f64,
    pub status: DeliveryStatus,
    #[serde(default)]
    pub shipped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl DeliveryBatchUpsert {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::MissingField("id"));
        }
        if self.allocation_id.trim().is_empty() {
            return Err(ValidationError::MissingField("allocation_id"));
        }
        if !(self.kg > 0.0) {
            return Err(ValidationError::NonPositiveQuantity(self.kg));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryBatch {
    pub id: String,
    pub allocation_id: String,
    pub kg: f64,
    pub status: DeliveryStatus,
    pub shipped_at: Option<DateTime<Utc>>,
    pub received_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit entry describing what an ingestion run or import did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: String,
    pub change_json: serde_json::Value,
    pub actor: String,
    pub occurred_at: DateTime<Utc>,
}

/// Registry metadata for one external data origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRow {
    pub id: String,
    pub name: String,
    pub url: String,
    pub kind: String,
}

/// Bulk import envelope: either a bare record or `{"items": [...]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BulkUpsert<T> {
    Bulk { items: Vec<T> },
    Single(T),
}

impl<T> BulkUpsert<T> {
    pub fn into_items(self) -> Vec<T> {
        match self {
            Self::Single(item) => vec![item],
            Self::Bulk { items } => items,
        }
    }
}

/// Lowercase a display name into a stable slug: `NuScale Power` -> `nuscale-power`.
pub fn slugify(name: &str) -> String {
    name.to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Deterministic id for a hub-page selection. Repeated parses of the same
/// recipient in the same round collide to the same id, which is what makes
/// upserts idempotent across runs.
pub fn hub_allocation_id(round: u8, recipient: &str) -> String {
    format!("doe-r{round}-{}", slugify(recipient))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocation(id: &str, kg: f64) -> AllocationUpsert {
        AllocationUpsert {
            id: id.to_string(),
            allocated_to: "X-energy".to_string(),
            kg,
            status: AllocationStatus::Conditional,
            allocation_date: None,
            delivery_window_start: None,
            delivery_window_end: None,
            notes: None,
            source_doc_id: None,
        }
    }

    #[test]
    fn slug_is_deterministic_and_collapses_punctuation() {
        assert_eq!(slugify("NuScale Power"), "nuscale-power");
        assert_eq!(slugify("  TerraPower,  LLC. "), "terrapower-llc");
        assert_eq!(slugify("NuScale Power"), slugify("NuScale Power"));
        assert_eq!(hub_allocation_id(2, "Ultra Safe Nuclear"), "doe-r2-ultra-safe-nuclear");
    }

    #[test]
    fn validation_rejects_non_positive_quantity() {
        assert!(allocation("a", 100.0).validate().is_ok());
        assert!(matches!(
            allocation("a", 0.0).validate(),
            Err(ValidationError::NonPositiveQuantity(_))
        ));
        assert!(matches!(
            allocation("a", -3.5).validate(),
            Err(ValidationError::NonPositiveQuantity(_))
        ));
        assert!(matches!(
            allocation("", 10.0).validate(),
            Err(ValidationError::MissingField("id"))
        ));
    }

    #[test]
    fn status_round_trips_through_strings() {
        use std::str::FromStr;
        assert_eq!(AllocationStatus::from_str("confirmed").unwrap(), AllocationStatus::Confirmed);
        assert_eq!(AllocationStatus::Conditional.as_str(), "conditional");
        assert!(AllocationStatus::from_str("cancelled").is_err());
        assert_eq!(DeliveryStatus::from_str("shipped").unwrap(), DeliveryStatus::Shipped);
    }

    #[test]
    fn bulk_envelope_accepts_single_and_items_shapes() {
        let single: BulkUpsert<AllocationUpsert> = serde_json::from_value(serde_json::json!({
            "id": "doe-2024-001",
            "allocated_to": "X-energy",
            "kg": 1200.0,
            "status": "confirmed"
        }))
        .unwrap();
        assert_eq!(single.into_items().len(), 1);

        let bulk: BulkUpsert<AllocationUpsert> = serde_json::from_value(serde_json::json!({
            "items": [
                {"id": "a", "allocated_to": "TerraPower", "kg": 850.0, "status": "conditional"},
                {"id": "b", "allocated_to": "Kairos Power", "kg": 750.0, "status": "conditional"}
            ]
        }))
        .unwrap();
        let items = bulk.into_items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "a");
    }
}
