//! Cached entity models.
//!
//! Records mirror the remote API payloads (camelCase). Fields the client does
//! not know about are kept in `extra` so replacing a record by id never drops
//! server data.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{Collection, EntityId};

/// A record that lives in one of the cached collections.
pub trait CachedEntity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Collection the record belongs to.
    const COLLECTION: Collection;

    /// Record identifier, unique within the collection.
    fn id(&self) -> EntityId;
}

/// Reconciliation state of a trip created on this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// Waiting for the first upload attempt.
    Pending,
    /// Acknowledged by the server.
    Synced,
    /// Last upload attempt failed, will be retried.
    Error,
}

/// User-provided trip fields, as sent to the server on create.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_location_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_location_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trip_type_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A trip, either server-identified or a local draft awaiting upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trip {
    pub id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_location_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_location_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trip_type_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Created on this device and not yet acknowledged by the server.
    #[serde(default)]
    pub is_local: bool,
    /// Absent for records that came from the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_status: Option<RecordStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_attempt: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Trip {
    /// Create a local, not yet uploaded trip from a draft.
    pub fn local(id: EntityId, draft: TripDraft) -> Self {
        Self {
            id,
            start_location_id: draft.start_location_id,
            end_location_id: draft.end_location_id,
            trip_type_id: draft.trip_type_id,
            vehicle_id: draft.vehicle_id,
            started_at: draft.started_at,
            ended_at: draft.ended_at,
            distance_km: draft.distance_km,
            notes: draft.notes,
            created_at: Some(Utc::now()),
            is_local: true,
            sync_status: Some(RecordStatus::Pending),
            last_sync_attempt: None,
            sync_error: None,
            extra: draft.extra,
        }
    }

    /// User-provided fields of this trip, without identity or sync metadata.
    pub fn draft(&self) -> TripDraft {
        TripDraft {
            start_location_id: self.start_location_id,
            end_location_id: self.end_location_id,
            trip_type_id: self.trip_type_id,
            vehicle_id: self.vehicle_id,
            started_at: self.started_at,
            ended_at: self.ended_at,
            distance_km: self.distance_km,
            notes: self.notes.clone(),
            extra: self.extra.clone(),
        }
    }

    /// Whether this trip still has to be pushed to the server.
    pub fn needs_upload(&self) -> bool {
        matches!(
            self.sync_status,
            Some(RecordStatus::Pending) | Some(RecordStatus::Error)
        )
    }

    /// Record a failed upload attempt.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.sync_status = Some(RecordStatus::Error);
        self.sync_error = Some(error.into());
        self.last_sync_attempt = Some(Utc::now());
    }
}

impl CachedEntity for Trip {
    const COLLECTION: Collection = Collection::Trips;

    fn id(&self) -> EntityId {
        self.id
    }
}

/// A kind of trip (business, commute, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripType {
    pub id: EntityId,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CachedEntity for TripType {
    const COLLECTION: Collection = Collection::TripTypes;

    fn id(&self) -> EntityId {
        self.id
    }
}

/// A named place trips start or end at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationPlace {
    pub id: EntityId,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CachedEntity for LocationPlace {
    const COLLECTION: Collection = Collection::Locations;

    fn id(&self) -> EntityId {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vehicle {
    pub id: EntityId,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_plate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_type_id: Option<EntityId>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CachedEntity for Vehicle {
    const COLLECTION: Collection = Collection::Vehicles;

    fn id(&self) -> EntityId {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleType {
    pub id: EntityId,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CachedEntity for VehicleType {
    const COLLECTION: Collection = Collection::VehicleTypes;

    fn id(&self) -> EntityId {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_server_trip_has_no_sync_metadata() {
        let trip: Trip = serde_json::from_value(json!({
            "id": 17,
            "vehicleId": 3,
            "notes": "site visit",
            "odometerStart": 12000
        }))
        .unwrap();

        assert_eq!(trip.id, 17);
        assert!(!trip.is_local);
        assert!(trip.sync_status.is_none());
        assert!(!trip.needs_upload());
        assert_eq!(trip.extra.get("odometerStart"), Some(&json!(12000)));
    }

    #[test]
    fn test_unknown_fields_survive_round_trip() {
        let value = json!({ "id": 4, "name": "Van", "seats": 3 });
        let vehicle: Vehicle = serde_json::from_value(value).unwrap();
        let back = serde_json::to_value(&vehicle).unwrap();
        assert_eq!(back["seats"], json!(3));
    }

    #[test]
    fn test_local_trip_from_draft() {
        let draft = TripDraft {
            vehicle_id: Some(9),
            notes: Some("offline".to_string()),
            ..Default::default()
        };
        let trip = Trip::local(-1, draft.clone());

        assert!(trip.is_local);
        assert_eq!(trip.sync_status, Some(RecordStatus::Pending));
        assert!(trip.created_at.is_some());
        assert!(trip.needs_upload());
        assert_eq!(trip.draft(), draft);
    }

    #[test]
    fn test_mark_failed() {
        let mut trip = Trip::local(-5, TripDraft::default());
        trip.mark_failed("timeout");

        assert_eq!(trip.sync_status, Some(RecordStatus::Error));
        assert_eq!(trip.sync_error.as_deref(), Some("timeout"));
        assert!(trip.last_sync_attempt.is_some());
        assert!(trip.needs_upload());
    }

    #[test]
    fn test_draft_serializes_without_sync_fields() {
        let trip = Trip::local(-2, TripDraft { trip_type_id: Some(1), ..Default::default() });
        let body = serde_json::to_value(trip.draft()).unwrap();

        assert_eq!(body, json!({ "tripTypeId": 1 }));
    }

    #[test]
    fn test_status_wire_format() {
        assert_eq!(serde_json::to_string(&RecordStatus::Pending).unwrap(), "\"pending\"");
    }
}
