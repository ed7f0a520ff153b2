//! Common types used throughout tripsync.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a cached record.
///
/// Server-assigned ids are strictly positive; ids of records created while
/// offline are negative.
pub type EntityId = i64;

/// A cached reference-data collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Collection {
    Trips,
    Locations,
    TripTypes,
    Vehicles,
    VehicleTypes,
}

impl Collection {
    /// Every cached collection, in fetch order.
    pub const ALL: [Collection; 5] = [
        Collection::Trips,
        Collection::Locations,
        Collection::TripTypes,
        Collection::Vehicles,
        Collection::VehicleTypes,
    ];

    /// Wire name of the collection.
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Trips => "trips",
            Collection::Locations => "locations",
            Collection::TripTypes => "tripTypes",
            Collection::Vehicles => "vehicles",
            Collection::VehicleTypes => "vehicleTypes",
        }
    }

    /// Name of the server content hash covering this collection.
    ///
    /// Vehicle types have no hash of their own and ride along with vehicles.
    pub fn hash_key(&self) -> &'static str {
        match self {
            Collection::VehicleTypes => Collection::Vehicles.as_str(),
            other => other.as_str(),
        }
    }

    /// Collections covered by a server hash key, empty for keys that are not
    /// cached locally (e.g. `profile`).
    pub fn for_hash_key(key: &str) -> Vec<Collection> {
        Self::ALL
            .iter()
            .copied()
            .filter(|c| c.hash_key() == key)
            .collect()
    }

    /// Distinct hash keys of the cached collections.
    pub fn hash_keys() -> Vec<&'static str> {
        let mut keys: Vec<&'static str> = Self::ALL.iter().map(|c| c.hash_key()).collect();
        keys.dedup();
        keys
    }

    /// SQL-friendly table / object store name.
    pub fn table_name(&self) -> &'static str {
        match self {
            Collection::Trips => "trips",
            Collection::Locations => "locations",
            Collection::TripTypes => "trip_types",
            Collection::Vehicles => "vehicles",
            Collection::VehicleTypes => "vehicle_types",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Collection {
    type Err = crate::Error;

    /// Accepts the wire name or the table name.
    fn from_str(s: &str) -> crate::Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s || c.table_name() == s)
            .ok_or_else(|| crate::Error::InvalidInput(format!("Unknown collection: {}", s)))
    }
}
