//! Common utilities and types shared across tripsync crates.
//!
//! This module provides the error type, the collection catalogue and the
//! cached entity models that the cache and sync layers agree on.

pub mod error;
pub mod model;
pub mod types;

pub use error::{Error, Result};
pub use model::{
    CachedEntity, LocationPlace, RecordStatus, Trip, TripDraft, TripType, Vehicle, VehicleType,
};
pub use types::{Collection, EntityId};
