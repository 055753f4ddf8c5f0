use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::order::DriverId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// A single location sample as delivered by the device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Fix {
    pub point: GeoPoint,
    #[serde(default)]
    pub heading: Option<f64>,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriverPosition {
    pub driver_id: DriverId,
    pub name: Option<String>,
    pub point: Option<GeoPoint>,
    pub heading: Option<f64>,
    pub last_signal: Option<DateTime<Utc>>,
}
