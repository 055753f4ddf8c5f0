use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::warn;

use crate::backend::Row;
use crate::geo::is_plausible;
use crate::models::order::DriverId;
use crate::models::position::DriverPosition;
use crate::sync::normalize::normalize_position;

const ONLINE_WINDOW_MINUTES: i64 = 5;

#[derive(Debug, Clone, Serialize)]
pub struct FleetEntry {
    #[serde(flatten)]
    pub position: DriverPosition,
    pub online: bool,
}

/// Dispatcher's view of where every driver is.
#[derive(Default)]
pub struct FleetBoard {
    drivers: DashMap<DriverId, DriverPosition>,
}

impl FleetBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or merges a driver row. An implausible point never replaces a
    /// good one; a cleared point (logout) does.
    pub fn apply_upsert(&self, row: &Row) {
        let incoming = match normalize_position(row) {
            Ok(position) => position,
            Err(err) => {
                warn!(error = %err, "ignoring unreadable driver row");
                return;
            }
        };

        let cleared = incoming.point.is_none();
        let usable = incoming.point.filter(is_plausible);

        self.drivers
            .entry(incoming.driver_id)
            .and_modify(|known| {
                if usable.is_some() || cleared {
                    known.point = usable;
                }
                if incoming.name.is_some() {
                    known.name = incoming.name.clone();
                }
                known.heading = incoming.heading;
                known.last_signal = incoming.last_signal;
            })
            .or_insert_with(|| DriverPosition {
                point: usable,
                ..incoming.clone()
            });
    }

    pub fn apply_delete(&self, row: &Row) {
        if let Ok(position) = normalize_position(row) {
            self.drivers.remove(&position.driver_id);
        }
    }

    pub fn get(&self, driver_id: DriverId) -> Option<DriverPosition> {
        self.drivers.get(&driver_id).map(|entry| entry.value().clone())
    }

    pub fn list(&self, now: DateTime<Utc>) -> Vec<FleetEntry> {
        let window = ChronoDuration::minutes(ONLINE_WINDOW_MINUTES);
        let mut entries: Vec<FleetEntry> = self
            .drivers
            .iter()
            .map(|entry| {
                let position = entry.value().clone();
                let online = position
                    .last_signal
                    .is_some_and(|signal| now - signal <= window);
                FleetEntry { position, online }
            })
            .collect();
        entries.sort_by_key(|entry| entry.position.driver_id.0);
        entries
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::backend::row;
    use crate::models::position::GeoPoint;

    #[test]
    fn zero_point_keeps_last_good_position() {
        let board = FleetBoard::new();
        board.apply_upsert(&row([("id", json!(1)), ("lat", json!(-27.5)), ("lng", json!(-48.5))]));
        board.apply_upsert(&row([("id", json!(1)), ("lat", json!(0)), ("lng", json!(0))]));

        assert_eq!(
            board.get(DriverId(1)).unwrap().point,
            Some(GeoPoint::new(-27.5, -48.5))
        );
    }

    #[test]
    fn cleared_point_removes_marker() {
        let board = FleetBoard::new();
        board.apply_upsert(&row([("id", json!(1)), ("latitude", json!(-27.5)), ("longitude", json!(-48.5))]));
        board.apply_upsert(&row([("id", json!(1)), ("lat", json!(null)), ("lng", json!(null))]));

        assert_eq!(board.get(DriverId(1)).unwrap().point, None);
    }

    #[test]
    fn online_means_signal_within_five_minutes() {
        let board = FleetBoard::new();
        let now = Utc::now();
        board.apply_upsert(&row([
            ("id", json!(1)),
            ("last_signal", json!((now - ChronoDuration::minutes(2)).to_rfc3339())),
        ]));
        board.apply_upsert(&row([
            ("id", json!(2)),
            ("last_signal", json!((now - ChronoDuration::minutes(9)).to_rfc3339())),
        ]));

        let online: Vec<bool> = board.list(now).iter().map(|e| e.online).collect();
        assert_eq!(online, vec![true, false]);
    }

    #[test]
    fn delete_drops_driver() {
        let board = FleetBoard::new();
        board.apply_upsert(&row([("id", json!(1))]));
        board.apply_delete(&row([("id", json!(1))]));
        assert!(board.get(DriverId(1)).is_none());
    }
}
