// ── Vehicle domain type ──

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::position::Position;
use super::{Entity, EntityPatch, ids, merge_sent, sent};
use crate::store::FieldUpdate;

/// A response vehicle as mirrored from the backend.
///
/// `immatriculation` (the registration plate) is the natural key that some
/// position feeds use instead of the backend id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    #[serde(default, deserialize_with = "ids::id")]
    pub id: String,
    pub immatriculation: Option<String>,
    #[serde(alias = "lat")]
    pub latitude: Option<f64>,
    #[serde(alias = "lng", alias = "lon")]
    pub longitude: Option<f64>,
    /// Operational status label (e.g. "available", "en route").
    pub status: Option<String>,
    pub position_updated_at: Option<DateTime<Utc>>,
    pub status_updated_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "ids::opt_id")]
    pub assigned_incident_id: Option<String>,
    #[serde(default, deserialize_with = "ids::opt_id")]
    pub assigned_phase_id: Option<String>,
    /// Every other field the backend sends.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Vehicle {
    /// Current reported position, if both coordinates are known.
    pub fn position(&self) -> Option<Position> {
        Some(Position::new(self.latitude?, self.longitude?))
    }
}

impl Entity for Vehicle {
    type Patch = VehiclePatch;

    fn id(&self) -> &str {
        &self.id
    }

    fn secondary_key(&self) -> Option<&str> {
        self.immatriculation.as_deref().filter(|k| !k.is_empty())
    }

    fn merge(&mut self, patch: VehiclePatch) {
        merge_sent!(self, patch;
            immatriculation,
            latitude,
            longitude,
            status,
            position_updated_at,
            status_updated_at,
            assigned_incident_id,
            assigned_phase_id,
        );
        self.extra.extend(patch.extra);
    }
}

/// A partial [`Vehicle`]. See [`EntityPatch`] for the field states.
#[allow(clippy::option_option)]
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct VehiclePatch {
    #[serde(default, alias = "vehicle_id", deserialize_with = "ids::id")]
    pub id: String,
    #[serde(default, deserialize_with = "sent")]
    pub immatriculation: Option<Option<String>>,
    #[serde(default, alias = "lat", deserialize_with = "sent")]
    pub latitude: Option<Option<f64>>,
    #[serde(default, alias = "lng", alias = "lon", deserialize_with = "sent")]
    pub longitude: Option<Option<f64>>,
    #[serde(default, deserialize_with = "sent")]
    pub status: Option<Option<String>>,
    #[serde(default, deserialize_with = "sent")]
    pub position_updated_at: Option<Option<DateTime<Utc>>>,
    #[serde(default, deserialize_with = "sent")]
    pub status_updated_at: Option<Option<DateTime<Utc>>>,
    #[serde(default, deserialize_with = "ids::sent_id")]
    pub assigned_incident_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "ids::sent_id")]
    pub assigned_phase_id: Option<Option<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl VehiclePatch {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

impl EntityPatch for VehiclePatch {
    fn id(&self) -> &str {
        &self.id
    }
}

fn same_coordinate(current: Option<f64>, incoming: f64) -> bool {
    current.is_some_and(|c| (c - incoming).abs() <= f64::EPSILON)
}

// ── Narrow high-frequency updates ────────────────────────────────────

/// A `vehicle_position_update`: new coordinates plus report time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionUpdate {
    pub position: Position,
    pub at: Option<DateTime<Utc>>,
}

impl FieldUpdate<Vehicle> for PositionUpdate {
    fn is_noop(&self, current: &Vehicle) -> bool {
        same_coordinate(current.latitude, self.position.latitude)
            && same_coordinate(current.longitude, self.position.longitude)
            && (self.at.is_none() || self.at == current.position_updated_at)
    }

    fn apply_to(self, current: &mut Vehicle) {
        current.latitude = Some(self.position.latitude);
        current.longitude = Some(self.position.longitude);
        if self.at.is_some() {
            current.position_updated_at = self.at;
        }
    }
}

/// A `vehicle_status_update`: new status label plus change time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: String,
    pub at: Option<DateTime<Utc>>,
}

impl FieldUpdate<Vehicle> for StatusUpdate {
    fn is_noop(&self, current: &Vehicle) -> bool {
        current.status.as_deref() == Some(self.status.as_str())
            && (self.at.is_none() || self.at == current.status_updated_at)
    }

    fn apply_to(self, current: &mut Vehicle) {
        current.status = Some(self.status);
        if self.at.is_some() {
            current.status_updated_at = self.at;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn vehicle() -> Vehicle {
        serde_json::from_value(json!({
            "id": "v1",
            "immatriculation": "AB-123-CD",
            "lat": 45.75,
            "lng": 4.85,
            "status": "available",
            "callsign": "VSAV 12"
        }))
        .expect("valid vehicle")
    }

    #[test]
    fn deserializes_short_coordinate_names_and_keeps_extra() {
        let v = vehicle();
        assert_eq!(v.position(), Some(Position::new(45.75, 4.85)));
        assert_eq!(v.extra["callsign"], "VSAV 12");
        assert_eq!(v.secondary_key(), Some("AB-123-CD"));
    }

    #[test]
    fn numeric_ids_are_stringified() {
        let v: Vehicle = serde_json::from_value(json!({ "id": 42 })).expect("valid");
        assert_eq!(v.id, "42");
    }

    #[test]
    fn merge_keeps_fields_absent_from_patch() {
        let mut v = vehicle();
        v.merge(VehiclePatch {
            status: Some(Some("en route".into())),
            ..VehiclePatch::new("v1")
        });
        assert_eq!(v.status.as_deref(), Some("en route"));
        assert_eq!(v.latitude, Some(45.75));
        assert_eq!(v.extra["callsign"], "VSAV 12");
    }

    #[test]
    fn explicit_null_in_patch_clears_the_field() {
        let mut v = vehicle();
        v.assigned_incident_id = Some("I1".into());
        v.assigned_phase_id = Some("p1".into());

        let patch: VehiclePatch = serde_json::from_value(json!({
            "id": "v1",
            "assigned_incident_id": null,
            "assigned_phase_id": null,
            "lat": null
        }))
        .expect("valid patch");
        assert_eq!(patch.assigned_incident_id, Some(None));
        assert_eq!(patch.status, None);

        v.merge(patch);
        assert_eq!(v.assigned_incident_id, None);
        assert_eq!(v.assigned_phase_id, None);
        assert_eq!(v.latitude, None);
        assert_eq!(v.longitude, Some(4.85));
        assert_eq!(v.status.as_deref(), Some("available"));
    }

    #[test]
    fn position_update_is_noop_only_when_unchanged() {
        let mut v = vehicle();
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).single();
        v.position_updated_at = at;

        let same = PositionUpdate {
            position: Position::new(45.75, 4.85),
            at,
        };
        assert!(same.is_noop(&v));

        let later = PositionUpdate {
            position: Position::new(45.75, 4.85),
            at: Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 5).single(),
        };
        assert!(!later.is_noop(&v));

        let moved = PositionUpdate {
            position: Position::new(45.76, 4.85),
            at: None,
        };
        assert!(!moved.is_noop(&v));
    }

    #[test]
    fn status_update_sets_label_and_time() {
        let mut v = vehicle();
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).single();
        let update = StatusUpdate {
            status: "on scene".into(),
            at,
        };
        assert!(!update.is_noop(&v));
        update.apply_to(&mut v);
        assert_eq!(v.status.as_deref(), Some("on scene"));
        assert_eq!(v.status_updated_at, at);
    }
}
