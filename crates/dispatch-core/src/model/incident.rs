// ── Incident domain type ──

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::position::Position;
use super::{Entity, EntityPatch, ids, merge_sent, sent};
use crate::store::FieldUpdate;

/// An operational incident (fire, accident, medical call, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    #[serde(default, deserialize_with = "ids::id")]
    pub id: String,
    pub status: Option<String>,
    pub label: Option<String>,
    pub address: Option<String>,
    #[serde(alias = "lat")]
    pub latitude: Option<f64>,
    #[serde(alias = "lng", alias = "lon")]
    pub longitude: Option<f64>,
    pub created_at: Option<DateTime<Utc>>,
    /// Operational phases in backend order. `None` means "not sent", which
    /// a patch must not confuse with "no phases".
    pub phases: Option<Vec<IncidentPhase>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Incident {
    pub fn position(&self) -> Option<Position> {
        Some(Position::new(self.latitude?, self.longitude?))
    }

    /// Phases as a slice, empty when none are known.
    pub fn phases(&self) -> &[IncidentPhase] {
        self.phases.as_deref().unwrap_or_default()
    }

    pub fn phase(&self, phase_id: &str) -> Option<&IncidentPhase> {
        self.phases().iter().find(|p| p.phase_id == phase_id)
    }
}

impl Entity for Incident {
    type Patch = IncidentPatch;

    fn id(&self) -> &str {
        &self.id
    }

    fn merge(&mut self, patch: IncidentPatch) {
        merge_sent!(self, patch;
            status,
            label,
            address,
            latitude,
            longitude,
            created_at,
            phases,
        );
        self.extra.extend(patch.extra);
    }
}

/// A partial [`Incident`], as carried by `incident_status_update`.
#[allow(clippy::option_option)]
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct IncidentPatch {
    #[serde(default, alias = "incident_id", deserialize_with = "ids::id")]
    pub id: String,
    #[serde(default, deserialize_with = "sent")]
    pub status: Option<Option<String>>,
    #[serde(default, deserialize_with = "sent")]
    pub label: Option<Option<String>>,
    #[serde(default, deserialize_with = "sent")]
    pub address: Option<Option<String>>,
    #[serde(default, alias = "lat", deserialize_with = "sent")]
    pub latitude: Option<Option<f64>>,
    #[serde(default, alias = "lng", alias = "lon", deserialize_with = "sent")]
    pub longitude: Option<Option<f64>>,
    #[serde(default, deserialize_with = "sent")]
    pub created_at: Option<Option<DateTime<Utc>>>,
    #[serde(default, deserialize_with = "sent")]
    pub phases: Option<Option<Vec<IncidentPhase>>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl IncidentPatch {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

impl EntityPatch for IncidentPatch {
    fn id(&self) -> &str {
        &self.id
    }
}

/// One operational phase of an incident (initial response, reinforcement, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncidentPhase {
    #[serde(default, alias = "id", deserialize_with = "ids::id")]
    pub phase_id: String,
    pub label: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An `incident_phase_update`: one phase replaced in place, or appended
/// when the incident does not know it yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseUpdate {
    pub phase: IncidentPhase,
}

impl FieldUpdate<Incident> for PhaseUpdate {
    fn is_noop(&self, current: &Incident) -> bool {
        current.phase(&self.phase.phase_id) == Some(&self.phase)
    }

    fn apply_to(self, current: &mut Incident) {
        let phases = current.phases.get_or_insert_with(Vec::new);
        match phases.iter_mut().find(|p| p.phase_id == self.phase.phase_id) {
            Some(existing) => *existing = self.phase,
            None => phases.push(self.phase),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn incident() -> Incident {
        serde_json::from_value(json!({
            "id": 7,
            "status": "open",
            "label": "Structure fire",
            "lat": 45.0,
            "lng": 5.0,
            "phases": [
                { "phase_id": "p1", "label": "Initial", "started_at": "2026-03-01T10:00:00Z" }
            ],
            "priority": 1
        }))
        .expect("valid incident")
    }

    #[test]
    fn parses_numeric_id_and_phases() {
        let inc = incident();
        assert_eq!(inc.id, "7");
        assert_eq!(inc.phases().len(), 1);
        assert_eq!(inc.extra["priority"], 1);
    }

    #[test]
    fn patch_without_phases_keeps_them() {
        let mut inc = incident();
        inc.merge(IncidentPatch {
            status: Some(Some("closed".into())),
            ..IncidentPatch::new("7")
        });
        assert_eq!(inc.status.as_deref(), Some("closed"));
        assert_eq!(inc.phases().len(), 1);
        assert_eq!(inc.label.as_deref(), Some("Structure fire"));
    }

    #[test]
    fn patch_parsed_from_wire_clears_nulls_and_keeps_extras() {
        let mut inc = incident();
        inc.address = Some("12 rue Garibaldi".into());
        let patch: IncidentPatch = serde_json::from_value(json!({
            "incident_id": "7",
            "address": null,
            "label": "Structure fire (contained)",
            "priority": 2
        }))
        .expect("valid patch");
        assert_eq!(patch.id, "7");

        inc.merge(patch);
        assert_eq!(inc.address, None);
        assert_eq!(inc.label.as_deref(), Some("Structure fire (contained)"));
        assert_eq!(inc.extra["priority"], 2);
        assert_eq!(inc.status.as_deref(), Some("open"));
    }

    #[test]
    fn phase_update_replaces_or_appends() {
        let mut inc = incident();
        let replaced = PhaseUpdate {
            phase: IncidentPhase {
                phase_id: "p1".into(),
                label: Some("Initial".into()),
                ended_at: "2026-03-01T11:00:00Z".parse().ok(),
                ..IncidentPhase::default()
            },
        };
        assert!(!replaced.is_noop(&inc));
        replaced.apply_to(&mut inc);
        assert_eq!(inc.phases().len(), 1);
        assert!(inc.phases()[0].ended_at.is_some());

        let appended = PhaseUpdate {
            phase: IncidentPhase {
                phase_id: "p2".into(),
                ..IncidentPhase::default()
            },
        };
        appended.clone().apply_to(&mut inc);
        assert_eq!(inc.phases().len(), 2);
        assert!(appended.is_noop(&inc));
    }
}
