// ── Event routing ──
//
// Maps each consumed stream event onto the store operation it implies.
// Handlers are synchronous: the store mutation happens in the delivery
// turn, publication follows on the store's own timer.

use tracing::trace;

use crate::error::CoreError;
use crate::model::{
    DispatchEvent, Incident, IncidentPatch, PhaseUpdate, ProposalPayload, StreamEvent, Vehicle,
};
use crate::store::{LookupKey, ProposalAggregator, ReconciliationStore};

/// Applies typed stream events to the console's stores.
#[derive(Debug, Clone)]
pub struct EventRouter {
    incidents: ReconciliationStore<Incident>,
    vehicles: ReconciliationStore<Vehicle>,
    proposals: ProposalAggregator,
}

impl EventRouter {
    pub fn new(
        incidents: ReconciliationStore<Incident>,
        vehicles: ReconciliationStore<Vehicle>,
        proposals: ProposalAggregator,
    ) -> Self {
        Self {
            incidents,
            vehicles,
            proposals,
        }
    }

    /// Apply `event`. Returns whether any store changed.
    ///
    /// Unknown event names are ignored; malformed payloads are an error.
    pub fn route(&self, event: &StreamEvent) -> Result<bool, CoreError> {
        let Some(parsed) = DispatchEvent::parse(event)? else {
            trace!(event = %event.name, "no route for event");
            return Ok(false);
        };

        let applied = match parsed {
            DispatchEvent::NewIncident(incident) => self.incidents.insert_new(incident),
            DispatchEvent::IncidentStatus(patch) => self.incidents.apply_patch(patch),
            DispatchEvent::IncidentPhase(p) => match (p.phase, p.phases) {
                (_, Some(phases)) => self.incidents.apply_patch(IncidentPatch {
                    phases: Some(Some(phases)),
                    ..IncidentPatch::new(p.incident_id)
                }),
                (Some(phase), None) => self
                    .incidents
                    .apply_field_update(LookupKey::id(&p.incident_id), PhaseUpdate { phase }),
                (None, None) => false,
            },
            DispatchEvent::VehiclePosition(p) => self.vehicles.apply_field_update(
                LookupKey::new(p.vehicle_id.as_deref(), p.immatriculation.as_deref()),
                p.update(),
            ),
            DispatchEvent::VehicleStatus(p) => self.vehicles.apply_field_update(
                LookupKey::new(p.vehicle_id.as_deref(), p.immatriculation.as_deref()),
                p.update(),
            ),
            DispatchEvent::VehicleAssignment(p) => {
                let key = LookupKey::new(p.vehicle_id.as_deref(), p.immatriculation.as_deref());
                match self.vehicles.resolve_id(key) {
                    Some(id) => self.vehicles.apply_patch(p.into_patch(id)),
                    None => false,
                }
            }
            DispatchEvent::Proposal(ProposalPayload::Full(proposal)) => {
                self.proposals.ingest(proposal)
            }
            DispatchEvent::Proposal(ProposalPayload::Status(s)) => {
                self.proposals.update_status(&s.proposal_id, s.status)
            }
        };

        if !applied {
            trace!(event = %event.name, "event changed nothing");
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};

    use crate::model::Position;

    struct Fixture {
        router: EventRouter,
        incidents: ReconciliationStore<Incident>,
        vehicles: ReconciliationStore<Vehicle>,
        proposals: ProposalAggregator,
    }

    fn fixture() -> Fixture {
        let incidents = ReconciliationStore::new("incidents", Duration::from_millis(100));
        let vehicles = ReconciliationStore::new("vehicles", Duration::from_millis(100));
        let proposals = ProposalAggregator::new();
        vehicles.load_snapshot([Vehicle {
            id: "v1".into(),
            immatriculation: Some("AB-123-CD".into()),
            status: Some("available".into()),
            ..Vehicle::default()
        }]);
        incidents.load_snapshot([Incident {
            id: "I1".into(),
            status: Some("open".into()),
            ..Incident::default()
        }]);
        Fixture {
            router: EventRouter::new(incidents.clone(), vehicles.clone(), proposals.clone()),
            incidents,
            vehicles,
            proposals,
        }
    }

    fn route(f: &Fixture, name: &str, data: Value) -> bool {
        f.router
            .route(&StreamEvent::new(name, data, Utc::now()))
            .expect("valid payload")
    }

    #[tokio::test(start_paused = true)]
    async fn status_update_for_unknown_vehicle_changes_nothing() {
        let f = fixture();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let before = f.vehicles.snapshot();

        assert!(!route(&f, "vehicle_status_update", json!({ "vehicle_id": "v404", "status": "x" })));
        assert!(!f.vehicles.is_flush_scheduled());
        assert_eq!(f.vehicles.len(), 1);
        assert_eq!(f.vehicles.snapshot(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn vehicle_events_reach_the_vehicle_store() {
        let f = fixture();
        assert!(route(
            &f,
            "vehicle_position_update",
            json!({ "immatriculation": "AB-123-CD", "lat": 45.0, "lng": 4.0 })
        ));
        assert!(route(&f, "vehicle_status_update", json!({ "id": "v1", "status": "en route" })));
        assert!(route(
            &f,
            "vehicle_assignment",
            json!({ "vehicle_id": "v1", "incident_id": "I1", "phase_id": "p1" })
        ));

        let v = f.vehicles.get("v1").expect("known vehicle");
        assert_eq!(v.position(), Some(Position::new(45.0, 4.0)));
        assert_eq!(v.status.as_deref(), Some("en route"));
        assert_eq!(v.assigned_incident_id.as_deref(), Some("I1"));
        assert_eq!(v.assigned_phase_id.as_deref(), Some("p1"));
    }

    #[tokio::test(start_paused = true)]
    async fn assignment_with_nulls_releases_the_vehicle() {
        let f = fixture();
        assert!(route(
            &f,
            "vehicle_assignment",
            json!({ "vehicle_id": "v1", "incident_id": "I1", "phase_id": "p1", "status": "en route" })
        ));

        let release = json!({
            "vehicle_id": "v1",
            "incident_id": null,
            "phase_id": null,
            "status": "available"
        });
        assert!(route(&f, "vehicle_assignment", release.clone()));
        let v = f.vehicles.get("v1").expect("known vehicle");
        assert_eq!(v.assigned_incident_id, None);
        assert_eq!(v.assigned_phase_id, None);
        assert_eq!(v.status.as_deref(), Some("available"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!route(&f, "vehicle_assignment", release));
        assert!(!f.vehicles.is_flush_scheduled());
    }

    #[tokio::test(start_paused = true)]
    async fn assignment_without_incident_keeps_the_current_one() {
        let f = fixture();
        route(&f, "vehicle_assignment", json!({ "vehicle_id": "v1", "incident_id": "I1" }));
        assert!(route(
            &f,
            "vehicle_assignment",
            json!({ "immatriculation": "AB-123-CD", "phase_id": "p2" })
        ));

        let v = f.vehicles.get("v1").expect("known vehicle");
        assert_eq!(v.assigned_incident_id.as_deref(), Some("I1"));
        assert_eq!(v.assigned_phase_id.as_deref(), Some("p2"));
    }

    #[tokio::test(start_paused = true)]
    async fn mistyped_incident_status_is_rejected_whole() {
        let f = fixture();
        f.incidents.apply_patch(IncidentPatch {
            label: Some(Some("old".into())),
            ..IncidentPatch::new("I1")
        });
        tokio::time::sleep(Duration::from_millis(150)).await;
        let version = f.incidents.version();

        let err = f
            .router
            .route(&StreamEvent::new(
                "incident_status_update",
                json!({ "id": "I1", "status": "closed", "label": "new", "latitude": "n/a" }),
                Utc::now(),
            ))
            .expect_err("latitude is not a number");
        assert!(matches!(err, CoreError::InvalidPayload { .. }));

        let i1 = f.incidents.get("I1").expect("known incident");
        assert_eq!(i1.label.as_deref(), Some("old"));
        assert_eq!(i1.status.as_deref(), Some("open"));
        assert!(!f.incidents.is_flush_scheduled());
        assert_eq!(f.incidents.version(), version);
    }

    #[tokio::test(start_paused = true)]
    async fn incident_status_extras_are_merged() {
        let f = fixture();
        assert!(route(
            &f,
            "incident_status_update",
            json!({ "id": "I1", "status": "closed", "label": "new", "crew": 4 })
        ));
        let i1 = f.incidents.get("I1").expect("known incident");
        assert_eq!(i1.label.as_deref(), Some("new"));
        assert_eq!(i1.extra["crew"], 4);
    }

    #[tokio::test(start_paused = true)]
    async fn incident_events_reach_the_incident_store() {
        let f = fixture();
        assert!(route(&f, "new_incident", json!({ "id": "I2", "label": "Flood" })));
        assert!(route(&f, "incident_status_update", json!({ "id": "I1", "status": "closed" })));
        assert!(!route(&f, "incident_status_update", json!({ "id": "I9", "status": "closed" })));
        assert!(route(
            &f,
            "incident_phase_update",
            json!({ "incident_id": "I1", "phase": { "phase_id": "p1", "label": "Initial" } })
        ));

        assert_eq!(f.incidents.len(), 2);
        let i1 = f.incidents.get("I1").expect("known incident");
        assert_eq!(i1.status.as_deref(), Some("closed"));
        assert_eq!(i1.phases().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn proposal_events_reach_the_aggregator() {
        let f = fixture();
        assert!(route(
            &f,
            "assignment_proposal",
            json!({ "proposal_id": "P1", "incident_id": "I1", "items": [] })
        ));
        assert!(route(
            &f,
            "assignment_proposal",
            json!({ "proposal_id": "P1", "rejected_at": "2026-03-01T10:00:00Z" })
        ));
        assert!(f.proposals.pending().is_empty());
        assert_eq!(f.proposals.all().len(), 1);
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let f = fixture();
        let err = f
            .router
            .route(&StreamEvent::new("new_incident", json!([1, 2]), Utc::now()))
            .expect_err("array is not an incident");
        assert!(matches!(err, CoreError::InvalidPayload { .. }));
    }
}
