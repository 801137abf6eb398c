// ── Stream events ──
//
// `StreamEvent` is what the multiplexer hands to subscribers: a name, the
// JSON payload, and a timestamp. `DispatchEvent` is the typed view the
// console routes on, one variant per consumed event name, each payload
// validated at the boundary.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoStaticStr};

use super::incident::{Incident, IncidentPatch, IncidentPhase};
use super::position::Position;
use super::proposal::{Proposal, ProposalStatus};
use super::vehicle::{PositionUpdate, StatusUpdate, VehiclePatch};
use super::{ids, sent};
use crate::error::CoreError;

/// A normalized message from the push stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub name: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl StreamEvent {
    pub fn new(name: impl Into<String>, data: Value, timestamp: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            data,
            timestamp,
        }
    }

    /// The typed name, if this is one the console consumes.
    pub fn known_name(&self) -> Option<EventName> {
        EventName::from_str(&self.name).ok()
    }
}

/// Event names the console subscribes to.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    AsRefStr,
    IntoStaticStr,
    EnumString,
    EnumIter,
)]
#[strum(serialize_all = "snake_case")]
pub enum EventName {
    NewIncident,
    VehiclePositionUpdate,
    VehicleStatusUpdate,
    IncidentStatusUpdate,
    VehicleAssignment,
    IncidentPhaseUpdate,
    AssignmentProposal,
}

// ── Payload schemas ──────────────────────────────────────────────────

/// `vehicle_position_update`. Either `vehicle_id` or `immatriculation`
/// must identify the vehicle.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct VehiclePositionPayload {
    #[serde(default, alias = "id", deserialize_with = "ids::opt_id")]
    pub vehicle_id: Option<String>,
    pub immatriculation: Option<String>,
    #[serde(alias = "lat")]
    pub latitude: f64,
    #[serde(alias = "lng", alias = "lon")]
    pub longitude: f64,
    pub position_updated_at: Option<DateTime<Utc>>,
}

impl VehiclePositionPayload {
    pub fn update(&self) -> PositionUpdate {
        PositionUpdate {
            position: Position::new(self.latitude, self.longitude),
            at: self.position_updated_at,
        }
    }
}

/// `vehicle_status_update`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct VehicleStatusPayload {
    #[serde(default, alias = "id", deserialize_with = "ids::opt_id")]
    pub vehicle_id: Option<String>,
    pub immatriculation: Option<String>,
    pub status: String,
    pub status_updated_at: Option<DateTime<Utc>>,
}

impl VehicleStatusPayload {
    pub fn update(&self) -> StatusUpdate {
        StatusUpdate {
            status: self.status.clone(),
            at: self.status_updated_at,
        }
    }
}

/// `vehicle_assignment`: which incident and phase a vehicle now serves.
///
/// An explicit `null` incident or phase releases the vehicle; a missing
/// one leaves the current assignment alone.
#[allow(clippy::option_option)]
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VehicleAssignmentPayload {
    #[serde(default, alias = "id", deserialize_with = "ids::opt_id")]
    pub vehicle_id: Option<String>,
    pub immatriculation: Option<String>,
    #[serde(default, alias = "assigned_incident_id", deserialize_with = "ids::sent_id")]
    pub incident_id: Option<Option<String>>,
    #[serde(default, alias = "assigned_phase_id", deserialize_with = "ids::sent_id")]
    pub phase_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "sent")]
    pub status: Option<Option<String>>,
}

impl VehicleAssignmentPayload {
    /// Shallow vehicle patch keyed by `id`.
    pub fn into_patch(self, id: String) -> VehiclePatch {
        VehiclePatch {
            id,
            immatriculation: self.immatriculation.map(Some),
            status: self.status,
            assigned_incident_id: self.incident_id,
            assigned_phase_id: self.phase_id,
            ..VehiclePatch::default()
        }
    }
}

/// `incident_phase_update`: one phase, or the full phase list.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct IncidentPhasePayload {
    #[serde(deserialize_with = "ids::id")]
    pub incident_id: String,
    pub phase: Option<IncidentPhase>,
    pub phases: Option<Vec<IncidentPhase>>,
}

/// `assignment_proposal`: a full proposal, or a lifecycle change for one
/// already known.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ProposalPayload {
    Full(Proposal),
    Status(ProposalStatusPayload),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProposalStatusPayload {
    #[serde(alias = "id", deserialize_with = "ids::id")]
    pub proposal_id: String,
    #[serde(flatten)]
    pub status: ProposalStatus,
}

// ── Typed event ──────────────────────────────────────────────────────

/// A stream event decoded into the payload its name implies.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    NewIncident(Incident),
    VehiclePosition(VehiclePositionPayload),
    VehicleStatus(VehicleStatusPayload),
    /// A partial incident carrying at least a status.
    IncidentStatus(IncidentPatch),
    VehicleAssignment(VehicleAssignmentPayload),
    IncidentPhase(IncidentPhasePayload),
    Proposal(ProposalPayload),
}

impl DispatchEvent {
    /// Decode `event` by name.
    ///
    /// Returns `Ok(None)` for names the console does not consume and
    /// [`CoreError::InvalidPayload`] when the payload does not match the
    /// schema for its name.
    pub fn parse(event: &StreamEvent) -> Result<Option<Self>, CoreError> {
        let Some(name) = event.known_name() else {
            return Ok(None);
        };

        let data = event.data.clone();
        let invalid = |e: serde_json::Error| CoreError::invalid_payload(name.as_ref(), e);

        let parsed = match name {
            EventName::NewIncident => {
                let incident: Incident = serde_json::from_value(data).map_err(invalid)?;
                if incident.id.is_empty() {
                    return Err(CoreError::invalid_payload(name.as_ref(), "missing incident id"));
                }
                Self::NewIncident(incident)
            }
            EventName::VehiclePositionUpdate => {
                let p: VehiclePositionPayload = serde_json::from_value(data).map_err(invalid)?;
                require_vehicle_key(name, p.vehicle_id.as_deref(), p.immatriculation.as_deref())?;
                Self::VehiclePosition(p)
            }
            EventName::VehicleStatusUpdate => {
                let p: VehicleStatusPayload = serde_json::from_value(data).map_err(invalid)?;
                require_vehicle_key(name, p.vehicle_id.as_deref(), p.immatriculation.as_deref())?;
                Self::VehicleStatus(p)
            }
            EventName::IncidentStatusUpdate => {
                let patch: IncidentPatch = serde_json::from_value(data).map_err(invalid)?;
                if patch.id.is_empty() {
                    return Err(CoreError::invalid_payload(name.as_ref(), "missing incident id"));
                }
                if !matches!(patch.status, Some(Some(_))) {
                    return Err(CoreError::invalid_payload(name.as_ref(), "missing `status`"));
                }
                Self::IncidentStatus(patch)
            }
            EventName::VehicleAssignment => {
                let p: VehicleAssignmentPayload = serde_json::from_value(data).map_err(invalid)?;
                require_vehicle_key(name, p.vehicle_id.as_deref(), p.immatriculation.as_deref())?;
                Self::VehicleAssignment(p)
            }
            EventName::IncidentPhaseUpdate => {
                let p: IncidentPhasePayload = serde_json::from_value(data).map_err(invalid)?;
                if p.phase.is_none() && p.phases.is_none() {
                    return Err(CoreError::invalid_payload(
                        name.as_ref(),
                        "neither `phase` nor `phases` present",
                    ));
                }
                Self::IncidentPhase(p)
            }
            EventName::AssignmentProposal => {
                Self::Proposal(serde_json::from_value(data).map_err(invalid)?)
            }
        };

        Ok(Some(parsed))
    }
}

fn require_vehicle_key(
    name: EventName,
    id: Option<&str>,
    immatriculation: Option<&str>,
) -> Result<(), CoreError> {
    let has = |k: Option<&str>| k.is_some_and(|k| !k.is_empty());
    if has(id) || has(immatriculation) {
        Ok(())
    } else {
        Err(CoreError::invalid_payload(
            name.as_ref(),
            "neither `vehicle_id` nor `immatriculation` present",
        ))
    }
}
