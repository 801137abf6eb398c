// ── Assignment proposal domain types ──

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids;

/// A backend-generated suggestion of which vehicles to send to which
/// phases of an incident.
///
/// `items` carries no serde default: a payload without it is a status
/// update, not a proposal (see [`ProposalPayload`](super::ProposalPayload)).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    #[serde(alias = "id", deserialize_with = "ids::id")]
    pub proposal_id: String,
    #[serde(deserialize_with = "ids::id")]
    pub incident_id: String,
    pub generated_at: Option<DateTime<Utc>>,
    pub items: Vec<LineItem>,
    #[serde(default)]
    pub missing: Vec<MissingItem>,
    pub validated_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
}

impl Proposal {
    /// Neither validated nor rejected.
    pub fn is_pending(&self) -> bool {
        self.validated_at.is_none() && self.rejected_at.is_none()
    }

    /// Merge lifecycle timestamps. Absent fields leave the current value.
    pub fn apply_status(&mut self, status: &ProposalStatus) {
        if status.validated_at.is_some() {
            self.validated_at = status.validated_at;
        }
        if status.rejected_at.is_some() {
            self.rejected_at = status.rejected_at;
        }
    }
}

/// One proposed vehicle for one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    #[serde(deserialize_with = "ids::id")]
    pub vehicle_id: String,
    #[serde(default, deserialize_with = "ids::id")]
    pub phase_id: String,
    /// Suitability score; higher is better.
    #[serde(default)]
    pub score: f64,
    pub vehicle_type: Option<String>,
    pub distance_km: Option<f64>,
    pub eta_minutes: Option<f64>,
}

/// A vehicle type the engine could not fill for a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingItem {
    #[serde(default, deserialize_with = "ids::opt_id")]
    pub phase_id: Option<String>,
    pub vehicle_type: String,
    #[serde(default = "one")]
    pub quantity: u32,
}

const fn one() -> u32 {
    1
}

/// Lifecycle timestamps carried by a proposal status update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalStatus {
    pub validated_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
}

impl ProposalStatus {
    pub fn validated(at: DateTime<Utc>) -> Self {
        Self {
            validated_at: Some(at),
            rejected_at: None,
        }
    }

    pub fn rejected(at: DateTime<Utc>) -> Self {
        Self {
            validated_at: None,
            rejected_at: Some(at),
        }
    }
}
