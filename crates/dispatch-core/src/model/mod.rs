// ── Domain model ──
//
// Canonical types for everything the live pipeline reconciles. Wire fields
// the core does not read are kept in each entity's flattened `extra` map so
// renderers still see everything the backend sent.

pub mod event;
pub mod incident;
pub mod position;
pub mod proposal;
pub mod vehicle;

pub use event::{
    DispatchEvent, EventName, IncidentPhasePayload, ProposalPayload, ProposalStatusPayload,
    StreamEvent, VehicleAssignmentPayload, VehiclePositionPayload, VehicleStatusPayload,
};
pub use incident::{Incident, IncidentPatch, IncidentPhase, PhaseUpdate};
pub use position::Position;
pub use proposal::{LineItem, MissingItem, Proposal, ProposalStatus};
pub use vehicle::{PositionUpdate, StatusUpdate, Vehicle, VehiclePatch};

/// An id-keyed record held by a [`ReconciliationStore`](crate::store::ReconciliationStore).
///
/// Everything beyond the id is opaque to the store; only the entity knows
/// how to shallow-merge a partial copy of itself.
pub trait Entity: Clone + PartialEq + Send + Sync + 'static {
    /// The partial form accepted by [`merge`](Self::merge).
    type Patch: EntityPatch;

    /// Primary id. Empty means "no id" and the store will refuse the record.
    fn id(&self) -> &str;

    /// Secondary natural key for callers that lack the primary id.
    fn secondary_key(&self) -> Option<&str> {
        None
    }

    /// Shallow-merge `patch` over `self`. Every field the patch carries
    /// wins, including an explicit `null`.
    fn merge(&mut self, patch: Self::Patch);
}

/// A partial entity addressed by primary id.
///
/// Patch fields are tri-state: `None` leaves the target alone,
/// `Some(None)` clears it and `Some(Some(v))` sets it.
pub trait EntityPatch: Send {
    fn id(&self) -> &str;
}

/// Copy each tri-state field of `$patch` that was sent onto `$target`.
macro_rules! merge_sent {
    ($target:expr, $patch:expr; $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = $patch.$field {
                $target.$field = value;
            }
        )+
    };
}
pub(crate) use merge_sent;

/// Serde helper telling a field sent as `null` apart from a missing one.
/// Pair with `#[serde(default)]` so a missing field stays `None`.
#[allow(clippy::option_option)]
pub(crate) fn sent<'de, D, T>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: serde::Deserialize<'de>,
{
    <Option<T> as serde::Deserialize>::deserialize(de).map(Some)
}

/// Serde helpers for ids that the backend sends as either strings or numbers.
pub(crate) mod ids {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    fn stringify<E: serde::de::Error>(value: Value) -> Result<Option<String>, E> {
        match value {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            Value::Number(n) => Ok(Some(n.to_string())),
            other => Err(E::custom(format!("expected a string or numeric id, got {other}"))),
        }
    }

    /// Required-but-defaultable id: missing or null becomes `""`.
    pub(crate) fn id<'de, D: Deserializer<'de>>(de: D) -> Result<String, D::Error> {
        let value = Value::deserialize(de)?;
        Ok(stringify(value)?.unwrap_or_default())
    }

    /// Optional foreign id.
    pub(crate) fn opt_id<'de, D: Deserializer<'de>>(de: D) -> Result<Option<String>, D::Error> {
        let value = Value::deserialize(de)?;
        Ok(stringify(value)?.filter(|s| !s.is_empty()))
    }

    /// Tri-state foreign id: missing stays `None`, `null` becomes `Some(None)`.
    #[allow(clippy::option_option)]
    pub(crate) fn sent_id<'de, D: Deserializer<'de>>(
        de: D,
    ) -> Result<Option<Option<String>>, D::Error> {
        opt_id(de).map(Some)
    }
}
