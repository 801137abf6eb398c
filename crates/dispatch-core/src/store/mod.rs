// ── Reconciled state ──
//
// Id-keyed entity stores with debounced publication, plus the proposal
// index. Consumers read published snapshots; handlers mutate.

mod proposals;
mod reconcile;

pub use proposals::{PhaseGroup, ProposalAggregator, group_by_phase};
pub use reconcile::{FieldUpdate, LookupKey, ReconciliationStore};
