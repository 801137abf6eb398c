// ── Assignment proposal aggregation ──
//
// Proposals are indexed by incident. Unlike the entity stores there is no
// debounce: proposals arrive rarely and operators act on them, so every
// mutation publishes immediately.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::model::{IncidentPhase, LineItem, Proposal, ProposalStatus};
use crate::stream::EntityStream;

#[derive(Default)]
struct ProposalIndex {
    by_incident: IndexMap<String, Vec<Arc<Proposal>>>,
    /// proposal id -> incident id.
    incident_of: HashMap<String, String>,
}

impl ProposalIndex {
    fn upsert(&mut self, proposal: Proposal) {
        let id = proposal.proposal_id.clone();
        let incident = proposal.incident_id.clone();

        if let Some(previous) = self.incident_of.get(&id).filter(|prev| **prev != incident) {
            if let Some(list) = self.by_incident.get_mut(previous) {
                list.retain(|p| p.proposal_id != id);
            }
            debug!(proposal = %id, from = %previous, to = %incident, "proposal moved to another incident");
        }

        let list = self.by_incident.entry(incident.clone()).or_default();
        match list.iter_mut().find(|p| p.proposal_id == id) {
            Some(slot) => *slot = Arc::new(proposal),
            None => list.push(Arc::new(proposal)),
        }
        self.incident_of.insert(id, incident);
    }

    fn flatten(&self) -> Vec<Arc<Proposal>> {
        self.by_incident.values().flatten().cloned().collect()
    }
}

/// Index of assignment proposals grouped by incident.
///
/// A proposal id lives in exactly one incident's list. Cheap to clone.
#[derive(Clone)]
pub struct ProposalAggregator {
    index: Arc<Mutex<ProposalIndex>>,
    snapshot: Arc<watch::Sender<Arc<Vec<Arc<Proposal>>>>>,
}

impl Default for ProposalAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProposalAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProposalAggregator")
            .field("proposals", &self.lock().incident_of.len())
            .finish_non_exhaustive()
    }
}

impl ProposalAggregator {
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            index: Arc::new(Mutex::new(ProposalIndex::default())),
            snapshot: Arc::new(snapshot),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProposalIndex> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, index: &ProposalIndex) {
        self.snapshot.send_replace(Arc::new(index.flatten()));
    }

    /// Replace every proposal with `proposals`.
    pub fn load_snapshot<I>(&self, proposals: I) -> usize
    where
        I: IntoIterator<Item = Proposal>,
    {
        let mut index = self.lock();
        *index = ProposalIndex::default();
        for p in proposals {
            if p.proposal_id.is_empty() {
                continue;
            }
            index.upsert(p);
        }
        let count = index.incident_of.len();
        self.publish(&index);
        count
    }

    /// Insert or replace a proposal by id.
    pub fn ingest(&self, proposal: Proposal) -> bool {
        if proposal.proposal_id.is_empty() {
            return false;
        }
        let mut index = self.lock();
        trace!(proposal = %proposal.proposal_id, incident = %proposal.incident_id, "ingest proposal");
        index.upsert(proposal);
        self.publish(&index);
        true
    }

    /// Merge lifecycle timestamps into a known proposal.
    ///
    /// Returns `false` when no incident holds `proposal_id`.
    pub fn update_status(&self, proposal_id: &str, status: ProposalStatus) -> bool {
        let mut index = self.lock();
        let Some(incident) = index.incident_of.get(proposal_id).cloned() else {
            trace!(proposal = %proposal_id, "status for unknown proposal dropped");
            return false;
        };
        let Some(slot) = index
            .by_incident
            .get_mut(&incident)
            .and_then(|list| list.iter_mut().find(|p| p.proposal_id == proposal_id))
        else {
            return false;
        };
        Arc::make_mut(slot).apply_status(&status);
        self.publish(&index);
        true
    }

    // ── Views ────────────────────────────────────────────────────────

    /// Every proposal, grouped by incident in first-seen order.
    pub fn all(&self) -> Arc<Vec<Arc<Proposal>>> {
        self.snapshot.borrow().clone()
    }

    /// Proposals neither validated nor rejected.
    pub fn pending(&self) -> Vec<Arc<Proposal>> {
        self.all().iter().filter(|p| p.is_pending()).cloned().collect()
    }

    pub fn for_incident(&self, incident_id: &str) -> Vec<Arc<Proposal>> {
        self.lock()
            .by_incident
            .get(incident_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get(&self, proposal_id: &str) -> Option<Arc<Proposal>> {
        let index = self.lock();
        let incident = index.incident_of.get(proposal_id)?;
        index
            .by_incident
            .get(incident)?
            .iter()
            .find(|p| p.proposal_id == proposal_id)
            .cloned()
    }

    pub fn subscribe(&self) -> EntityStream<Proposal> {
        EntityStream::new(self.snapshot.subscribe())
    }
}

// ── Display grouping ─────────────────────────────────────────────────

/// Line items of one proposal that target the same phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseGroup<'a> {
    pub phase_id: &'a str,
    /// `None` for phases the incident does not list.
    pub label: Option<&'a str>,
    pub started_at: Option<DateTime<Utc>>,
    /// Highest score first.
    pub items: Vec<&'a LineItem>,
}

/// Partition `proposal`'s items by target phase.
///
/// Phases are ordered by start time, phases without one last, ties broken
/// by their order in `phases`. Items targeting phases absent from `phases`
/// form trailing groups in first-appearance order.
pub fn group_by_phase<'a>(proposal: &'a Proposal, phases: &'a [IncidentPhase]) -> Vec<PhaseGroup<'a>> {
    let mut groups: IndexMap<&'a str, PhaseGroup<'a>> = IndexMap::new();
    for phase in phases {
        groups.entry(phase.phase_id.as_str()).or_insert_with(|| PhaseGroup {
            phase_id: &phase.phase_id,
            label: phase.label.as_deref(),
            started_at: phase.started_at,
            items: Vec::new(),
        });
    }
    let listed = groups.len();

    for item in &proposal.items {
        groups
            .entry(item.phase_id.as_str())
            .or_insert_with(|| PhaseGroup {
                phase_id: &item.phase_id,
                label: None,
                started_at: None,
                items: Vec::new(),
            })
            .items
            .push(item);
    }

    let mut ordered: Vec<(usize, PhaseGroup<'a>)> = groups
        .into_values()
        .enumerate()
        .filter(|(_, g)| !g.items.is_empty())
        .collect();

    // Stable sort; `position` breaks ties between equal start times.
    ordered.sort_by(|(ia, a), (ib, b)| {
        let known = (*ia >= listed).cmp(&(*ib >= listed));
        let start = match (a.started_at, b.started_at) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        known.then(start).then(ia.cmp(ib))
    });

    ordered
        .into_iter()
        .map(|(_, mut g)| {
            g.items.sort_by(|a, b| b.score.total_cmp(&a.score));
            g
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn proposal(id: &str, incident: &str) -> Proposal {
        serde_json::from_value(json!({
            "proposal_id": id,
            "incident_id": incident,
            "items": []
        }))
        .expect("valid proposal")
    }

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().expect("timestamp")
    }

    #[test]
    fn validated_proposal_leaves_pending_but_stays_in_all() {
        let agg = ProposalAggregator::new();
        assert!(agg.ingest(proposal("P1", "I1")));
        assert_eq!(agg.pending().len(), 1);

        let t = ts("2026-03-01T10:05:00Z");
        assert!(agg.update_status("P1", ProposalStatus::validated(t)));

        assert!(agg.pending().is_empty());
        let all = agg.all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].validated_at, Some(t));
    }

    #[test]
    fn rejected_proposals_are_not_pending() {
        let agg = ProposalAggregator::new();
        agg.load_snapshot([proposal("P1", "I1"), proposal("P2", "I1")]);
        agg.update_status("P2", ProposalStatus::rejected(ts("2026-03-01T10:00:00Z")));
        let pending: Vec<_> = agg.pending().iter().map(|p| p.proposal_id.clone()).collect();
        assert_eq!(pending, ["P1"]);
    }

    #[test]
    fn ingest_replaces_in_place() {
        let agg = ProposalAggregator::new();
        agg.ingest(proposal("P1", "I1"));
        agg.ingest(proposal("P2", "I1"));

        let mut updated = proposal("P1", "I1");
        updated.generated_at = Some(ts("2026-03-01T11:00:00Z"));
        agg.ingest(updated);

        let list = agg.for_incident("I1");
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].proposal_id, "P1");
        assert!(list[0].generated_at.is_some());
    }

    #[test]
    fn proposal_moving_incident_appears_once() {
        let agg = ProposalAggregator::new();
        agg.ingest(proposal("P1", "I1"));
        agg.ingest(proposal("P1", "I2"));

        assert!(agg.for_incident("I1").is_empty());
        assert_eq!(agg.for_incident("I2").len(), 1);
        assert_eq!(agg.all().len(), 1);
    }

    #[test]
    fn status_for_unknown_proposal_is_dropped() {
        let agg = ProposalAggregator::new();
        assert!(!agg.update_status("nope", ProposalStatus::default()));
    }

    #[tokio::test]
    async fn subscribers_see_every_mutation() {
        let agg = ProposalAggregator::new();
        let mut stream = agg.subscribe();
        agg.ingest(proposal("P1", "I1"));
        let snap = stream.changed().await.expect("aggregator alive");
        assert_eq!(snap.len(), 1);
    }

    #[test]
    fn groups_order_by_start_then_listing_and_items_by_score() {
        let phases: Vec<IncidentPhase> = serde_json::from_value(json!([
            { "phase_id": "late",  "started_at": "2026-03-01T10:30:00Z" },
            { "phase_id": "none" },
            { "phase_id": "early", "started_at": "2026-03-01T10:00:00Z" },
            { "phase_id": "tie",   "started_at": "2026-03-01T10:30:00Z" },
            { "phase_id": "empty", "started_at": "2026-03-01T09:00:00Z" }
        ]))
        .expect("phases");

        let p: Proposal = serde_json::from_value(json!({
            "proposal_id": "P1",
            "incident_id": "I1",
            "items": [
                { "vehicle_id": "a", "phase_id": "none",  "score": 0.1 },
                { "vehicle_id": "b", "phase_id": "tie",   "score": 0.5 },
                { "vehicle_id": "c", "phase_id": "early", "score": 0.2 },
                { "vehicle_id": "d", "phase_id": "early", "score": 0.9 },
                { "vehicle_id": "e", "phase_id": "late",  "score": 0.3 },
                { "vehicle_id": "f", "phase_id": "ghost", "score": 1.0 }
            ]
        }))
        .expect("proposal");

        let groups = group_by_phase(&p, &phases);
        let order: Vec<&str> = groups.iter().map(|g| g.phase_id).collect();
        assert_eq!(order, ["early", "late", "tie", "none", "ghost"]);

        let early: Vec<&str> = groups[0].items.iter().map(|i| i.vehicle_id.as_str()).collect();
        assert_eq!(early, ["d", "c"]);
        assert!(groups[4].label.is_none());
    }
}
