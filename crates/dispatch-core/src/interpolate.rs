// ── Position interpolation ──
//
// Vehicles report positions every few seconds; the map should not jump.
// Each frame moves the displayed position a fixed fraction of the way to
// the latest report. Entries that have converged are skipped until a new
// report moves their target.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::model::{Position, Vehicle};
use crate::stream::EntityStream;

/// Displayed positions keyed by vehicle id.
pub type PositionMap = Arc<HashMap<String, Position>>;

/// Smoothing parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InterpolatorConfig {
    /// Fraction of the remaining distance covered per frame.
    pub factor: f64,
    /// Convergence threshold in degrees, per axis.
    pub epsilon: f64,
    /// Frame clock period.
    pub frame_interval: Duration,
    /// Drop entries whose id is absent from the latest target set.
    pub prune_missing: bool,
}

impl Default for InterpolatorConfig {
    fn default() -> Self {
        Self {
            factor: 0.12,
            epsilon: 1e-6,
            frame_interval: Duration::from_millis(16),
            prune_missing: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct AnimationEntry {
    current: Position,
    target: Position,
    settled: bool,
}

/// Per-id exponential smoothing toward target positions.
#[derive(Debug, Clone)]
pub struct PositionInterpolator {
    config: InterpolatorConfig,
    entries: HashMap<String, AnimationEntry>,
}

impl PositionInterpolator {
    pub fn new(config: InterpolatorConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
        }
    }

    /// Retarget from the latest reports.
    ///
    /// Unknown ids appear directly at their target. Known ids keep their
    /// displayed position and animate toward the new target. Returns
    /// whether ids were added or pruned.
    pub fn set_targets<I, S>(&mut self, targets: I) -> bool
    where
        I: IntoIterator<Item = (S, Position)>,
        S: Into<String>,
    {
        let mut seen = Vec::new();
        let mut membership_changed = false;
        for (id, target) in targets {
            let id = id.into();
            match self.entries.get_mut(&id) {
                Some(entry) => {
                    if entry.target != target {
                        entry.target = target;
                        entry.settled = false;
                    }
                }
                None => {
                    membership_changed = true;
                    self.entries.insert(
                        id.clone(),
                        AnimationEntry {
                            current: target,
                            target,
                            settled: true,
                        },
                    );
                }
            }
            if self.config.prune_missing {
                seen.push(id);
            }
        }

        if self.config.prune_missing {
            let before = self.entries.len();
            let keep: HashSet<String> = seen.into_iter().collect();
            self.entries.retain(|id, _| keep.contains(id));
            let pruned = before - self.entries.len();
            if pruned > 0 {
                membership_changed = true;
                trace!(pruned, "dropped animation entries without a target");
            }
        }
        membership_changed
    }

    /// Advance every unsettled entry one frame. Returns whether any
    /// displayed position changed.
    pub fn tick(&mut self) -> bool {
        let InterpolatorConfig {
            factor, epsilon, ..
        } = self.config;
        let mut moved = false;

        for entry in self.entries.values_mut().filter(|e| !e.settled) {
            entry.current = entry.current.step_toward(&entry.target, factor);
            moved = true;
            if entry.current.within(&entry.target, epsilon) {
                entry.settled = true;
            }
        }
        moved
    }

    pub fn displayed(&self, id: &str) -> Option<Position> {
        self.entries.get(id).map(|e| e.current)
    }

    pub fn positions(&self) -> HashMap<String, Position> {
        self.entries
            .iter()
            .map(|(id, e)| (id.clone(), e.current))
            .collect()
    }

    pub fn is_settled(&self) -> bool {
        self.entries.values().all(|e| e.settled)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn vehicle_targets(snapshot: &[Arc<Vehicle>]) -> impl Iterator<Item = (String, Position)> + '_ {
    snapshot
        .iter()
        .filter_map(|v| Some((v.id.clone(), v.position()?)))
}

// ── Frame loop ───────────────────────────────────────────────────────

/// Handle to a running interpolation loop.
#[derive(Debug)]
pub struct InterpolationHandle {
    positions: watch::Receiver<PositionMap>,
    task: JoinHandle<()>,
}

impl InterpolationHandle {
    /// Displayed positions as of the last frame.
    pub fn positions(&self) -> PositionMap {
        self.positions.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PositionMap> {
        self.positions.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Drive a [`PositionInterpolator`] from `vehicles` on a frame clock.
///
/// Retargets whenever the vehicle store publishes and republishes
/// displayed positions after every frame that moved something. Runs until
/// `cancel` fires or the store is dropped.
pub fn spawn_interpolation_loop(
    mut vehicles: EntityStream<Vehicle>,
    config: InterpolatorConfig,
    cancel: CancellationToken,
) -> InterpolationHandle {
    let mut interpolator = PositionInterpolator::new(config);
    interpolator.set_targets(vehicle_targets(&vehicles.latest()));
    let (tx, positions) = watch::channel(Arc::new(interpolator.positions()));

    let task = tokio::spawn(async move {
        let mut frames = tokio::time::interval(config.frame_interval);
        frames.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(interval = ?config.frame_interval, "interpolation loop started");

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                snapshot = vehicles.changed() => {
                    let Some(snapshot) = snapshot else { break };
                    if interpolator.set_targets(vehicle_targets(&snapshot)) {
                        tx.send_replace(Arc::new(interpolator.positions()));
                    }
                }
                _ = frames.tick() => {
                    if interpolator.tick() {
                        tx.send_replace(Arc::new(interpolator.positions()));
                    }
                }
            }
        }
        debug!("interpolation loop stopped");
    });

    InterpolationHandle { positions, task }
}
