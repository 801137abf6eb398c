//! Real-time operational state layer between `dispatch-api` and the
//! dispatch console UI.
//!
//! This crate keeps a consistent live picture of incidents, vehicles and
//! assignment proposals by merging bulk snapshots with a push event stream:
//!
//! - **[`DispatchConsole`]**: Screen-scoped service object. [`mount()`](DispatchConsole::mount)
//!   loads the three collections in parallel, subscribes to every consumed
//!   event and opens the stream; [`teardown()`](DispatchConsole::teardown)
//!   cancels everything it started.
//!
//! - **[`ReconciliationStore<T>`]**: Id-keyed, insertion-ordered entity
//!   store. Mutations apply immediately; publication of the new snapshot is
//!   coalesced over a short window so bursts produce one notification.
//!
//! - **[`StreamMultiplexer`]**: One shared push connection with
//!   reference-counted per-event subscriptions and payload normalization.
//!
//! - **[`ProposalAggregator`]**: Assignment proposals indexed by incident,
//!   with [`group_by_phase`] for per-phase display ordering.
//!
//! - **[`ReferenceCache`]**: Lazily resolved, deduplicated lookups of
//!   referenced records with change notification.
//!
//! - **[`PositionInterpolator`]**: Frame-driven smoothing of vehicle
//!   positions between reports.
//!
//! - **[`EntityStream<T>`]**: Subscription handle over any published
//!   collection. Exposes `current()` / `latest()` / `changed()`.

pub mod config;
pub mod console;
pub(crate) mod convert;
pub mod error;
pub mod interpolate;
pub mod model;
pub mod multiplexer;
pub mod resolve;
pub mod router;
pub mod store;
pub mod stream;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::{ConsoleConfig, TlsVerification};
pub use console::{DispatchConsole, RefreshReport, SessionClient};
pub use error::CoreError;
pub use interpolate::{
    InterpolationHandle, InterpolatorConfig, PositionInterpolator, PositionMap,
    spawn_interpolation_loop,
};
pub use multiplexer::{
    ConnectionState, EventHandler, StreamMultiplexer, StreamStatus, Subscription,
};
pub use resolve::{ReferenceCache, ReferenceFetcher, ResolutionState, display_label};
pub use router::EventRouter;
pub use store::{
    FieldUpdate, LookupKey, PhaseGroup, ProposalAggregator, ReconciliationStore, group_by_phase,
};
pub use stream::EntityStream;

// Re-export model types at the crate root for ergonomics.
pub use model::{
    DispatchEvent, Entity, EntityPatch, EventName, Incident, IncidentPatch, IncidentPhase,
    LineItem, MissingItem, Position, Proposal, ProposalStatus, StreamEvent, Vehicle,
    VehiclePatch,
};
