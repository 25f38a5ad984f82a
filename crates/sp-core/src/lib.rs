//! Core domain logic for shiftpay.
//!
//! This crate contains the fundamental types and logic for:
//! - Session tracking: folding join/leave/tick events into participation
//!   records, plus the per-run actor runtime
//! - The participation ledger seam (`SessionStore`)
//! - Payroll: valuing a resource manifest and distributing it by tracked
//!   minutes, with the donation/redistribution policy

pub mod event;
pub mod payroll;
pub mod record;
pub mod runtime;
pub mod store;
pub mod tracker;
pub mod types;

pub use event::{JoinEvent, LeaveEvent, PresenceEvent, Roster, TickEvent};
pub use payroll::{
    DonationPolicy, ManifestLine, PayoutLine, PayoutReport, PayrollError, PriceQuote, PriceSource,
    ResourceManifest, calculate_payroll,
};
pub use record::{EventRun, ParticipationRecord};
pub use runtime::{ServiceError, TrackerService};
pub use store::{AppendOutcome, MemoryStore, SessionStore};
pub use tracker::{SessionTracker, TrackError};
pub use types::{
    ChannelId, Credits, DonationPercent, EventRunId, MaterialCode, ParticipantId, RunStatus,
    TrackedChannel, ValidationError,
};
