//! Durable participation records and event runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ChannelId, EventRunId, ParticipantId, RunStatus, TrackedChannel};

/// A finalized (or checkpoint-flushed) join-to-leave interval.
///
/// The session identity is `(event, participant, channel, joined_at)`;
/// successive checkpoint flushes for the same still-open session carry the
/// same identity with a growing `duration_seconds`, and the store merges
/// them by upsert. Once the session fully closes the record is immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipationRecord {
    /// The event run this session belongs to.
    pub event: EventRunId,
    /// The participant.
    pub participant: ParticipantId,
    /// Display name at recording time.
    pub display_name: String,
    /// The channel the session took place in.
    pub channel: ChannelId,
    /// When the session opened.
    pub joined_at: DateTime<Utc>,
    /// When the session closed (or the latest checkpoint).
    pub left_at: DateTime<Utc>,
    /// Whole seconds between `joined_at` and `left_at`, never negative.
    pub duration_seconds: i64,
    /// Org-membership classification at recording time. Informational;
    /// must not affect the payroll rate.
    #[serde(default)]
    pub member: bool,
}

impl ParticipationRecord {
    /// Builds a record for the interval `[joined_at, left_at]`.
    ///
    /// The duration is truncated to whole seconds and clamped to zero when
    /// the interval is inverted (defensive: out-of-order timestamps from a
    /// best-effort event source).
    #[must_use]
    pub fn for_interval(
        event: EventRunId,
        participant: ParticipantId,
        display_name: String,
        channel: ChannelId,
        joined_at: DateTime<Utc>,
        left_at: DateTime<Utc>,
        member: bool,
    ) -> Self {
        let left_at = left_at.max(joined_at);
        let duration_seconds = (left_at - joined_at).num_seconds().max(0);
        Self {
            event,
            participant,
            display_name,
            channel,
            joined_at,
            left_at,
            duration_seconds,
            member,
        }
    }

    /// The upsert key identifying this session in the ledger.
    #[must_use]
    pub fn session_identity(&self) -> (&EventRunId, &ParticipantId, &ChannelId, DateTime<Utc>) {
        (&self.event, &self.participant, &self.channel, self.joined_at)
    }
}

/// One timed activity window grouping participation sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRun {
    /// Run identifier.
    pub id: EventRunId,
    /// When tracking started.
    pub started_at: DateTime<Utc>,
    /// When tracking ended; `None` while the run is open.
    pub ended_at: Option<DateTime<Utc>>,
    /// Lifecycle state.
    pub status: RunStatus,
    /// The channel roster supplied at event start.
    pub channels: Vec<TrackedChannel>,
}

impl EventRun {
    /// Creates a new open run.
    #[must_use]
    pub fn open(id: EventRunId, started_at: DateTime<Utc>, channels: Vec<TrackedChannel>) -> Self {
        Self {
            id,
            started_at,
            ended_at: None,
            status: RunStatus::Open,
            channels,
        }
    }

    /// IDs of channels whose presence is informational (staging/dispatch).
    #[must_use]
    pub fn staging_channels(&self) -> Vec<ChannelId> {
        self.channels
            .iter()
            .filter(|c| c.staging)
            .map(|c| c.id.clone())
            .collect()
    }
}
