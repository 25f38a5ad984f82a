//! Session tracking state machine.
//!
//! Converts a stream of join/leave/tick events into open-session state and
//! emits [`ParticipationRecord`]s. The tracker is a pure state machine; the
//! async actor wrapper lives in [`crate::runtime`].
//!
//! Ticks flush the cumulative duration of every still-present session so a
//! crash loses at most one tick interval, and finalize sessions whose
//! participant silently disappeared (missed leave) at the last confirmed
//! presence time.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::event::{JoinEvent, LeaveEvent, TickEvent};
use crate::record::ParticipationRecord;
use crate::types::{ChannelId, EventRunId, ParticipantId, TrackedChannel};

/// Tracker errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrackError {
    /// The run was stopped; no new sessions may open.
    #[error("event run {event} is closed")]
    EventClosed {
        /// The closed run.
        event: EventRunId,
    },
}

/// In-memory state of one participant currently present in a channel.
#[derive(Debug, Clone)]
struct OpenSession {
    joined_at: DateTime<Utc>,
    /// Last time presence was confirmed (join time, then advanced by ticks).
    last_checkpoint: DateTime<Utc>,
    display_name: String,
    member: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    channel: ChannelId,
    participant: ParticipantId,
}

/// Tracks open sessions for a single event run.
#[derive(Debug)]
pub struct SessionTracker {
    event: EventRunId,
    channels: HashMap<ChannelId, TrackedChannel>,
    sessions: HashMap<SessionKey, OpenSession>,
    closed: bool,
}

impl SessionTracker {
    /// Creates a tracker for an open run over the given channel roster.
    #[must_use]
    pub fn new(event: EventRunId, channels: Vec<TrackedChannel>) -> Self {
        let channels = channels.into_iter().map(|c| (c.id.clone(), c)).collect();
        Self {
            event,
            channels,
            sessions: HashMap::new(),
            closed: false,
        }
    }

    /// The run this tracker belongs to.
    #[must_use]
    pub const fn event(&self) -> &EventRunId {
        &self.event
    }

    /// Whether the run has been force-closed.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of currently open sessions.
    #[must_use]
    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Handles a join.
    ///
    /// A duplicate join (an open session already exists for the key) is a
    /// protocol anomaly: the stale session is defensively finalized at the
    /// new join time before the new one opens. Joins on untracked channels
    /// are dropped; event delivery is best-effort and must never raise.
    pub fn on_join(&mut self, join: &JoinEvent) -> Result<Vec<ParticipationRecord>, TrackError> {
        if self.closed {
            return Err(TrackError::EventClosed {
                event: self.event.clone(),
            });
        }
        if !self.channels.contains_key(&join.channel) {
            tracing::warn!(
                event = %self.event,
                channel = %join.channel,
                participant = %join.participant,
                "join for untracked channel dropped"
            );
            return Ok(Vec::new());
        }

        let key = SessionKey {
            channel: join.channel.clone(),
            participant: join.participant.clone(),
        };
        let mut flushed = Vec::new();

        if let Some(stale) = self.sessions.remove(&key) {
            tracing::warn!(
                event = %self.event,
                channel = %key.channel,
                participant = %key.participant,
                "duplicate join; finalizing stale session"
            );
            flushed.push(self.finalize(&key, &stale, join.at));
        }

        self.sessions.insert(
            key,
            OpenSession {
                joined_at: join.at,
                last_checkpoint: join.at,
                display_name: join.display_name.clone(),
                member: join.member,
            },
        );
        Ok(flushed)
    }

    /// Handles a leave.
    ///
    /// A leave without a matching open session is a no-op; it can occur
    /// after a tracker restart or duplicate delivery.
    pub fn on_leave(&mut self, leave: &LeaveEvent) -> Vec<ParticipationRecord> {
        let key = SessionKey {
            channel: leave.channel.clone(),
            participant: leave.participant.clone(),
        };
        match self.sessions.remove(&key) {
            Some(session) => vec![self.finalize(&key, &session, leave.at)],
            None => {
                tracing::debug!(
                    event = %self.event,
                    channel = %key.channel,
                    participant = %key.participant,
                    "leave without matching join ignored"
                );
                Vec::new()
            }
        }
    }

    /// Handles a periodic tick.
    ///
    /// Sessions whose participant is confirmed present by the roster get a
    /// cumulative checkpoint flush and advance their checkpoint; sessions
    /// whose participant is absent are finalized at the last confirmed
    /// presence time, not the tick time.
    pub fn on_tick(&mut self, tick: &TickEvent) -> Vec<ParticipationRecord> {
        if self.closed {
            return Vec::new();
        }

        let mut flushed = Vec::new();
        let sessions = std::mem::take(&mut self.sessions);
        let mut kept = HashMap::with_capacity(sessions.len());
        for (key, mut session) in sessions {
            if tick.roster.contains(&key.channel, &key.participant) {
                if tick.now > session.last_checkpoint {
                    session.last_checkpoint = tick.now;
                    flushed.push(self.finalize(&key, &session, tick.now));
                }
                // An out-of-order tick is already covered by the checkpoint.
                kept.insert(key, session);
            } else {
                tracing::warn!(
                    event = %self.event,
                    channel = %key.channel,
                    participant = %key.participant,
                    "participant absent at tick; finalizing at last confirmed presence"
                );
                let last_seen = session.last_checkpoint;
                flushed.push(self.finalize(&key, &session, last_seen));
            }
        }
        self.sessions = kept;
        flushed
    }

    /// Finalizes every remaining session at `at` and closes the run.
    ///
    /// After this returns, joins are rejected with
    /// [`TrackError::EventClosed`]; leaves and ticks become no-ops.
    pub fn force_close_all(&mut self, at: DateTime<Utc>) -> Vec<ParticipationRecord> {
        let sessions = std::mem::take(&mut self.sessions);
        self.closed = true;
        sessions
            .into_iter()
            .map(|(key, session)| self.finalize(&key, &session, at))
            .collect()
    }

    /// Participants currently present in any tracked channel, sorted and
    /// deduplicated.
    #[must_use]
    pub fn live_participants(&self) -> Vec<ParticipantId> {
        let mut participants: Vec<ParticipantId> = self
            .sessions
            .keys()
            .map(|k| k.participant.clone())
            .collect();
        participants.sort();
        participants.dedup();
        participants
    }

    /// Builds the flush record for a session up to `left_at`.
    ///
    /// The close time never moves behind the last checkpoint: a flush
    /// already covered that interval and stored durations must not shrink.
    fn finalize(
        &self,
        key: &SessionKey,
        session: &OpenSession,
        left_at: DateTime<Utc>,
    ) -> ParticipationRecord {
        ParticipationRecord::for_interval(
            self.event.clone(),
            key.participant.clone(),
            session.display_name.clone(),
            key.channel.clone(),
            session.joined_at,
            left_at.max(session.last_checkpoint),
            session.member,
        )
    }
}
