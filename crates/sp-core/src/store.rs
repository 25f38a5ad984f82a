//! Storage seam for the participation ledger.
//!
//! The tracker runtime writes through [`SessionStore`] so the core stays
//! independent of any particular storage engine; the sqlite implementation
//! lives in the `sp-db` crate and [`MemoryStore`] backs tests and dry runs.

use std::collections::BTreeMap;
use std::convert::Infallible;

use chrono::{DateTime, Utc};

use crate::record::{EventRun, ParticipationRecord};
use crate::types::{ChannelId, EventRunId, ParticipantId, RunStatus};

/// Outcome of appending a participation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// A new session record was inserted.
    Inserted,
    /// An existing session record was extended by a later flush.
    Extended,
    /// The record would have shrunk the stored duration (out-of-order or
    /// duplicate delivery) and was ignored.
    Stale,
}

/// Durable storage for event runs and participation records.
///
/// `append` has upsert semantics keyed by session identity
/// `(event, participant, channel, joined_at)`: a flush for an existing
/// identity extends the stored record, and the stored duration never
/// decreases across successive upserts.
pub trait SessionStore {
    /// Storage error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Persists a new event run.
    fn create_event_run(&mut self, run: &EventRun) -> Result<(), Self::Error>;

    /// Marks an event run closed.
    fn close_event_run(
        &mut self,
        event: &EventRunId,
        ended_at: DateTime<Utc>,
    ) -> Result<(), Self::Error>;

    /// Looks up an event run.
    fn event_run(&self, event: &EventRunId) -> Result<Option<EventRun>, Self::Error>;

    /// Inserts or extends a participation record by session identity.
    fn append(&mut self, record: &ParticipationRecord) -> Result<AppendOutcome, Self::Error>;

    /// All records for an event, ordered by join time then participant.
    fn records_for_event(
        &self,
        event: &EventRunId,
    ) -> Result<Vec<ParticipationRecord>, Self::Error>;

    /// Sums whole minutes per participant across the event's sessions,
    /// skipping the given channels. Seconds are summed first and divided
    /// once, so several short sessions do not each lose a fraction.
    fn aggregate_minutes(
        &self,
        event: &EventRunId,
        exclude_channels: &[ChannelId],
    ) -> Result<BTreeMap<ParticipantId, u64>, Self::Error>;

    /// Bulk purge of an event's records and its run row. Returns the number
    /// of participation records removed.
    fn delete_event(&mut self, event: &EventRunId) -> Result<usize, Self::Error>;
}

type SessionIdentity = (EventRunId, ParticipantId, ChannelId, DateTime<Utc>);

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    runs: BTreeMap<EventRunId, EventRun>,
    records: BTreeMap<SessionIdentity, ParticipationRecord>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    type Error = Infallible;

    fn create_event_run(&mut self, run: &EventRun) -> Result<(), Self::Error> {
        self.runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    fn close_event_run(
        &mut self,
        event: &EventRunId,
        ended_at: DateTime<Utc>,
    ) -> Result<(), Self::Error> {
        if let Some(run) = self.runs.get_mut(event) {
            run.ended_at = Some(ended_at);
            run.status = RunStatus::Closed;
        }
        Ok(())
    }

    fn event_run(&self, event: &EventRunId) -> Result<Option<EventRun>, Self::Error> {
        Ok(self.runs.get(event).cloned())
    }

    fn append(&mut self, record: &ParticipationRecord) -> Result<AppendOutcome, Self::Error> {
        let key = (
            record.event.clone(),
            record.participant.clone(),
            record.channel.clone(),
            record.joined_at,
        );
        match self.records.entry(key) {
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(record.clone());
                Ok(AppendOutcome::Inserted)
            }
            std::collections::btree_map::Entry::Occupied(mut entry) => {
                if record.duration_seconds >= entry.get().duration_seconds {
                    entry.insert(record.clone());
                    Ok(AppendOutcome::Extended)
                } else {
                    Ok(AppendOutcome::Stale)
                }
            }
        }
    }

    fn records_for_event(
        &self,
        event: &EventRunId,
    ) -> Result<Vec<ParticipationRecord>, Self::Error> {
        let mut records: Vec<ParticipationRecord> = self
            .records
            .values()
            .filter(|r| &r.event == event)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.participant.cmp(&b.participant))
        });
        Ok(records)
    }

    fn aggregate_minutes(
        &self,
        event: &EventRunId,
        exclude_channels: &[ChannelId],
    ) -> Result<BTreeMap<ParticipantId, u64>, Self::Error> {
        let mut seconds: BTreeMap<ParticipantId, u64> = BTreeMap::new();
        for record in self.records.values() {
            if &record.event != event || exclude_channels.contains(&record.channel) {
                continue;
            }
            *seconds.entry(record.participant.clone()).or_default() +=
                u64::try_from(record.duration_seconds).unwrap_or(0);
        }
        Ok(seconds.into_iter().map(|(p, s)| (p, s / 60)).collect())
    }

    fn delete_event(&mut self, event: &EventRunId) -> Result<usize, Self::Error> {
        self.runs.remove(event);
        let before = self.records.len();
        self.records.retain(|_, r| &r.event != event);
        Ok(before - self.records.len())
    }
}
