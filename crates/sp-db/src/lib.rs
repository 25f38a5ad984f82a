//! Participation ledger backed by `rusqlite`.
//!
//! # Thread Safety
//!
//! [`Ledger`] wraps a `rusqlite::Connection`, which is `Send` but not
//! `Sync`: an instance can be moved between threads but not shared without
//! external synchronization. The tracker runtime funnels all writes through
//! a single persistence worker, which is exactly that discipline; read-side
//! consumers open their own connection or share the worker's behind a
//! mutex.
//!
//! # Schema
//!
//! Timestamps are stored as TEXT in ISO 8601 UTC (e.g.
//! `2026-08-01T18:00:00Z`) so lexicographic order matches chronological
//! order. One `participation` row exists per session identity
//! `(event_id, participant_id, channel_id, joined_at)`; checkpoint flushes
//! for a still-open session update the row in place, and an update that
//! would shrink `duration_seconds` is ignored — that indicates out-of-order
//! or duplicate delivery, never a real session getting shorter.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use thiserror::Error;

use sp_core::{
    AppendOutcome, ChannelId, EventRun, EventRunId, ParticipantId, ParticipationRecord, RunStatus,
    SessionStore, TrackedChannel,
};

/// Bounded backoff schedule applied uniformly at the write boundary.
const WRITE_RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(50),
    Duration::from_millis(200),
    Duration::from_millis(800),
];

/// Ledger errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to parse a stored timestamp.
    #[error("invalid stored timestamp: {value}")]
    TimestampParse {
        value: String,
        #[source]
        source: chrono::ParseError,
    },

    /// Failed to parse the stored channel roster for a run.
    #[error("invalid channel roster for run {event}")]
    ChannelsParse {
        event: String,
        #[source]
        source: serde_json::Error,
    },

    /// A stored identifier failed validation on read-back.
    #[error("invalid stored value")]
    Validation(#[from] sp_core::ValidationError),
}

/// Durable participation ledger.
///
/// See the [module documentation](self) for thread safety considerations.
pub struct Ledger {
    conn: Connection,
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|source| DbError::TimestampParse {
            value: value.to_string(),
            source,
        })
}

/// Returns whether a sqlite error is worth retrying (busy/locked).
fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

/// Runs a write operation with bounded exponential backoff on transient
/// failures. Non-transient errors surface immediately.
fn with_retry<T>(
    operation: &str,
    mut op: impl FnMut() -> Result<T, rusqlite::Error>,
) -> Result<T, rusqlite::Error> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) => {
                let Some(delay) = WRITE_RETRY_DELAYS.get(attempt) else {
                    return Err(err);
                };
                tracing::warn!(operation, attempt, error = %err, "transient write failure; backing off");
                std::thread::sleep(*delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

impl Ledger {
    /// Opens a ledger at the given path, creating it if necessary.
    ///
    /// The schema is automatically initialized on first open.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let ledger = Self { conn };
        ledger.init()?;
        Ok(ledger)
    }

    /// Opens an in-memory ledger.
    ///
    /// Useful for testing. The data is destroyed when the connection closes.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let ledger = Self { conn };
        ledger.init()?;
        Ok(ledger)
    }

    /// Initializes the schema. Idempotent.
    fn init(&self) -> Result<(), DbError> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS event_runs (
                id TEXT PRIMARY KEY,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                status TEXT NOT NULL DEFAULT 'open',
                channels TEXT NOT NULL DEFAULT '[]'
            );

            -- One row per session identity; duration_seconds never
            -- decreases across upserts.
            CREATE TABLE IF NOT EXISTS participation (
                event_id TEXT NOT NULL,
                participant_id TEXT NOT NULL,
                display_name TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                joined_at TEXT NOT NULL,
                left_at TEXT NOT NULL,
                duration_seconds INTEGER NOT NULL,
                is_member INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (event_id, participant_id, channel_id, joined_at),
                FOREIGN KEY (event_id) REFERENCES event_runs(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_participation_event
                ON participation(event_id);
            CREATE INDEX IF NOT EXISTS idx_participation_participant
                ON participation(event_id, participant_id);
            ",
        )?;
        Ok(())
    }

    /// Persists a new event run with its channel roster.
    pub fn create_event_run(&mut self, run: &EventRun) -> Result<(), DbError> {
        let channels = serde_json::to_string(&run.channels).map_err(|source| {
            DbError::ChannelsParse {
                event: run.id.to_string(),
                source,
            }
        })?;
        with_retry("create_event_run", || {
            self.conn.execute(
                "INSERT INTO event_runs (id, started_at, ended_at, status, channels)
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    run.id.as_str(),
                    format_timestamp(run.started_at),
                    run.ended_at.map(format_timestamp),
                    run.status.as_str(),
                    channels,
                ],
            )
        })?;
        Ok(())
    }

    /// Marks a run closed at `ended_at`.
    pub fn close_event_run(
        &mut self,
        event: &EventRunId,
        ended_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        with_retry("close_event_run", || {
            self.conn.execute(
                "UPDATE event_runs SET ended_at = ?, status = ? WHERE id = ?",
                params![
                    format_timestamp(ended_at),
                    RunStatus::Closed.as_str(),
                    event.as_str(),
                ],
            )
        })?;
        Ok(())
    }

    /// Looks up a run by ID.
    pub fn event_run(&self, event: &EventRunId) -> Result<Option<EventRun>, DbError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, started_at, ended_at, status, channels
                 FROM event_runs WHERE id = ?",
                params![event.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, started_at, ended_at, status, channels)) = row else {
            return Ok(None);
        };
        let channels: Vec<TrackedChannel> =
            serde_json::from_str(&channels).map_err(|source| DbError::ChannelsParse {
                event: id.clone(),
                source,
            })?;
        Ok(Some(EventRun {
            id: EventRunId::new(id)?,
            started_at: parse_timestamp(&started_at)?,
            ended_at: ended_at.as_deref().map(parse_timestamp).transpose()?,
            status: status.parse()?,
            channels,
        }))
    }

    /// Inserts or extends a record by session identity.
    ///
    /// An update that would shrink the stored duration is ignored and
    /// logged; it indicates an out-of-order or duplicate event.
    pub fn append(&mut self, record: &ParticipationRecord) -> Result<AppendOutcome, DbError> {
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT duration_seconds FROM participation
                 WHERE event_id = ? AND participant_id = ? AND channel_id = ? AND joined_at = ?",
                params![
                    record.event.as_str(),
                    record.participant.as_str(),
                    record.channel.as_str(),
                    format_timestamp(record.joined_at),
                ],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            None => {
                with_retry("append_insert", || {
                    self.conn.execute(
                        "INSERT INTO participation
                         (event_id, participant_id, display_name, channel_id,
                          joined_at, left_at, duration_seconds, is_member)
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                        params![
                            record.event.as_str(),
                            record.participant.as_str(),
                            record.display_name,
                            record.channel.as_str(),
                            format_timestamp(record.joined_at),
                            format_timestamp(record.left_at),
                            record.duration_seconds,
                            i64::from(record.member),
                        ],
                    )
                })?;
                Ok(AppendOutcome::Inserted)
            }
            Some(prev) if record.duration_seconds >= prev => {
                with_retry("append_extend", || {
                    self.conn.execute(
                        "UPDATE participation
                         SET left_at = ?, duration_seconds = ?, display_name = ?, is_member = ?
                         WHERE event_id = ? AND participant_id = ? AND channel_id = ? AND joined_at = ?",
                        params![
                            format_timestamp(record.left_at),
                            record.duration_seconds,
                            record.display_name,
                            i64::from(record.member),
                            record.event.as_str(),
                            record.participant.as_str(),
                            record.channel.as_str(),
                            format_timestamp(record.joined_at),
                        ],
                    )
                })?;
                Ok(AppendOutcome::Extended)
            }
            Some(prev) => {
                tracing::warn!(
                    event = %record.event,
                    participant = %record.participant,
                    stored = prev,
                    offered = record.duration_seconds,
                    "rejecting duration shrink; out-of-order or duplicate flush"
                );
                Ok(AppendOutcome::Stale)
            }
        }
    }

    /// All records for an event, ordered by join time then participant.
    pub fn records_for_event(
        &self,
        event: &EventRunId,
    ) -> Result<Vec<ParticipationRecord>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT event_id, participant_id, display_name, channel_id,
                    joined_at, left_at, duration_seconds, is_member
             FROM participation
             WHERE event_id = ?
             ORDER BY joined_at ASC, participant_id ASC",
        )?;
        let rows = stmt.query_map(params![event.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, i64>(7)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (event_id, participant, display_name, channel, joined_at, left_at, duration, member) =
                row?;
            records.push(ParticipationRecord {
                event: EventRunId::new(event_id)?,
                participant: ParticipantId::new(participant)?,
                display_name,
                channel: ChannelId::new(channel)?,
                joined_at: parse_timestamp(&joined_at)?,
                left_at: parse_timestamp(&left_at)?,
                duration_seconds: duration,
                member: member != 0,
            });
        }
        Ok(records)
    }

    /// Sums whole minutes per participant across the event's sessions.
    ///
    /// Seconds are summed first and divided once, so many short sessions do
    /// not each lose a sub-minute fraction.
    pub fn aggregate_minutes(
        &self,
        event: &EventRunId,
        exclude_channels: &[ChannelId],
    ) -> Result<BTreeMap<ParticipantId, u64>, DbError> {
        let placeholders = exclude_channels
            .iter()
            .map(|_| "?")
            .collect::<Vec<_>>()
            .join(", ");
        let sql = if exclude_channels.is_empty() {
            "SELECT participant_id, SUM(duration_seconds)
             FROM participation WHERE event_id = ?
             GROUP BY participant_id"
                .to_string()
        } else {
            format!(
                "SELECT participant_id, SUM(duration_seconds)
                 FROM participation WHERE event_id = ? AND channel_id NOT IN ({placeholders})
                 GROUP BY participant_id"
            )
        };

        let mut stmt = self.conn.prepare(&sql)?;
        let bindings = std::iter::once(event.as_str().to_string())
            .chain(exclude_channels.iter().map(|c| c.as_str().to_string()));
        let rows = stmt.query_map(params_from_iter(bindings), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut minutes = BTreeMap::new();
        for row in rows {
            let (participant, seconds) = row?;
            let seconds = u64::try_from(seconds.max(0)).unwrap_or(0);
            minutes.insert(ParticipantId::new(participant)?, seconds / 60);
        }
        Ok(minutes)
    }

    /// Bulk purge of an event's records and its run row.
    ///
    /// Returns the number of participation records removed.
    pub fn delete_event(&mut self, event: &EventRunId) -> Result<usize, DbError> {
        let tx = self.conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM participation WHERE event_id = ?",
            params![event.as_str()],
        )?;
        tx.execute(
            "DELETE FROM event_runs WHERE id = ?",
            params![event.as_str()],
        )?;
        tx.commit()?;
        Ok(removed)
    }
}

impl SessionStore for Ledger {
    type Error = DbError;

    fn create_event_run(&mut self, run: &EventRun) -> Result<(), Self::Error> {
        Self::create_event_run(self, run)
    }

    fn close_event_run(
        &mut self,
        event: &EventRunId,
        ended_at: DateTime<Utc>,
    ) -> Result<(), Self::Error> {
        Self::close_event_run(self, event, ended_at)
    }

    fn event_run(&self, event: &EventRunId) -> Result<Option<EventRun>, Self::Error> {
        Self::event_run(self, event)
    }

    fn append(&mut self, record: &ParticipationRecord) -> Result<AppendOutcome, Self::Error> {
        Self::append(self, record)
    }

    fn records_for_event(
        &self,
        event: &EventRunId,
    ) -> Result<Vec<ParticipationRecord>, Self::Error> {
        Self::records_for_event(self, event)
    }

    fn aggregate_minutes(
        &self,
        event: &EventRunId,
        exclude_channels: &[ChannelId],
    ) -> Result<BTreeMap<ParticipantId, u64>, Self::Error> {
        Self::aggregate_minutes(self, event, exclude_channels)
    }

    fn delete_event(&mut self, event: &EventRunId) -> Result<usize, Self::Error> {
        Self::delete_event(self, event)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, 18, 0, 0)
            .single()
            .expect("valid test timestamp")
            + chrono::Duration::seconds(secs)
    }

    fn run_id(id: &str) -> EventRunId {
        EventRunId::new(id).unwrap()
    }

    fn channels() -> Vec<TrackedChannel> {
        vec![
            TrackedChannel {
                id: ChannelId::new("staging").unwrap(),
                name: "Staging".to_string(),
                staging: true,
            },
            TrackedChannel {
                id: ChannelId::new("mining-alpha").unwrap(),
                name: "Mining Alpha".to_string(),
                staging: false,
            },
        ]
    }

    fn open_run(ledger: &mut Ledger, id: &str) {
        ledger
            .create_event_run(&EventRun::open(run_id(id), ts(0), channels()))
            .unwrap();
    }

    fn record(
        event: &str,
        participant: &str,
        channel: &str,
        joined: i64,
        left: i64,
    ) -> ParticipationRecord {
        ParticipationRecord::for_interval(
            run_id(event),
            ParticipantId::new(participant).unwrap(),
            participant.to_uppercase(),
            ChannelId::new(channel).unwrap(),
            ts(joined),
            ts(left),
            false,
        )
    }

    #[test]
    fn event_run_roundtrip_preserves_channels() {
        let mut ledger = Ledger::open_in_memory().unwrap();
        open_run(&mut ledger, "op-1");

        let run = ledger.event_run(&run_id("op-1")).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Open);
        assert_eq!(run.started_at, ts(0));
        assert_eq!(run.channels, channels());
        assert_eq!(run.staging_channels(), vec![ChannelId::new("staging").unwrap()]);
    }

    #[test]
    fn close_event_run_sets_status_and_end() {
        let mut ledger = Ledger::open_in_memory().unwrap();
        open_run(&mut ledger, "op-1");
        ledger.close_event_run(&run_id("op-1"), ts(3600)).unwrap();

        let run = ledger.event_run(&run_id("op-1")).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Closed);
        assert_eq!(run.ended_at, Some(ts(3600)));
    }

    #[test]
    fn unknown_run_is_none() {
        let ledger = Ledger::open_in_memory().unwrap();
        assert!(ledger.event_run(&run_id("nope")).unwrap().is_none());
    }

    #[test]
    fn append_then_extend_same_identity() {
        let mut ledger = Ledger::open_in_memory().unwrap();
        open_run(&mut ledger, "op-1");

        let outcome = ledger
            .append(&record("op-1", "p1", "mining-alpha", 0, 60))
            .unwrap();
        assert_eq!(outcome, AppendOutcome::Inserted);

        let outcome = ledger
            .append(&record("op-1", "p1", "mining-alpha", 0, 150))
            .unwrap();
        assert_eq!(outcome, AppendOutcome::Extended);

        let records = ledger.records_for_event(&run_id("op-1")).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].duration_seconds, 150);
        assert_eq!(records[0].left_at, ts(150));
    }

    #[test]
    fn append_rejects_duration_shrink() {
        let mut ledger = Ledger::open_in_memory().unwrap();
        open_run(&mut ledger, "op-1");
        ledger
            .append(&record("op-1", "p1", "mining-alpha", 0, 150))
            .unwrap();

        let outcome = ledger
            .append(&record("op-1", "p1", "mining-alpha", 0, 60))
            .unwrap();
        assert_eq!(outcome, AppendOutcome::Stale);

        let records = ledger.records_for_event(&run_id("op-1")).unwrap();
        assert_eq!(records[0].duration_seconds, 150);
    }

    #[test]
    fn rejoin_creates_distinct_record() {
        let mut ledger = Ledger::open_in_memory().unwrap();
        open_run(&mut ledger, "op-1");
        ledger
            .append(&record("op-1", "p1", "mining-alpha", 0, 60))
            .unwrap();
        // Brief disconnect, rejoin: different joined_at, distinct record.
        ledger
            .append(&record("op-1", "p1", "mining-alpha", 120, 300))
            .unwrap();

        let records = ledger.records_for_event(&run_id("op-1")).unwrap();
        assert_eq!(records.len(), 2);

        let minutes = ledger.aggregate_minutes(&run_id("op-1"), &[]).unwrap();
        // 60s + 180s = 240s = 4 minutes.
        assert_eq!(minutes[&ParticipantId::new("p1").unwrap()], 4);
    }

    #[test]
    fn aggregate_sums_across_channels_and_excludes() {
        let mut ledger = Ledger::open_in_memory().unwrap();
        open_run(&mut ledger, "op-1");
        ledger
            .append(&record("op-1", "p1", "mining-alpha", 0, 600))
            .unwrap();
        ledger
            .append(&record("op-1", "p1", "staging", 700, 1300))
            .unwrap();
        ledger
            .append(&record("op-1", "p2", "mining-alpha", 0, 300))
            .unwrap();

        let all = ledger.aggregate_minutes(&run_id("op-1"), &[]).unwrap();
        assert_eq!(all[&ParticipantId::new("p1").unwrap()], 20);
        assert_eq!(all[&ParticipantId::new("p2").unwrap()], 5);

        let excluded = ledger
            .aggregate_minutes(&run_id("op-1"), &[ChannelId::new("staging").unwrap()])
            .unwrap();
        assert_eq!(excluded[&ParticipantId::new("p1").unwrap()], 10);
    }

    #[test]
    fn aggregate_is_blind_to_membership() {
        let mut ledger = Ledger::open_in_memory().unwrap();
        open_run(&mut ledger, "op-1");

        let mut member = record("op-1", "p1", "mining-alpha", 0, 600);
        member.member = true;
        ledger.append(&member).unwrap();
        ledger
            .append(&record("op-1", "p2", "mining-alpha", 0, 600))
            .unwrap();

        let minutes = ledger.aggregate_minutes(&run_id("op-1"), &[]).unwrap();
        assert_eq!(
            minutes[&ParticipantId::new("p1").unwrap()],
            minutes[&ParticipantId::new("p2").unwrap()]
        );
    }

    #[test]
    fn records_ordered_by_join_then_participant() {
        let mut ledger = Ledger::open_in_memory().unwrap();
        open_run(&mut ledger, "op-1");
        ledger
            .append(&record("op-1", "p2", "mining-alpha", 300, 600))
            .unwrap();
        ledger
            .append(&record("op-1", "p1", "mining-alpha", 0, 600))
            .unwrap();
        ledger
            .append(&record("op-1", "p3", "mining-alpha", 300, 600))
            .unwrap();

        let records = ledger.records_for_event(&run_id("op-1")).unwrap();
        let order: Vec<&str> = records.iter().map(|r| r.participant.as_str()).collect();
        assert_eq!(order, vec!["p1", "p2", "p3"]);
    }

    #[test]
    fn delete_event_purges_records_and_run() {
        let mut ledger = Ledger::open_in_memory().unwrap();
        open_run(&mut ledger, "op-1");
        open_run(&mut ledger, "op-2");
        ledger
            .append(&record("op-1", "p1", "mining-alpha", 0, 60))
            .unwrap();
        ledger
            .append(&record("op-1", "p2", "mining-alpha", 0, 60))
            .unwrap();
        ledger
            .append(&record("op-2", "p1", "mining-alpha", 0, 60))
            .unwrap();

        assert_eq!(ledger.delete_event(&run_id("op-1")).unwrap(), 2);
        assert!(ledger.event_run(&run_id("op-1")).unwrap().is_none());
        assert!(ledger.records_for_event(&run_id("op-1")).unwrap().is_empty());

        // The other run is untouched.
        assert!(ledger.event_run(&run_id("op-2")).unwrap().is_some());
        assert_eq!(ledger.records_for_event(&run_id("op-2")).unwrap().len(), 1);
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ledger.db");

        {
            let mut ledger = Ledger::open(&path).unwrap();
            open_run(&mut ledger, "op-1");
            ledger
                .append(&record("op-1", "p1", "mining-alpha", 0, 4200))
                .unwrap();
        }

        let ledger = Ledger::open(&path).unwrap();
        let minutes = ledger.aggregate_minutes(&run_id("op-1"), &[]).unwrap();
        assert_eq!(minutes[&ParticipantId::new("p1").unwrap()], 70);
    }
}
