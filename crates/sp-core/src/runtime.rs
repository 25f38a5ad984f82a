//! Live tracking runtime: one actor per event run, one persistence worker.
//!
//! All mutation of a run's open-session state happens inside a single
//! tokio task owning a [`SessionTracker`], fed by a bounded command queue —
//! events for the same run are processed in arrival order with no shared
//! mutable state. Flushed records cross a bounded queue to a dedicated
//! persistence worker thread, so a slow store applies backpressure to the
//! enqueue instead of stalling join/leave processing or dropping data.
//!
//! The worker retries failed writes with bounded backoff and parks records
//! that exhaust their retries for a later pass; they are dropped only at
//! shutdown, loudly.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::event::{JoinEvent, LeaveEvent, PresenceEvent, TickEvent};
use crate::record::{EventRun, ParticipationRecord};
use crate::store::{AppendOutcome, SessionStore};
use crate::tracker::SessionTracker;
use crate::types::{EventRunId, ParticipantId, RunStatus, TrackedChannel};

/// Depth of each run actor's command queue.
const COMMAND_QUEUE_DEPTH: usize = 64;

/// Depth of the shared persistence queue.
const FLUSH_QUEUE_DEPTH: usize = 256;

/// Bounded backoff schedule for ledger writes.
const WRITE_RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(50),
    Duration::from_millis(200),
    Duration::from_millis(800),
];

/// Errors surfaced by the tracking service.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The run is already being tracked by this service.
    #[error("event run {event} is already being tracked")]
    AlreadyRunning {
        /// The running event.
        event: EventRunId,
    },

    /// The run was stopped; joins are no longer accepted.
    #[error("event run {event} is closed")]
    EventClosed {
        /// The closed event.
        event: EventRunId,
    },

    /// No such run is known to this service or the store.
    #[error("unknown event run {event}")]
    UnknownEvent {
        /// The unknown event.
        event: EventRunId,
    },

    /// The run's actor is gone (service shutting down).
    #[error("event run {event} is no longer accepting events")]
    TrackerGone {
        /// The affected event.
        event: EventRunId,
    },

    /// The underlying store failed.
    #[error("store error: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ServiceError {
    fn store<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Store(Box::new(err))
    }
}

enum RunCommand {
    Join(JoinEvent),
    Leave(LeaveEvent),
    Tick(TickEvent),
    Live(oneshot::Sender<Vec<ParticipantId>>),
    Stop {
        at: DateTime<Utc>,
        ack: oneshot::Sender<()>,
    },
}

enum WriteRequest {
    Record(ParticipationRecord),
    /// Resolves once every previously enqueued record has been persisted.
    Barrier(oneshot::Sender<()>),
}

struct RunHandle {
    tx: mpsc::Sender<RunCommand>,
    task: tokio::task::JoinHandle<()>,
}

/// Drives live session tracking across concurrent event runs.
pub struct TrackerService<S: SessionStore + Send + 'static> {
    store: Arc<Mutex<S>>,
    runs: HashMap<EventRunId, RunHandle>,
    flush_tx: mpsc::Sender<WriteRequest>,
    writer: Option<std::thread::JoinHandle<()>>,
}

fn lock<S>(store: &Arc<Mutex<S>>) -> MutexGuard<'_, S> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<S: SessionStore + Send + 'static> TrackerService<S> {
    /// Creates a service over the given store and starts the persistence
    /// worker.
    #[must_use]
    pub fn new(store: S) -> Self {
        let store = Arc::new(Mutex::new(store));
        let (flush_tx, flush_rx) = mpsc::channel(FLUSH_QUEUE_DEPTH);
        let writer = spawn_writer(Arc::clone(&store), flush_rx);
        Self {
            store,
            runs: HashMap::new(),
            flush_tx,
            writer: Some(writer),
        }
    }

    /// Shared handle to the underlying store, for read paths (status,
    /// payroll) that live outside the tracking hot path.
    #[must_use]
    pub fn store(&self) -> Arc<Mutex<S>> {
        Arc::clone(&self.store)
    }

    /// Starts tracking a run, creating its ledger row if needed.
    ///
    /// A run that already exists in the store as `Open` (e.g. after a
    /// tracker restart) is resumed; a `Closed` run is rejected.
    pub async fn start_event(
        &mut self,
        event: EventRunId,
        channels: Vec<TrackedChannel>,
        started_at: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        if self.runs.contains_key(&event) {
            return Err(ServiceError::AlreadyRunning { event });
        }

        let existing = lock(&self.store)
            .event_run(&event)
            .map_err(ServiceError::store)?;
        match existing {
            Some(run) if run.status == RunStatus::Closed => {
                return Err(ServiceError::EventClosed { event });
            }
            Some(_) => {
                tracing::info!(event = %event, "resuming open event run");
            }
            None => {
                let run = EventRun::open(event.clone(), started_at, channels.clone());
                lock(&self.store)
                    .create_event_run(&run)
                    .map_err(ServiceError::store)?;
            }
        }

        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let tracker = SessionTracker::new(event.clone(), channels);
        let task = tokio::spawn(run_actor(tracker, rx, self.flush_tx.clone()));
        self.runs.insert(event, RunHandle { tx, task });
        Ok(())
    }

    /// Routes a presence event to the owning run actor.
    ///
    /// Joins for closed runs are rejected; leaves and ticks for closed or
    /// unknown runs are no-ops, since the sessions they refer to are
    /// already finalized.
    pub async fn dispatch(&self, event: PresenceEvent) -> Result<(), ServiceError> {
        match event {
            PresenceEvent::Join(join) => {
                let run = join.event.clone();
                match self.runs.get(&run) {
                    Some(handle) => handle
                        .tx
                        .send(RunCommand::Join(join))
                        .await
                        .map_err(|_| ServiceError::TrackerGone { event: run }),
                    None => Err(self.missing_run_error(run)),
                }
            }
            PresenceEvent::Leave(leave) => {
                let run = leave.event.clone();
                match self.runs.get(&run) {
                    Some(handle) => handle
                        .tx
                        .send(RunCommand::Leave(leave))
                        .await
                        .map_err(|_| ServiceError::TrackerGone { event: run }),
                    None => {
                        tracing::debug!(event = %run, "leave for inactive run ignored");
                        Ok(())
                    }
                }
            }
            PresenceEvent::Tick(tick) => {
                for (run, handle) in &self.runs {
                    if handle
                        .tx
                        .send(RunCommand::Tick(tick.clone()))
                        .await
                        .is_err()
                    {
                        tracing::warn!(event = %run, "tick not delivered; actor gone");
                    }
                }
                Ok(())
            }
        }
    }

    /// Participants currently present in the run's tracked channels.
    pub async fn live_participants(
        &self,
        event: &EventRunId,
    ) -> Result<Vec<ParticipantId>, ServiceError> {
        let handle = self
            .runs
            .get(event)
            .ok_or_else(|| self.missing_run_error(event.clone()))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        handle
            .tx
            .send(RunCommand::Live(reply_tx))
            .await
            .map_err(|_| ServiceError::TrackerGone {
                event: event.clone(),
            })?;
        reply_rx.await.map_err(|_| ServiceError::TrackerGone {
            event: event.clone(),
        })
    }

    /// Stops a run: force-closes every open session at `at`, waits for the
    /// flushes to be persisted, and marks the run closed in the store.
    pub async fn stop_event(
        &mut self,
        event: &EventRunId,
        at: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let Some(handle) = self.runs.remove(event) else {
            return Err(self.missing_run_error(event.clone()));
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if handle
            .tx
            .send(RunCommand::Stop { at, ack: ack_tx })
            .await
            .is_ok()
        {
            let _ = ack_rx.await;
        }
        let _ = handle.task.await;

        self.wait_for_flushes().await;
        lock(&self.store)
            .close_event_run(event, at)
            .map_err(ServiceError::store)?;
        Ok(())
    }

    /// Stops every remaining run at `at` and joins the persistence worker.
    pub async fn shutdown(mut self, at: DateTime<Utc>) {
        let events: Vec<EventRunId> = self.runs.keys().cloned().collect();
        for event in events {
            if let Err(err) = self.stop_event(&event, at).await {
                tracing::error!(event = %event, error = %err, "failed to stop run at shutdown");
            }
        }
        drop(self.flush_tx);
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                tracing::error!("persistence worker panicked");
            }
        }
    }

    /// Blocks until every record enqueued so far has been persisted.
    async fn wait_for_flushes(&self) {
        let (barrier_tx, barrier_rx) = oneshot::channel();
        if self
            .flush_tx
            .send(WriteRequest::Barrier(barrier_tx))
            .await
            .is_ok()
        {
            let _ = barrier_rx.await;
        }
    }

    fn missing_run_error(&self, event: EventRunId) -> ServiceError {
        let closed = lock(&self.store)
            .event_run(&event)
            .ok()
            .flatten()
            .is_some_and(|run| run.status == RunStatus::Closed);
        if closed {
            ServiceError::EventClosed { event }
        } else {
            ServiceError::UnknownEvent { event }
        }
    }
}

/// The single-writer actor owning one run's tracker state.
async fn run_actor(
    mut tracker: SessionTracker,
    mut rx: mpsc::Receiver<RunCommand>,
    flush_tx: mpsc::Sender<WriteRequest>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            RunCommand::Join(join) => match tracker.on_join(&join) {
                Ok(records) => forward(records, &flush_tx).await,
                Err(err) => tracing::warn!(error = %err, "join rejected"),
            },
            RunCommand::Leave(leave) => forward(tracker.on_leave(&leave), &flush_tx).await,
            RunCommand::Tick(tick) => forward(tracker.on_tick(&tick), &flush_tx).await,
            RunCommand::Live(reply) => {
                let _ = reply.send(tracker.live_participants());
            }
            RunCommand::Stop { at, ack } => {
                forward(tracker.force_close_all(at), &flush_tx).await;
                let _ = ack.send(());
                break;
            }
        }
    }
}

/// Enqueues flushed records for persistence, applying backpressure when the
/// queue is full rather than dropping.
async fn forward(records: Vec<ParticipationRecord>, flush_tx: &mpsc::Sender<WriteRequest>) {
    for record in records {
        if flush_tx.send(WriteRequest::Record(record)).await.is_err() {
            tracing::error!("persistence worker gone; participation record lost");
        }
    }
}

/// Spawns the persistence worker thread.
///
/// The store is synchronous, so writes run on a dedicated thread off the
/// async runtime; the bounded queue in front of it is the backpressure
/// boundary.
fn spawn_writer<S: SessionStore + Send + 'static>(
    store: Arc<Mutex<S>>,
    mut rx: mpsc::Receiver<WriteRequest>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut parked: VecDeque<ParticipationRecord> = VecDeque::new();
        while let Some(request) = rx.blocking_recv() {
            match request {
                WriteRequest::Record(record) => {
                    retry_parked(&store, &mut parked);
                    if let Err(record) = write_with_backoff(&store, record) {
                        parked.push_back(record);
                    }
                }
                WriteRequest::Barrier(ack) => {
                    retry_parked(&store, &mut parked);
                    let _ = ack.send(());
                }
            }
        }
        retry_parked(&store, &mut parked);
        if !parked.is_empty() {
            tracing::error!(
                count = parked.len(),
                "unpersisted participation records at shutdown"
            );
        }
    })
}

/// Retries previously parked records ahead of new work.
fn retry_parked<S: SessionStore>(store: &Arc<Mutex<S>>, parked: &mut VecDeque<ParticipationRecord>) {
    for _ in 0..parked.len() {
        let Some(record) = parked.pop_front() else {
            break;
        };
        if let Err(record) = write_with_backoff(store, record) {
            parked.push_back(record);
        }
    }
}

/// Writes one record, retrying with bounded backoff. Returns the record on
/// exhaustion so the caller can park it.
fn write_with_backoff<S: SessionStore>(
    store: &Arc<Mutex<S>>,
    record: ParticipationRecord,
) -> Result<(), ParticipationRecord> {
    let mut attempt = 0;
    loop {
        match lock(store).append(&record) {
            Ok(AppendOutcome::Stale) => {
                tracing::warn!(
                    event = %record.event,
                    participant = %record.participant,
                    "stale flush ignored by ledger"
                );
                return Ok(());
            }
            Ok(_) => return Ok(()),
            Err(err) => {
                let Some(delay) = WRITE_RETRY_DELAYS.get(attempt) else {
                    tracing::error!(
                        event = %record.event,
                        participant = %record.participant,
                        error = %err,
                        "ledger write exhausted retries; parking record"
                    );
                    return Err(record);
                };
                tracing::warn!(
                    attempt,
                    error = %err,
                    "ledger write failed; backing off"
                );
                std::thread::sleep(*delay);
                attempt += 1;
            }
        }
    }
}
