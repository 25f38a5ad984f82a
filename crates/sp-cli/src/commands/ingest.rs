//! Replay a presence event stream through the session tracker.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::PoisonError;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use sp_core::{EventRunId, PresenceEvent, ServiceError, TrackedChannel, TrackerService};
use sp_db::Ledger;

fn event_time(event: &PresenceEvent) -> DateTime<Utc> {
    match event {
        PresenceEvent::Join(join) => join.at,
        PresenceEvent::Leave(leave) => leave.at,
        PresenceEvent::Tick(tick) => tick.now,
    }
}

/// Runs a complete event: start, replay, force-close, summary.
pub fn run(
    ledger: Ledger,
    event: &EventRunId,
    channels_path: &Path,
    input_path: &Path,
    end: Option<DateTime<Utc>>,
) -> Result<()> {
    let channels: Vec<TrackedChannel> = serde_json::from_str(
        &std::fs::read_to_string(channels_path).context("failed to read channel roster")?,
    )
    .context("failed to parse channel roster")?;

    let file = File::open(input_path).context("failed to open event stream")?;
    let mut events = Vec::new();
    let mut skipped = 0usize;
    for line in BufReader::new(file).lines() {
        let line = line.context("failed to read event stream")?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<PresenceEvent>(&line) {
            Ok(event) => events.push(event),
            Err(err) => {
                tracing::warn!(error = %err, "skipping malformed event line");
                skipped += 1;
            }
        }
    }

    let started_at = events.first().map_or_else(Utc::now, event_time);
    let end = end.unwrap_or_else(|| events.last().map_or(started_at, event_time));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    let (store, dispatched) = runtime.block_on(async {
        let mut service = TrackerService::new(ledger);
        let store = service.store();
        service
            .start_event(event.clone(), channels, started_at)
            .await?;

        let mut dispatched = 0usize;
        for presence in events {
            match service.dispatch(presence).await {
                Ok(()) => dispatched += 1,
                Err(
                    err @ (ServiceError::UnknownEvent { .. } | ServiceError::EventClosed { .. }),
                ) => {
                    tracing::warn!(error = %err, "event not dispatched");
                }
                Err(err) => return Err(anyhow::Error::from(err)),
            }
        }

        service.stop_event(event, end).await?;
        service.shutdown(end).await;
        Ok((store, dispatched))
    })?;

    let guard = store.lock().unwrap_or_else(PoisonError::into_inner);
    let records = guard.records_for_event(event)?;
    let minutes = guard.aggregate_minutes(event, &[])?;

    println!(
        "event {event}: {dispatched} events dispatched ({skipped} skipped), {} session records",
        records.len()
    );
    for (participant, mins) in &minutes {
        println!("  {:24} {mins:>6} min", participant.as_str());
    }
    Ok(())
}
