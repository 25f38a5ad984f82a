//! Show an event run's state and per-participant minutes.

use anyhow::{Result, bail};
use chrono::SecondsFormat;

use sp_core::EventRunId;
use sp_db::Ledger;

pub fn run(ledger: &Ledger, event: &EventRunId, count_staging_time: bool) -> Result<()> {
    let Some(run) = ledger.event_run(event)? else {
        bail!("unknown event run {event}");
    };

    print!(
        "event {}: {} (started {}",
        run.id,
        run.status,
        run.started_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    if let Some(ended_at) = run.ended_at {
        print!(
            ", ended {}",
            ended_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
    }
    println!(")");

    let exclude = if count_staging_time {
        Vec::new()
    } else {
        run.staging_channels()
    };
    let minutes = ledger.aggregate_minutes(event, &exclude)?;
    if minutes.is_empty() {
        println!("  no recorded participation");
        return Ok(());
    }
    for (participant, mins) in &minutes {
        println!("  {:24} {mins:>6} min", participant.as_str());
    }
    Ok(())
}
