//! Delete an event run and its participation records.

use anyhow::Result;

use sp_core::EventRunId;
use sp_db::Ledger;

pub fn run(ledger: &mut Ledger, event: &EventRunId) -> Result<()> {
    let removed = ledger.delete_event(event)?;
    println!("event {event}: removed {removed} session records");
    Ok(())
}
