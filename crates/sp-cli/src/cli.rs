//! Command-line argument definitions.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

/// Presence-based payroll for organized group events.
///
/// Tracks who was in which channel for how long during an event run, and
/// converts a collected-cargo manifest into per-participant payouts
/// proportional to time spent.
#[derive(Debug, Parser)]
#[command(name = "shiftpay", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Replay a presence event stream through the session tracker.
    Ingest {
        /// Event run ID. Generated when omitted.
        #[arg(long)]
        event: Option<String>,

        /// Path to the channel roster (JSON array of tracked channels).
        #[arg(long)]
        channels: PathBuf,

        /// Path to the event stream (JSON lines of presence events).
        #[arg(long)]
        input: PathBuf,

        /// Force-close time (RFC 3339). Defaults to the last event time.
        #[arg(long)]
        end: Option<DateTime<Utc>>,
    },

    /// Show an event run's state and per-participant minutes.
    Status {
        /// Event run ID.
        #[arg(long)]
        event: String,
    },

    /// Calculate the payroll for an event run.
    Payroll {
        /// Event run ID.
        #[arg(long)]
        event: String,

        /// Path to the resource manifest (JSON array of material lines).
        #[arg(long)]
        manifest: PathBuf,

        /// Path to the price table (JSON map of material code to value).
        #[arg(long, conflicts_with = "prices_url")]
        prices: Option<PathBuf>,

        /// Market API endpoint to fetch prices from instead of a file.
        #[arg(long)]
        prices_url: Option<String>,

        /// Donation percentage withheld from each donor's share.
        #[arg(long, default_value_t = 0)]
        donation: u8,

        /// Participant who donates; repeat for multiple donors.
        #[arg(long = "donor")]
        donors: Vec<String>,

        /// Participant who requested the calculation.
        #[arg(long)]
        requested_by: Option<String>,

        /// Emit the full report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Delete an event run and all of its participation records.
    Purge {
        /// Event run ID.
        #[arg(long)]
        event: String,
    },
}
