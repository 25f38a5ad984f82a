//! Calculate the payroll for an event run.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;

use sp_core::{
    DonationPercent, DonationPolicy, EventRunId, ParticipantId, PriceSource, ResourceManifest,
    calculate_payroll,
};
use sp_db::Ledger;
use sp_market::{MarketClient, PriceCache, PriceTable};

/// Freshness window for prices fetched at calculation time.
const PRICE_TTL: Duration = Duration::from_secs(300);

pub struct PayrollRequest<'a> {
    pub event: &'a EventRunId,
    pub manifest_path: &'a Path,
    pub prices_path: Option<&'a Path>,
    pub prices_url: Option<&'a str>,
    pub donation: u8,
    pub donors: &'a [String],
    pub requested_by: Option<&'a str>,
    pub json: bool,
    pub count_staging_time: bool,
}

/// Loads prices from a static table or fetches them from the market API.
fn load_prices(
    prices_path: Option<&Path>,
    prices_url: Option<&str>,
) -> Result<Box<dyn PriceSource>> {
    if let Some(url) = prices_url {
        let client = MarketClient::new(url)?;
        let cache = PriceCache::new(PRICE_TTL);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to start async runtime")?;
        let cached = runtime
            .block_on(cache.refresh(&client))
            .context("failed to fetch market prices")?;
        tracing::debug!(cached, "fetched market prices");
        return Ok(Box::new(cache));
    }
    let Some(path) = prices_path else {
        bail!("either --prices or --prices-url is required");
    };
    Ok(Box::new(PriceTable::from_path(path)?))
}

pub fn run(ledger: &Ledger, request: &PayrollRequest<'_>) -> Result<()> {
    let Some(event_run) = ledger.event_run(request.event)? else {
        bail!("unknown event run {}", request.event);
    };

    let manifest: ResourceManifest = serde_json::from_str(
        &std::fs::read_to_string(request.manifest_path).context("failed to read manifest")?,
    )
    .context("failed to parse manifest")?;

    let prices = load_prices(request.prices_path, request.prices_url)?;

    let policy = DonationPolicy {
        percent: DonationPercent::new(request.donation)?,
        donors: request
            .donors
            .iter()
            .map(|donor| ParticipantId::new(donor.as_str()))
            .collect::<Result<_, _>>()?,
    };
    let requested_by = request
        .requested_by
        .map(ParticipantId::new)
        .transpose()?;

    let exclude = if request.count_staging_time {
        Vec::new()
    } else {
        event_run.staging_channels()
    };
    let minutes = ledger.aggregate_minutes(request.event, &exclude)?;

    let report = calculate_payroll(
        request.event,
        &manifest,
        &minutes,
        prices.as_ref(),
        &policy,
        Utc::now(),
        requested_by,
    )?;

    if request.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "event {}: {} credits over {} participant-minutes",
        report.event, report.total_value, report.total_minutes
    );
    println!(
        "  {:24} {:>7} {:>12} {:>10} {:>10} {:>12}",
        "participant", "minutes", "gross", "donated", "received", "payout"
    );
    for line in &report.lines {
        let marker = if line.donor { "*" } else { " " };
        println!(
            "  {:24} {:>7} {:>12} {:>10} {:>10} {:>12}{marker}",
            line.participant.as_str(),
            line.participation_minutes,
            line.gross_share.value(),
            line.donated.value(),
            line.redistribution.value(),
            line.payout.value(),
        );
    }
    if !policy.donors.is_empty() {
        println!("  (* donor)");
    }
    Ok(())
}
