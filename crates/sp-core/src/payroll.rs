//! Payroll calculation.
//!
//! Converts a resource manifest plus price lookups into a total value, then
//! distributes that value across participants proportional to their tracked
//! minutes, with an optional donation/redistribution step.
//!
//! The calculation is a pure function of its inputs: rerunning it with the
//! same manifest, minutes, prices, and timestamp produces an identical
//! report. All share arithmetic is integer arithmetic (i128 intermediates)
//! and the rounding residual is assigned to a single line, so the
//! conservation invariant `sum(payout) == total_value` holds exactly.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{
    Credits, DonationPercent, EventRunId, MaterialCode, ParticipantId, ValidationError,
};

/// A market quote for one material.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    /// Credits per standard cargo unit.
    pub unit_value: f64,
    /// When the value was last obtained.
    pub as_of: DateTime<Utc>,
}

/// Supplies market values for materials.
///
/// Implementations return the most recent successfully-fetched value even
/// if stale, and `None` only when no value has ever been obtained. Lookups
/// must be O(1) and non-blocking; the calculator calls them inline.
pub trait PriceSource {
    /// Returns the current quote for a material, if any.
    fn get_price(&self, code: &MaterialCode) -> Option<PriceQuote>;
}

/// One line of collected cargo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestLine {
    /// Material code for price lookup.
    pub material: MaterialCode,
    /// Quantity in standard cargo units.
    pub quantity: f64,
}

/// The collected cargo for one payroll calculation.
///
/// Supplied fresh per calculation; never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ManifestLine>", into = "Vec<ManifestLine>")]
pub struct ResourceManifest {
    lines: Vec<ManifestLine>,
}

impl ResourceManifest {
    /// Creates a manifest, rejecting negative or non-finite quantities.
    pub fn new(lines: Vec<ManifestLine>) -> Result<Self, ValidationError> {
        for line in &lines {
            if !line.quantity.is_finite() || line.quantity < 0.0 {
                return Err(ValidationError::QuantityOutOfRange {
                    value: line.quantity,
                });
            }
        }
        Ok(Self { lines })
    }

    /// The manifest lines.
    #[must_use]
    pub fn lines(&self) -> &[ManifestLine] {
        &self.lines
    }

    /// Whether the manifest has no lines.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

impl TryFrom<Vec<ManifestLine>> for ResourceManifest {
    type Error = ValidationError;

    fn try_from(lines: Vec<ManifestLine>) -> Result<Self, Self::Error> {
        Self::new(lines)
    }
}

impl From<ResourceManifest> for Vec<ManifestLine> {
    fn from(manifest: ResourceManifest) -> Self {
        manifest.lines
    }
}

/// Who donates, and how much.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DonationPolicy {
    /// Percentage of each donor's gross share that is withheld.
    pub percent: DonationPercent,
    /// Participants who opted in to donating.
    pub donors: BTreeSet<ParticipantId>,
}

/// One participant's payout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutLine {
    /// The participant being paid.
    pub participant: ParticipantId,
    /// Aggregated participation minutes used as the weight.
    pub participation_minutes: u64,
    /// Share of the total before donation adjustments.
    pub gross_share: Credits,
    /// Whether this participant donated.
    pub donor: bool,
    /// Amount withheld from this participant's gross share.
    pub donated: Credits,
    /// Amount received from the donation pool.
    pub redistribution: Credits,
    /// Final amount: `gross_share - donated + redistribution`, plus the
    /// rounding residual for the single largest line.
    pub payout: Credits,
}

/// The result of a payroll calculation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutReport {
    /// The event run this payroll covers.
    pub event: EventRunId,
    /// Total distributed value.
    pub total_value: Credits,
    /// Sum of participation minutes across eligible participants.
    pub total_minutes: u64,
    /// Per-participant detail, ordered by participant ID.
    pub lines: Vec<PayoutLine>,
    /// When the calculation ran.
    pub calculated_at: DateTime<Utc>,
    /// Who requested the calculation, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<ParticipantId>,
}

/// Payroll calculation failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayrollError {
    /// The manifest valued to zero; there is nothing to distribute.
    #[error("manifest has no distributable value")]
    NoValue,

    /// No participant has positive participation minutes.
    #[error("no eligible participants with positive minutes")]
    NoParticipants,

    /// No manifest line could be priced at all.
    #[error("no price available for any manifest line")]
    PriceUnavailable,

    /// The distributed sum does not match the total. This indicates a bug;
    /// the report is withheld rather than emitted incorrect.
    #[error("conservation violated: distributed {distributed} of {total}")]
    ConservationViolated {
        /// The total that should have been distributed.
        total: Credits,
        /// The amount actually distributed.
        distributed: Credits,
    },
}

/// Values the manifest against the price source.
///
/// Unknown materials are skipped with a warning so a mistyped code does not
/// sink the whole calculation; `PriceUnavailable` is returned only when
/// nothing could be priced.
fn value_manifest(
    manifest: &ResourceManifest,
    prices: &dyn PriceSource,
) -> Result<Credits, PayrollError> {
    let mut total: i64 = 0;
    let mut priced_any = false;

    for line in manifest.lines() {
        match prices.get_price(&line.material) {
            Some(quote) if quote.unit_value.is_finite() && quote.unit_value >= 0.0 => {
                priced_any = true;
                total = total.saturating_add(line_value(line.quantity, quote.unit_value));
            }
            Some(quote) => {
                tracing::warn!(
                    material = %line.material,
                    unit_value = quote.unit_value,
                    "invalid quote; line skipped"
                );
            }
            None => {
                tracing::warn!(material = %line.material, "no price available; line skipped");
            }
        }
    }

    if !priced_any && !manifest.is_empty() {
        return Err(PayrollError::PriceUnavailable);
    }
    if total <= 0 {
        return Err(PayrollError::NoValue);
    }
    Ok(Credits::new(total))
}

#[expect(
    clippy::cast_possible_truncation,
    reason = "values are rounded and bounded well below i64::MAX in practice"
)]
fn line_value(quantity: f64, unit_value: f64) -> i64 {
    (quantity * unit_value).round() as i64
}

/// Narrows an i128 share back to i64. Shares are bounded by the i64 total,
/// so saturation is unreachable in practice.
fn narrow(value: i128) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Index of the line with the strictly largest value of `key`, preferring
/// the earliest (lowest participant ID, since lines are ID-ordered) on ties.
fn largest_by<T, F: Fn(&T) -> i64>(items: &[T], key: F) -> usize {
    let mut best = 0;
    for (i, item) in items.iter().enumerate().skip(1) {
        if key(item) > key(&items[best]) {
            best = i;
        }
    }
    best
}

/// Calculates the payroll for one event run.
///
/// `minutes` is the aggregate per-participant participation (typically from
/// the ledger); participants with zero minutes are excluded. The pay rate
/// per minute is identical for every participant; membership or any other
/// classification never enters the weighting.
#[expect(
    clippy::too_many_lines,
    reason = "the distribution steps read best as one linear pass"
)]
pub fn calculate_payroll(
    event: &EventRunId,
    manifest: &ResourceManifest,
    minutes: &BTreeMap<ParticipantId, u64>,
    prices: &dyn PriceSource,
    policy: &DonationPolicy,
    calculated_at: DateTime<Utc>,
    requested_by: Option<ParticipantId>,
) -> Result<PayoutReport, PayrollError> {
    let total = value_manifest(manifest, prices)?;

    // BTreeMap iteration keeps the participant order deterministic.
    let eligible: Vec<(&ParticipantId, u64)> = minutes
        .iter()
        .filter(|(_, m)| **m > 0)
        .map(|(p, m)| (p, *m))
        .collect();
    if eligible.is_empty() {
        return Err(PayrollError::NoParticipants);
    }
    let total_minutes: u64 = eligible.iter().map(|(_, m)| m).sum();

    struct Share<'a> {
        participant: &'a ParticipantId,
        minutes: u64,
        gross: i64,
        donor: bool,
        donated: i64,
        redistribution: i64,
        recipient: bool,
    }

    let percent = i128::from(policy.percent.value());
    let mut shares: Vec<Share<'_>> = eligible
        .iter()
        .map(|&(participant, m)| {
            let gross =
                narrow(i128::from(total.value()) * i128::from(m) / i128::from(total_minutes));
            let donor = policy.donors.contains(participant);
            let donated = if donor {
                narrow(i128::from(gross) * percent / 100)
            } else {
                0
            };
            Share {
                participant,
                minutes: m,
                gross,
                donor,
                donated,
                redistribution: 0,
                recipient: false,
            }
        })
        .collect();

    // Redistribute the donation pool to non-donors pro-rata by their own
    // gross share; with no non-donors the pool returns to the donors so
    // value is never destroyed.
    let pool: i64 = shares.iter().map(|s| s.donated).sum();
    if pool > 0 {
        let receivers_exist = shares.iter().any(|s| !s.donor);
        if !receivers_exist {
            tracing::warn!(event = %event, pool, "no non-donor recipients; returning pool to donors");
        }
        for share in &mut shares {
            share.recipient = if receivers_exist {
                !share.donor
            } else {
                share.donor
            };
        }

        let recipient_gross: i128 = shares
            .iter()
            .filter(|s| s.recipient)
            .map(|s| i128::from(s.gross))
            .sum();
        let mut distributed: i64 = 0;
        for share in shares.iter_mut().filter(|s| s.recipient) {
            if recipient_gross > 0 {
                share.redistribution =
                    narrow(i128::from(pool) * i128::from(share.gross) / recipient_gross);
                distributed += share.redistribution;
            }
        }
        // The pool's flooring remainder goes to the largest-gross recipient
        // so withheld and redistributed amounts match exactly.
        let leftover = pool - distributed;
        if leftover > 0 {
            let mut best: Option<usize> = None;
            for (i, share) in shares.iter().enumerate() {
                if !share.recipient {
                    continue;
                }
                match best {
                    Some(b) if shares[b].gross >= share.gross => {}
                    _ => best = Some(i),
                }
            }
            if let Some(best) = best {
                shares[best].redistribution += leftover;
            }
        }
    }

    let mut lines: Vec<PayoutLine> = shares
        .into_iter()
        .map(|s| PayoutLine {
            participant: s.participant.clone(),
            participation_minutes: s.minutes,
            gross_share: Credits::new(s.gross),
            donor: s.donor,
            donated: Credits::new(s.donated),
            redistribution: Credits::new(s.redistribution),
            payout: Credits::new(s.gross - s.donated + s.redistribution),
        })
        .collect();

    // Assign the gross-flooring residual to the single largest payout so
    // the distributed sum matches the total exactly.
    let distributed: i64 = lines.iter().map(|l| l.payout.value()).sum();
    let residual = total.value() - distributed;
    if residual > 0 {
        let idx = largest_by(&lines, |l| l.payout.value());
        lines[idx].payout = Credits::new(lines[idx].payout.value() + residual);
    }

    let distributed: Credits = lines.iter().map(|l| l.payout).sum();
    if distributed != total {
        return Err(PayrollError::ConservationViolated {
            total,
            distributed,
        });
    }

    Ok(PayoutReport {
        event: event.clone(),
        total_value: total,
        total_minutes,
        lines,
        calculated_at,
        requested_by,
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    struct TablePrices(BTreeMap<MaterialCode, f64>);

    impl TablePrices {
        fn new(entries: &[(&str, f64)]) -> Self {
            Self(
                entries
                    .iter()
                    .map(|(code, value)| (MaterialCode::new(*code).unwrap(), *value))
                    .collect(),
            )
        }
    }

    impl PriceSource for TablePrices {
        fn get_price(&self, code: &MaterialCode) -> Option<PriceQuote> {
            self.0.get(code).map(|&unit_value| PriceQuote {
                unit_value,
                as_of: fixed_time(),
            })
        }
    }

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, 20, 0, 0)
            .single()
            .expect("valid test timestamp")
    }

    fn run_id() -> EventRunId {
        EventRunId::new("op-1").unwrap()
    }

    fn p(id: &str) -> ParticipantId {
        ParticipantId::new(id).unwrap()
    }

    fn manifest(lines: &[(&str, f64)]) -> ResourceManifest {
        ResourceManifest::new(
            lines
                .iter()
                .map(|(code, quantity)| ManifestLine {
                    material: MaterialCode::new(*code).unwrap(),
                    quantity: *quantity,
                })
                .collect(),
        )
        .unwrap()
    }

    fn minutes(entries: &[(&str, u64)]) -> BTreeMap<ParticipantId, u64> {
        entries.iter().map(|(id, m)| (p(id), *m)).collect()
    }

    fn donation(percent: u8, donors: &[&str]) -> DonationPolicy {
        DonationPolicy {
            percent: DonationPercent::new(percent).unwrap(),
            donors: donors.iter().map(|id| p(id)).collect(),
        }
    }

    fn calculate(
        man: &ResourceManifest,
        mins: &BTreeMap<ParticipantId, u64>,
        prices: &TablePrices,
        policy: &DonationPolicy,
    ) -> Result<PayoutReport, PayrollError> {
        calculate_payroll(
            &run_id(),
            man,
            mins,
            prices,
            policy,
            fixed_time(),
            Some(p("ops-lead")),
        )
    }

    fn line<'a>(report: &'a PayoutReport, id: &str) -> &'a PayoutLine {
        report
            .lines
            .iter()
            .find(|l| l.participant == p(id))
            .expect("line present")
    }

    // Scenario A: three participants, 70/65/60 minutes, 100k total.
    #[test]
    fn scenario_proportional_distribution() {
        let report = calculate(
            &manifest(&[("QUAN", 100.0)]),
            &minutes(&[("p1", 70), ("p2", 65), ("p3", 60)]),
            &TablePrices::new(&[("QUAN", 1000.0)]),
            &DonationPolicy::default(),
        )
        .unwrap();

        assert_eq!(report.total_value, Credits::new(100_000));
        assert_eq!(report.total_minutes, 195);
        assert_eq!(line(&report, "p1").gross_share, Credits::new(35_897));
        assert_eq!(line(&report, "p2").gross_share, Credits::new(33_333));
        assert_eq!(line(&report, "p3").gross_share, Credits::new(30_769));

        // Residual credit lands on the largest payout.
        assert_eq!(line(&report, "p1").payout, Credits::new(35_898));
        assert_eq!(line(&report, "p2").payout, Credits::new(33_333));
        assert_eq!(line(&report, "p3").payout, Credits::new(30_769));

        let sum: Credits = report.lines.iter().map(|l| l.payout).sum();
        assert_eq!(sum, report.total_value);
    }

    // Scenario B: participant 1 donates 10%.
    #[test]
    fn scenario_donation_redistribution() {
        let report = calculate(
            &manifest(&[("QUAN", 100.0)]),
            &minutes(&[("p1", 70), ("p2", 65), ("p3", 60)]),
            &TablePrices::new(&[("QUAN", 1000.0)]),
            &donation(10, &["p1"]),
        )
        .unwrap();

        let donor = line(&report, "p1");
        assert!(donor.donor);
        assert_eq!(donor.donated, Credits::new(3_589));
        assert_eq!(donor.redistribution, Credits::ZERO);
        assert_eq!(donor.payout, Credits::new(32_308));

        // Pool splits pro-rata across p2/p3 by their gross shares
        // (33333:30769), the flooring remainder going to p2.
        assert_eq!(line(&report, "p2").redistribution, Credits::new(1_867));
        assert_eq!(line(&report, "p3").redistribution, Credits::new(1_722));

        let withheld: Credits = report.lines.iter().map(|l| l.donated).sum();
        let redistributed: Credits = report.lines.iter().map(|l| l.redistribution).sum();
        assert_eq!(withheld, redistributed);

        let sum: Credits = report.lines.iter().map(|l| l.payout).sum();
        assert_eq!(sum, report.total_value);
    }

    // Scenario C: no eligible participants.
    #[test]
    fn scenario_no_participants() {
        let result = calculate(
            &manifest(&[("QUAN", 100.0)]),
            &minutes(&[("p1", 0)]),
            &TablePrices::new(&[("QUAN", 1000.0)]),
            &DonationPolicy::default(),
        );
        assert_eq!(result.unwrap_err(), PayrollError::NoParticipants);
    }

    // P4: pay rate is identical regardless of any classification.
    #[test]
    fn equal_minutes_equal_share() {
        let report = calculate(
            &manifest(&[("QUAN", 100.0)]),
            &minutes(&[("member", 60), ("visitor", 60)]),
            &TablePrices::new(&[("QUAN", 1000.0)]),
            &DonationPolicy::default(),
        )
        .unwrap();

        assert_eq!(
            line(&report, "member").gross_share,
            line(&report, "visitor").gross_share
        );
    }

    // P5: conservation holds for any donation percentage and donor set.
    #[test]
    fn conservation_across_policies() {
        let man = manifest(&[("QUAN", 99.999), ("GOLD", 3.7)]);
        let prices = TablePrices::new(&[("QUAN", 1000.0), ("GOLD", 6_041.0)]);
        let mins = minutes(&[("p1", 7), ("p2", 11), ("p3", 13), ("p4", 113)]);

        let donor_sets: &[&[&str]] = &[
            &[],
            &["p1"],
            &["p1", "p3"],
            &["p1", "p2", "p3"],
            &["p1", "p2", "p3", "p4"],
        ];
        for percent in [0_u8, 10, 15, 20, 33, 50, 99, 100] {
            for donors in donor_sets {
                let report =
                    calculate(&man, &mins, &prices, &donation(percent, donors)).unwrap();
                let sum: Credits = report.lines.iter().map(|l| l.payout).sum();
                assert_eq!(
                    sum, report.total_value,
                    "conservation failed at {percent}% donors {donors:?}"
                );
            }
        }
    }

    // P6: redistribution is pro-rata and exactly matches the pool.
    #[test]
    fn redistribution_is_pro_rata() {
        let report = calculate(
            &manifest(&[("QUAN", 100.0)]),
            &minutes(&[("p1", 70), ("p2", 65), ("p3", 60)]),
            &TablePrices::new(&[("QUAN", 1000.0)]),
            &donation(20, &["p1"]),
        )
        .unwrap();

        let withheld: Credits = report.lines.iter().map(|l| l.donated).sum();
        let redistributed: Credits = report.lines.iter().map(|l| l.redistribution).sum();
        assert_eq!(withheld, redistributed);

        // Larger gross share receives the larger portion.
        assert!(line(&report, "p2").redistribution >= line(&report, "p3").redistribution);
        assert_eq!(line(&report, "p1").redistribution, Credits::ZERO);
    }

    #[test]
    fn all_donors_pool_returns_to_donors() {
        let report = calculate(
            &manifest(&[("QUAN", 100.0)]),
            &minutes(&[("p1", 70), ("p2", 65)]),
            &TablePrices::new(&[("QUAN", 1000.0)]),
            &donation(20, &["p1", "p2"]),
        )
        .unwrap();

        let sum: Credits = report.lines.iter().map(|l| l.payout).sum();
        assert_eq!(sum, report.total_value);
        for l in &report.lines {
            assert!(l.donor);
            assert!(l.redistribution > Credits::ZERO);
            assert!(l.payout > Credits::ZERO);
        }
    }

    // P7: identical inputs produce a byte-identical report.
    #[test]
    fn calculation_is_idempotent() {
        let man = manifest(&[("QUAN", 100.0), ("GOLD", 2.5)]);
        let prices = TablePrices::new(&[("QUAN", 1000.0), ("GOLD", 6_041.0)]);
        let mins = minutes(&[("p1", 70), ("p2", 65), ("p3", 60)]);
        let policy = donation(15, &["p2"]);

        let first = calculate(&man, &mins, &prices, &policy).unwrap();
        let second = calculate(&man, &mins, &prices, &policy).unwrap();

        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn unknown_material_skipped_known_still_paid() {
        let report = calculate(
            &manifest(&[("QUAN", 100.0), ("XYZZ", 50.0)]),
            &minutes(&[("p1", 60)]),
            &TablePrices::new(&[("QUAN", 1000.0)]),
            &DonationPolicy::default(),
        )
        .unwrap();
        assert_eq!(report.total_value, Credits::new(100_000));
    }

    #[test]
    fn no_line_priced_is_price_unavailable() {
        let result = calculate(
            &manifest(&[("XYZZ", 50.0), ("PLGH", 10.0)]),
            &minutes(&[("p1", 60)]),
            &TablePrices::new(&[("QUAN", 1000.0)]),
            &DonationPolicy::default(),
        );
        assert_eq!(result.unwrap_err(), PayrollError::PriceUnavailable);
    }

    #[test]
    fn empty_manifest_is_no_value() {
        let result = calculate(
            &manifest(&[]),
            &minutes(&[("p1", 60)]),
            &TablePrices::new(&[("QUAN", 1000.0)]),
            &DonationPolicy::default(),
        );
        assert_eq!(result.unwrap_err(), PayrollError::NoValue);
    }

    #[test]
    fn zero_quantity_is_no_value() {
        let result = calculate(
            &manifest(&[("QUAN", 0.0)]),
            &minutes(&[("p1", 60)]),
            &TablePrices::new(&[("QUAN", 1000.0)]),
            &DonationPolicy::default(),
        );
        assert_eq!(result.unwrap_err(), PayrollError::NoValue);
    }

    #[test]
    fn zero_minute_participants_are_excluded() {
        let report = calculate(
            &manifest(&[("QUAN", 100.0)]),
            &minutes(&[("p1", 70), ("idle", 0)]),
            &TablePrices::new(&[("QUAN", 1000.0)]),
            &DonationPolicy::default(),
        )
        .unwrap();

        assert_eq!(report.lines.len(), 1);
        assert_eq!(report.lines[0].participant, p("p1"));
        assert_eq!(report.lines[0].payout, report.total_value);
    }

    #[test]
    fn manifest_rejects_negative_quantity() {
        let result = ResourceManifest::new(vec![ManifestLine {
            material: MaterialCode::new("QUAN").unwrap(),
            quantity: -1.0,
        }]);
        assert!(result.is_err());
    }

    #[test]
    fn manifest_serde_validates() {
        let parsed: Result<ResourceManifest, _> =
            serde_json::from_str(r#"[{"material":"QUAN","quantity":-3.0}]"#);
        assert!(parsed.is_err());

        let parsed: ResourceManifest =
            serde_json::from_str(r#"[{"material":"quan","quantity":100.0}]"#).unwrap();
        assert_eq!(parsed.lines()[0].material.as_str(), "QUAN");
    }
}
