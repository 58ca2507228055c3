//! Pure channel health classification.
//!
//! `classify` is deterministic and side-effect free: the same snapshot and
//! threshold table always produce the same classification, which keeps
//! re-analysis of stored history idempotent.

use crate::model::{
    ChannelAssessment, ChannelReading, Classification, Direction, Health, IssueCode, RawSnapshot,
    Summary,
};
use crate::thresholds::{MetricBand, MetricThresholds, ThresholdTable};

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn assess_metric(
    value: f64,
    thresholds: &MetricThresholds,
    low_code: IssueCode,
    high_code: IssueCode,
    issues: &mut Vec<IssueCode>,
) -> MetricBand {
    let band = thresholds.band_of(value);
    if band != MetricBand::Good {
        let low = thresholds
            .good_min
            .or(thresholds.marginal_min)
            .is_some_and(|b| value < b);
        issues.push(if low { low_code } else { high_code });
    }
    band
}

fn assess_channel(ch: &ChannelReading, table: &ThresholdTable) -> ChannelAssessment {
    let mut issues = Vec::new();
    let mut worst = MetricBand::Good;

    let power_thresholds = match ch.direction {
        Direction::Downstream => &table.downstream_power,
        Direction::Upstream => &table.upstream_power,
    };
    let band = assess_metric(
        ch.power_dbmv,
        power_thresholds,
        IssueCode::PowerLow,
        IssueCode::PowerHigh,
        &mut issues,
    );
    worst = worst_of(worst, band);

    if let Some(snr) = ch.snr_db {
        let band = assess_metric(
            snr,
            &table.downstream_snr,
            IssueCode::SnrLow,
            IssueCode::SnrLow,
            &mut issues,
        );
        worst = worst_of(worst, band);
    }

    let health = match worst {
        MetricBand::Good => Health::Good,
        MetricBand::Marginal => Health::Marginal,
        MetricBand::Critical => Health::Poor,
    };
    ChannelAssessment {
        channel_id: ch.channel_id,
        direction: ch.direction,
        health,
        issues,
    }
}

fn worst_of(a: MetricBand, b: MetricBand) -> MetricBand {
    use MetricBand::*;
    match (a, b) {
        (Critical, _) | (_, Critical) => Critical,
        (Marginal, _) | (_, Marginal) => Marginal,
        _ => Good,
    }
}

fn summarize(snapshot: &RawSnapshot) -> Summary {
    let ds_powers: Vec<f64> = snapshot
        .channels_in(Direction::Downstream)
        .map(|c| c.power_dbmv)
        .collect();
    let us_powers: Vec<f64> = snapshot
        .channels_in(Direction::Upstream)
        .map(|c| c.power_dbmv)
        .collect();
    let ds_snrs: Vec<f64> = snapshot
        .channels_in(Direction::Downstream)
        .filter_map(|c| c.snr_db)
        .collect();

    let min = |vs: &[f64]| vs.iter().copied().fold(f64::INFINITY, f64::min);
    let max = |vs: &[f64]| vs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let avg = |vs: &[f64]| vs.iter().sum::<f64>() / vs.len() as f64;
    let stat = |vs: &[f64], f: &dyn Fn(&[f64]) -> f64| {
        if vs.is_empty() {
            0.0
        } else {
            round1(f(vs))
        }
    };

    Summary {
        ds_total: ds_powers.len() as u32,
        us_total: us_powers.len() as u32,
        ds_power_min: stat(&ds_powers, &min),
        ds_power_max: stat(&ds_powers, &max),
        ds_power_avg: stat(&ds_powers, &avg),
        us_power_min: stat(&us_powers, &min),
        us_power_max: stat(&us_powers, &max),
        us_power_avg: stat(&us_powers, &avg),
        ds_snr_min: stat(&ds_snrs, &min),
        ds_snr_avg: stat(&ds_snrs, &avg),
        correctable_total: snapshot.channels.iter().map(|c| c.correctable_errors).sum(),
        uncorrectable_total: snapshot
            .channels
            .iter()
            .map(|c| c.uncorrectable_errors)
            .sum(),
    }
}

/// Classify one snapshot against a threshold table.
///
/// Aggregate health is the worst per-channel tag; an empty channel set (all
/// connections down) is poor with a dedicated issue code. An uncorrectable
/// error total above the configured budget raises the aggregate to at least
/// marginal.
pub fn classify(snapshot: &RawSnapshot, table: &ThresholdTable) -> Classification {
    let channels: Vec<ChannelAssessment> = snapshot
        .channels
        .iter()
        .map(|ch| assess_channel(ch, table))
        .collect();
    let summary = summarize(snapshot);

    let mut aggregate_issues: Vec<IssueCode> = Vec::new();
    let mut aggregate = channels
        .iter()
        .map(|c| c.health)
        .max()
        .unwrap_or(Health::Good);

    if channels.is_empty() {
        aggregate = Health::Poor;
        aggregate_issues.push(IssueCode::NoChannels);
    }
    for code in [IssueCode::PowerLow, IssueCode::PowerHigh, IssueCode::SnrLow] {
        if channels.iter().any(|c| c.issues.contains(&code)) {
            aggregate_issues.push(code);
        }
    }
    if summary.uncorrectable_total > table.uncorrectable_limit {
        aggregate_issues.push(IssueCode::ErrorsHigh);
        aggregate = aggregate.max(Health::Marginal);
    }

    Classification {
        channels,
        aggregate,
        aggregate_issues,
        summary,
    }
}
