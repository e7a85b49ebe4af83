//! Per-tick console snapshot.

use std::fmt::Write;

use chrono::{DateTime, Local};

use quotawatch_core::{Provenance, ResolvedView, Sample, field};
use quotawatch_engine::{Phase, TickReport};

/// Thresholds the snapshot tags rows against.
#[derive(Debug, Clone)]
pub struct SnapshotStyle {
    pub quota_threshold: f64,
    pub down: Vec<f64>,
    pub up: f64,
}

/// `↓<T%` for the deepest down threshold the value is under, `↑≥U%` at or
/// above the up threshold.
pub fn severity_tag(percent: f64, down: &[f64], up: f64) -> Option<String> {
    let mut ascending = down.to_vec();
    ascending.sort_by(f64::total_cmp);
    if let Some(t) = ascending.into_iter().find(|t| percent < *t) {
        return Some(format!("↓<{t:.0}%"));
    }
    (percent >= up).then(|| format!("↑≥{up:.0}%"))
}

fn provenance_tag(view: &ResolvedView) -> Option<String> {
    match view.provenance {
        Provenance::Fresh => None,
        Provenance::Cached => Some(format!("cached {}s", view.age_secs)),
        Provenance::Missing => Some("missing".to_string()),
    }
}

fn tags(list: impl IntoIterator<Item = Option<String>>) -> String {
    list.into_iter()
        .flatten()
        .map(|t| format!("  [{t}]"))
        .collect()
}

fn money(v: Option<f64>) -> String {
    v.map(|v| format!("¥{v:.2}")).unwrap_or_else(|| "-".to_string())
}

fn name_width<'a>(names: impl Iterator<Item = &'a str>) -> usize {
    names
        .map(|n| n.chars().count())
        .max()
        .unwrap_or(0)
        .clamp(18, 36)
}

fn pad(name: &str, width: usize) -> String {
    let len = name.chars().count();
    format!("{name}{}", " ".repeat(width.saturating_sub(len)))
}

/// Render one tick. `others` is everything the status scraper reported;
/// entries already shown as watched services are skipped.
pub fn render(report: &TickReport, style: &SnapshotStyle, others: &[Sample]) -> String {
    let ts = DateTime::from_timestamp(report.at as i64, 0)
        .unwrap_or_default()
        .with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S");
    let header = format!("--- {ts} --- quotawatch ---");
    let others: Vec<(&str, f64)> = others
        .iter()
        .filter(|s| !report.service_views.iter().any(|v| v.entity_id == s.entity_id))
        .filter_map(|s| Some((s.entity_id.as_str(), s.field(field::PERCENT)?)))
        .collect();
    let names = report
        .quota_views
        .iter()
        .chain(report.service_views.iter())
        .map(|v| v.entity_id.as_str())
        .chain(others.iter().map(|(name, _)| *name));
    let width = name_width(names);

    let mut out = String::new();
    let _ = writeln!(out, "\n{header}");

    if !report.quota_views.is_empty() {
        let phase = match report.quota_phase {
            Some(Phase::A) => "A",
            Some(Phase::B) => "B",
            None => "-",
        };
        let _ = writeln!(
            out,
            "[quota] phase {phase}, override {}",
            u8::from(report.override_set)
        );
        for view in &report.quota_views {
            let remaining = view.value(field::REMAINING);
            let low = remaining
                .filter(|r| *r <= style.quota_threshold)
                .map(|_| format!("≤¥{:.2}", style.quota_threshold));
            let _ = writeln!(
                out,
                "  • {} | total {} | used {} | remaining {}{}",
                pad(&view.entity_id, width),
                money(view.value(field::TOTAL)),
                money(view.value(field::USED)),
                money(remaining),
                tags([low, provenance_tag(view)]),
            );
        }
    }

    if !report.service_views.is_empty() {
        let _ = writeln!(out, "[services]");
        for view in &report.service_views {
            let line = match view.value(field::PERCENT) {
                Some(pct) => format!(
                    "24h {pct:6.2}%{}",
                    tags([severity_tag(pct, &style.down, style.up), provenance_tag(view)])
                ),
                None => format!("24h    n/a{}", tags([provenance_tag(view)])),
            };
            let _ = writeln!(out, "  • {} | {line}", pad(&view.entity_id, width));
        }
    }

    if !others.is_empty() {
        let _ = writeln!(out, "[other services]");
        for (name, pct) in &others {
            let _ = writeln!(out, "  • {} | 24h {pct:6.2}%", pad(name, width));
        }
    }

    for event in &report.events {
        let _ = writeln!(out, "  ! {}", event);
    }
    let _ = writeln!(out, "{}", "-".repeat(header.chars().count().max(40)));
    out
}
