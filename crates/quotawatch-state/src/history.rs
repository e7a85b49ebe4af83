//! CSV history of resolved values, one append per tick.
//!
//! - `quota_wide.csv`: one row per tick with total, used, used percent,
//!   remaining and provenance for every quota entity.
//! - `quota_long.csv` / `status_long.csv`: one row per tick and entity with
//!   local calendar components, the entity's index in its configured list,
//!   the value and `is_cached` / `is_missing` flags.
//!
//! Headers are written when a file is created.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Local, Timelike};
use tracing::debug;

use quotawatch_core::{EntityId, Provenance, ResolvedView, field};

use crate::error::HistoryError;

const QUOTA_WIDE: &str = "quota_wide.csv";
const QUOTA_LONG: &str = "quota_long.csv";
const STATUS_LONG: &str = "status_long.csv";
const LONG_HEADER: &str = "year,month,day,hour,minute,second,curve_id,value,is_cached,is_missing";

/// Appends history rows under a directory.
#[derive(Debug, Clone)]
pub struct HistoryWriter {
    dir: PathBuf,
    quota_entities: Vec<EntityId>,
    service_entities: Vec<EntityId>,
}

impl HistoryWriter {
    /// Create a writer. The entity lists fix the wide-form column order
    /// and the long-form curve ids.
    pub fn new(dir: &Path, quota_entities: Vec<EntityId>, service_entities: Vec<EntityId>) -> Self {
        Self {
            dir: dir.to_path_buf(),
            quota_entities,
            service_entities,
        }
    }

    /// Append every history file for one tick.
    pub fn append_tick(
        &self,
        at: u64,
        quota_views: &[ResolvedView],
        service_views: &[ResolvedView],
    ) -> Result<(), HistoryError> {
        if !self.quota_entities.is_empty() {
            self.append_quota_wide(at, quota_views)?;
            self.append_long(QUOTA_LONG, &self.quota_entities, field::REMAINING, at, quota_views)?;
        }
        if !self.service_entities.is_empty() {
            self.append_long(STATUS_LONG, &self.service_entities, field::PERCENT, at, service_views)?;
        }
        Ok(())
    }

    /// Append one wide-form row.
    pub fn append_quota_wide(&self, at: u64, views: &[ResolvedView]) -> Result<(), HistoryError> {
        let mut header = vec!["timestamp".to_string()];
        for id in &self.quota_entities {
            for col in ["total", "used", "used_pct", "remaining", "provenance"] {
                header.push(csv_field(&format!("{id}_{col}")));
            }
        }

        let mut row = vec![local_time(at).format("%Y-%m-%d %H:%M:%S").to_string()];
        for id in &self.quota_entities {
            let view = find(views, id);
            let total = view.and_then(|v| v.value(field::TOTAL));
            let used = view.and_then(|v| v.value(field::USED));
            let remaining = view.and_then(|v| v.value(field::REMAINING));
            let used_pct = match (used, total) {
                (Some(u), Some(t)) if t > 0.0 => Some(u / t * 100.0),
                _ => None,
            };
            let provenance = view.map_or(Provenance::Missing, |v| v.provenance);
            row.push(fmt_opt(total));
            row.push(fmt_opt(used));
            row.push(fmt_opt(used_pct));
            row.push(fmt_opt(remaining));
            row.push(provenance.as_str().to_string());
        }

        self.append_row(QUOTA_WIDE, &header.join(","), &row.join(","))
    }

    /// Append one long-form row per entity.
    fn append_long(
        &self,
        file: &str,
        entities: &[EntityId],
        value_field: &str,
        at: u64,
        views: &[ResolvedView],
    ) -> Result<(), HistoryError> {
        let t = local_time(at);
        let mut rows = Vec::with_capacity(entities.len());
        for (curve_id, id) in entities.iter().enumerate() {
            let view = find(views, id);
            let provenance = view.map_or(Provenance::Missing, |v| v.provenance);
            let value = view.and_then(|v| v.value(value_field));
            rows.push(format!(
                "{},{},{},{},{},{},{},{},{},{}",
                t.year(),
                t.month(),
                t.day(),
                t.hour(),
                t.minute(),
                t.second(),
                curve_id,
                fmt_opt(value),
                u8::from(provenance == Provenance::Cached),
                u8::from(provenance == Provenance::Missing),
            ));
        }
        self.append_row(file, LONG_HEADER, &rows.join("\n"))
    }

    fn append_row(&self, file: &str, header: &str, body: &str) -> Result<(), HistoryError> {
        let path = self.dir.join(file);
        let io_err = |source| HistoryError::Io {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(|source| HistoryError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let is_new = !path.exists();
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        if is_new {
            writeln!(f, "{header}").map_err(io_err)?;
        }
        writeln!(f, "{body}").map_err(io_err)?;
        debug!(?path, "history appended");
        Ok(())
    }
}

fn find<'a>(views: &'a [ResolvedView], id: &str) -> Option<&'a ResolvedView> {
    views.iter().find(|v| v.entity_id == id)
}

fn local_time(at: u64) -> DateTime<Local> {
    DateTime::from_timestamp(at as i64, 0)
        .unwrap_or_default()
        .with_timezone(&Local)
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map(|v| format!("{v:.2}")).unwrap_or_default()
}

/// Quote a CSV field when it contains separators or quotes.
fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quotawatch_core::Sample;

    fn writer(dir: &Path) -> HistoryWriter {
        HistoryWriter::new(
            dir,
            vec!["codex".to_string(), "claude".to_string()],
            vec!["svc-a".to_string()],
        )
    }

    fn read_lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn wide_row_has_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path());
        let views = vec![ResolvedView::fresh(Sample::quota("codex", 200.0, 50.0, 150.0, 1))];

        w.append_quota_wide(1_700_000_000, &views).unwrap();
        w.append_quota_wide(1_700_000_060, &views).unwrap();

        let lines = read_lines(&dir.path().join(QUOTA_WIDE));
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("timestamp,codex_total,codex_used,codex_used_pct"));
        assert!(lines[1].contains(",200.00,50.00,25.00,150.00,fresh,"));
        // Entity without a view is written as missing with empty values.
        assert!(lines[1].ends_with(",,,,,missing"));
    }

    #[test]
    fn long_rows_flag_cached_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path());
        let quota = vec![
            ResolvedView::cached(Sample::quota("codex", 100.0, 90.0, 10.0, 1), 60),
            ResolvedView::missing("claude"),
        ];
        let services = vec![ResolvedView::fresh(Sample::percent("svc-a", 97.5, 1))];

        w.append_tick(1_700_000_000, &quota, &services).unwrap();

        let quota_lines = read_lines(&dir.path().join(QUOTA_LONG));
        assert_eq!(quota_lines[0], LONG_HEADER);
        assert!(quota_lines[1].ends_with(",0,10.00,1,0"));
        assert!(quota_lines[2].ends_with(",1,,0,1"));

        let status_lines = read_lines(&dir.path().join(STATUS_LONG));
        assert_eq!(status_lines.len(), 2);
        assert!(status_lines[1].ends_with(",0,97.50,0,0"));
    }

    #[test]
    fn calendar_components_match_local_time() {
        let dir = tempfile::tempdir().unwrap();
        let w = HistoryWriter::new(dir.path(), vec![], vec!["svc".to_string()]);
        let at = 1_700_000_000;
        w.append_tick(at, &[], &[]).unwrap();

        let t = local_time(at);
        let line = &read_lines(&dir.path().join(STATUS_LONG))[1];
        let expected = format!("{},{},{},", t.year(), t.month(), t.day());
        assert!(line.starts_with(&expected));
        assert!(!dir.path().join(QUOTA_WIDE).exists());
    }

    #[test]
    fn csv_field_quotes_commas() {
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
