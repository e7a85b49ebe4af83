//! Cleanup of scraped service names.
//!
//! The status page scraper reads text blocks, so the same service shows up
//! under several noisy variants ("98.21% 日本线路（CodeX） 3h ago", a bare
//! name, a chunk of neighbouring text). Variants are grouped by a cleaned
//! key and collapsed to one conservative percentage.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

const MAX_NAME_LEN: usize = 160;
const MAX_PERCENT: f64 = 1000.0;

static LEADING_PERCENT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\s*\d+(?:\.\d+)?%\s*").ok());
static RELATIVE_TIME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)\d+\s*[hm](?:\s*ago)?").ok());
static WHITESPACE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\s+").ok());
static SERVICE_LIKE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)线路|号池|\bCLI\b|Claude|CodeX|Sonnet|Opus|CC\s*2api|（|）").ok()
});

fn replace_all(re: &LazyLock<Option<Regex>>, s: &str, with: &str) -> String {
    match re.as_ref() {
        Some(re) => re.replace_all(s, with).into_owned(),
        None => s.to_string(),
    }
}

/// Reduce a raw scraped name to its grouping key, or `None` when the text
/// is noise rather than a service name.
pub fn normalize_service_name(raw: &str) -> Option<String> {
    let name = raw.trim();
    if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
        return None;
    }

    let key = replace_all(&LEADING_PERCENT, name, "");
    let key = key.replace("now", "").replace("ago", "");
    let key = replace_all(&RELATIVE_TIME, &key, "");
    let key = replace_all(&WHITESPACE, &key, " ");
    let key = key.trim();

    if key.is_empty() || key.contains('%') {
        return None;
    }
    if !SERVICE_LIKE.as_ref().is_some_and(|re| re.is_match(key)) {
        return None;
    }
    Some(key.to_string())
}

/// Collapse raw `(name, percent)` rows into one percentage per service.
///
/// Within a group, rows whose raw name already equals the key win; the
/// minimum percentage among the preferred rows is kept.
pub fn normalize_services<I>(rows: I) -> BTreeMap<String, f64>
where
    I: IntoIterator<Item = (String, f64)>,
{
    let mut groups: BTreeMap<String, Vec<(String, f64)>> = BTreeMap::new();
    for (name, percent) in rows {
        if !(0.0..=MAX_PERCENT).contains(&percent) {
            continue;
        }
        if let Some(key) = normalize_service_name(&name) {
            groups.entry(key).or_default().push((name, percent));
        }
    }

    groups
        .into_iter()
        .filter_map(|(key, variants)| {
            let exact = variants
                .iter()
                .filter(|(n, _)| n.trim() == key)
                .map(|(_, p)| *p)
                .reduce(f64::min);
            let picked = exact.or_else(|| variants.iter().map(|(_, p)| *p).reduce(f64::min))?;
            Some((key, picked))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(items: &[(&str, f64)]) -> Vec<(String, f64)> {
        items.iter().map(|(n, p)| (n.to_string(), *p)).collect()
    }

    #[test]
    fn strips_percent_and_time_markers() {
        assert_eq!(
            normalize_service_name("98.21% 日本线路（CodeX）  3h ago").as_deref(),
            Some("日本线路（CodeX）")
        );
        assert_eq!(
            normalize_service_name("Claude Code 主线路 now").as_deref(),
            Some("Claude Code 主线路")
        );
    }

    #[test]
    fn rejects_noise() {
        assert_eq!(normalize_service_name(""), None);
        assert_eq!(normalize_service_name("uptime 99.1% overall"), None);
        assert_eq!(normalize_service_name("Last updated"), None);
        assert_eq!(normalize_service_name(&"线路".repeat(100)), None);
    }

    #[test]
    fn exact_names_win_over_variants() {
        let out = normalize_services(rows(&[
            ("日本线路（CodeX）", 97.5),
            ("99.99% 日本线路（CodeX） 5m ago", 12.0),
            ("日本线路（CodeX）", 96.0),
        ]));
        assert_eq!(out.get("日本线路（CodeX）"), Some(&96.0));
    }

    #[test]
    fn min_percent_without_exact_match() {
        let out = normalize_services(rows(&[
            ("90% 号池 A 1h", 94.5),
            ("号池 A now", 88.0),
        ]));
        assert_eq!(out.get("号池 A"), Some(&88.0));
    }

    #[test]
    fn out_of_range_percent_dropped() {
        let out = normalize_services(rows(&[("Opus 线路", 1500.0), ("Sonnet 线路", -1.0)]));
        assert!(out.is_empty());
    }
}
