//! Shared value types passed between the fetchers, the resolver, and the
//! decision engines.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Identifier of a watched entity (a quota card or a service name).
pub type EntityId = String;

/// Well-known numeric field names carried by samples.
pub mod field {
    /// Total granted quota.
    pub const TOTAL: &str = "total";
    /// Quota consumed so far.
    pub const USED: &str = "used";
    /// Quota still available. The balance the phase engine watches.
    pub const REMAINING: &str = "remaining";
    /// 24h availability percentage of a service.
    pub const PERCENT: &str = "percent";
}

// ── Sample ────────────────────────────────────────────────────────

/// One observation of an entity, produced once per tick by a fetcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub entity_id: EntityId,
    pub fields: BTreeMap<String, f64>,
    /// Unix timestamp (seconds) of the observation.
    pub observed_at: u64,
}

impl Sample {
    pub fn new(entity_id: impl Into<EntityId>, observed_at: u64) -> Self {
        Self {
            entity_id: entity_id.into(),
            fields: BTreeMap::new(),
            observed_at,
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: &str, value: f64) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn field(&self, name: &str) -> Option<f64> {
        self.fields.get(name).copied()
    }

    /// A quota sample carrying total, used and remaining.
    pub fn quota(entity_id: impl Into<EntityId>, total: f64, used: f64, remaining: f64, at: u64) -> Self {
        Self::new(entity_id, at)
            .with_field(field::TOTAL, total)
            .with_field(field::USED, used)
            .with_field(field::REMAINING, remaining)
    }

    /// A service availability sample.
    pub fn percent(entity_id: impl Into<EntityId>, percent: f64, at: u64) -> Self {
        Self::new(entity_id, at).with_field(field::PERCENT, percent)
    }
}

// ── Resolution ────────────────────────────────────────────────────

/// Where a resolved value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Trusted sample fetched this tick.
    Fresh,
    /// Last known good sample, still within its TTL.
    Cached,
    /// Nothing trustworthy available.
    Missing,
}

impl Provenance {
    pub fn is_missing(self) -> bool {
        self == Provenance::Missing
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Provenance::Fresh => "fresh",
            Provenance::Cached => "cached",
            Provenance::Missing => "missing",
        }
    }
}

/// The only input the decision engines consume.
///
/// When `provenance` is [`Provenance::Missing`], `values` is `None` and
/// engines must leave their state untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedView {
    pub entity_id: EntityId,
    pub values: Option<Sample>,
    pub provenance: Provenance,
    /// Seconds since the underlying sample was cached (0 for fresh).
    pub age_secs: u64,
}

impl ResolvedView {
    pub fn fresh(sample: Sample) -> Self {
        Self {
            entity_id: sample.entity_id.clone(),
            values: Some(sample),
            provenance: Provenance::Fresh,
            age_secs: 0,
        }
    }

    pub fn cached(sample: Sample, age_secs: u64) -> Self {
        Self {
            entity_id: sample.entity_id.clone(),
            values: Some(sample),
            provenance: Provenance::Cached,
            age_secs,
        }
    }

    pub fn missing(entity_id: impl Into<EntityId>) -> Self {
        Self {
            entity_id: entity_id.into(),
            values: None,
            provenance: Provenance::Missing,
            age_secs: 0,
        }
    }

    /// Read a numeric field. Always `None` for missing views.
    pub fn value(&self, name: &str) -> Option<f64> {
        match self.provenance {
            Provenance::Missing => None,
            _ => self.values.as_ref().and_then(|s| s.field(name)),
        }
    }
}

// ── Alerts ────────────────────────────────────────────────────────

/// What an alert is about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertKind {
    /// Balance above the base threshold while in phase A.
    QuotaPhaseA,
    /// Phase A reminder limit reached; the engine moved to phase B.
    QuotaEscalation,
    /// Balance dropped below a depletion milestone in phase B.
    QuotaMilestone { value: f64 },
    /// Balance fell below the base threshold; back to phase A.
    QuotaRevert,
    /// Availability fell below a down threshold.
    ServiceDown { threshold: f64 },
    /// Availability recovered to the up threshold after a floor breach.
    ServiceUp,
}

/// A single alert, handed to the dispatcher. Delivery is not the
/// engine's concern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub kind: AlertKind,
    pub entity_id: EntityId,
    /// Unix timestamp (seconds) of the tick that produced the alert.
    pub at: u64,
    /// The observed value (balance or percent) that triggered it.
    pub value: f64,
    /// Whether the event goes to the loud notification channel.
    pub loud: bool,
}

impl AlertEvent {
    pub fn new(kind: AlertKind, entity_id: impl Into<EntityId>, at: u64, value: f64) -> Self {
        Self {
            kind,
            entity_id: entity_id.into(),
            at,
            value,
            loud: true,
        }
    }

    pub fn quiet(mut self) -> Self {
        self.loud = false;
        self
    }

    /// Short human-facing title.
    pub fn title(&self) -> &'static str {
        match self.kind {
            AlertKind::QuotaPhaseA => "Quota reminder",
            AlertKind::QuotaEscalation => "Quota reminder limit reached",
            AlertKind::QuotaMilestone { .. } => "Quota milestone",
            AlertKind::QuotaRevert => "Quota exhausted",
            AlertKind::ServiceDown { .. } => "Service degraded",
            AlertKind::ServiceUp => "Service recovered",
        }
    }
}

impl fmt::Display for AlertEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = &self.entity_id;
        let v = self.value;
        match &self.kind {
            AlertKind::QuotaPhaseA => write!(f, "{id}: remaining ¥{v:.2} is above the reminder threshold"),
            AlertKind::QuotaEscalation => {
                write!(f, "{id}: reminder limit reached, now alerting on milestones only (remaining ¥{v:.2})")
            }
            AlertKind::QuotaMilestone { value } => {
                write!(f, "{id}: remaining dropped below ¥{value:.0} (now ¥{v:.2})")
            }
            AlertKind::QuotaRevert => write!(f, "{id}: remaining ¥{v:.2} is below the base threshold"),
            AlertKind::ServiceDown { threshold } => {
                write!(f, "{id}: 24h availability fell below {threshold:.0}% (now {v:.2}%)")
            }
            AlertKind::ServiceUp => write!(f, "{id}: 24h availability recovered (now {v:.2}%)"),
        }
    }
}

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
