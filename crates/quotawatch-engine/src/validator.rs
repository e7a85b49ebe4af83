//! Trust classification of raw samples.
//!
//! Scrapers that hit a half-rendered page tend to report every number as
//! zero, and API heuristics sometimes pick the wrong block. Neither should
//! be allowed to drive an alert. The validator is a pure function of the
//! sample; it never looks at the cache.

use std::fmt;

use quotawatch_core::{Sample, field};

/// Outcome of validating one sample.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Trusted,
    Untrusted(UntrustedReason),
}

impl Verdict {
    pub fn is_trusted(&self) -> bool {
        matches!(self, Verdict::Trusted)
    }
}

/// Why a sample was rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum UntrustedReason {
    /// A required field is absent.
    MissingField(String),
    /// Every field that is normally positive is exactly zero.
    AllZero,
    /// A value is not a finite number.
    NotFinite(String),
    /// A cross-field or range check failed.
    Inconsistent(String),
}

impl fmt::Display for UntrustedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UntrustedReason::MissingField(name) => write!(f, "required field {name:?} is absent"),
            UntrustedReason::AllZero => write!(f, "degenerate all-zero payload"),
            UntrustedReason::NotFinite(name) => write!(f, "field {name:?} is not a finite number"),
            UntrustedReason::Inconsistent(what) => write!(f, "inconsistent payload: {what}"),
        }
    }
}

/// A cross-field or range check.
#[derive(Debug, Clone, PartialEq)]
pub enum Consistency {
    /// `lhs <= rhs + epsilon` whenever both fields are present.
    NotGreater { lhs: String, rhs: String },
    /// `min <= field <= max` whenever the field is present.
    Range { field: String, min: f64, max: f64 },
}

/// The structural rules a sample must satisfy.
#[derive(Debug, Clone, PartialEq)]
pub struct TrustRules {
    pub required: Vec<String>,
    /// Fields that are positive in the normal case. If every one of them
    /// that is present equals zero, the sample is degenerate.
    pub positive: Vec<String>,
    pub checks: Vec<Consistency>,
    pub epsilon: f64,
}

impl TrustRules {
    /// Rules for quota cards: `remaining` is required, `used` may not
    /// exceed `total`.
    pub fn quota() -> Self {
        Self {
            required: vec![field::REMAINING.to_string()],
            positive: vec![
                field::TOTAL.to_string(),
                field::USED.to_string(),
                field::REMAINING.to_string(),
            ],
            checks: vec![Consistency::NotGreater {
                lhs: field::USED.to_string(),
                rhs: field::TOTAL.to_string(),
            }],
            epsilon: 0.01,
        }
    }

    /// Rules for service availability percentages.
    pub fn availability() -> Self {
        Self {
            required: vec![field::PERCENT.to_string()],
            positive: vec![field::PERCENT.to_string()],
            checks: vec![Consistency::Range {
                field: field::PERCENT.to_string(),
                min: 0.0,
                max: 100.0,
            }],
            epsilon: 0.01,
        }
    }
}

/// Classifies samples as trusted or untrusted.
#[derive(Debug, Clone)]
pub struct TrustValidator {
    rules: TrustRules,
}

impl TrustValidator {
    pub fn new(rules: TrustRules) -> Self {
        Self { rules }
    }

    pub fn validate(&self, sample: &Sample) -> Verdict {
        for name in &self.rules.required {
            if sample.field(name).is_none() {
                return Verdict::Untrusted(UntrustedReason::MissingField(name.clone()));
            }
        }

        if let Some((name, _)) = sample.fields.iter().find(|(_, v)| !v.is_finite()) {
            return Verdict::Untrusted(UntrustedReason::NotFinite(name.clone()));
        }

        let mut positives = self
            .rules
            .positive
            .iter()
            .filter_map(|name| sample.field(name))
            .peekable();
        if positives.peek().is_some() && positives.all(|v| v == 0.0) {
            return Verdict::Untrusted(UntrustedReason::AllZero);
        }

        let eps = self.rules.epsilon;
        for check in &self.rules.checks {
            match check {
                Consistency::NotGreater { lhs, rhs } => {
                    if let (Some(l), Some(r)) = (sample.field(lhs), sample.field(rhs))
                        && l > r + eps
                    {
                        return Verdict::Untrusted(UntrustedReason::Inconsistent(format!(
                            "{lhs} ({l}) exceeds {rhs} ({r})"
                        )));
                    }
                }
                Consistency::Range { field, min, max } => {
                    if let Some(v) = sample.field(field)
                        && (v < *min - eps || v > *max + eps)
                    {
                        return Verdict::Untrusted(UntrustedReason::Inconsistent(format!(
                            "{field} ({v}) outside [{min}, {max}]"
                        )));
                    }
                }
            }
        }

        Verdict::Trusted
    }
}
