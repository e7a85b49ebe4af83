//! ThresholdCrossingEngine — per-service down/up crossing detection.
//!
//! A drop is reported once per tick at the highest down threshold the
//! percentage fell through. Recovery is only reported for services that
//! previously fell below the floor (the deepest down threshold); the
//! floor flag is sticky until [`ThresholdCrossingEngine::reset`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use quotawatch_core::{AlertEvent, AlertKind, EntityId, ResolvedView, ThresholdPolicy, field};

/// Per-service crossing state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceThresholdState {
    pub service_id: EntityId,
    pub last_percent: Option<f64>,
    pub has_dropped_below_floor: bool,
}

impl ServiceThresholdState {
    fn new(service_id: &str) -> Self {
        Self {
            service_id: service_id.to_string(),
            last_percent: None,
            has_dropped_below_floor: false,
        }
    }
}

pub struct ThresholdCrossingEngine {
    policy: ThresholdPolicy,
    states: HashMap<EntityId, ServiceThresholdState>,
}

impl ThresholdCrossingEngine {
    pub fn new(policy: ThresholdPolicy) -> Self {
        Self {
            policy,
            states: HashMap::new(),
        }
    }

    /// Evaluate one service's view for this tick.
    pub fn evaluate(&mut self, view: &ResolvedView, now: u64) -> Option<AlertEvent> {
        let current = view.value(field::PERCENT)?;
        let floor = self.policy.floor();
        let state = self
            .states
            .entry(view.entity_id.clone())
            .or_insert_with(|| ServiceThresholdState::new(&view.entity_id));

        let mut event = None;
        if let Some(last) = state.last_percent {
            // Down thresholds are descending, so the first hit is the highest.
            if let Some(t) = self
                .policy
                .down
                .iter()
                .copied()
                .find(|t| last >= *t && current < *t)
            {
                info!(service = %state.service_id, threshold = t, percent = current, "availability dropped");
                event = Some(AlertEvent::new(
                    AlertKind::ServiceDown { threshold: t },
                    &state.service_id,
                    now,
                    current,
                ));
            } else if state.has_dropped_below_floor && last < self.policy.up && current >= self.policy.up {
                info!(service = %state.service_id, percent = current, "availability recovered");
                event = Some(AlertEvent::new(
                    AlertKind::ServiceUp,
                    &state.service_id,
                    now,
                    current,
                ));
            }
        }

        if current < floor && !state.has_dropped_below_floor {
            debug!(service = %state.service_id, floor, "below floor, recovery alerts armed");
            state.has_dropped_below_floor = true;
        }
        state.last_percent = Some(current);
        event
    }

    /// Clear the floor flag and history for one service.
    pub fn reset(&mut self, service_id: &str) {
        self.states.remove(service_id);
    }

    pub fn state(&self, service_id: &str) -> Option<&ServiceThresholdState> {
        self.states.get(service_id)
    }

    pub fn states(&self) -> impl Iterator<Item = &ServiceThresholdState> {
        self.states.values()
    }

    /// Load previously persisted states.
    pub fn restore(&mut self, states: impl IntoIterator<Item = ServiceThresholdState>) {
        for state in states {
            self.states.insert(state.service_id.clone(), state);
        }
    }
}
