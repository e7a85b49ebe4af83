//! QuotaPhaseEngine — two-phase hysteresis over a remaining balance.
//!
//! ```text
//!            override = 1, or notify_limit reminders
//!   PhaseA ─────────────────────────────────────────► PhaseB
//!   remind every tick                           remind once per milestone
//!   while balance > threshold                   crossed on the way down
//!      ▲                                                │
//!      └──────────── balance < threshold ───────────────┘
//!                    (override written back to 0)
//! ```
//!
//! Missing views never reach the state machine.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use quotawatch_core::{
    AlertEvent, AlertKind, EntityId, MilestonePolicy, QuotaPolicy, ResolvedView, field,
};

use crate::budget::NotificationBudget;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Healthy balance; remind every tick above the threshold.
    A,
    /// Depleting; remind only at milestones.
    B,
}

/// Mutable state of one watched balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaPhaseState {
    pub phase: Phase,
    pub milestones_notified: Vec<f64>,
    pub notify_count_in_phase: u32,
    /// Last observed value of the override control.
    pub override_set: bool,
    /// Balance seen on the previous non-missing tick.
    pub last_balance: Option<f64>,
    pub budget: NotificationBudget,
}

impl QuotaPhaseState {
    pub fn new(loud_budget: u32) -> Self {
        Self {
            phase: Phase::A,
            milestones_notified: Vec::new(),
            notify_count_in_phase: 0,
            override_set: false,
            last_balance: None,
            budget: NotificationBudget::new(loud_budget),
        }
    }
}

/// What one tick of the engine produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuotaOutcome {
    pub events: Vec<AlertEvent>,
    /// Value the control channel must be set to, if any.
    pub write_override: Option<bool>,
}

pub struct QuotaPhaseEngine {
    entity_id: EntityId,
    policy: QuotaPolicy,
    state: QuotaPhaseState,
}

impl QuotaPhaseEngine {
    pub fn new(entity_id: impl Into<EntityId>, policy: QuotaPolicy) -> Self {
        let state = QuotaPhaseState::new(policy.loud_budget);
        Self {
            entity_id: entity_id.into(),
            policy,
            state,
        }
    }

    pub fn restore(&mut self, state: QuotaPhaseState) {
        self.state = state;
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn state(&self) -> &QuotaPhaseState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    /// Feed one tick's view of the balance plus the override value read
    /// from the control channel.
    pub fn evaluate(&mut self, view: &ResolvedView, override_set: bool, now: u64) -> QuotaOutcome {
        let mut out = QuotaOutcome::default();
        let Some(balance) = view.value(field::REMAINING) else {
            debug!(entity = %self.entity_id, "no balance this tick, phase untouched");
            return out;
        };

        self.state.override_set = override_set;

        match self.state.phase {
            Phase::A => self.evaluate_phase_a(balance, now, &mut out),
            Phase::B => self.evaluate_phase_b(balance, now, &mut out),
        }

        self.state.last_balance = Some(balance);
        out
    }

    fn evaluate_phase_a(&mut self, balance: f64, now: u64, out: &mut QuotaOutcome) {
        if self.state.override_set {
            info!(entity = %self.entity_id, balance, "override set, entering phase B");
            self.enter(Phase::B);
            return;
        }
        if balance <= self.policy.threshold {
            return;
        }

        let loud = self.state.budget.try_spend();
        self.state.notify_count_in_phase += 1;
        let event = AlertEvent::new(AlertKind::QuotaPhaseA, &self.entity_id, now, balance);
        out.events.push(if loud { event } else { event.quiet() });
        debug!(
            entity = %self.entity_id,
            balance,
            count = self.state.notify_count_in_phase,
            loud,
            "phase A reminder"
        );

        if self.state.notify_count_in_phase >= self.policy.notify_limit {
            info!(
                entity = %self.entity_id,
                limit = self.policy.notify_limit,
                "reminder limit reached, entering phase B"
            );
            self.enter(Phase::B);
            self.state.override_set = true;
            out.write_override = Some(true);
            out.events.push(AlertEvent::new(
                AlertKind::QuotaEscalation,
                &self.entity_id,
                now,
                balance,
            ));
        }
    }

    fn evaluate_phase_b(&mut self, balance: f64, now: u64, out: &mut QuotaOutcome) {
        if let Some(prev) = self.state.last_balance {
            let crossed: Vec<f64> = self
                .policy
                .milestones
                .iter()
                .copied()
                .filter(|m| prev >= *m && balance < *m)
                .filter(|m| !self.state.milestones_notified.contains(m))
                .collect();

            let pick = match self.policy.milestone_policy {
                MilestonePolicy::Lowest => crossed.iter().copied().reduce(f64::min),
                MilestonePolicy::Highest => crossed.iter().copied().reduce(f64::max),
            };
            if let Some(m) = pick {
                info!(entity = %self.entity_id, milestone = m, balance, "milestone crossed");
                // Shallower milestones crossed in the same jump are implied.
                self.state.milestones_notified.extend(crossed);
                out.events.push(AlertEvent::new(
                    AlertKind::QuotaMilestone { value: m },
                    &self.entity_id,
                    now,
                    balance,
                ));
            }
        }

        if balance < self.policy.threshold {
            info!(entity = %self.entity_id, balance, "balance below threshold, back to phase A");
            self.enter(Phase::A);
            self.state.override_set = false;
            out.write_override = Some(false);
            out.events.push(AlertEvent::new(
                AlertKind::QuotaRevert,
                &self.entity_id,
                now,
                balance,
            ));
        }
    }

    fn enter(&mut self, phase: Phase) {
        self.state.phase = phase;
        self.state.milestones_notified.clear();
        self.state.notify_count_in_phase = 0;
        self.state.budget.reset();
    }
}
