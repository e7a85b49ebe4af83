//! NotificationBudget — caps the loud alerts a phase may emit.
//!
//! The plain per-tick event is always produced; the budget only decides
//! whether it also goes to the loud channel. The owning state machine
//! resets the budget on every phase transition.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationBudget {
    limit: u32,
    count: u32,
    exhausted: bool,
}

impl NotificationBudget {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            count: 0,
            exhausted: limit == 0,
        }
    }

    /// Spend one loud notification. Returns false once the budget is used up.
    pub fn try_spend(&mut self) -> bool {
        if self.exhausted {
            return false;
        }
        self.count += 1;
        if self.count >= self.limit {
            self.exhausted = true;
        }
        true
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.limit);
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}
