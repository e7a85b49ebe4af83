//! quotawatch-engine — turns a noisy sample stream into a stable alert stream.
//!
//! # Architecture
//!
//! ```text
//! Scheduler (one tick every `interval`)
//!   ├── OverrideChannel::read()            manual phase B switch
//!   ├── fetch_with_retry() → Fetcher       timeout + linear backoff
//!   ├── SampleResolver                     per entity group
//!   │   ├── TrustValidator                 structural sanity checks
//!   │   └── FreshnessCache                 last known good, soft TTL
//!   │         → ResolvedView { Fresh | Cached | Missing }
//!   ├── QuotaPhaseEngine                   phase A/B hysteresis
//!   │   └── NotificationBudget             loud reminders per phase
//!   ├── ThresholdCrossingEngine            down/up crossings per service
//!   ├── AlertSink::dispatch()              zero or more AlertEvents
//!   └── HistoryWriter / StateStore         optional persistence
//! ```
//!
//! # Debounce
//!
//! A `Missing` view never reaches a state transition: neither engine
//! mutates state or emits alerts for an entity with no trustworthy data
//! this tick. That rule is the main defense against false alerts caused
//! by transient scrape outages.

pub mod budget;
pub mod cache;
pub mod control;
pub mod quota;
pub mod resolver;
pub mod retry;
pub mod scheduler;
pub mod sink;
pub mod threshold;
pub mod validator;

pub use budget::NotificationBudget;
pub use cache::{CacheEntry, FreshnessCache};
pub use control::{ControlError, ControlPort, FileControlPort, MemoryControlPort, OverrideChannel};
pub use quota::{Phase, QuotaOutcome, QuotaPhaseEngine, QuotaPhaseState};
pub use resolver::SampleResolver;
pub use retry::fetch_with_retry;
pub use scheduler::{Scheduler, TickCallback, TickReport};
pub use sink::{AlertSink, DispatchError, RecordingSink};
pub use threshold::{ServiceThresholdState, ThresholdCrossingEngine};
pub use validator::{TrustRules, TrustValidator, UntrustedReason, Verdict};
