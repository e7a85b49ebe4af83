//! quotawatch-core — shared types, configuration, and the fetch contract.
//!
//! Everything the decision engines consume lives here: the immutable
//! [`Sample`] produced by a fetch collaborator, the [`ResolvedView`] that
//! the resolver hands to the engines, the [`AlertEvent`] they emit, and
//! the validated policy values built from `quotawatch.toml`.

pub mod config;
pub mod duration;
pub mod fetch;
pub mod types;

pub use config::{
    CachePolicy, ConfigError, MilestonePolicy, QuotaPolicy, RetryPolicy, Settings,
    ThresholdPolicy, WatchConfig,
};
pub use fetch::{BoxFuture, FetchError, Fetcher};
pub use types::*;
