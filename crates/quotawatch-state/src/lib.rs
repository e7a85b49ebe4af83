//! quotawatch-state — persistence for the watcher.
//!
//! Two concerns live here:
//!
//! - [`StateStore`], backed by [redb](https://docs.rs/redb), keeps the
//!   decision engines' state (phase, thresholds, last-known-good cache)
//!   across restarts. Values are JSON-serialized into `&[u8]` columns.
//! - [`HistoryWriter`] appends one CSV row per tick (wide form) and one
//!   row per tick and entity (long form) for later charting.
//!
//! Both are optional from the scheduler's point of view: failures are
//! logged and the tick carries on.

pub mod error;
pub mod history;
pub mod store;
pub mod tables;

pub use error::{HistoryError, StateError, StateResult};
pub use history::HistoryWriter;
pub use store::StateStore;
