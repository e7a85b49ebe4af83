//! quotawatch-fetch — concrete [`Fetcher`](quotawatch_core::Fetcher)
//! implementations.
//!
//! - [`QuotaApiFetcher`] calls the balance endpoint with a bearer token and
//!   digs the remaining balance out of whichever payload shape it returns.
//! - [`CommandFetcher`] runs an external scraper (a browser-automation
//!   script) and parses the JSON list it prints.
//! - [`FallbackFetcher`] asks a second source for whatever the first one
//!   could not deliver.
//!
//! Both report every problem as a [`FetchError`](quotawatch_core::FetchError);
//! nothing here is fatal.

pub mod api;
pub mod command;
pub mod fallback;
pub mod money;
pub mod normalize;

pub use api::{QuotaApiFetcher, resolve_token, resolve_token_from_env};
pub use command::{CommandFetcher, CommandOutput, TokenCommand};
pub use fallback::FallbackFetcher;
pub use money::parse_money;
pub use normalize::{normalize_service_name, normalize_services};
