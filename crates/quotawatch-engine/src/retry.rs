//! Timeout and linear-backoff retry around a [`Fetcher`].

use std::collections::HashMap;

use tracing::{debug, warn};

use quotawatch_core::{EntityId, FetchError, Fetcher, RetryPolicy, Sample};

/// Fetch `ids`, retrying only the entities that failed.
///
/// Each attempt is bounded by `policy.timeout`. Attempt `n` (1-based) waits
/// `n * policy.backoff` first. Ids the fetcher did not return count as
/// [`FetchError::NotFound`]. The result holds one entry per id, in input
/// order, carrying the last error for entities that never succeeded.
pub async fn fetch_with_retry(
    fetcher: &dyn Fetcher,
    ids: &[EntityId],
    policy: &RetryPolicy,
) -> Vec<(EntityId, Result<Sample, FetchError>)> {
    let mut outcomes: HashMap<EntityId, Result<Sample, FetchError>> = HashMap::new();
    let mut pending: Vec<EntityId> = ids.to_vec();

    for attempt in 0..=policy.retries {
        if pending.is_empty() {
            break;
        }
        if attempt > 0 {
            let delay = policy.delay_for(attempt);
            debug!(attempt, pending = pending.len(), delay_ms = delay.as_millis() as u64, "retrying fetch");
            tokio::time::sleep(delay).await;
        }

        match tokio::time::timeout(policy.timeout, fetcher.fetch_many(&pending)).await {
            Ok(results) => {
                let mut returned: HashMap<EntityId, Result<Sample, FetchError>> =
                    results.into_iter().collect();
                for id in &pending {
                    let result = returned
                        .remove(id)
                        .unwrap_or_else(|| Err(FetchError::NotFound(id.clone())));
                    outcomes.insert(id.clone(), result);
                }
            }
            Err(_) => {
                warn!(attempt, timeout_ms = policy.timeout.as_millis() as u64, "fetch attempt timed out");
                for id in &pending {
                    outcomes.insert(id.clone(), Err(FetchError::Timeout(policy.timeout)));
                }
            }
        }

        pending.retain(|id| outcomes.get(id).is_some_and(|r| r.is_err()));
    }

    if !pending.is_empty() {
        warn!(failed = ?pending, "fetch failed after retries");
    }

    ids.iter()
        .map(|id| {
            let result = outcomes
                .remove(id)
                .unwrap_or_else(|| Err(FetchError::NotFound(id.clone())));
            (id.clone(), result)
        })
        .collect()
}
