//! SampleResolver — the single funnel between fetchers and engines.
//!
//! Every fetch result for an entity ends up as exactly one
//! [`ResolvedView`]: `Fresh` when this tick's sample is trusted (and
//! recorded in the cache), `Cached` when the cache still holds a recent
//! trusted sample, `Missing` otherwise. Engines never see untrusted data.

use std::time::Duration;

use tracing::{debug, warn};

use quotawatch_core::{CachePolicy, EntityId, FetchError, ResolvedView, Sample};

use crate::cache::FreshnessCache;
use crate::validator::{TrustValidator, Verdict};

/// A fetch result with the validator's verdict attached.
type Checked = Result<(Sample, Verdict), FetchError>;

pub struct SampleResolver {
    validator: TrustValidator,
    cache: FreshnessCache,
    policy: CachePolicy,
}

impl SampleResolver {
    pub fn new(validator: TrustValidator, policy: CachePolicy) -> Self {
        Self {
            validator,
            cache: FreshnessCache::new(),
            policy,
        }
    }

    pub fn cache(&self) -> &FreshnessCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut FreshnessCache {
        &mut self.cache
    }

    /// Resolve one entity with the long TTL.
    pub fn resolve(
        &mut self,
        entity_id: &str,
        fetch_result: Result<Sample, FetchError>,
        now: u64,
    ) -> ResolvedView {
        self.resolve_with_ttl(entity_id, fetch_result, now, self.policy.ttl)
    }

    /// Resolve one entity, falling back to cache entries no older than `ttl`.
    pub fn resolve_with_ttl(
        &mut self,
        entity_id: &str,
        fetch_result: Result<Sample, FetchError>,
        now: u64,
        ttl: Duration,
    ) -> ResolvedView {
        let checked = self.check(fetch_result);
        self.settle(entity_id, checked, now, ttl)
    }

    /// Resolve a whole entity group fetched in the same tick.
    ///
    /// When the group is partial (some entities trusted, some not), the
    /// upstream is known to be returning an incomplete set and fallbacks
    /// use the short TTL so stale values age out sooner. Output order
    /// follows the input.
    pub fn resolve_batch(
        &mut self,
        results: Vec<(EntityId, Result<Sample, FetchError>)>,
        now: u64,
    ) -> Vec<ResolvedView> {
        let checked: Vec<(EntityId, Checked)> = results
            .into_iter()
            .map(|(id, result)| (id, self.check(result)))
            .collect();
        let trusted = checked
            .iter()
            .filter(|(_, c)| c.as_ref().is_ok_and(|(_, v)| v.is_trusted()))
            .count();
        let partial = trusted > 0 && trusted < checked.len();
        let ttl = if partial {
            debug!(trusted, total = checked.len(), "partial entity set, using short TTL");
            self.policy.short_ttl
        } else {
            self.policy.ttl
        };

        checked
            .into_iter()
            .map(|(id, c)| self.settle(&id, c, now, ttl))
            .collect()
    }

    fn check(&self, fetch_result: Result<Sample, FetchError>) -> Checked {
        fetch_result.map(|sample| {
            let verdict = self.validator.validate(&sample);
            (sample, verdict)
        })
    }

    fn settle(&mut self, entity_id: &str, checked: Checked, now: u64, ttl: Duration) -> ResolvedView {
        match checked {
            Ok((sample, Verdict::Trusted)) => {
                self.cache.record(entity_id, sample.clone(), now);
                return ResolvedView::fresh(sample);
            }
            Ok((_, Verdict::Untrusted(reason))) => {
                warn!(entity = %entity_id, %reason, "untrusted sample, falling back to cache");
            }
            Err(e) => {
                warn!(entity = %entity_id, error = %e, "no sample this tick, falling back to cache");
            }
        }

        match self.cache.lookup(entity_id, now, ttl) {
            Some((sample, age)) => {
                debug!(entity = %entity_id, age_secs = age, "using cached sample");
                ResolvedView::cached(sample.clone(), age)
            }
            None => {
                debug!(entity = %entity_id, "no trustworthy value, marking missing");
                ResolvedView::missing(entity_id)
            }
        }
    }
}
