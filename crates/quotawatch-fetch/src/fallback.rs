//! Primary source with a secondary fallback on the same tick.
//!
//! The quota page scrape matches what the website shows, so it goes
//! first; the balance API answers for whatever the scrape could not.

use std::sync::Arc;

use tracing::debug;

use quotawatch_core::{BoxFuture, EntityId, FetchError, Fetcher, Sample};

pub struct FallbackFetcher {
    primary: Arc<dyn Fetcher>,
    secondary: Arc<dyn Fetcher>,
}

impl FallbackFetcher {
    pub fn new(primary: Arc<dyn Fetcher>, secondary: Arc<dyn Fetcher>) -> Self {
        Self { primary, secondary }
    }
}

impl Fetcher for FallbackFetcher {
    fn fetch<'a>(&'a self, entity_id: &'a str) -> BoxFuture<'a, Result<Sample, FetchError>> {
        Box::pin(async move {
            match self.primary.fetch(entity_id).await {
                Ok(sample) => Ok(sample),
                Err(e) => {
                    debug!(entity = %entity_id, error = %e, "primary source failed, trying fallback");
                    self.secondary.fetch(entity_id).await
                }
            }
        })
    }

    fn fetch_many<'a>(
        &'a self,
        entity_ids: &'a [EntityId],
    ) -> BoxFuture<'a, Vec<(EntityId, Result<Sample, FetchError>)>> {
        Box::pin(async move {
            let mut results = self.primary.fetch_many(entity_ids).await;
            let failed: Vec<EntityId> = results
                .iter()
                .filter(|(_, r)| r.is_err())
                .map(|(id, _)| id.clone())
                .collect();
            if failed.is_empty() {
                return results;
            }

            debug!(failed = ?failed, "primary source failed, trying fallback");
            for (id, result) in self.secondary.fetch_many(&failed).await {
                if let Some(slot) = results.iter_mut().find(|(rid, _)| *rid == id) {
                    slot.1 = result;
                }
            }
            results
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use quotawatch_core::field;

    /// Answers only for the listed ids and counts the ids it was asked for.
    struct Knows {
        ids: Vec<&'static str>,
        remaining: f64,
        asked: AtomicUsize,
    }

    impl Knows {
        fn new(ids: Vec<&'static str>, remaining: f64) -> Arc<Self> {
            Arc::new(Self {
                ids,
                remaining,
                asked: AtomicUsize::new(0),
            })
        }
    }

    impl Fetcher for Knows {
        fn fetch<'a>(&'a self, entity_id: &'a str) -> BoxFuture<'a, Result<Sample, FetchError>> {
            self.asked.fetch_add(1, Ordering::SeqCst);
            let known = self.ids.contains(&entity_id);
            let remaining = self.remaining;
            Box::pin(async move {
                if known {
                    Ok(Sample::new(entity_id, 0).with_field(field::REMAINING, remaining))
                } else {
                    Err(FetchError::NotFound(entity_id.to_string()))
                }
            })
        }
    }

    fn ids(list: &[&str]) -> Vec<EntityId> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn secondary_fills_only_primary_failures() {
        let primary = Knows::new(vec!["a"], 10.0);
        let secondary = Knows::new(vec!["a", "b"], 20.0);
        let fetcher = FallbackFetcher::new(primary.clone(), secondary.clone());

        let results = fetcher.fetch_many(&ids(&["a", "b", "c"])).await;
        let order: Vec<&str> = results.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(results[0].1.as_ref().unwrap().field(field::REMAINING), Some(10.0));
        assert_eq!(results[1].1.as_ref().unwrap().field(field::REMAINING), Some(20.0));
        assert_eq!(results[2].1, Err(FetchError::NotFound("c".to_string())));
        assert_eq!(secondary.asked.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn secondary_untouched_when_primary_succeeds() {
        let primary = Knows::new(vec!["a"], 10.0);
        let secondary = Knows::new(vec!["a"], 20.0);
        let fetcher = FallbackFetcher::new(primary, secondary.clone());

        let sample = fetcher.fetch("a").await.unwrap();
        assert_eq!(sample.field(field::REMAINING), Some(10.0));
        assert_eq!(secondary.asked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn single_fetch_falls_back() {
        let fetcher = FallbackFetcher::new(Knows::new(vec![], 0.0), Knows::new(vec!["a"], 20.0));
        let sample = fetcher.fetch("a").await.unwrap();
        assert_eq!(sample.field(field::REMAINING), Some(20.0));
    }
}
