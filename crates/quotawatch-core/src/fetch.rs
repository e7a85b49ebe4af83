//! The fetch collaborator contract.
//!
//! A fetcher turns an entity id into a [`Sample`]. How it does so (HTTP,
//! a browser-automation subprocess, a fixture) is not the engine's
//! business. Timeouts and retries are applied by the scheduler around
//! these calls.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;

use crate::types::{EntityId, Sample};

/// Boxed future returned by [`Fetcher`] methods so fetchers can be used
/// as trait objects.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Why a fetch produced no sample. Never fatal.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("upstream payload changed shape: {0}")]
    Upstream(String),

    #[error("entity {0:?} not present in upstream payload")]
    NotFound(EntityId),

    #[error("fetch command failed: {0}")]
    Command(String),
}

/// Produces raw samples for watched entities.
pub trait Fetcher: Send + Sync {
    /// Fetch one entity.
    fn fetch<'a>(&'a self, entity_id: &'a str) -> BoxFuture<'a, Result<Sample, FetchError>>;

    /// Fetch several entities at once.
    ///
    /// The default calls [`fetch`](Self::fetch) for each id in order.
    /// Fetchers whose upstream returns every entity in one response
    /// override this to hit the upstream once.
    fn fetch_many<'a>(
        &'a self,
        entity_ids: &'a [EntityId],
    ) -> BoxFuture<'a, Vec<(EntityId, Result<Sample, FetchError>)>> {
        Box::pin(async move {
            let mut results = Vec::with_capacity(entity_ids.len());
            for id in entity_ids {
                results.push((id.clone(), self.fetch(id).await));
            }
            results
        })
    }
}
