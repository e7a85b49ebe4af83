//! Scheduler — the cooperative tick loop.
//!
//! One tick reads the override, fetches both entity groups concurrently,
//! resolves every result into a [`ResolvedView`], feeds the engines and
//! dispatches whatever alerts they emit. History and persistence run last;
//! their failures are logged and the loop carries on.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use quotawatch_core::{
    AlertEvent, EntityId, Fetcher, ResolvedView, Sample, Settings, epoch_secs,
};
use quotawatch_state::tables::{CACHE_ENTRIES, QUOTA_PHASE, SERVICE_THRESHOLDS};
use quotawatch_state::{HistoryWriter, StateResult, StateStore};

use crate::cache::CacheEntry;
use crate::control::OverrideChannel;
use crate::quota::{Phase, QuotaPhaseEngine, QuotaPhaseState};
use crate::resolver::SampleResolver;
use crate::retry::fetch_with_retry;
use crate::sink::AlertSink;
use crate::threshold::{ServiceThresholdState, ThresholdCrossingEngine};
use crate::validator::{TrustRules, TrustValidator};

const QUOTA_PREFIX: &str = "quota:";
const SERVICE_PREFIX: &str = "service:";

/// Invoked after every tick with its report.
pub type TickCallback = Box<dyn FnMut(&TickReport) + Send>;

/// Everything one tick observed and decided.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickReport {
    pub at: u64,
    pub quota_views: Vec<ResolvedView>,
    pub service_views: Vec<ResolvedView>,
    pub events: Vec<AlertEvent>,
    /// Override value after the tick, including any write-back that
    /// reached the control port.
    pub override_set: bool,
    pub quota_phase: Option<Phase>,
}

struct QuotaGroup {
    fetcher: Arc<dyn Fetcher>,
    entities: Vec<EntityId>,
    resolver: SampleResolver,
    engine: QuotaPhaseEngine,
}

struct ServiceGroup {
    fetcher: Arc<dyn Fetcher>,
    entities: Vec<EntityId>,
    resolver: SampleResolver,
    engine: ThresholdCrossingEngine,
}

type FetchResults = Vec<(EntityId, Result<Sample, quotawatch_core::FetchError>)>;

pub struct Scheduler {
    settings: Settings,
    control: OverrideChannel,
    quota: Option<QuotaGroup>,
    services: Option<ServiceGroup>,
    sinks: Vec<Box<dyn AlertSink>>,
    history: Option<HistoryWriter>,
    store: Option<StateStore>,
    on_tick: Option<TickCallback>,
}

impl Scheduler {
    pub fn new(settings: Settings, control: OverrideChannel) -> Self {
        Self {
            settings,
            control,
            quota: None,
            services: None,
            sinks: Vec::new(),
            history: None,
            store: None,
            on_tick: None,
        }
    }

    /// Watch quota cards. The phase engine tracks `balance_entity`.
    pub fn with_quota(
        mut self,
        fetcher: Arc<dyn Fetcher>,
        mut entities: Vec<EntityId>,
        balance_entity: impl Into<EntityId>,
    ) -> Self {
        let balance_entity = balance_entity.into();
        if !entities.contains(&balance_entity) {
            entities.push(balance_entity.clone());
        }
        self.quota = Some(QuotaGroup {
            fetcher,
            entities,
            resolver: SampleResolver::new(TrustValidator::new(TrustRules::quota()), self.settings.cache),
            engine: QuotaPhaseEngine::new(balance_entity, self.settings.quota.clone()),
        });
        self
    }

    /// Watch service availability percentages.
    pub fn with_services(mut self, fetcher: Arc<dyn Fetcher>, entities: Vec<EntityId>) -> Self {
        self.services = Some(ServiceGroup {
            fetcher,
            entities,
            resolver: SampleResolver::new(
                TrustValidator::new(TrustRules::availability()),
                self.settings.cache,
            ),
            engine: ThresholdCrossingEngine::new(self.settings.thresholds.clone()),
        });
        self
    }

    pub fn with_sink(mut self, sink: impl AlertSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn with_history(mut self, history: HistoryWriter) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_tick_callback(mut self, callback: TickCallback) -> Self {
        self.on_tick = Some(callback);
        self
    }

    pub fn quota_state(&self) -> Option<&QuotaPhaseState> {
        self.quota.as_ref().map(|q| q.engine.state())
    }

    pub fn service_state(&self, service_id: &str) -> Option<&ServiceThresholdState> {
        self.services.as_ref()?.engine.state(service_id)
    }

    /// Load engine and cache state from the store. Returns the number of
    /// documents restored.
    pub fn restore(&mut self) -> StateResult<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let mut restored = 0;

        if let Some(quota) = &mut self.quota {
            if let Some(state) = store.get::<QuotaPhaseState>(QUOTA_PHASE, quota.engine.entity_id())? {
                quota.engine.restore(state);
                restored += 1;
            }
        }

        if let Some(services) = &mut self.services {
            let mut states: Vec<ServiceThresholdState> = Vec::new();
            for (key, state) in store.list::<ServiceThresholdState>(SERVICE_THRESHOLDS)? {
                if services.entities.contains(&state.service_id) {
                    states.push(state);
                } else if store.delete(SERVICE_THRESHOLDS, &key)? {
                    debug!(service = %state.service_id, "dropped state of unwatched service");
                }
            }
            restored += states.len();
            services.engine.restore(states);
        }

        let mut quota_entries = Vec::new();
        let mut service_entries = Vec::new();
        for (key, entry) in store.list::<CacheEntry>(CACHE_ENTRIES)? {
            if key.starts_with(QUOTA_PREFIX) {
                quota_entries.push(entry);
            } else if key.starts_with(SERVICE_PREFIX) {
                service_entries.push(entry);
            }
        }
        if let Some(quota) = &mut self.quota {
            restored += quota_entries.len();
            quota.resolver.cache_mut().restore(quota_entries);
        }
        if let Some(services) = &mut self.services {
            restored += service_entries.len();
            services.resolver.cache_mut().restore(service_entries);
        }

        info!(restored, "engine state restored");
        Ok(restored)
    }

    /// Run one tick at `now` (unix seconds).
    pub async fn tick(&mut self, now: u64) -> TickReport {
        let override_read = self.control.read();

        let quota_job = self
            .quota
            .as_ref()
            .map(|q| (Arc::clone(&q.fetcher), q.entities.clone()));
        let service_job = self
            .services
            .as_ref()
            .map(|s| (Arc::clone(&s.fetcher), s.entities.clone()));
        let retry = self.settings.retry;

        let (quota_results, service_results) = tokio::join!(
            fetch_group(quota_job, &retry),
            fetch_group(service_job, &retry),
        );

        let mut events = Vec::new();
        let mut override_set = override_read;

        let mut quota_views = Vec::new();
        if let (Some(quota), Some(results)) = (&mut self.quota, quota_results) {
            quota_views = quota.resolver.resolve_batch(results, now);
            let balance_view = quota_views
                .iter()
                .find(|v| v.entity_id == quota.engine.entity_id())
                .cloned()
                .unwrap_or_else(|| ResolvedView::missing(quota.engine.entity_id()));

            let outcome = quota.engine.evaluate(&balance_view, override_read, now);
            if let Some(value) = outcome.write_override
                && self.control.write(value)
            {
                debug!(value, "override written back");
                override_set = value;
            }
            events.extend(outcome.events);
        }

        let mut service_views = Vec::new();
        if let (Some(services), Some(results)) = (&mut self.services, service_results) {
            service_views = services.resolver.resolve_batch(results, now);
            for view in &service_views {
                if let Some(event) = services.engine.evaluate(view, now) {
                    events.push(event);
                }
            }
        }

        for event in &events {
            self.dispatch(event);
        }

        if let Some(history) = &self.history
            && let Err(e) = history.append_tick(now, &quota_views, &service_views)
        {
            warn!(error = %e, "failed to append history");
        }

        if let Err(e) = self.persist() {
            warn!(error = %e, "failed to persist engine state");
        }

        let report = TickReport {
            at: now,
            quota_views,
            service_views,
            events,
            override_set,
            quota_phase: self.quota.as_ref().map(|q| q.engine.phase()),
        };
        debug!(
            events = report.events.len(),
            override_set = report.override_set,
            "tick complete"
        );
        if let Some(callback) = &mut self.on_tick {
            callback(&report);
        }
        report
    }

    /// Tick every `interval` until `shutdown` fires. A tick in progress
    /// always completes.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.settings.interval.as_secs(),
            quota = self.quota.is_some(),
            services = self.services.is_some(),
            "scheduler started"
        );

        loop {
            let stopping = *shutdown.borrow();
            if stopping {
                break;
            }
            self.tick(epoch_secs()).await;

            tokio::select! {
                _ = tokio::time::sleep(self.settings.interval) => {}
                res = shutdown.changed() => {
                    if res.is_err() {
                        debug!("shutdown sender dropped");
                    }
                    break;
                }
            }
        }
        info!("scheduler shutting down");
    }

    fn dispatch(&mut self, event: &AlertEvent) {
        for sink in &mut self.sinks {
            if let Err(e) = sink.dispatch(event) {
                error!(sink = sink.name(), error = %e, kind = event.title(), "alert dispatch failed");
            }
        }
    }

    fn persist(&self) -> StateResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        if let Some(quota) = &self.quota {
            store.put(QUOTA_PHASE, quota.engine.entity_id(), quota.engine.state())?;
            let keyed: Vec<(String, &CacheEntry)> = quota
                .resolver
                .cache()
                .entries()
                .map(|e| (format!("{QUOTA_PREFIX}{}", e.entity_id), e))
                .collect();
            store.put_all(CACHE_ENTRIES, keyed.iter().map(|(k, e)| (k.as_str(), *e)))?;
        }

        if let Some(services) = &self.services {
            store.put_all(
                SERVICE_THRESHOLDS,
                services.engine.states().map(|s| (s.service_id.as_str(), s)),
            )?;
            let keyed: Vec<(String, &CacheEntry)> = services
                .resolver
                .cache()
                .entries()
                .map(|e| (format!("{SERVICE_PREFIX}{}", e.entity_id), e))
                .collect();
            store.put_all(CACHE_ENTRIES, keyed.iter().map(|(k, e)| (k.as_str(), *e)))?;
        }
        Ok(())
    }
}

async fn fetch_group(
    job: Option<(Arc<dyn Fetcher>, Vec<EntityId>)>,
    retry: &quotawatch_core::RetryPolicy,
) -> Option<FetchResults> {
    let (fetcher, entities) = job?;
    Some(fetch_with_retry(fetcher.as_ref(), &entities, retry).await)
}
