//! End-to-end scheduler scenarios driven by scripted fetchers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use quotawatch_core::{
    AlertKind, BoxFuture, CachePolicy, EntityId, FetchError, Fetcher, MilestonePolicy,
    Provenance, QuotaPolicy, RetryPolicy, Sample, Settings, ThresholdPolicy,
};
use quotawatch_engine::{
    MemoryControlPort, OverrideChannel, Phase, RecordingSink, Scheduler,
};
use quotawatch_state::{HistoryWriter, StateStore};

type Round = Vec<(EntityId, Result<Sample, FetchError>)>;

/// Replays one prepared round per `fetch_many` call. Once the script runs
/// out, every entity fails.
struct Script {
    rounds: Mutex<VecDeque<Round>>,
}

impl Script {
    fn new(rounds: Vec<Round>) -> Arc<Self> {
        Arc::new(Self {
            rounds: Mutex::new(rounds.into()),
        })
    }
}

impl Fetcher for Script {
    fn fetch<'a>(&'a self, entity_id: &'a str) -> BoxFuture<'a, Result<Sample, FetchError>> {
        Box::pin(async move { Err(FetchError::NotFound(entity_id.to_string())) })
    }

    fn fetch_many<'a>(
        &'a self,
        entity_ids: &'a [EntityId],
    ) -> BoxFuture<'a, Vec<(EntityId, Result<Sample, FetchError>)>> {
        let round = self.rounds.lock().unwrap().pop_front();
        Box::pin(async move {
            match round {
                Some(round) => round,
                None => entity_ids
                    .iter()
                    .map(|id| (id.clone(), Err(FetchError::Network("script exhausted".into()))))
                    .collect(),
            }
        })
    }
}

fn balance(v: f64) -> Round {
    vec![("codex".to_string(), Ok(Sample::quota("codex", 200.0, 200.0 - v, v, 0)))]
}

fn failed(id: &str) -> Round {
    vec![(id.to_string(), Err(FetchError::Timeout(Duration::from_secs(60))))]
}

fn percent(p: f64) -> Round {
    vec![("jp".to_string(), Ok(Sample::percent("jp", p, 0)))]
}

fn settings(threshold: f64, milestones: Vec<f64>, down: Vec<f64>, up: f64) -> Settings {
    Settings {
        interval: Duration::from_secs(60),
        retry: RetryPolicy {
            timeout: Duration::from_secs(60),
            retries: 0,
            backoff: Duration::from_secs(2),
        },
        cache: CachePolicy {
            ttl: Duration::from_secs(1800),
            short_ttl: Duration::from_secs(300),
        },
        quota: QuotaPolicy::new(threshold, milestones, MilestonePolicy::Lowest, 5, 1).unwrap(),
        thresholds: ThresholdPolicy::new(down, up).unwrap(),
    }
}

fn quota_scheduler(
    settings: Settings,
    script: Arc<Script>,
    control: MemoryControlPort,
    sink: RecordingSink,
) -> Scheduler {
    Scheduler::new(settings, OverrideChannel::new(control))
        .with_quota(script, vec!["codex".to_string()], "codex")
        .with_sink(sink)
}

#[tokio::test]
async fn low_balance_stays_in_phase_a() {
    let sink = RecordingSink::new();
    let mut s = quota_scheduler(
        settings(3.0, vec![], vec![10.0], 80.0),
        Script::new(vec![balance(10.0), balance(2.0)]),
        MemoryControlPort::new(),
        sink.clone(),
    );

    let first = s.tick(60).await;
    assert_eq!(first.events.len(), 1);
    assert_eq!(first.events[0].kind, AlertKind::QuotaPhaseA);

    let second = s.tick(120).await;
    assert_eq!(second.quota_views[0].provenance, Provenance::Fresh);
    assert!(second.events.is_empty());
    assert_eq!(second.quota_phase, Some(Phase::A));
}

#[tokio::test]
async fn override_then_multi_milestone_jump() {
    let control = MemoryControlPort::new();
    let sink = RecordingSink::new();
    let mut s = quota_scheduler(
        settings(5.0, vec![50.0, 20.0, 10.0, 5.0], vec![10.0], 80.0),
        Script::new(vec![balance(40.0), balance(18.0)]),
        control.clone(),
        sink.clone(),
    );

    control.set_raw("1\n");
    let first = s.tick(60).await;
    assert!(first.events.is_empty());
    assert_eq!(first.quota_phase, Some(Phase::B));

    let second = s.tick(120).await;
    let kinds: Vec<AlertKind> = second.events.iter().map(|e| e.kind.clone()).collect();
    assert_eq!(kinds, vec![AlertKind::QuotaMilestone { value: 20.0 }]);
}

#[tokio::test]
async fn revert_writes_override_back_to_zero() {
    let control = MemoryControlPort::new();
    control.set_raw("1");
    let sink = RecordingSink::new();
    let mut s = quota_scheduler(
        settings(5.0, vec![50.0, 20.0, 10.0, 5.0], vec![10.0], 80.0),
        Script::new(vec![balance(12.0), balance(3.0)]),
        control.clone(),
        sink.clone(),
    );

    s.tick(60).await;
    let report = s.tick(120).await;
    assert!(report.events.iter().any(|e| e.kind == AlertKind::QuotaRevert));
    assert_eq!(control.raw(), "0");
    assert!(!report.override_set);

    let state = s.quota_state().unwrap();
    assert_eq!(state.phase, Phase::A);
    assert!(state.milestones_notified.is_empty());
    assert_eq!(state.notify_count_in_phase, 0);
}

#[tokio::test]
async fn reminder_limit_sets_override() {
    let control = MemoryControlPort::new();
    let sink = RecordingSink::new();
    let mut s = quota_scheduler(
        settings(5.0, vec![50.0], vec![10.0], 80.0),
        Script::new((0..5).map(|_| balance(100.0)).collect()),
        control.clone(),
        sink.clone(),
    );

    for t in 1..=5 {
        s.tick(t * 60).await;
    }
    let events = sink.events();
    assert_eq!(events.len(), 6);
    // One loud reminder, four quiet ones, then the escalation.
    assert_eq!(events.iter().filter(|e| e.loud).count(), 2);
    assert_eq!(events[5].kind, AlertKind::QuotaEscalation);
    assert_eq!(control.raw(), "1");
}

#[tokio::test]
async fn service_drop_floor_and_recovery() {
    let sink = RecordingSink::new();
    let script = Script::new(vec![percent(75.0), percent(65.0), percent(45.0), percent(82.0)]);
    let mut s = Scheduler::new(
        settings(5.0, vec![], vec![70.0, 60.0, 50.0], 80.0),
        OverrideChannel::new(MemoryControlPort::new()),
    )
    .with_services(script, vec!["jp".to_string()])
    .with_sink(sink.clone());

    for t in 1..=4 {
        s.tick(t * 60).await;
    }
    let kinds: Vec<AlertKind> = sink.events().into_iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            AlertKind::ServiceDown { threshold: 70.0 },
            AlertKind::ServiceDown { threshold: 60.0 },
            AlertKind::ServiceUp,
        ]
    );
    assert!(s.service_state("jp").unwrap().has_dropped_below_floor);
}

#[tokio::test]
async fn repeated_failure_without_cache_changes_nothing() {
    let control = MemoryControlPort::new();
    let sink = RecordingSink::new();
    let mut s = quota_scheduler(
        settings(5.0, vec![50.0, 20.0], vec![10.0], 80.0),
        Script::new(vec![failed("codex"), failed("codex")]),
        control.clone(),
        sink.clone(),
    );
    let initial = s.quota_state().unwrap().clone();

    for t in 1..=2 {
        let report = s.tick(t * 60).await;
        assert_eq!(report.quota_views[0].provenance, Provenance::Missing);
        assert_eq!(s.quota_state().unwrap(), &initial);
    }
    assert!(sink.events().is_empty());
    assert_eq!(control.raw(), "");
}

#[tokio::test]
async fn missing_tick_is_transparent() {
    // A missing tick between two samples must not hide the crossing.
    let with_gap = Script::new(vec![
        balance(60.0),
        failed("codex"),
        balance(30.0),
    ]);
    let control = MemoryControlPort::new();
    control.set_raw("1");
    let sink = RecordingSink::new();
    // Long outage: cache TTL shorter than the gap.
    let mut cfg = settings(5.0, vec![50.0, 20.0], vec![10.0], 80.0);
    cfg.cache.ttl = Duration::from_secs(30);
    cfg.cache.short_ttl = Duration::from_secs(30);
    let mut s = quota_scheduler(cfg, with_gap, control, sink.clone());

    s.tick(60).await;
    let before = s.quota_state().unwrap().clone();
    let gap = s.tick(120).await;
    assert_eq!(gap.quota_views[0].provenance, Provenance::Missing);
    assert!(gap.events.is_empty());
    assert_eq!(s.quota_state().unwrap(), &before);

    let after = s.tick(180).await;
    let kinds: Vec<AlertKind> = after.events.iter().map(|e| e.kind.clone()).collect();
    assert_eq!(kinds, vec![AlertKind::QuotaMilestone { value: 50.0 }]);
}

#[tokio::test]
async fn cached_value_survives_short_outage() {
    let sink = RecordingSink::new();
    let mut s = quota_scheduler(
        settings(5.0, vec![], vec![10.0], 80.0),
        Script::new(vec![balance(100.0), failed("codex")]),
        MemoryControlPort::new(),
        sink.clone(),
    );
    s.tick(60).await;
    let report = s.tick(120).await;
    assert_eq!(report.quota_views[0].provenance, Provenance::Cached);
    assert_eq!(report.quota_views[0].age_secs, 60);
    // Cached values still drive phase A reminders.
    assert_eq!(report.events.len(), 1);
}

#[tokio::test]
async fn history_and_store_follow_ticks() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open_in_memory().unwrap();
    let history = HistoryWriter::new(dir.path(), vec!["codex".to_string()], Vec::new());
    let mut s = quota_scheduler(
        settings(5.0, vec![], vec![10.0], 80.0),
        Script::new(vec![balance(100.0), balance(90.0)]),
        MemoryControlPort::new(),
        RecordingSink::new(),
    )
    .with_history(history)
    .with_store(store.clone());

    s.tick(60).await;
    s.tick(120).await;

    let wide = std::fs::read_to_string(dir.path().join("quota_wide.csv")).unwrap();
    assert_eq!(wide.lines().count(), 3);

    let mut restored = quota_scheduler(
        settings(5.0, vec![], vec![10.0], 80.0),
        Script::new(Vec::new()),
        MemoryControlPort::new(),
        RecordingSink::new(),
    )
    .with_store(store);
    assert_eq!(restored.restore().unwrap(), 2);
    assert_eq!(restored.quota_state().unwrap().last_balance, Some(90.0));
    assert_eq!(restored.quota_state().unwrap().notify_count_in_phase, 2);
}
