//! quotawatchd — the quotawatch daemon.
//!
//! Single binary that assembles the watcher:
//! - Config loading and validation (fatal on error)
//! - Fetchers (quota scraper command with balance API fallback, status
//!   scraper command)
//! - Scheduler with override file, alert sinks, CSV history, redb state
//! - Console snapshot after every tick
//!
//! # Usage
//!
//! ```text
//! quotawatchd --config quotawatch.toml
//! quotawatchd --once --only-watch
//! quotawatchd --test-notify
//! ```

mod sinks;
mod snapshot;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use quotawatch_core::config::QuotaConfig;
use quotawatch_core::{AlertEvent, AlertKind, Fetcher, Settings, WatchConfig, epoch_secs};
use quotawatch_engine::{AlertSink, FileControlPort, OverrideChannel, Scheduler};
use quotawatch_fetch::{
    CommandFetcher, CommandOutput, FallbackFetcher, QuotaApiFetcher, TokenCommand, resolve_token_from_env,
};
use quotawatch_state::{HistoryWriter, StateStore};

use crate::sinks::{ConsoleSink, LogSink};
use crate::snapshot::SnapshotStyle;

const DEFAULT_CONFIG: &str = "quotawatch.toml";

#[derive(Parser)]
#[command(name = "quotawatchd", about = "Balance and service status watcher")]
struct Cli {
    /// Config file. Defaults to ./quotawatch.toml when present, built-in
    /// defaults otherwise.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run a single tick and exit.
    #[arg(long)]
    once: bool,

    /// Send a test alert through every sink and exit.
    #[arg(long)]
    test_notify: bool,

    /// Hide services that are not watched from the snapshot.
    #[arg(long)]
    only_watch: bool,

    /// Emit logs as JSON.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = load_config(cli.config.as_deref())?;
    let settings = config.validate().context("invalid configuration")?;

    if cli.test_notify {
        test_notify(&config);
        return Ok(());
    }

    let mut scheduler = build_scheduler(&config, settings, cli.only_watch).await?;
    if let Err(e) = scheduler.restore() {
        warn!(error = %e, "failed to restore state, starting fresh");
    }

    if cli.once {
        scheduler.tick(epoch_secs()).await;
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => error!(error = %e, "failed to listen for ctrl-c"),
        }
        let _ = shutdown_tx.send(true);
    });

    scheduler.run(shutdown_rx).await;
    info!("quotawatchd stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,quotawatchd=debug,quotawatch=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<WatchConfig> {
    match path {
        Some(path) => WatchConfig::from_file(path).context("failed to load config"),
        None if Path::new(DEFAULT_CONFIG).exists() => {
            WatchConfig::from_file(Path::new(DEFAULT_CONFIG)).context("failed to load config")
        }
        None => {
            info!("no config file, using built-in defaults");
            Ok(WatchConfig::default())
        }
    }
}

async fn api_token(q: &QuotaConfig, settings: &Settings) -> anyhow::Result<String> {
    let command = if q.token_command.is_empty() {
        None
    } else {
        Some(TokenCommand::new(&q.token_command)?.with_cwd(q.command_dir.clone()))
    };
    let token = resolve_token_from_env(&q.token_env, command.as_ref(), settings.retry.timeout, q.token.as_deref())
        .await?;
    Ok(token)
}

/// Scraper command first with the balance API as fallback when both are
/// configured, otherwise whichever one is.
async fn quota_fetcher(config: &WatchConfig, settings: &Settings) -> anyhow::Result<Arc<dyn Fetcher>> {
    let q = &config.quota;
    let scraper: Option<Arc<dyn Fetcher>> = if q.command.is_empty() {
        None
    } else {
        let fetcher: Arc<dyn Fetcher> =
            Arc::new(CommandFetcher::new(&q.command, CommandOutput::Quota)?.with_cwd(q.command_dir.clone()));
        Some(fetcher)
    };

    let api = match api_token(q, settings).await {
        Ok(token) => {
            let api: Arc<dyn Fetcher> = Arc::new(QuotaApiFetcher::new(&q.api_url, token, settings.retry.timeout)?);
            Some(api)
        }
        Err(e) if scraper.is_some() => {
            debug!(error = %e, "no API token, quota scraper runs without fallback");
            None
        }
        Err(e) => return Err(e.context("quota API selected but no token available")),
    };

    let fetcher: Arc<dyn Fetcher> = match (scraper, api) {
        (Some(scraper), Some(api)) => {
            info!(command = ?q.command, url = %q.api_url, "quota source: scraper command, balance API fallback");
            Arc::new(FallbackFetcher::new(scraper, api))
        }
        (Some(scraper), None) => {
            info!(command = ?q.command, "quota source: scraper command");
            scraper
        }
        (None, Some(api)) => {
            info!(url = %q.api_url, "quota source: balance API");
            api
        }
        (None, None) => anyhow::bail!("no quota source configured"),
    };
    Ok(fetcher)
}

fn quota_entities(config: &WatchConfig) -> Vec<String> {
    if config.quota.entities.is_empty() {
        vec![config.quota.balance_entity.clone()]
    } else {
        config.quota.entities.clone()
    }
}

async fn build_scheduler(config: &WatchConfig, settings: Settings, only_watch: bool) -> anyhow::Result<Scheduler> {
    let control = FileControlPort::new(&config.quota.control_path);
    let style = SnapshotStyle {
        quota_threshold: settings.quota.threshold,
        down: settings.thresholds.down.clone(),
        up: settings.thresholds.up,
    };

    let services = &config.services;
    let status_fetcher = if services.watch.is_empty() || services.command.is_empty() {
        info!("service status watching disabled");
        None
    } else {
        let fetcher = CommandFetcher::new(&services.command, CommandOutput::Availability)?
            .with_cwd(services.command_dir.clone());
        Some(Arc::new(fetcher))
    };

    let quota_fetcher = quota_fetcher(config, &settings).await?;
    let snapshot_source = status_fetcher.clone().filter(|_| !only_watch);
    let mut scheduler = Scheduler::new(settings, OverrideChannel::new(control))
        .with_quota(quota_fetcher, quota_entities(config), &config.quota.balance_entity)
        .with_sink(LogSink)
        .with_sink(ConsoleSink::stdout())
        .with_tick_callback(Box::new(move |report| {
            let others = snapshot_source
                .as_ref()
                .map(|f| f.last_output())
                .unwrap_or_default();
            print!("{}", snapshot::render(report, &style, &others));
        }));

    let service_entities = match status_fetcher {
        Some(fetcher) => {
            scheduler = scheduler.with_services(fetcher, services.watch.clone());
            services.watch.clone()
        }
        None => Vec::new(),
    };

    if let Some(dir) = &config.history.dir {
        scheduler = scheduler.with_history(HistoryWriter::new(dir, quota_entities(config), service_entities));
    }

    if let Some(path) = &config.state.path {
        match StateStore::open(path) {
            Ok(store) => scheduler = scheduler.with_store(store),
            Err(e) => warn!(path = ?path, error = %e, "state store unavailable, state kept in memory"),
        }
    }

    Ok(scheduler)
}

fn test_notify(config: &WatchConfig) {
    let event = AlertEvent::new(
        AlertKind::QuotaPhaseA,
        &config.quota.balance_entity,
        epoch_secs(),
        config.quota.threshold,
    );
    let mut sinks: Vec<Box<dyn AlertSink>> = vec![Box::new(LogSink), Box::new(ConsoleSink::stdout())];
    for sink in &mut sinks {
        if let Err(e) = sink.dispatch(&event) {
            error!(sink = sink.name(), error = %e, "test notification failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags() {
        let cli = Cli::try_parse_from(["quotawatchd", "--once", "--log-json", "--config", "x.toml"]).unwrap();
        assert!(cli.once);
        assert!(!cli.only_watch);
        assert!(cli.log_json);
        assert!(!cli.test_notify);
        assert_eq!(cli.config.as_deref(), Some(Path::new("x.toml")));

        let cli = Cli::try_parse_from(["quotawatchd", "--only-watch"]).unwrap();
        assert!(cli.only_watch);
    }

    #[test]
    fn explicit_missing_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn invalid_thresholds_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[services]\ndown = [10.0, 50.0]\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert!(config.validate().is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn once_with_command_sources() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = WatchConfig::default();
        config.quota.token_env = "QUOTAWATCHD_TEST_TOKEN_UNSET".into();
        config.quota.command = vec![
            "sh".into(),
            "-c".into(),
            r#"echo '[{"name":"CodeX 专用福利","total":"¥200","used":"¥50","remaining":"¥150"}]'"#.into(),
        ];
        config.quota.control_path = dir.path().join("override.txt");
        config.services.command = vec![
            "sh".into(),
            "-c".into(),
            r#"echo '[{"name":"日本线路（CodeX）","percent_24h":99}]'"#.into(),
        ];
        config.history.dir = Some(dir.path().join("history"));
        config.state.path = Some(dir.path().join("state.redb"));

        let settings = config.validate().unwrap();
        let mut scheduler = build_scheduler(&config, settings, false).await.unwrap();
        let report = scheduler.tick(epoch_secs()).await;

        assert_eq!(report.quota_views[0].value("remaining"), Some(150.0));
        assert_eq!(report.service_views.len(), 2);
        assert!(report.service_views[1].provenance.is_missing());
        assert!(dir.path().join("history/quota_wide.csv").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn scraper_with_token_command_builds_fallback_source() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = WatchConfig::default();
        config.quota.token_env = "QUOTAWATCHD_TEST_TOKEN_UNSET".into();
        config.quota.token_command = vec!["sh".into(), "-c".into(), "echo sk-Auto1".into()];
        config.quota.command = vec!["sh".into(), "-c".into(), "cat cards.json".into()];
        config.quota.command_dir = Some(dir.path().to_path_buf());
        std::fs::write(
            dir.path().join("cards.json"),
            r#"[{"name":"CodeX 专用福利","remaining":"¥9.00"}]"#,
        )
        .unwrap();

        let settings = config.validate().unwrap();
        let fetcher = quota_fetcher(&config, &settings).await.unwrap();
        let sample = fetcher.fetch("CodeX 专用福利").await.unwrap();
        assert_eq!(sample.field("remaining"), Some(9.0));
    }

    #[tokio::test]
    async fn no_quota_source_is_an_error() {
        let mut config = WatchConfig::default();
        config.quota.token_env = "QUOTAWATCHD_TEST_TOKEN_UNSET".into();
        let settings = config.validate().unwrap();
        assert!(quota_fetcher(&config, &settings).await.is_err());
    }
}
