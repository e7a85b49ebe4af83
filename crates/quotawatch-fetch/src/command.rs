//! External scraper command.
//!
//! The command prints a JSON list on stdout, possibly surrounded by log
//! lines. Two list shapes are understood, picked at construction:
//!
//! ```text
//! availability: [{"name": "日本线路（CodeX）", "percent_24h": 99.2}, ...]
//! quota:        [{"name": "CodeX 专用福利", "total": "¥200", "used": "¥50", "remaining": "¥150"}, ...]
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{LazyLock, Mutex, PoisonError};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use quotawatch_core::{
    BoxFuture, ConfigError, EntityId, FetchError, Fetcher, Sample, epoch_secs, field,
};

use crate::money::parse_money;
use crate::normalize::normalize_services;

/// Which JSON shape the command prints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutput {
    Availability,
    Quota,
}

#[derive(Debug, Deserialize)]
struct ServiceRow {
    #[serde(default)]
    name: String,
    #[serde(default)]
    percent_24h: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct QuotaRow {
    name: String,
    #[serde(default)]
    total: Value,
    #[serde(default)]
    used: Value,
    #[serde(default)]
    remaining: Value,
}

static API_TOKEN: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"sk-[A-Za-z0-9]+").ok());

fn split_argv(argv: &[String]) -> Result<(String, Vec<String>), ConfigError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| ConfigError::Invalid("fetch command is empty".to_string()))?;
    Ok((program.clone(), args.to_vec()))
}

/// Run `program` to completion and return its stdout. A non-zero exit is
/// an error carrying the head of stderr.
async fn run_command(program: &str, args: &[String], cwd: Option<&Path>) -> Result<String, FetchError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // The scheduler's timeout drops this future; take the child with it.
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let out = cmd
        .output()
        .await
        .map_err(|e| FetchError::Command(format!("failed to start {program}: {e}")))?;

    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        let tail: String = stderr.trim().chars().take(200).collect();
        return Err(FetchError::Command(format!("{program} exited with {}: {tail}", out.status)));
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

pub struct CommandFetcher {
    program: String,
    args: Vec<String>,
    output: CommandOutput,
    cwd: Option<PathBuf>,
    /// Every sample the last successful run produced, requested or not.
    last: Mutex<Vec<Sample>>,
}

impl CommandFetcher {
    /// `argv[0]` is the program, the rest its arguments.
    pub fn new(argv: &[String], output: CommandOutput) -> Result<Self, ConfigError> {
        let (program, args) = split_argv(argv)?;
        Ok(Self {
            program,
            args,
            output,
            cwd: None,
            last: Mutex::new(Vec::new()),
        })
    }

    /// Run the command from `cwd` instead of the daemon's working directory.
    pub fn with_cwd(mut self, cwd: Option<PathBuf>) -> Self {
        self.cwd = cwd;
        self
    }

    /// Every entity the last run reported, sorted by id. Empty after a
    /// failed run.
    pub fn last_output(&self) -> Vec<Sample> {
        self.last.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn remember(&self, samples: Option<&HashMap<EntityId, Sample>>) {
        let mut all: Vec<Sample> = samples.map(|m| m.values().cloned().collect()).unwrap_or_default();
        all.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = all;
    }

    async fn collect(&self) -> Result<HashMap<EntityId, Sample>, FetchError> {
        let result = self.run_and_parse().await;
        self.remember(result.as_ref().ok());
        result
    }

    async fn run_and_parse(&self) -> Result<HashMap<EntityId, Sample>, FetchError> {
        let stdout = run_command(&self.program, &self.args, self.cwd.as_deref()).await?;
        let now = epoch_secs();
        let samples = match self.output {
            CommandOutput::Availability => parse_availability(&stdout, now)?,
            CommandOutput::Quota => parse_quota(&stdout, now)?,
        };
        debug!(program = %self.program, entities = samples.len(), "command output parsed");
        Ok(samples)
    }
}

/// Browser-automation command that reveals the API token. The first
/// `sk-...` word it prints wins.
pub struct TokenCommand {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
}

impl TokenCommand {
    pub fn new(argv: &[String]) -> Result<Self, ConfigError> {
        let (program, args) = split_argv(argv)?;
        Ok(Self {
            program,
            args,
            cwd: None,
        })
    }

    pub fn with_cwd(mut self, cwd: Option<PathBuf>) -> Self {
        self.cwd = cwd;
        self
    }

    pub async fn fetch(&self, timeout: Duration) -> Result<String, FetchError> {
        let run = run_command(&self.program, &self.args, self.cwd.as_deref());
        let stdout = tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| FetchError::Timeout(timeout))??;
        API_TOKEN
            .as_ref()
            .and_then(|re| re.find(&stdout))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| FetchError::Upstream(format!("{} printed no token", self.program)))
    }
}

impl Fetcher for CommandFetcher {
    fn fetch<'a>(&'a self, entity_id: &'a str) -> BoxFuture<'a, Result<Sample, FetchError>> {
        Box::pin(async move {
            self.collect()
                .await?
                .remove(entity_id)
                .ok_or_else(|| FetchError::NotFound(entity_id.to_string()))
        })
    }

    fn fetch_many<'a>(
        &'a self,
        entity_ids: &'a [EntityId],
    ) -> BoxFuture<'a, Vec<(EntityId, Result<Sample, FetchError>)>> {
        Box::pin(async move {
            match self.collect().await {
                Ok(mut samples) => entity_ids
                    .iter()
                    .map(|id| {
                        let result = samples
                            .remove(id)
                            .ok_or_else(|| FetchError::NotFound(id.clone()));
                        (id.clone(), result)
                    })
                    .collect(),
                Err(e) => {
                    warn!(program = %self.program, error = %e, "fetch command failed");
                    entity_ids.iter().map(|id| (id.clone(), Err(e.clone()))).collect()
                }
            }
        })
    }
}

/// Find the first JSON list of `T` in output that may carry log lines,
/// including bracketed ones like `[scraper] launching`.
fn json_list<T: DeserializeOwned>(stdout: &str, what: &str) -> Result<Vec<T>, FetchError> {
    let mut last_err = None;
    for (start, _) in stdout.match_indices('[') {
        let mut stream = serde_json::Deserializer::from_str(&stdout[start..]).into_iter::<Vec<T>>();
        match stream.next() {
            Some(Ok(rows)) => return Ok(rows),
            Some(Err(e)) => last_err = Some(e.to_string()),
            None => {}
        }
    }
    let head: String = stdout.chars().take(200).collect();
    Err(FetchError::Upstream(match last_err {
        Some(e) => format!("invalid {what} list: {e}"),
        None => format!("no JSON list in output: {head}"),
    }))
}

/// Parse availability rows into one percent sample per normalized name.
pub fn parse_availability(stdout: &str, at: u64) -> Result<HashMap<EntityId, Sample>, FetchError> {
    let rows: Vec<ServiceRow> = json_list(stdout, "service")?;
    let services = normalize_services(
        rows.into_iter()
            .map(|r| (r.name, r.percent_24h.unwrap_or(0.0))),
    );
    Ok(services
        .into_iter()
        .map(|(name, pct)| {
            let sample = Sample::percent(name.clone(), pct, at);
            (name, sample)
        })
        .collect())
}

/// Parse quota card rows. Unparseable money cells are left out of the
/// sample, which the trust rules then judge.
pub fn parse_quota(stdout: &str, at: u64) -> Result<HashMap<EntityId, Sample>, FetchError> {
    let rows: Vec<QuotaRow> = json_list(stdout, "quota")?;
    Ok(rows
        .into_iter()
        .map(|row| {
            let name = row.name.trim().to_string();
            let mut sample = Sample::new(name.clone(), at);
            for (key, value) in [
                (field::TOTAL, &row.total),
                (field::USED, &row.used),
                (field::REMAINING, &row.remaining),
            ] {
                if let Some(v) = parse_money(value) {
                    sample = sample.with_field(key, v);
                }
            }
            (name, sample)
        })
        .collect())
}
