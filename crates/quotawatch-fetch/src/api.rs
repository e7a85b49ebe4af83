//! Balance API client.

use std::time::Duration;

use reqwest::Client;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use quotawatch_core::{BoxFuture, ConfigError, FetchError, Fetcher, Sample, epoch_secs, field};

use crate::command::TokenCommand;
use crate::money::parse_money;

const USER_AGENT: &str = concat!("quotawatch/", env!("CARGO_PKG_VERSION"));

const REMAINING_KEYS: &[&str] = &["remaining", "remaining_yen", "remain", "remain_yen"];
const TOTAL_KEYS: &[&str] = &["total_yen", "total", "total_amount"];
const USED_KEYS: &[&str] = &["used_yen", "used", "used_amount"];
/// Blocks scanned for a best-guess balance when no named key matches.
const GUESS_BLOCKS: &[&str] = &["summary", "stats", "balance", "limits"];

/// Fetches the token's balance. The endpoint reports a single balance, so
/// every requested entity receives the same reading.
pub struct QuotaApiFetcher {
    client: Client,
    url: String,
    token: String,
}

impl QuotaApiFetcher {
    pub fn new(url: impl Into<String>, token: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            token: token.into(),
        })
    }

    async fn get_payload(&self) -> Result<Value, FetchError> {
        let resp = self
            .client
            .get(&self.url)
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Network(format!("request timed out: {e}"))
                } else {
                    FetchError::Network(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Upstream(format!("HTTP {status}")));
        }
        resp.json::<Value>()
            .await
            .map_err(|e| FetchError::Upstream(format!("invalid JSON: {e}")))
    }
}

impl Fetcher for QuotaApiFetcher {
    fn fetch<'a>(&'a self, entity_id: &'a str) -> BoxFuture<'a, Result<Sample, FetchError>> {
        Box::pin(async move {
            let payload = self.get_payload().await?;
            let sample = extract_quota(entity_id, &payload, epoch_secs())?;
            debug!(entity = %entity_id, remaining = ?sample.field(field::REMAINING), "balance fetched");
            Ok(sample)
        })
    }
}

fn first_money(obj: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| obj.get(*k).and_then(parse_money))
}

/// Build a quota sample from an API payload.
///
/// The payload may be wrapped in a `data` envelope. `remaining` is looked
/// up in order: a `totals` block, top-level keys, a `credit` block, the
/// first positive money value in a summary-like block, and finally
/// `total - used`.
pub fn extract_quota(entity_id: &str, payload: &Value, at: u64) -> Result<Sample, FetchError> {
    let data = payload
        .get("data")
        .filter(|d| d.is_object())
        .unwrap_or(payload)
        .as_object()
        .ok_or_else(|| FetchError::Upstream("payload is not an object".to_string()))?;

    let totals = data.get("totals").and_then(Value::as_object);
    let credit = data.get("credit").and_then(Value::as_object);

    let total = totals
        .and_then(|t| first_money(t, TOTAL_KEYS))
        .or_else(|| first_money(data, TOTAL_KEYS));
    let used = totals
        .and_then(|t| first_money(t, USED_KEYS))
        .or_else(|| first_money(data, USED_KEYS));

    let remaining = totals
        .and_then(|t| first_money(t, REMAINING_KEYS))
        .or_else(|| first_money(data, REMAINING_KEYS))
        .or_else(|| credit.and_then(|c| first_money(c, &REMAINING_KEYS[..2])))
        .or_else(|| {
            GUESS_BLOCKS
                .iter()
                .filter_map(|k| data.get(*k).and_then(Value::as_object))
                .flat_map(|block| block.values())
                .filter_map(parse_money)
                .find(|v| *v > 0.0)
        })
        .or_else(|| match (total, used) {
            (Some(t), Some(u)) => Some((t - u).max(0.0)),
            _ => None,
        })
        .ok_or_else(|| FetchError::Upstream("no remaining balance in payload".to_string()))?;

    let mut sample = Sample::new(entity_id, at).with_field(field::REMAINING, remaining);
    if let Some(t) = total {
        sample = sample.with_field(field::TOTAL, t);
    }
    if let Some(u) = used {
        sample = sample.with_field(field::USED, u);
    }
    Ok(sample)
}

fn env_token(env_value: Option<&str>) -> Option<String> {
    env_value
        .map(str::trim)
        .filter(|v| v.starts_with("sk-"))
        .map(str::to_string)
}

/// Pick the API token: an environment value that looks like a key wins
/// over the configured one.
pub fn resolve_token(env_value: Option<&str>, configured: Option<&str>) -> Result<String, ConfigError> {
    if let Some(v) = env_token(env_value) {
        return Ok(v);
    }
    configured
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            ConfigError::Invalid("no API token: set the token env var (sk-...) or quota.token".to_string())
        })
}

/// Token lookup in order: the environment variable `env_var`, then the
/// token command when one is given, then the configured token.
pub async fn resolve_token_from_env(
    env_var: &str,
    command: Option<&TokenCommand>,
    timeout: Duration,
    configured: Option<&str>,
) -> Result<String, ConfigError> {
    let env_value = std::env::var(env_var).ok();
    if let Some(token) = env_token(env_value.as_deref()) {
        info!(env_var, "using API token from environment");
        return Ok(token);
    }
    if let Some(command) = command {
        match command.fetch(timeout).await {
            Ok(token) => {
                info!("using API token from token command");
                return Ok(token);
            }
            Err(e) => warn!(error = %e, "token command failed, using configured token"),
        }
    }
    resolve_token(None, configured)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn totals_block_with_envelope() {
        let payload = json!({
            "data": {"totals": {"total": "¥200.00", "used": "¥50.36", "remaining": "¥149.64"}}
        });
        let s = extract_quota("codex", &payload, 7).unwrap();
        assert_eq!(s.field(field::REMAINING), Some(149.64));
        assert_eq!(s.field(field::TOTAL), Some(200.0));
        assert_eq!(s.field(field::USED), Some(50.36));
        assert_eq!(s.observed_at, 7);
    }

    #[test]
    fn top_level_keys_without_envelope() {
        let payload = json!({"remaining_yen": 12.5, "total_yen": 20});
        let s = extract_quota("codex", &payload, 0).unwrap();
        assert_eq!(s.field(field::REMAINING), Some(12.5));
        assert_eq!(s.field(field::TOTAL), Some(20.0));
        assert_eq!(s.field(field::USED), None);
    }

    #[test]
    fn credit_block() {
        let payload = json!({"data": {"credit": {"remaining": "3.10"}}});
        let s = extract_quota("codex", &payload, 0).unwrap();
        assert_eq!(s.field(field::REMAINING), Some(3.1));
    }

    #[test]
    fn summary_guess_skips_zeroes() {
        let payload = json!({"summary": {"calls": 0, "left": "¥8.20"}});
        let s = extract_quota("codex", &payload, 0).unwrap();
        assert_eq!(s.field(field::REMAINING), Some(8.2));
    }

    #[test]
    fn computed_from_total_and_used() {
        let payload = json!({"data": {"total_amount": "100", "used_amount": "130"}});
        let s = extract_quota("codex", &payload, 0).unwrap();
        assert_eq!(s.field(field::REMAINING), Some(0.0));
    }

    #[test]
    fn unknown_shape_is_upstream_error() {
        let err = extract_quota("codex", &json!({"data": {"foo": "bar"}}), 0).unwrap_err();
        assert!(matches!(err, FetchError::Upstream(_)));
        let err = extract_quota("codex", &json!([1, 2]), 0).unwrap_err();
        assert!(matches!(err, FetchError::Upstream(_)));
    }

    #[test]
    fn env_token_needs_key_prefix() {
        assert_eq!(resolve_token(Some("sk-abc"), Some("sk-cfg")).unwrap(), "sk-abc");
        assert_eq!(resolve_token(Some("garbage"), Some("sk-cfg")).unwrap(), "sk-cfg");
        assert_eq!(resolve_token(None, Some(" sk-cfg\n")).unwrap(), "sk-cfg");
    }

    #[test]
    fn missing_token_is_config_error() {
        assert!(matches!(resolve_token(None, None), Err(ConfigError::Invalid(_))));
        assert!(resolve_token(Some(""), Some("  ")).is_err());
    }

    const UNSET_VAR: &str = "QUOTAWATCH_TEST_TOKEN_UNSET";

    #[cfg(unix)]
    #[tokio::test]
    async fn token_command_beats_configured() {
        let argv = vec!["sh".to_string(), "-c".to_string(), "echo revealed sk-Auto42".to_string()];
        let command = TokenCommand::new(&argv).unwrap();
        let token = resolve_token_from_env(UNSET_VAR, Some(&command), Duration::from_secs(5), Some("sk-cfg"))
            .await
            .unwrap();
        assert_eq!(token, "sk-Auto42");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_token_command_uses_configured() {
        let argv = vec!["sh".to_string(), "-c".to_string(), "exit 1".to_string()];
        let command = TokenCommand::new(&argv).unwrap();
        let token = resolve_token_from_env(UNSET_VAR, Some(&command), Duration::from_secs(5), Some("sk-cfg"))
            .await
            .unwrap();
        assert_eq!(token, "sk-cfg");
    }

    #[tokio::test]
    async fn no_source_is_config_error() {
        let err = resolve_token_from_env(UNSET_VAR, None, Duration::from_secs(5), None).await;
        assert!(err.is_err());
    }
}
