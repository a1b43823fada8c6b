//! Configuration types.
//!
//! Every section has a `Default` and a `from_env()` that overlays
//! environment variables on top of it.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};

/// Top-level configuration for the assistant.
#[derive(Debug, Clone)]
pub struct AssistConfig {
    pub llm: LlmConfig,
    pub pipeline: PipelineConfig,
    pub triage: TriageConfig,
    pub compose: ComposeConfig,
    pub memory: MemoryConfig,
    pub mailbox: MailboxConfig,
}

impl AssistConfig {
    /// Load the full configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            llm: llm_config_from_env()?,
            pipeline: PipelineConfig::from_env()?,
            triage: TriageConfig::from_env()?,
            compose: ComposeConfig::from_env()?,
            memory: MemoryConfig::from_env()?,
            mailbox: MailboxConfig::from_env()?,
        })
    }
}

/// Build the LLM config from `ASSIST_LLM_BACKEND`, the matching API key and
/// `ASSIST_MODEL`.
pub fn llm_config_from_env() -> Result<LlmConfig, ConfigError> {
    let backend = match std::env::var("ASSIST_LLM_BACKEND")
        .unwrap_or_else(|_| "anthropic".to_string())
        .to_lowercase()
        .as_str()
    {
        "anthropic" => LlmBackend::Anthropic,
        "openai" => LlmBackend::OpenAi,
        other => {
            return Err(ConfigError::InvalidValue {
                key: "ASSIST_LLM_BACKEND".into(),
                message: format!("unknown backend '{other}' (expected anthropic or openai)"),
            });
        }
    };

    let (key_var, default_model) = match backend {
        LlmBackend::Anthropic => ("ANTHROPIC_API_KEY", "claude-sonnet-4-20250514"),
        LlmBackend::OpenAi => ("OPENAI_API_KEY", "gpt-4o"),
    };
    let api_key =
        std::env::var(key_var).map_err(|_| ConfigError::MissingEnvVar(key_var.to_string()))?;
    let model = std::env::var("ASSIST_MODEL").unwrap_or_else(|_| default_model.to_string());

    Ok(LlmConfig {
        backend,
        api_key: SecretString::from(api_key),
        model,
    })
}

/// Batch orchestration settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum unread messages fetched per batch.
    pub max_batch_size: usize,
    /// Maximum in-flight LLM calls per stage.
    pub max_concurrency: usize,
    /// Timeout for a single LLM call.
    pub llm_timeout: Duration,
    /// Timeout for a single mail provider call.
    pub provider_timeout: Duration,
    /// Retries after a provider rate limit before giving up.
    pub max_rate_limit_retries: u32,
    /// First backoff delay; doubles on each retry.
    pub retry_base_delay: Duration,
    /// Upper bound on a single backoff delay.
    pub retry_max_delay: Duration,
    /// Use one batched triage call instead of one call per message.
    pub batch_classify: bool,
    /// Interval between batch runs in the host loop.
    pub poll_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 25,
            max_concurrency: 4,
            llm_timeout: Duration::from_secs(60),
            provider_timeout: Duration::from_secs(30),
            max_rate_limit_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
            batch_classify: false,
            poll_interval: Duration::from_secs(900), // 15 minutes
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            max_batch_size: env_or("ASSIST_MAX_BATCH_SIZE", d.max_batch_size)?,
            max_concurrency: env_or("ASSIST_MAX_CONCURRENCY", d.max_concurrency)?.max(1),
            llm_timeout: env_secs_or("ASSIST_LLM_TIMEOUT_SECS", d.llm_timeout)?,
            provider_timeout: env_secs_or("ASSIST_PROVIDER_TIMEOUT_SECS", d.provider_timeout)?,
            max_rate_limit_retries: env_or("ASSIST_RATE_LIMIT_RETRIES", d.max_rate_limit_retries)?,
            retry_base_delay: d.retry_base_delay,
            retry_max_delay: d.retry_max_delay,
            batch_classify: env_or("ASSIST_BATCH_CLASSIFY", d.batch_classify)?,
            poll_interval: env_secs_or("ASSIST_POLL_INTERVAL_SECS", d.poll_interval)?,
        })
    }
}

/// Triage settings.
#[derive(Debug, Clone, Default)]
pub struct TriageConfig {
    /// The user's own address; mail from it is never answered.
    pub user_address: Option<String>,
    /// Extra sender regexes that are always treated as automated.
    pub extra_ignore_senders: Vec<String>,
    /// Sender regexes that bypass the rule pre-filter.
    pub always_classify_senders: Vec<String>,
}

impl TriageConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            user_address: std::env::var("ASSIST_USER_ADDRESS").ok(),
            extra_ignore_senders: env_list("ASSIST_IGNORE_SENDERS"),
            always_classify_senders: env_list("ASSIST_ALWAYS_CLASSIFY_SENDERS"),
        })
    }
}

/// Draft composition settings.
#[derive(Debug, Clone)]
pub struct ComposeConfig {
    /// Name used in the sign-off.
    pub signature: String,
    /// Most recent thread turns included in the prompt.
    pub max_context_turns: usize,
    /// Character budget for the thread context in the prompt.
    pub max_context_chars: usize,
    /// Character budget for the message body in the prompt.
    pub max_body_chars: usize,
    /// Copy the other original recipients on the reply.
    pub reply_all: bool,
    /// The user's own address, excluded from reply-all.
    pub user_address: Option<String>,
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            signature: "Sent by your assistant".to_string(),
            max_context_turns: 6,
            max_context_chars: 4000,
            max_body_chars: 4000,
            reply_all: false,
            user_address: None,
        }
    }
}

impl ComposeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            signature: std::env::var("ASSIST_SIGNATURE").unwrap_or(d.signature),
            max_context_turns: env_or("ASSIST_MAX_CONTEXT_TURNS", d.max_context_turns)?,
            max_context_chars: env_or("ASSIST_MAX_CONTEXT_CHARS", d.max_context_chars)?,
            max_body_chars: d.max_body_chars,
            reply_all: env_or("ASSIST_REPLY_ALL", d.reply_all)?,
            user_address: std::env::var("ASSIST_USER_ADDRESS").ok(),
        })
    }
}

/// Conversation memory retention.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Turns kept per thread (oldest dropped first).
    pub max_turns_per_thread: usize,
    /// Threads kept in total (least recently active evicted first).
    pub max_threads: usize,
    /// Threads idle for longer than this are dropped by `prune_idle`.
    pub idle_ttl: Option<Duration>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_turns_per_thread: 50,
            max_threads: 1000,
            idle_ttl: Some(Duration::from_secs(7 * 24 * 3600)),
        }
    }
}

impl MemoryConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let idle_ttl = match std::env::var("ASSIST_MEMORY_TTL_SECS") {
            Ok(v) if v == "0" => None,
            Ok(v) => Some(Duration::from_secs(parse_value("ASSIST_MEMORY_TTL_SECS", &v)?)),
            Err(_) => d.idle_ttl,
        };
        Ok(Self {
            max_turns_per_thread: env_or("ASSIST_MEMORY_MAX_TURNS", d.max_turns_per_thread)?.max(1),
            max_threads: env_or("ASSIST_MEMORY_MAX_THREADS", d.max_threads)?.max(1),
            idle_ttl,
        })
    }
}

/// Which mailbox the host binary talks to.
#[derive(Debug, Clone)]
pub enum MailboxConfig {
    Gmail {
        access_token: SecretString,
        user_address: String,
    },
    Local {
        root: PathBuf,
        user_address: String,
    },
}

impl MailboxConfig {
    /// Gmail when `GMAIL_ACCESS_TOKEN` is set, otherwise a local directory
    /// from `ASSIST_MAILDIR`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let user_address = std::env::var("ASSIST_USER_ADDRESS")
            .unwrap_or_else(|_| "me@localhost".to_string());

        if let Ok(token) = std::env::var("GMAIL_ACCESS_TOKEN") {
            return Ok(Self::Gmail {
                access_token: SecretString::from(token),
                user_address,
            });
        }

        let root = std::env::var("ASSIST_MAILDIR").map_err(|_| ConfigError::MissingRequired {
            key: "GMAIL_ACCESS_TOKEN or ASSIST_MAILDIR".into(),
            hint: "Set a Gmail OAuth access token or point ASSIST_MAILDIR at a directory with an inbox/ folder of .eml files.".into(),
        })?;
        Ok(Self::Local {
            root: PathBuf::from(root),
            user_address,
        })
    }
}

// ── Env helpers ─────────────────────────────────────────────────────

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{raw}': {e}"),
    })
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

/// A whole number of seconds; zero is rejected because every duration
/// key is a timeout or a timer period.
fn secs_value(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    match parse_value::<u64>(key, raw)? {
        0 => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be at least 1 second".into(),
        }),
        secs => Ok(Duration::from_secs(secs)),
    }
}

fn env_secs_or(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => secs_value(key, &raw),
        Err(_) => Ok(default),
    }
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_defaults_are_bounded() {
        let config = PipelineConfig::default();
        assert!(config.max_concurrency >= 1);
        assert!(config.max_rate_limit_retries > 0);
        assert!(config.retry_base_delay < config.retry_max_delay);
    }

    #[test]
    fn memory_defaults_have_retention() {
        let config = MemoryConfig::default();
        assert_eq!(config.max_turns_per_thread, 50);
        assert!(config.idle_ttl.is_some());
    }

    #[test]
    fn parse_value_reports_key() {
        let err = parse_value::<usize>("ASSIST_MAX_BATCH_SIZE", "lots").unwrap_err();
        assert!(err.to_string().contains("ASSIST_MAX_BATCH_SIZE"));
    }

    #[test]
    fn zero_seconds_is_rejected() {
        let err = secs_value("ASSIST_POLL_INTERVAL_SECS", "0").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "ASSIST_POLL_INTERVAL_SECS"));
        assert!(secs_value("ASSIST_LLM_TIMEOUT_SECS", " 0 ").is_err());
        assert_eq!(
            secs_value("ASSIST_LLM_TIMEOUT_SECS", "45").unwrap(),
            Duration::from_secs(45)
        );
        assert!(secs_value("ASSIST_LLM_TIMEOUT_SECS", "-1").is_err());
    }

    #[test]
    fn parse_value_trims() {
        let v: u32 = parse_value("K", " 7 ").unwrap();
        assert_eq!(v, 7);
    }
}
