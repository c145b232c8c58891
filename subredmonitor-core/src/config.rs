//! Configuration file model, validation and credential resolution.
//!
//! The file is read once at startup. Every problem found here is fatal: the
//! process refuses to start rather than run with a partial configuration.

use crate::error::ConfigError;
use crate::retry::RetryConfig;
use crate::rules::{MatchRule, TextField};
use crate::types::{
    BackendSpec, NotificationTarget, RedditCredentials, Secret, WatchTarget,
};
use regex::RegexBuilder;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_USER_AGENT: &str = "subredmonitor v0.1";
pub const DEFAULT_REDIS_URL: &str = "redis://redis:6379";

const MAX_PAGE_SIZE: u32 = 100;
const RECOMMENDED_MIN_TTL: Duration = Duration::from_secs(24 * 3600);
const MAX_DEDUP_TTL: Duration = Duration::from_secs(365 * 24 * 3600);
/// Upper bound for poll intervals, cycle budgets and retry delays.
pub const MAX_INTERVAL: Duration = Duration::from_secs(7 * 24 * 3600);
/// Pushover's emergency priority needs retry/expire parameters this
/// notifier does not send.
const PUSHOVER_MAX_PRIORITY: i8 = 1;

/// Source of environment variables, injectable for tests.
pub trait EnvSource {
    fn var(&self, name: &str) -> Option<String>;
}

pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub reddit: RedditSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub notifiers: BTreeMap<String, NotifierSection>,
    #[serde(default, rename = "watch")]
    pub watches: Vec<WatchSection>,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RedditSection {
    pub user_agent: String,
    pub api_base: String,
    pub token_url: String,
    pub page_size: u32,
    pub page_limit: u32,
    pub cycle_budget_secs: u64,
    pub backoff: RetrySection,
}

impl Default for RedditSection {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            api_base: "https://oauth.reddit.com".to_string(),
            token_url: "https://www.reddit.com/api/v1/access_token".to_string(),
            page_size: MAX_PAGE_SIZE,
            page_limit: 3,
            cycle_budget_secs: 120,
            backoff: RetrySection::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Redis,
    Memory,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSection {
    pub backend: StoreBackend,
    pub url: String,
    pub key_prefix: String,
    pub dedup_ttl_secs: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Redis,
            url: DEFAULT_REDIS_URL.to_string(),
            key_prefix: "subredmonitor".to_string(),
            dedup_ttl_secs: 7 * 24 * 3600,
        }
    }
}

/// A retry or backoff table. Fields left out keep the preset of the
/// section the table belongs to.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub jitter_factor: Option<f64>,
}

impl RetrySection {
    pub fn resolve(self, preset: RetryConfig, field: &str) -> Result<RetryConfig, ConfigError> {
        let config = RetryConfig {
            max_attempts: self.max_attempts.unwrap_or(preset.max_attempts),
            base_delay_ms: self.base_delay_ms.unwrap_or(preset.base_delay_ms),
            max_delay_ms: self.max_delay_ms.unwrap_or(preset.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier.unwrap_or(preset.backoff_multiplier),
            jitter_factor: self.jitter_factor.unwrap_or(preset.jitter_factor),
        };

        let invalid = |name: &str, value: String| ConfigError::InvalidValue {
            field: format!("{}.{}", field, name),
            value,
        };
        if config.max_attempts == 0 {
            return Err(invalid("max_attempts", "0".to_string()));
        }
        if config.max_delay_ms > MAX_INTERVAL.as_millis() as u64 {
            return Err(invalid("max_delay_ms", config.max_delay_ms.to_string()));
        }
        if config.base_delay_ms > config.max_delay_ms {
            return Err(invalid("base_delay_ms", config.base_delay_ms.to_string()));
        }
        if !(config.backoff_multiplier.is_finite() && config.backoff_multiplier >= 1.0) {
            return Err(invalid(
                "backoff_multiplier",
                config.backoff_multiplier.to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&config.jitter_factor) {
            return Err(invalid("jitter_factor", config.jitter_factor.to_string()));
        }
        Ok(config)
    }
}

fn default_true() -> bool {
    true
}

fn default_prowl_key_env() -> String {
    "PROWL_API_KEY".to_string()
}

fn default_pushover_token_env() -> String {
    "PUSHOVER_TOKEN".to_string()
}

fn default_pushover_user_env() -> String {
    "PUSHOVER_USER".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotifierSection {
    Prowl {
        #[serde(default = "default_prowl_key_env")]
        api_key_env: String,
        #[serde(default)]
        priority: i8,
        #[serde(default)]
        retry: RetrySection,
        #[serde(default = "default_true")]
        verify_on_startup: bool,
    },
    Pushover {
        #[serde(default = "default_pushover_token_env")]
        token_env: String,
        #[serde(default = "default_pushover_user_env")]
        user_env: String,
        #[serde(default)]
        priority: i8,
        #[serde(default)]
        device: Option<String>,
        #[serde(default)]
        retry: RetrySection,
        #[serde(default = "default_true")]
        verify_on_startup: bool,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SubredditSpec {
    One(String),
    Many(Vec<String>),
}

fn default_poll_interval() -> u64 {
    60
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatchSection {
    #[serde(default)]
    pub name: Option<String>,
    pub subreddit: SubredditSpec,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Notifier names. Omitted means every configured notifier.
    #[serde(default)]
    pub notify: Option<Vec<String>>,
    #[serde(default)]
    pub rules: Vec<RuleSection>,
    #[serde(default)]
    pub error_backoff: RetrySection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleSection {
    Keyword {
        value: String,
        #[serde(default)]
        field: TextField,
    },
    Flair {
        value: String,
    },
    ScoreAtLeast {
        value: i64,
    },
    Author {
        value: String,
    },
    Pattern {
        value: String,
    },
    SelfPost,
    All {
        rules: Vec<RuleSection>,
    },
}

impl RuleSection {
    pub fn compile(&self) -> Result<MatchRule, ConfigError> {
        match self {
            RuleSection::Keyword { value, field } => {
                if value.trim().is_empty() {
                    return Err(ConfigError::InvalidValue {
                        field: "rules.keyword.value".to_string(),
                        value: value.clone(),
                    });
                }
                Ok(MatchRule::keyword(value, *field))
            }
            RuleSection::Flair { value } => Ok(MatchRule::FlairEquals(value.clone())),
            RuleSection::ScoreAtLeast { value } => Ok(MatchRule::ScoreAtLeast(*value)),
            RuleSection::Author { value } => Ok(MatchRule::author(value)),
            RuleSection::Pattern { value } => RegexBuilder::new(value)
                .case_insensitive(true)
                .build()
                .map(MatchRule::PatternMatch)
                .map_err(|e| ConfigError::InvalidPattern {
                    pattern: value.clone(),
                    reason: e.to_string(),
                }),
            RuleSection::SelfPost => Ok(MatchRule::SelfPost),
            RuleSection::All { rules } => {
                if rules.is_empty() {
                    return Err(ConfigError::ValidationFailed {
                        reason: "an `all` rule group needs at least one rule".to_string(),
                    });
                }
                rules
                    .iter()
                    .map(RuleSection::compile)
                    .collect::<Result<Vec<_>, _>>()
                    .map(MatchRule::All)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedditSettings {
    pub user_agent: String,
    pub api_base: String,
    pub token_url: String,
    pub page_size: u32,
    pub page_limit: u32,
    pub cycle_budget: Duration,
    pub backoff: RetryConfig,
    pub credentials: RedditCredentials,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub url: String,
    pub key_prefix: String,
    pub dedup_ttl: Duration,
}

/// Validated, credential-resolved configuration. Read-only after startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub reddit: RedditSettings,
    pub store: StoreSettings,
    pub notification_targets: Vec<NotificationTarget>,
    pub watch_targets: Vec<WatchTarget>,
}

impl FileConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Validate the file and resolve every credential from `env`.
    pub fn into_settings(self, env: &dyn EnvSource) -> Result<Settings, ConfigError> {
        let reddit = resolve_reddit(self.reddit, env)?;
        let store = resolve_store(self.store, env)?;

        let mut notification_targets = Vec::with_capacity(self.notifiers.len());
        for (name, section) in self.notifiers {
            notification_targets.push(resolve_notifier(name, section, env)?);
        }
        let known: HashSet<&str> = notification_targets
            .iter()
            .map(|t| t.name.as_str())
            .collect();

        if self.watches.is_empty() {
            return Err(ConfigError::MissingField {
                field: "watch".to_string(),
            });
        }

        let mut watch_targets = Vec::with_capacity(self.watches.len());
        let mut names = HashSet::new();
        for section in self.watches {
            let target = build_watch_target(section, &known)?;
            if !names.insert(target.name.clone()) {
                return Err(ConfigError::ValidationFailed {
                    reason: format!("duplicate watch target name {:?}", target.name),
                });
            }
            watch_targets.push(target);
        }

        info!(
            "Loaded {} watch targets and {} notification targets",
            watch_targets.len(),
            notification_targets.len()
        );

        Ok(Settings {
            reddit,
            store,
            notification_targets,
            watch_targets,
        })
    }
}

impl Settings {
    pub fn load(path: &Path, env: &dyn EnvSource) -> Result<Self, ConfigError> {
        FileConfig::from_path(path)?.into_settings(env)
    }

    pub fn notification_target(&self, name: &str) -> Option<&NotificationTarget> {
        self.notification_targets.iter().find(|t| t.name == name)
    }
}

fn required_env(env: &dyn EnvSource, var_name: &str) -> Result<String, ConfigError> {
    env.var(var_name)
        .ok_or_else(|| ConfigError::MissingEnvironmentVariable {
            var_name: var_name.to_string(),
        })
}

fn resolve_reddit(section: RedditSection, env: &dyn EnvSource) -> Result<RedditSettings, ConfigError> {
    if section.page_size == 0 || section.page_size > MAX_PAGE_SIZE {
        return Err(ConfigError::InvalidValue {
            field: "reddit.page_size".to_string(),
            value: section.page_size.to_string(),
        });
    }
    if section.page_limit == 0 {
        return Err(ConfigError::InvalidValue {
            field: "reddit.page_limit".to_string(),
            value: section.page_limit.to_string(),
        });
    }
    if section.cycle_budget_secs == 0 || section.cycle_budget_secs > MAX_INTERVAL.as_secs() {
        return Err(ConfigError::InvalidValue {
            field: "reddit.cycle_budget_secs".to_string(),
            value: section.cycle_budget_secs.to_string(),
        });
    }
    if section.user_agent.trim().is_empty() {
        return Err(ConfigError::MissingField {
            field: "reddit.user_agent".to_string(),
        });
    }

    let backoff = section
        .backoff
        .resolve(RetryConfig::reddit(), "reddit.backoff")?;

    let credentials = RedditCredentials {
        client_id: required_env(env, "REDDIT_CLIENT_ID")?,
        client_secret: Secret::new(required_env(env, "REDDIT_CLIENT_SECRET")?),
        username: required_env(env, "REDDIT_USERNAME")?,
        password: Secret::new(required_env(env, "REDDIT_PASSWORD")?),
    };

    Ok(RedditSettings {
        user_agent: section.user_agent,
        api_base: section.api_base,
        token_url: section.token_url,
        page_size: section.page_size,
        page_limit: section.page_limit,
        cycle_budget: Duration::from_secs(section.cycle_budget_secs),
        backoff,
        credentials,
    })
}

fn resolve_store(section: StoreSection, env: &dyn EnvSource) -> Result<StoreSettings, ConfigError> {
    if section.dedup_ttl_secs == 0 || section.dedup_ttl_secs > MAX_DEDUP_TTL.as_secs() {
        return Err(ConfigError::InvalidValue {
            field: "store.dedup_ttl_secs".to_string(),
            value: section.dedup_ttl_secs.to_string(),
        });
    }
    let dedup_ttl = Duration::from_secs(section.dedup_ttl_secs);
    if dedup_ttl < RECOMMENDED_MIN_TTL {
        warn!(
            "store.dedup_ttl_secs = {} is short; reappearing items may alert twice",
            section.dedup_ttl_secs
        );
    }
    if section.key_prefix.is_empty() || section.key_prefix.contains(char::is_whitespace) {
        return Err(ConfigError::InvalidValue {
            field: "store.key_prefix".to_string(),
            value: section.key_prefix,
        });
    }

    Ok(StoreSettings {
        backend: section.backend,
        url: env.var("REDIS_URL").unwrap_or(section.url),
        key_prefix: section.key_prefix,
        dedup_ttl,
    })
}

fn resolve_notifier(
    name: String,
    section: NotifierSection,
    env: &dyn EnvSource,
) -> Result<NotificationTarget, ConfigError> {
    let (backend, retry, verify_on_startup) = match section {
        NotifierSection::Prowl {
            api_key_env,
            priority,
            retry,
            verify_on_startup,
        } => (
            BackendSpec::Prowl {
                api_key: Secret::new(required_env(env, &api_key_env)?),
                priority: validate_priority(&name, priority, 2)?,
            },
            retry,
            verify_on_startup,
        ),
        NotifierSection::Pushover {
            token_env,
            user_env,
            priority,
            device,
            retry,
            verify_on_startup,
        } => (
            BackendSpec::Pushover {
                app_token: Secret::new(required_env(env, &token_env)?),
                user_key: Secret::new(required_env(env, &user_env)?),
                priority: validate_priority(&name, priority, PUSHOVER_MAX_PRIORITY)?,
                device,
            },
            retry,
            verify_on_startup,
        ),
    };

    let retry = retry.resolve(RetryConfig::default(), &format!("notifiers.{}.retry", name))?;

    Ok(NotificationTarget {
        name,
        backend,
        retry,
        verify_on_startup,
    })
}

/// Both supported backends use a scale starting at -2.
fn validate_priority(name: &str, priority: i8, max: i8) -> Result<i8, ConfigError> {
    if (-2..=max).contains(&priority) {
        Ok(priority)
    } else {
        Err(ConfigError::InvalidValue {
            field: format!("notifiers.{}.priority", name),
            value: priority.to_string(),
        })
    }
}

fn normalize_subreddit(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim();
    let name = trimmed
        .strip_prefix("/r/")
        .or_else(|| trimmed.strip_prefix("r/"))
        .unwrap_or(trimmed);
    let valid = (2..=21).contains(&name.len())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name.to_string())
    } else {
        Err(ConfigError::InvalidValue {
            field: "watch.subreddit".to_string(),
            value: raw.to_string(),
        })
    }
}

fn build_watch_target(
    section: WatchSection,
    known_notifiers: &HashSet<&str>,
) -> Result<WatchTarget, ConfigError> {
    let parts: Vec<String> = match &section.subreddit {
        SubredditSpec::One(joined) => joined.split('+').map(str::to_string).collect(),
        SubredditSpec::Many(list) => list.clone(),
    };
    if parts.is_empty() {
        return Err(ConfigError::MissingField {
            field: "watch.subreddit".to_string(),
        });
    }
    let subreddit = parts
        .iter()
        .map(|p| normalize_subreddit(p))
        .collect::<Result<Vec<_>, _>>()?
        .join("+");

    let name = section
        .name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| subreddit.to_lowercase());

    if section.poll_interval_secs == 0 || section.poll_interval_secs > MAX_INTERVAL.as_secs() {
        return Err(ConfigError::InvalidValue {
            field: format!("watch.{}.poll_interval_secs", name),
            value: section.poll_interval_secs.to_string(),
        });
    }
    let error_backoff = section
        .error_backoff
        .resolve(RetryConfig::error_backoff(), &format!("watch.{}.error_backoff", name))?;

    let notify = match section.notify {
        Some(list) => {
            for notifier in &list {
                if !known_notifiers.contains(notifier.as_str()) {
                    return Err(ConfigError::ValidationFailed {
                        reason: format!(
                            "watch target {:?} references unknown notifier {:?}",
                            name, notifier
                        ),
                    });
                }
            }
            list
        }
        None => {
            let mut all: Vec<String> = known_notifiers.iter().map(|n| n.to_string()).collect();
            all.sort();
            all
        }
    };
    if notify.is_empty() {
        warn!("Watch target {} has no notification targets; hits are only logged", name);
    }

    let rules = section
        .rules
        .iter()
        .map(RuleSection::compile)
        .collect::<Result<Vec<_>, _>>()?;
    if rules.is_empty() {
        warn!("Watch target {} has no rules and will never match", name);
    }

    Ok(WatchTarget {
        name,
        subreddit,
        rules,
        notify,
        poll_interval: Duration::from_secs(section.poll_interval_secs),
        error_backoff,
    })
}
