//! Environment-backed configuration for `tgterm`.

use std::{env, error::Error, fmt, time::Duration};

use sync_core::{EngineConfig, RequestTimeouts, UserId};
use sync_runtime::SyncRuntimeConfig;

const DEFAULT_PAGE_SIZE: usize = 50;
const DEFAULT_SEND_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_BACKFILL_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_INGRESS_CAPACITY: usize = 4_096;
const DEFAULT_TIMELINE_ROWS: usize = 100;
const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct TermConfig {
    /// Backend executable speaking newline-delimited JSON on stdio.
    pub backend_cmd: String,
    pub backend_args: Vec<String>,
    pub page_size: usize,
    /// Timeout of sends, edits, deletes and read markers.
    pub send_timeout: Duration,
    /// Timeout of history pages and chat list loads.
    pub backfill_timeout: Duration,
    pub ingress_capacity: usize,
    pub timeline_rows: usize,
    /// Panic on engine defects instead of reporting them.
    pub strict: bool,
    /// Account id used as the sender of optimistic messages.
    pub own_user_id: UserId,
}

impl TermConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let backend_cmd = optional_trimmed_env("TGTERM_BACKEND_CMD", &mut lookup)
            .ok_or(ConfigError::Missing {
                key: "TGTERM_BACKEND_CMD",
            })?;
        let backend_args = optional_trimmed_env("TGTERM_BACKEND_ARGS", &mut lookup)
            .map(|args| args.split_whitespace().map(str::to_owned).collect())
            .unwrap_or_default();

        let page_size = parse_or("TGTERM_PAGE_SIZE", DEFAULT_PAGE_SIZE, &mut lookup)?;
        let send_timeout_ms =
            parse_or("TGTERM_SEND_TIMEOUT_MS", DEFAULT_SEND_TIMEOUT_MS, &mut lookup)?;
        let backfill_timeout_ms = parse_or(
            "TGTERM_BACKFILL_TIMEOUT_MS",
            DEFAULT_BACKFILL_TIMEOUT_MS,
            &mut lookup,
        )?;
        let ingress_capacity = parse_or(
            "TGTERM_INGRESS_CAPACITY",
            DEFAULT_INGRESS_CAPACITY,
            &mut lookup,
        )?;
        let timeline_rows = parse_or("TGTERM_TIMELINE_ROWS", DEFAULT_TIMELINE_ROWS, &mut lookup)?;
        let strict = parse_flag("TGTERM_STRICT", &mut lookup)?;
        let own_user_id = UserId(parse_or("TGTERM_USER_ID", 0_i64, &mut lookup)?);

        if !(1..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(ConfigError::InvalidValue {
                key: "TGTERM_PAGE_SIZE",
                value: page_size.to_string(),
                reason: format!("must be between 1 and {MAX_PAGE_SIZE}"),
            });
        }
        for (key, value) in [
            ("TGTERM_SEND_TIMEOUT_MS", send_timeout_ms),
            ("TGTERM_BACKFILL_TIMEOUT_MS", backfill_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key,
                    value: "0".to_owned(),
                    reason: "must be at least 1".to_owned(),
                });
            }
        }
        if ingress_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TGTERM_INGRESS_CAPACITY",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(Self {
            backend_cmd,
            backend_args,
            page_size,
            send_timeout: Duration::from_millis(send_timeout_ms),
            backfill_timeout: Duration::from_millis(backfill_timeout_ms),
            ingress_capacity,
            timeline_rows,
            strict,
            own_user_id,
        })
    }

    pub fn runtime_config(&self) -> SyncRuntimeConfig {
        SyncRuntimeConfig {
            engine: EngineConfig {
                timeouts: RequestTimeouts {
                    interactive: self.send_timeout,
                    backfill: self.backfill_timeout,
                },
                ingress_capacity: self.ingress_capacity,
                page_size: self.page_size,
                timeline_rows: self.timeline_rows,
                own_user_id: self.own_user_id,
                panic_on_defect: self.strict,
                ..EngineConfig::default()
            },
            ..SyncRuntimeConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is unset or blank.
    Missing { key: &'static str },
    /// A variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing { key } => write!(f, "{key} must be set"),
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_or<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value.parse::<T>().map_err(|err| ConfigError::InvalidValue {
        key,
        value,
        reason: err.to_string(),
    })
}

fn parse_flag<F>(key: &'static str, lookup: &mut F) -> Result<bool, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(false);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "expected true or false".to_owned(),
        }),
    }
}
