use std::fmt;
use std::time::Duration;

use anyhow::Context;

use crate::backend::{DEFAULT_RETRY_STATUSES, RetryPolicy};
use crate::dircache::paths;
use crate::pacer::{DEFAULT_DECAY_CONSTANT, PacerConfig};

const DEFAULT_MIN_SLEEP_MS: u64 = 10;
const DEFAULT_MAX_SLEEP_MS: u64 = 5 * 60 * 1000;

#[derive(Clone)]
pub struct DriverConfig {
    /// API endpoint override; `None` uses the public OpenDRIVE endpoint.
    pub endpoint: Option<String>,
    pub username: String,
    /// Taken from the environment when set, otherwise from the keyring.
    pub password: Option<String>,
    /// Remote directory every logical path is relative to.
    pub root: String,
    pub create_root: bool,
    pub pacer: PacerConfig,
    pub max_depth: Option<u32>,
    pub retry_policy: RetryPolicy,
}

impl fmt::Debug for DriverConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverConfig")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("root", &self.root)
            .field("create_root", &self.create_root)
            .field("pacer", &self.pacer)
            .field("max_depth", &self.max_depth)
            .field("retry_policy", &self.retry_policy)
            .finish()
    }
}

impl DriverConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let username = lookup("OPENDRIVE_USERNAME")
            .filter(|value| !value.trim().is_empty())
            .context("OPENDRIVE_USERNAME is not set")?;
        let endpoint = lookup("OPENDRIVE_ENDPOINT").filter(|value| !value.trim().is_empty());
        let password = lookup("OPENDRIVE_PASSWORD").filter(|value| !value.is_empty());
        let root = paths::normalize(&lookup("OPENDRIVE_ROOT").unwrap_or_default())
            .context("invalid OPENDRIVE_ROOT")?;
        let create_root = read_bool(&lookup, "OPENDRIVE_CREATE_ROOT", false);

        let pacer = PacerConfig {
            min_sleep: Duration::from_millis(read_u64(
                &lookup,
                "OPENDRIVE_MIN_SLEEP_MS",
                DEFAULT_MIN_SLEEP_MS,
            )),
            max_sleep: Duration::from_millis(read_u64(
                &lookup,
                "OPENDRIVE_MAX_SLEEP_MS",
                DEFAULT_MAX_SLEEP_MS,
            )),
            decay_constant: read_u64(
                &lookup,
                "OPENDRIVE_DECAY_CONSTANT",
                u64::from(DEFAULT_DECAY_CONSTANT),
            )
            .try_into()
            .unwrap_or(DEFAULT_DECAY_CONSTANT),
        }
        .normalized();

        let max_depth = match lookup("OPENDRIVE_MAX_DEPTH") {
            Some(value) => parse_depth(&value)?,
            None => None,
        };
        let retry_policy = match lookup("OPENDRIVE_RETRY_STATUSES") {
            Some(value) => RetryPolicy::with_statuses(parse_statuses(&value)?),
            None => RetryPolicy::with_statuses(DEFAULT_RETRY_STATUSES),
        };

        Ok(Self {
            endpoint,
            username,
            password,
            root,
            create_root,
            pacer,
            max_depth,
            retry_policy,
        })
    }
}

/// Negative depths mean unbounded.
pub fn parse_depth(value: &str) -> anyhow::Result<Option<u32>> {
    let depth: i64 = value
        .trim()
        .parse()
        .with_context(|| format!("invalid depth: {value}"))?;
    if depth < 0 {
        return Ok(None);
    }
    let depth = u32::try_from(depth).with_context(|| format!("depth out of range: {value}"))?;
    Ok(Some(depth))
}

fn parse_statuses(value: &str) -> anyhow::Result<Vec<u16>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|status| !status.is_empty())
        .map(|status| {
            status
                .parse::<u16>()
                .ok()
                .filter(|code| (100..600).contains(code))
                .with_context(|| format!("invalid HTTP status in OPENDRIVE_RETRY_STATUSES: {status}"))
        })
        .collect()
}

fn read_u64<F>(lookup: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool<F>(lookup: &F, name: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<DriverConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        DriverConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_only_the_username_is_set() {
        let config = config(&[("OPENDRIVE_USERNAME", "alice")]).unwrap();

        assert_eq!(config.username, "alice");
        assert_eq!(config.endpoint, None);
        assert_eq!(config.password, None);
        assert_eq!(config.root, "");
        assert!(!config.create_root);
        assert_eq!(config.pacer, PacerConfig::default());
        assert_eq!(config.max_depth, None);
        assert_eq!(config.retry_policy, RetryPolicy::default());
    }

    #[test]
    fn debug_output_hides_the_password() {
        let config = config(&[
            ("OPENDRIVE_USERNAME", "alice"),
            ("OPENDRIVE_PASSWORD", "hunter2"),
        ])
        .unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn username_is_required() {
        let err = config(&[("OPENDRIVE_PASSWORD", "secret")]).unwrap_err();
        assert!(err.to_string().contains("OPENDRIVE_USERNAME"));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config(&[
            ("OPENDRIVE_USERNAME", "alice"),
            ("OPENDRIVE_ENDPOINT", "http://127.0.0.1:9000/api/v1"),
            ("OPENDRIVE_ROOT", "/backups/laptop/"),
            ("OPENDRIVE_CREATE_ROOT", "yes"),
            ("OPENDRIVE_MIN_SLEEP_MS", "50"),
            ("OPENDRIVE_MAX_SLEEP_MS", "2000"),
            ("OPENDRIVE_DECAY_CONSTANT", "3"),
            ("OPENDRIVE_MAX_DEPTH", "2"),
            ("OPENDRIVE_RETRY_STATUSES", "429, 503"),
        ])
        .unwrap();

        assert_eq!(config.endpoint.as_deref(), Some("http://127.0.0.1:9000/api/v1"));
        assert_eq!(config.root, "backups/laptop");
        assert!(config.create_root);
        assert_eq!(config.pacer.min_sleep, Duration::from_millis(50));
        assert_eq!(config.pacer.max_sleep, Duration::from_secs(2));
        assert_eq!(config.pacer.decay_constant, 3);
        assert_eq!(config.max_depth, Some(2));
        assert_eq!(config.retry_policy.statuses().collect::<Vec<_>>(), [429, 503]);
    }

    #[test]
    fn negative_depth_is_unbounded() {
        let config = config(&[("OPENDRIVE_USERNAME", "alice"), ("OPENDRIVE_MAX_DEPTH", "-1")])
            .unwrap();
        assert_eq!(config.max_depth, None);
        assert_eq!(parse_depth("0").unwrap(), Some(0));
        assert!(parse_depth("deep").is_err());
    }

    #[test]
    fn unparsable_numbers_fall_back_to_defaults() {
        let config = config(&[
            ("OPENDRIVE_USERNAME", "alice"),
            ("OPENDRIVE_MIN_SLEEP_MS", "soon"),
            ("OPENDRIVE_DECAY_CONSTANT", "0"),
        ])
        .unwrap();
        assert_eq!(config.pacer.min_sleep, Duration::from_millis(10));
        assert_eq!(config.pacer.decay_constant, 1);
    }

    #[test]
    fn bad_retry_statuses_are_rejected() {
        let err = config(&[
            ("OPENDRIVE_USERNAME", "alice"),
            ("OPENDRIVE_RETRY_STATUSES", "429,teapot"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("teapot"));
    }

    #[test]
    fn parent_segments_in_the_root_are_rejected() {
        assert!(config(&[("OPENDRIVE_USERNAME", "alice"), ("OPENDRIVE_ROOT", "a/../b")]).is_err());
    }
}
