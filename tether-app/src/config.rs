//! Environment-backed runtime configuration for the `tether` binary.

use std::{env, path::PathBuf, time::Duration};

use tether_core::matrix::{ClientConfig, MatrixError, DEFAULT_REQUEST_TIMEOUT, DEFAULT_SYNC_TIMEOUT};
use thiserror::Error;

const DEFAULT_HOMESERVER: &str = "http://localhost:8448";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value for {key} ({value:?}): {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Client(#[from] MatrixError),
}

#[derive(Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub homeserver: String,
    pub username: String,
    pub password: String,
    pub settings_path: PathBuf,
    /// Try to register the account before logging in.
    pub register: bool,
    pub allow_insecure_connections: bool,
    pub sync_timeout: Duration,
    pub request_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let homeserver = optional_trimmed("TETHER_HOMESERVER", &mut lookup)
            .unwrap_or_else(|| DEFAULT_HOMESERVER.to_owned());
        let username =
            optional_trimmed("TETHER_USER", &mut lookup).ok_or(ConfigError::Missing("TETHER_USER"))?;
        // Passwords may legitimately carry surrounding whitespace.
        let password = lookup("TETHER_PASSWORD")
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing("TETHER_PASSWORD"))?;

        let settings_path = optional_trimmed("TETHER_SETTINGS", &mut lookup)
            .map(PathBuf::from)
            .unwrap_or_else(|| default_settings_path(&username));

        let register = parse_flag("TETHER_REGISTER", &mut lookup)?;
        let allow_insecure_connections =
            parse_flag("TETHER_ALLOW_INSECURE_CONNECTIONS", &mut lookup)?;

        let sync_timeout = parse_millis("TETHER_SYNC_TIMEOUT_MS", DEFAULT_SYNC_TIMEOUT, &mut lookup)?;
        let request_timeout =
            parse_millis("TETHER_REQUEST_TIMEOUT_MS", DEFAULT_REQUEST_TIMEOUT, &mut lookup)?;

        if request_timeout <= sync_timeout {
            return Err(ConfigError::InvalidValue {
                key: "TETHER_REQUEST_TIMEOUT_MS",
                value: request_timeout.as_millis().to_string(),
                reason: "must exceed the sync timeout".to_owned(),
            });
        }

        Ok(Self {
            homeserver,
            username,
            password,
            settings_path,
            register,
            allow_insecure_connections,
            sync_timeout,
            request_timeout,
        })
    }

    pub fn client_config(&self) -> Result<ClientConfig, ConfigError> {
        Ok(ClientConfig::new(&self.homeserver)?
            .allow_insecure_connections(self.allow_insecure_connections)
            .request_timeout(self.request_timeout)
            .sync_timeout(self.sync_timeout))
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("homeserver", &self.homeserver)
            .field("username", &self.username)
            .field("settings_path", &self.settings_path)
            .field("register", &self.register)
            .field("allow_insecure_connections", &self.allow_insecure_connections)
            .field("sync_timeout", &self.sync_timeout)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

fn default_settings_path(username: &str) -> PathBuf {
    let safe: String = username
        .trim_start_matches('@')
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect();
    env::temp_dir().join(format!("tether-{safe}.json"))
}

fn optional_trimmed<F>(key: &str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

fn parse_flag<F>(key: &'static str, lookup: &mut F) -> Result<bool, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(raw) = optional_trimmed(key, lookup) else {
        return Ok(false);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: raw,
            reason: "expected true or false".to_owned(),
        }),
    }
}

fn parse_millis<F>(key: &'static str, default: Duration, lookup: &mut F) -> Result<Duration, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(raw) = optional_trimmed(key, lookup) else {
        return Ok(default);
    };
    raw.parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| ConfigError::InvalidValue {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        })
}
