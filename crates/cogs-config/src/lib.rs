//! Profile configuration for Cogswell Pub/Sub tools.
//!
//! TOML profiles, project-key resolution (env var, keyring, plaintext)
//! and translation to `cogs_core::ConnectionOptions`. The CLI puts its
//! flag overrides on top of this.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use cogs_core::ConnectionOptions;
use cogs_core::config::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_URL};

/// Keyring service name; entries are keyed `<profile>/keys`.
pub const KEYRING_SERVICE: &str = "cogs";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("profile '{name}' not found")]
    UnknownProfile { name: String },

    #[error("no project keys configured for profile '{profile}'")]
    NoKeys { profile: String },

    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// Profile used when none is named on the command line.
    pub default_profile: Option<String>,

    #[serde(default)]
    pub defaults: Defaults,

    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: HashMap::new(),
        }
    }
}

/// Settings a profile inherits unless it overrides them.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default = "default_url")]
    pub url: String,

    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            url: default_url(),
            auto_reconnect: default_auto_reconnect(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

fn default_url() -> String {
    DEFAULT_URL.into()
}
fn default_auto_reconnect() -> bool {
    true
}
fn default_connect_timeout_ms() -> u64 {
    u64::try_from(DEFAULT_CONNECT_TIMEOUT.as_millis()).unwrap_or(30_000)
}

/// A named project profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Profile {
    /// Override the Pub/Sub endpoint.
    pub url: Option<String>,

    /// Project keys in plaintext. Prefer the keyring or `keys_env`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<String>,

    /// Environment variable holding comma-separated project keys.
    pub keys_env: Option<String>,

    pub auto_reconnect: Option<bool>,

    pub connect_timeout_ms: Option<u64>,

    /// Session to resume on connect.
    pub session_uuid: Option<Uuid>,
}

impl Config {
    /// Name of the profile to use: the override if given, else the
    /// configured default, else `"default"`.
    pub fn profile_name(&self, requested: Option<&str>) -> String {
        requested
            .map(str::to_owned)
            .or_else(|| self.default_profile.clone())
            .unwrap_or_else(|| "default".into())
    }

    pub fn profile(&self, name: &str) -> Result<&Profile, ConfigError> {
        self.profiles
            .get(name)
            .ok_or_else(|| ConfigError::UnknownProfile { name: name.into() })
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("io", "cogswell", "cogs").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("cogs");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load config from `path`, layered over defaults and under `COGS_*`
/// environment variables (`COGS_DEFAULTS__URL=…`). A missing file is
/// not an error.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("COGS_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<PathBuf, ConfigError> {
    let path = config_path();
    save_config_to(cfg, &path)?;
    Ok(path)
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Key resolution (without CLI flags) ──────────────────────────────

/// Split a key list on commas or whitespace.
pub fn split_keys(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|k| !k.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Resolve a profile's project keys from the credential chain.
///
/// 1. The environment variable named by `keys_env`
/// 2. The system keyring (`cogs` / `<profile>/keys`)
/// 3. Plaintext `keys` in the profile
pub fn resolve_keys(
    profile: &Profile,
    profile_name: &str,
) -> Result<Vec<SecretString>, ConfigError> {
    if let Some(ref env_name) = profile.keys_env {
        if let Ok(val) = std::env::var(env_name) {
            debug!(profile = profile_name, env = %env_name, "project keys from environment");
            return non_empty(split_keys(&val), profile_name);
        }
    }

    if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, &keyring_user(profile_name)) {
        if let Ok(stored) = entry.get_password() {
            debug!(profile = profile_name, "project keys from keyring");
            return non_empty(split_keys(&stored), profile_name);
        }
    }

    non_empty(profile.keys.clone(), profile_name)
}

/// Store project keys for `profile_name` in the system keyring.
pub fn store_keys(profile_name: &str, keys: &[String]) -> Result<(), ConfigError> {
    let entry = keyring::Entry::new(KEYRING_SERVICE, &keyring_user(profile_name))?;
    entry.set_password(&keys.join(","))?;
    Ok(())
}

fn keyring_user(profile_name: &str) -> String {
    format!("{profile_name}/keys")
}

fn non_empty(keys: Vec<String>, profile_name: &str) -> Result<Vec<SecretString>, ConfigError> {
    if keys.is_empty() {
        return Err(ConfigError::NoKeys {
            profile: profile_name.into(),
        });
    }
    Ok(keys.into_iter().map(SecretString::from).collect())
}

// ── Translation to ConnectionOptions ────────────────────────────────

/// Build `ConnectionOptions` from a profile over the global defaults.
pub fn profile_to_options(
    profile: &Profile,
    defaults: &Defaults,
) -> Result<ConnectionOptions, ConfigError> {
    let raw_url = profile.url.as_deref().unwrap_or(&defaults.url);
    let url: url::Url = raw_url.parse().map_err(|_| ConfigError::Validation {
        field: "url".into(),
        reason: format!("invalid URL: {raw_url}"),
    })?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(ConfigError::Validation {
            field: "url".into(),
            reason: format!("expected a ws:// or wss:// URL, got '{raw_url}'"),
        });
    }

    let timeout_ms = profile.connect_timeout_ms.unwrap_or(defaults.connect_timeout_ms);

    Ok(ConnectionOptions::default()
        .with_url(url)
        .with_auto_reconnect(profile.auto_reconnect.unwrap_or(defaults.auto_reconnect))
        .with_connect_timeout(Duration::from_millis(timeout_ms))
        .with_session_uuid(profile.session_uuid))
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use pretty_assertions::assert_eq;
    use secrecy::ExposeSecret;

    use super::*;

    const SAMPLE: &str = r#"
default_profile = "staging"

[defaults]
connect_timeout_ms = 10000

[profiles.staging]
url = "wss://staging.example.com/pubsub"
keys = ["R-abc-00ff", "W-abc-11ee"]
auto_reconnect = false

[profiles.prod]
keys_env = "COGS_TEST_UNSET_KEYS_VARIABLE"
session_uuid = "6ba7b810-9dad-11d1-80b4-00c04fd430c8"
"#;

    fn write_sample(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        path
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config_from(&dir.path().join("absent.toml")).unwrap();

        assert_eq!(cfg.default_profile.as_deref(), Some("default"));
        assert_eq!(cfg.defaults.url, DEFAULT_URL);
        assert_eq!(cfg.defaults.connect_timeout_ms, 30_000);
        assert!(cfg.profiles.is_empty());
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config_from(&write_sample(&dir)).unwrap();

        assert_eq!(cfg.profile_name(None), "staging");
        assert_eq!(cfg.profile_name(Some("prod")), "prod");
        assert_eq!(cfg.defaults.connect_timeout_ms, 10_000);
        assert!(cfg.defaults.auto_reconnect);

        let staging = cfg.profile("staging").unwrap();
        assert_eq!(staging.keys, vec!["R-abc-00ff", "W-abc-11ee"]);
        assert!(matches!(cfg.profile("nope"), Err(ConfigError::UnknownProfile { .. })));
    }

    #[test]
    fn profile_settings_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config_from(&write_sample(&dir)).unwrap();

        let staging = profile_to_options(cfg.profile("staging").unwrap(), &cfg.defaults).unwrap();
        assert_eq!(staging.url.as_str(), "wss://staging.example.com/pubsub");
        assert!(!staging.auto_reconnect);
        assert_eq!(staging.connect_timeout, Duration::from_secs(10));
        assert_eq!(staging.session_uuid, None);

        let prod = profile_to_options(cfg.profile("prod").unwrap(), &cfg.defaults).unwrap();
        assert_eq!(prod.url.as_str(), DEFAULT_URL);
        assert!(prod.auto_reconnect);
        assert_eq!(
            prod.session_uuid.map(|u| u.to_string()).as_deref(),
            Some("6ba7b810-9dad-11d1-80b4-00c04fd430c8")
        );
    }

    #[test]
    fn non_websocket_url_is_rejected() {
        let profile = Profile {
            url: Some("https://api.cogswell.io".into()),
            ..Profile::default()
        };
        let err = profile_to_options(&profile, &Defaults::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Validation { ref field, .. } if field == "url"));
    }

    #[test]
    fn save_then_load_keeps_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut cfg = Config::default();
        cfg.profiles.insert(
            "default".into(),
            Profile {
                keys: vec!["A-abc-00ff".into()],
                connect_timeout_ms: Some(5_000),
                ..Profile::default()
            },
        );
        save_config_to(&cfg, &path).unwrap();

        assert_eq!(load_config_from(&path).unwrap(), cfg);
    }

    #[test]
    fn plaintext_keys_are_the_last_resort() {
        let profile = Profile {
            keys: vec!["R-abc-00ff".into()],
            keys_env: Some("COGS_TEST_UNSET_KEYS_VARIABLE".into()),
            ..Profile::default()
        };
        let keys = resolve_keys(&profile, "cogs-config-test-no-keyring-entry").unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].expose_secret(), "R-abc-00ff");
    }

    #[test]
    fn profile_without_keys_is_an_error() {
        let err =
            resolve_keys(&Profile::default(), "cogs-config-test-no-keyring-entry").unwrap_err();
        assert!(matches!(err, ConfigError::NoKeys { .. }));
    }

    #[test]
    fn key_lists_split_on_commas_and_whitespace() {
        assert_eq!(
            split_keys("R-a-01, W-a-02\nA-a-03,,"),
            vec!["R-a-01", "W-a-02", "A-a-03"]
        );
        assert!(split_keys(" , ").is_empty());
    }
}
