//! Shared configuration for dispatch console front-ends.
//!
//! TOML profiles, session-token resolution (env + keyring + plaintext),
//! and translation to `dispatch_core::ConsoleConfig`. The runtime config
//! type lives in core and never touches disk; this crate is the disk side.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use dispatch_core::{ConsoleConfig, InterpolatorConfig, TlsVerification};

const KEYRING_SERVICE: &str = "dispatch-live";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no profile named '{profile}'")]
    UnknownProfile { profile: String },

    #[error("no session token configured for profile '{profile}'")]
    NoCredentials { profile: String },

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
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Default profile name.
    pub default_profile: Option<String>,

    /// Global defaults.
    #[serde(default)]
    pub defaults: Defaults,

    /// Named backend profiles.
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

impl Config {
    /// Look up `name`, or the default profile when `None`.
    pub fn profile<'a>(&'a self, name: Option<&'a str>) -> Result<(&'a str, &'a Profile), ConfigError> {
        let name = name
            .or(self.default_profile.as_deref())
            .unwrap_or("default");
        self.profiles
            .get(name)
            .map(|p| (name, p))
            .ok_or_else(|| ConfigError::UnknownProfile {
                profile: name.into(),
            })
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Defaults {
    /// REST and stream-connect timeout, seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Store publication window, milliseconds.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    #[serde(default = "default_stream_path")]
    pub stream_path: String,

    #[serde(default)]
    pub insecure: bool,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            debounce_ms: default_debounce_ms(),
            stream_path: default_stream_path(),
            insecure: false,
        }
    }
}

fn default_timeout() -> u64 {
    30
}
fn default_debounce_ms() -> u64 {
    100
}
fn default_stream_path() -> String {
    dispatch_core::config::DEFAULT_STREAM_PATH.into()
}

/// A named backend profile.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Profile {
    /// Backend base URL (e.g., "https://dispatch.example.org").
    pub url: String,

    /// Session token (plaintext; prefer keyring or env var).
    pub token: Option<String>,

    /// Environment variable name containing the session token.
    pub token_env: Option<String>,

    /// Override the event-stream path.
    pub stream_path: Option<String>,

    /// Path to custom CA certificate.
    pub ca_cert: Option<PathBuf>,

    /// Override insecure TLS setting.
    pub insecure: Option<bool>,

    /// Override timeout.
    pub timeout: Option<u64>,

    /// Override the publication window.
    pub debounce_ms: Option<u64>,

    /// Position smoothing overrides.
    #[serde(default)]
    pub interpolation: InterpolationSettings,
}

/// Optional overrides for [`InterpolatorConfig`].
#[derive(Debug, Default, Clone, Copy, Deserialize, Serialize)]
pub struct InterpolationSettings {
    pub factor: Option<f64>,
    pub epsilon: Option<f64>,
    pub frame_interval_ms: Option<u64>,
    pub prune_missing: Option<bool>,
}

impl InterpolationSettings {
    fn resolve(self) -> Result<InterpolatorConfig, ConfigError> {
        let base = InterpolatorConfig::default();
        let cfg = InterpolatorConfig {
            factor: self.factor.unwrap_or(base.factor),
            epsilon: self.epsilon.unwrap_or(base.epsilon),
            frame_interval: self
                .frame_interval_ms
                .map_or(base.frame_interval, Duration::from_millis),
            prune_missing: self.prune_missing.unwrap_or(base.prune_missing),
        };

        if cfg.factor.is_nan() || cfg.factor <= 0.0 || cfg.factor > 1.0 {
            return Err(ConfigError::Validation {
                field: "interpolation.factor".into(),
                reason: format!("expected a value in (0, 1], got {}", cfg.factor),
            });
        }
        if cfg.epsilon.is_nan() || cfg.epsilon <= 0.0 {
            return Err(ConfigError::Validation {
                field: "interpolation.epsilon".into(),
                reason: format!("expected a positive value, got {}", cfg.epsilon),
            });
        }
        if cfg.frame_interval.is_zero() {
            return Err(ConfigError::Validation {
                field: "interpolation.frame_interval_ms".into(),
                reason: "must be greater than zero".into(),
            });
        }
        Ok(cfg)
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("org", "dispatch", "dispatch-live").map_or_else(
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
    p.push("dispatch-live");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load the full Config from `path` + environment.
///
/// Environment keys use `__` for nesting:
/// `DISPATCH_DEFAULTS__TIMEOUT=10`, `DISPATCH_DEFAULT_PROFILE=staging`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("DISPATCH_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Load config, returning a default if the file doesn't exist.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Token resolution ────────────────────────────────────────────────

/// Resolve the session token from the credential chain.
pub fn resolve_token(profile: &Profile, profile_name: &str) -> Result<SecretString, ConfigError> {
    // 1. Profile's token_env → env var lookup
    if let Some(ref env_name) = profile.token_env {
        if let Ok(val) = std::env::var(env_name) {
            return Ok(SecretString::from(val));
        }
    }

    // 2. System keyring
    if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, &token_key(profile_name)) {
        if let Ok(secret) = entry.get_password() {
            return Ok(SecretString::from(secret));
        }
    }

    // 3. Plaintext in config
    if let Some(ref token) = profile.token {
        return Ok(SecretString::from(token.clone()));
    }

    Err(ConfigError::NoCredentials {
        profile: profile_name.into(),
    })
}

/// Store a session token in the system keyring for `profile_name`.
pub fn store_token(profile_name: &str, token: &SecretString) -> Result<(), ConfigError> {
    let entry = keyring::Entry::new(KEYRING_SERVICE, &token_key(profile_name))?;
    entry.set_password(token.expose_secret())?;
    Ok(())
}

fn token_key(profile_name: &str) -> String {
    format!("{profile_name}/token")
}

// ── Translation ─────────────────────────────────────────────────────

/// Build a `ConsoleConfig` from a profile layered over `defaults`.
pub fn profile_to_console_config(
    profile: &Profile,
    defaults: &Defaults,
) -> Result<ConsoleConfig, ConfigError> {
    let url: url::Url = profile.url.parse().map_err(|_| ConfigError::Validation {
        field: "url".into(),
        reason: format!("invalid URL: {}", profile.url),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::Validation {
            field: "url".into(),
            reason: format!("expected an http(s) URL, got scheme '{}'", url.scheme()),
        });
    }

    let tls = if profile.insecure.unwrap_or(defaults.insecure) {
        TlsVerification::DangerAcceptInvalid
    } else if let Some(ref ca_path) = profile.ca_cert {
        TlsVerification::CustomCa(ca_path.clone())
    } else {
        TlsVerification::SystemDefaults
    };

    let mut config = ConsoleConfig::new(url);
    config.stream_path = profile
        .stream_path
        .clone()
        .unwrap_or_else(|| defaults.stream_path.clone());
    config.tls = tls;
    config.timeout = Duration::from_secs(profile.timeout.unwrap_or(defaults.timeout));
    config.debounce = Duration::from_millis(profile.debounce_ms.unwrap_or(defaults.debounce_ms));
    config.interpolation = profile.interpolation.resolve()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"
default_profile = "lyon"

[defaults]
timeout = 15

[profiles.lyon]
url = "https://dispatch.example.org"
token = "plain-token"
token_env = "DISPATCH_TEST_TOKEN_THAT_IS_NEVER_SET"
debounce_ms = 50

[profiles.lyon.interpolation]
factor = 0.25
prune_missing = false

[profiles.staging]
url = "https://staging.example.org/console/"
insecure = true
"#;

    fn write_sample(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, SAMPLE).expect("write sample");
        path
    }

    #[test]
    fn loads_profiles_and_defaults_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_config_from(&write_sample(&dir)).expect("load");

        assert_eq!(config.defaults.timeout, 15);
        assert_eq!(config.defaults.debounce_ms, 100);
        assert_eq!(config.profiles.len(), 2);

        let (name, profile) = config.profile(None).expect("default profile");
        assert_eq!(name, "lyon");
        assert_eq!(profile.debounce_ms, Some(50));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_config_from(&dir.path().join("absent.toml")).expect("load");
        assert_eq!(config.default_profile.as_deref(), Some("default"));
        assert!(config.profiles.is_empty());
        assert!(matches!(
            config.profile(None),
            Err(ConfigError::UnknownProfile { .. })
        ));
    }

    #[test]
    fn profile_overrides_layer_over_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_config_from(&write_sample(&dir)).expect("load");

        let (_, lyon) = config.profile(Some("lyon")).expect("lyon");
        let console = profile_to_console_config(lyon, &config.defaults).expect("console config");
        assert_eq!(console.timeout, Duration::from_secs(15));
        assert_eq!(console.debounce, Duration::from_millis(50));
        assert_eq!(console.tls, TlsVerification::SystemDefaults);
        assert!((console.interpolation.factor - 0.25).abs() < f64::EPSILON);
        assert!(!console.interpolation.prune_missing);

        let (_, staging) = config.profile(Some("staging")).expect("staging");
        let console = profile_to_console_config(staging, &config.defaults).expect("console config");
        assert_eq!(console.tls, TlsVerification::DangerAcceptInvalid);
        assert_eq!(
            console.stream_url().expect("stream url").as_str(),
            "https://staging.example.org/console/api/events/stream"
        );
    }

    #[test]
    fn rejects_bad_urls_and_smoothing_factors() {
        let defaults = Defaults::default();
        let bad_url = Profile {
            url: "ftp://example.org".into(),
            ..Profile::default()
        };
        assert!(matches!(
            profile_to_console_config(&bad_url, &defaults),
            Err(ConfigError::Validation { ref field, .. }) if field == "url"
        ));

        let bad_factor = Profile {
            url: "https://example.org".into(),
            interpolation: InterpolationSettings {
                factor: Some(1.5),
                ..InterpolationSettings::default()
            },
            ..Profile::default()
        };
        assert!(matches!(
            profile_to_console_config(&bad_factor, &defaults),
            Err(ConfigError::Validation { ref field, .. }) if field == "interpolation.factor"
        ));
    }

    #[test]
    fn token_falls_back_to_plaintext() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_config_from(&write_sample(&dir)).expect("load");
        let (_, lyon) = config.profile(Some("lyon")).expect("lyon");

        let token = resolve_token(lyon, "dispatch-live-test-profile-without-keyring-entry")
            .expect("plaintext token");
        assert_eq!(token.expose_secret(), "plain-token");
    }

    #[test]
    fn missing_token_is_reported() {
        let profile = Profile {
            url: "https://example.org".into(),
            ..Profile::default()
        };
        assert!(matches!(
            resolve_token(&profile, "dispatch-live-test-profile-without-keyring-entry"),
            Err(ConfigError::NoCredentials { .. })
        ));
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.profiles.insert(
            "default".into(),
            Profile {
                url: "https://dispatch.example.org".into(),
                debounce_ms: Some(75),
                ..Profile::default()
            },
        );

        save_config_to(&config, &path).expect("save");
        let loaded = load_config_from(&path).expect("load");
        let (_, profile) = loaded.profile(None).expect("default profile");
        assert_eq!(profile.url, "https://dispatch.example.org");
        assert_eq!(profile.debounce_ms, Some(75));
    }
}
