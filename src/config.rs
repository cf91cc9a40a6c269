use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Admin API address used when `USE_ISTIO_CONFIG=true`.
pub const ISTIO_ADMIN_URL: &str = "http://127.0.0.1:15000";
/// Quit API address used when `USE_ISTIO_CONFIG=true`.
pub const ISTIO_QUIT_URL: &str = "http://127.0.0.1:15020";

/// Resolved, immutable settings for one scuttle run.
///
/// Built once at startup from defaults, an optional TOML file and the
/// environment (in that order), then passed by reference to every stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Sidecar admin API, e.g. `http://127.0.0.1:15000`. `None` disables
    /// both readiness gating and the local sidecar shutdown path.
    pub sidecar_admin_url: Option<String>,
    pub start_without_sidecar: bool,
    /// Soft readiness deadline; zero means unbounded.
    pub wait_timeout: Duration,
    /// Hard readiness deadline; zero disables it. Supersedes `wait_timeout`.
    pub hard_wait_timeout: Duration,
    pub sidecar_quit_url: Option<String>,
    pub never_kill_sidecar: bool,
    pub never_kill_on_failure: bool,
    pub quit_api_fallback_to_signal: bool,
    pub generic_quit_endpoints: Vec<String>,
    /// Process name targeted by the signal fallback.
    pub sidecar_process_name: String,
}

/// On-disk form of [`Settings`]. Every field is optional so a file only
/// overrides what it names.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct FileSettings {
    sidecar_admin_url: Option<String>,
    start_without_sidecar: Option<bool>,
    wait_timeout: Option<String>,
    hard_wait_timeout: Option<String>,
    sidecar_quit_url: Option<String>,
    never_kill_sidecar: Option<bool>,
    never_kill_on_failure: Option<bool>,
    quit_api_fallback_to_signal: Option<bool>,
    generic_quit_endpoints: Option<Vec<String>>,
    sidecar_process_name: Option<String>,
}

/// Errors raised while building [`Settings`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read settings file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse settings file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid duration {value:?}")]
    InvalidDuration { value: String },
    #[error("invalid value {value:?} for {field}")]
    InvalidSetting { field: &'static str, value: String },
}

impl Settings {
    /// Load settings from the process environment, layered over the TOML
    /// file at `path` when one is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, |name| std::env::var(name).ok())
    }

    /// Same as [`Settings::load`] with an injectable environment lookup.
    pub fn load_with<F>(path: Option<&Path>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::default();

        if env_bool(&lookup, "USE_ISTIO_CONFIG").unwrap_or(false) {
            settings.sidecar_admin_url = Some(ISTIO_ADMIN_URL.to_string());
            settings.sidecar_quit_url = Some(ISTIO_QUIT_URL.to_string());
        }

        if let Some(path) = path {
            settings.apply_file(path)?;
        }

        settings.apply_env(&lookup);
        Ok(settings)
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: FileSettings = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loaded settings file");

        if let Some(url) = file.sidecar_admin_url {
            self.sidecar_admin_url = non_empty(url);
        }
        if let Some(v) = file.start_without_sidecar {
            self.start_without_sidecar = v;
        }
        if let Some(raw) = file.wait_timeout {
            self.wait_timeout = file_duration("wait_timeout", &raw)?;
        }
        if let Some(raw) = file.hard_wait_timeout {
            self.hard_wait_timeout = file_duration("hard_wait_timeout", &raw)?;
        }
        if let Some(url) = file.sidecar_quit_url {
            self.sidecar_quit_url = non_empty(url);
        }
        if let Some(v) = file.never_kill_sidecar {
            self.never_kill_sidecar = v;
        }
        if let Some(v) = file.never_kill_on_failure {
            self.never_kill_on_failure = v;
        }
        if let Some(v) = file.quit_api_fallback_to_signal {
            self.quit_api_fallback_to_signal = v;
        }
        if let Some(endpoints) = file.generic_quit_endpoints {
            self.generic_quit_endpoints = clean_endpoints(endpoints.iter().map(String::as_str));
        }
        if let Some(name) = file.sidecar_process_name {
            if name.trim().is_empty() {
                return Err(ConfigError::InvalidSetting {
                    field: "sidecar_process_name",
                    value: name,
                });
            }
            self.sidecar_process_name = name;
        }
        Ok(())
    }

    /// Environment variables win over everything else. Invalid values are
    /// logged and leave the lower layer untouched.
    fn apply_env<F>(&mut self, lookup: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if env_string(lookup, "ENVOY_KILL_API").is_some() {
            tracing::warn!("ENVOY_KILL_API is no longer read, use ISTIO_QUIT_API instead");
        }

        if let Some(url) = env_string(lookup, "ENVOY_ADMIN_API") {
            self.sidecar_admin_url = Some(url);
        }
        if let Some(v) = env_bool(lookup, "START_WITHOUT_ENVOY") {
            self.start_without_sidecar = v;
        }
        if let Some(d) = env_duration(lookup, "WAIT_FOR_ENVOY_TIMEOUT") {
            self.wait_timeout = d;
        }
        if let Some(d) = env_duration(lookup, "QUIT_WITHOUT_ENVOY_TIMEOUT") {
            self.hard_wait_timeout = d;
        }
        if let Some(url) = env_string(lookup, "ISTIO_QUIT_API") {
            self.sidecar_quit_url = Some(url);
        }
        if let Some(v) = env_bool(lookup, "NEVER_KILL_ISTIO") {
            self.never_kill_sidecar = v;
        }
        if let Some(v) = env_bool(lookup, "NEVER_KILL_ISTIO_ON_FAILURE") {
            self.never_kill_on_failure = v;
        }
        if let Some(v) = env_bool(lookup, "ISTIO_FALLBACK_PKILL") {
            self.quit_api_fallback_to_signal = v;
        }
        if let Some(csv) = env_string(lookup, "GENERIC_QUIT_ENDPOINTS") {
            self.generic_quit_endpoints = clean_endpoints(csv.split(','));
        }
    }
}

/// Whether log output is enabled (`SCUTTLE_LOGGING`, default true).
///
/// Read before the subscriber is installed, so nothing is logged here.
pub fn logging_enabled<F>(lookup: F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match lookup("SCUTTLE_LOGGING").as_deref().map(str::trim) {
        Some("false") => false,
        _ => true,
    }
}

/// Parse a compound duration such as `500ms`, `5s` or `1m30s`.
///
/// A bare `0` is accepted as zero. Units: `ns`, `us`/`µs`, `ms`, `s`, `m`, `h`.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration {
        value: input.to_string(),
    };

    let s = input.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(invalid());
    }

    let mut total_nanos: u128 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(num_end);
        let unit_end = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_end);

        let unit_nanos: u128 = match unit {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3_600 * 1_000_000_000,
            _ => return Err(invalid()),
        };

        let (whole, frac) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() && frac.is_empty() {
            return Err(invalid());
        }
        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        total_nanos = total_nanos
            .checked_add(whole.checked_mul(unit_nanos).ok_or_else(invalid)?)
            .ok_or_else(invalid)?;

        if !frac.is_empty() {
            if !frac.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            // Digits past nanosecond precision cannot contribute.
            let digits = &frac[..frac.len().min(18)];
            let numerator: u128 = digits.parse().map_err(|_| invalid())?;
            let scale = 10u128.pow(digits.len() as u32);
            total_nanos = total_nanos
                .checked_add(numerator * unit_nanos / scale)
                .ok_or_else(invalid)?;
        }

        rest = tail;
    }

    let nanos = u64::try_from(total_nanos).map_err(|_| invalid())?;
    Ok(Duration::from_nanos(nanos))
}

fn file_duration(field: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    parse_duration(raw).map_err(|_| ConfigError::InvalidSetting {
        field,
        value: raw.to_string(),
    })
}

/// A set, non-blank environment variable. Blank counts as unset.
fn env_string<F>(lookup: &F, name: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    let value = lookup(name)?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    tracing::debug!(name, value = trimmed, "read environment setting");
    Some(trimmed.to_string())
}

fn env_bool<F>(lookup: &F, name: &str) -> Option<bool>
where
    F: Fn(&str) -> Option<String>,
{
    let value = env_string(lookup, name)?;
    match value.as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => {
            tracing::warn!(name, value = %value, "invalid value will be ignored");
            None
        }
    }
}

fn env_duration<F>(lookup: &F, name: &str) -> Option<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let value = env_string(lookup, name)?;
    match parse_duration(&value) {
        Ok(d) => Some(d),
        Err(_) => {
            tracing::warn!(name, value = %value, "invalid value will be ignored");
            None
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn clean_endpoints<'a>(raw: impl Iterator<Item = &'a str>) -> Vec<String> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// --- Default implementations ---

impl Default for Settings {
    fn default() -> Self {
        Self {
            sidecar_admin_url: None,
            start_without_sidecar: false,
            wait_timeout: Duration::ZERO,
            hard_wait_timeout: Duration::ZERO,
            sidecar_quit_url: None,
            never_kill_sidecar: false,
            never_kill_on_failure: false,
            quit_api_fallback_to_signal: false,
            generic_quit_endpoints: Vec::new(),
            sidecar_process_name: "pilot-agent".to_string(),
        }
    }
}
