//! Settings loading and validation.
//!
//! The server core only needs a `get(key)` accessor, expressed by the
//! [`SettingsSource`] trait. [`Settings`] is the stock implementation: a
//! JSON file layered over built-in defaults, with environment overrides.
//!
//! Every known setting has a default and, optionally, a list of allowed
//! values. A user value only replaces the default when it has the same
//! JSON kind as the default and (if a list exists) appears in it; anything
//! else is reported and ignored.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::{fs, fmt};

use anyhow::{Context, Result};
use serde_json::{Map, Value};

use crate::constants::{DEFAULT_HOST, DEFAULT_PORT, DEFAULT_START_DELAY};

/// Key of the listening host setting.
pub const HOST_KEY: &str = "host";
/// Key of the listening port setting.
pub const PORT_KEY: &str = "port";
/// Key of the delayed-start setting, in milliseconds.
pub const START_DELAY_KEY: &str = "start_delay_ms";

/// Read-only access to host settings.
pub trait SettingsSource: Send + Sync {
    /// Value stored under `key`, if any.
    fn get(&self, key: &str) -> Option<Value>;

    /// String value under `key`.
    fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(str::to_owned))
    }

    /// Unsigned integer value under `key`.
    fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.as_u64())
    }
}

impl SettingsSource for HashMap<String, Value> {
    fn get(&self, key: &str) -> Option<Value> {
        HashMap::get(self, key).cloned()
    }
}

/// A known setting: its default and the values it may take.
#[derive(Debug, Clone)]
struct SettingSpec {
    name: &'static str,
    default: Value,
    allowed: Option<Vec<Value>>,
}

fn known_settings() -> Vec<SettingSpec> {
    vec![
        SettingSpec {
            name: HOST_KEY,
            default: Value::from(DEFAULT_HOST),
            allowed: None,
        },
        SettingSpec {
            name: PORT_KEY,
            default: Value::from(DEFAULT_PORT),
            allowed: None,
        },
        SettingSpec {
            name: START_DELAY_KEY,
            default: Value::from(u64::try_from(DEFAULT_START_DELAY.as_millis()).unwrap_or(u64::MAX)),
            allowed: None,
        },
    ]
}

/// Settings backed by an optional JSON file, with validated defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    values: HashMap<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        let values = known_settings()
            .into_iter()
            .map(|spec| (spec.name.to_string(), spec.default))
            .collect();
        Self { values }
    }
}

impl SettingsSource for Settings {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }
}

impl Settings {
    /// Default location of the settings file.
    ///
    /// `GULP_SERVER_CONFIG_DIR` overrides the platform config directory.
    pub fn default_path() -> Result<PathBuf> {
        let dir = match std::env::var("GULP_SERVER_CONFIG_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => dirs::config_dir()
                .context("Could not determine config directory")?
                .join("gulp-server"),
        };
        Ok(dir.join("settings.json"))
    }

    /// Load settings from `path`, falling back to defaults when the file
    /// does not exist. Environment overrides are applied last.
    pub fn load(path: &Path) -> Result<Self> {
        let mut settings = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read settings: {}", path.display()))?;
            Self::from_json_str(&content)
                .with_context(|| format!("Failed to parse settings: {}", path.display()))?
        } else {
            log::debug!("Settings file {} not found, using defaults", path.display());
            Self::default()
        };
        settings.apply_env_overrides();
        Ok(settings)
    }

    /// Parse a JSON object of user settings and verify it against the
    /// known settings.
    pub fn from_json_str(content: &str) -> Result<Self> {
        let user: Map<String, Value> =
            serde_json::from_str(content).context("Settings must be a JSON object")?;
        Ok(Self::from_user_values(user))
    }

    fn from_user_values(mut user: Map<String, Value>) -> Self {
        let mut settings = Self::default();
        for spec in known_settings() {
            let Some(value) = user.remove(spec.name) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            if is_valid(&spec, &value) {
                settings.values.insert(spec.name.to_string(), value);
            } else {
                log::warn!(
                    "Invalid value for setting \"{}\": {} (using default {})",
                    spec.name,
                    value,
                    spec.default
                );
            }
        }
        // Settings we don't know about are kept as-is for the host.
        settings.values.extend(user);
        settings
    }

    /// Override or add a value.
    pub fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }

    /// Apply `GULP_SERVER_HOST`, `GULP_SERVER_PORT` and
    /// `GULP_SERVER_START_DELAY_MS` from the environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("GULP_SERVER_HOST") {
            self.set(HOST_KEY, Value::from(host));
        }

        if let Some(port) = lookup("GULP_SERVER_PORT") {
            match port.parse::<u16>() {
                Ok(port) => self.set(PORT_KEY, Value::from(port)),
                Err(_) => log::warn!("Ignoring GULP_SERVER_PORT={port}: not a port number"),
            }
        }

        if let Some(delay) = lookup("GULP_SERVER_START_DELAY_MS") {
            if let Ok(delay) = delay.parse::<u64>() {
                self.set(START_DELAY_KEY, Value::from(delay));
            }
        }
    }
}

/// Same JSON kind as the default and, when restricted, an allowed value.
fn is_valid(spec: &SettingSpec, value: &Value) -> bool {
    let same_kind = match (&spec.default, value) {
        (Value::Bool(_), Value::Bool(_)) | (Value::String(_), Value::String(_)) => true,
        (Value::Number(d), Value::Number(v)) => {
            (d.is_u64() || d.is_i64()) == (v.is_u64() || v.is_i64())
        }
        (Value::Array(_), Value::Array(items)) => items.iter().all(Value::is_string),
        (Value::Object(_), Value::Object(map)) => map.values().all(Value::is_string),
        _ => false,
    };
    if !same_kind {
        return false;
    }

    match &spec.allowed {
        None => true,
        Some(allowed) => match value {
            Value::Array(items) => items.iter().all(|item| allowed.contains(item)),
            Value::Object(map) => map.values().all(|item| allowed.contains(item)),
            other => allowed.contains(other),
        },
    }
}

/// Host and port the server listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddr {
    /// Host name or IP address.
    pub host: String,
    /// TCP port; 0 lets the OS pick one.
    pub port: u16,
}

impl Default for ServerAddr {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl ServerAddr {
    /// Build an address from parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Read `host` and `port` from `settings`, using defaults for missing
    /// or unusable values.
    pub fn from_settings(settings: &dyn SettingsSource) -> Self {
        let host = settings
            .get_str(HOST_KEY)
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = match settings.get_u64(PORT_KEY) {
            Some(port) => u16::try_from(port).unwrap_or_else(|_| {
                log::warn!("Port {port} out of range, using {DEFAULT_PORT}");
                DEFAULT_PORT
            }),
            None => DEFAULT_PORT,
        };
        Self { host, port }
    }
}
