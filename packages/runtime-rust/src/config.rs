//! Bus connection settings.
//!
//! Layered the same way every time: built-in defaults, then the optional JSON
//! settings file, then environment variables and command-line flags (clap
//! resolves those two, flag first).
//!
//! The settings file uses the host's `{"Weikio": {"Nats": {...}}}` section
//! with `Url`, `Username`, `Password` and `Timeout` (milliseconds) keys; the
//! matching environment variables are `Weikio__Nats__Url` and so on. A
//! lowercase `bus` section is read as well, and the `Weikio` one wins.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use opbus_core::ConfigurationError;
use serde::{Deserialize, Deserializer};

pub const DEFAULT_URL: &str = "nats://localhost:4222";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SETTINGS_FILE: &str = "appsettings.json";

/// Where and how to connect to the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusSettings {
    /// Server URL.
    pub url: String,
    /// Optional user name; only used together with `password`.
    pub username: Option<String>,
    pub password: Option<String>,
    /// Upper bound on establishing a connection.
    pub connect_timeout: Duration,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            username: None,
            password: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl BusSettings {
    /// User name and password, when both are configured.
    #[must_use]
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }

    /// Defaults overlaid with the `bus` and then the `Weikio:Nats` sections
    /// of the JSON file at `path`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidSettings` when the file exists but
    /// cannot be read or parsed. A missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigurationError> {
        let mut settings = Self::default();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(settings),
            Err(err) => {
                return Err(ConfigurationError::InvalidSettings(format!(
                    "cannot read {}: {err}",
                    path.display()
                )))
            }
        };
        let file: SettingsFile = serde_json::from_str(&raw).map_err(|err| {
            ConfigurationError::InvalidSettings(format!("cannot parse {}: {err}", path.display()))
        })?;
        if let Some(bus) = file.bus {
            settings.apply(bus)?;
        }
        if let Some(nats) = file.host.and_then(|host| host.nats) {
            settings.apply(nats)?;
        }
        Ok(settings)
    }

    /// Overlay every non-blank value of `overrides`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidSettings` for a zero timeout.
    pub fn apply(&mut self, overrides: SettingsOverrides) -> Result<(), ConfigurationError> {
        if let Some(url) = non_blank(overrides.url) {
            self.url = url;
        }
        if let Some(username) = non_blank(overrides.username) {
            self.username = Some(username);
        }
        if let Some(password) = non_blank(overrides.password) {
            self.password = Some(password);
        }
        match overrides.timeout_ms {
            Some(0) => {
                return Err(ConfigurationError::InvalidSettings(
                    "timeout_ms must be greater than zero".to_string(),
                ))
            }
            Some(ms) => self.connect_timeout = Duration::from_millis(ms),
            None => {}
        }
        Ok(())
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Partial settings from one layer; `None` and blank strings leave the
/// lower layer's value in place.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsOverrides {
    #[serde(default, alias = "Url")]
    pub url: Option<String>,
    #[serde(default, alias = "Username")]
    pub username: Option<String>,
    #[serde(default, alias = "Password")]
    pub password: Option<String>,
    #[serde(default, alias = "Timeout", deserialize_with = "millis")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    bus: Option<SettingsOverrides>,
    #[serde(default, rename = "Weikio")]
    host: Option<HostSection>,
}

#[derive(Debug, Default, Deserialize)]
struct HostSection {
    #[serde(default, rename = "Nats")]
    nats: Option<SettingsOverrides>,
}

/// Milliseconds given either as a number or as a numeric string.
fn millis<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(ms)) => Ok(Some(ms)),
        Some(Raw::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(Raw::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid timeout {text:?}"))),
    }
}

// ---------------------------------------------------------------------------
// Command line
// ---------------------------------------------------------------------------

/// Bus flags for service binaries; flatten into the binary's parser.
#[derive(Debug, Clone, clap::Args)]
pub struct BusArgs {
    /// JSON settings file; ignored when absent.
    #[arg(long = "settings", env = "OPBUS_SETTINGS", default_value = DEFAULT_SETTINGS_FILE)]
    pub settings: PathBuf,

    /// Bus server URL.
    #[arg(long = "nats-url", env = "Weikio__Nats__Url")]
    pub url: Option<String>,

    #[arg(long = "nats-username", env = "Weikio__Nats__Username")]
    pub username: Option<String>,

    #[arg(long = "nats-password", env = "Weikio__Nats__Password", hide_env_values = true)]
    pub password: Option<String>,

    /// Connect timeout in milliseconds.
    #[arg(long = "nats-timeout-ms", env = "Weikio__Nats__Timeout")]
    pub timeout_ms: Option<u64>,
}

impl BusArgs {
    /// Resolve all layers into final settings.
    ///
    /// # Errors
    ///
    /// Propagates settings-file and validation errors.
    pub fn resolve(&self) -> Result<BusSettings, ConfigurationError> {
        let mut settings = BusSettings::from_file(&self.settings)?;
        settings.apply(SettingsOverrides {
            url: self.url.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            timeout_ms: self.timeout_ms,
        })?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use clap::{CommandFactory, Parser};

    use super::*;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        bus: BusArgs,
    }

    fn settings_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults() {
        let settings = BusSettings::default();
        assert_eq!(settings.url, "nats://localhost:4222");
        assert_eq!(settings.connect_timeout, Duration::from_secs(10));
        assert!(settings.credentials().is_none());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = BusSettings::from_file(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings, BusSettings::default());
    }

    #[test]
    fn file_values_override_defaults() {
        let file = settings_file(
            r#"{"bus": {"url": "nats://bus:4222", "username": "svc", "password": "pw",
                "timeout_ms": 2500}}"#,
        );
        let settings = BusSettings::from_file(file.path()).unwrap();
        assert_eq!(settings.url, "nats://bus:4222");
        assert_eq!(settings.credentials(), Some(("svc", "pw")));
        assert_eq!(settings.connect_timeout, Duration::from_millis(2500));

        let file = settings_file(
            r#"{"Weikio": {"Nats": {"Url": "nats://host:4222", "Username": "agent",
                "Password": "secret", "Timeout": "4000"}}}"#,
        );
        let settings = BusSettings::from_file(file.path()).unwrap();
        assert_eq!(settings.url, "nats://host:4222");
        assert_eq!(settings.credentials(), Some(("agent", "secret")));
        assert_eq!(settings.connect_timeout, Duration::from_millis(4000));

        let file = settings_file(r#"{"Weikio": {"Nats": {"Timeout": 750}}}"#);
        let settings = BusSettings::from_file(file.path()).unwrap();
        assert_eq!(settings.url, DEFAULT_URL);
        assert_eq!(settings.connect_timeout, Duration::from_millis(750));
    }

    #[test]
    fn host_section_wins_over_bus_section() {
        let file = settings_file(
            r#"{"bus": {"url": "nats://bus:4222", "timeout_ms": 100},
                "Weikio": {"Nats": {"Url": "nats://host:4222"}}}"#,
        );
        let settings = BusSettings::from_file(file.path()).unwrap();
        assert_eq!(settings.url, "nats://host:4222");
        assert_eq!(settings.connect_timeout, Duration::from_millis(100));
    }

    #[test]
    fn non_numeric_timeout_is_rejected() {
        let file = settings_file(r#"{"Weikio": {"Nats": {"Timeout": "soon"}}}"#);
        assert!(matches!(
            BusSettings::from_file(file.path()),
            Err(ConfigurationError::InvalidSettings(_))
        ));
    }

    #[test]
    fn flags_read_host_environment_variables() {
        let command = Cli::command();
        let env_of = |id: &str| {
            command
                .get_arguments()
                .find(|arg| arg.get_id() == id)
                .and_then(|arg| arg.get_env())
                .and_then(|name| name.to_str())
                .map(str::to_string)
        };
        assert_eq!(env_of("url").as_deref(), Some("Weikio__Nats__Url"));
        assert_eq!(env_of("username").as_deref(), Some("Weikio__Nats__Username"));
        assert_eq!(env_of("password").as_deref(), Some("Weikio__Nats__Password"));
        assert_eq!(env_of("timeout_ms").as_deref(), Some("Weikio__Nats__Timeout"));
    }

    #[test]
    fn blank_values_are_unset() {
        let file = settings_file(r#"{"bus": {"url": "  ", "username": "", "password": "pw"}}"#);
        let settings = BusSettings::from_file(file.path()).unwrap();
        assert_eq!(settings.url, DEFAULT_URL);
        assert_eq!(settings.username, None);
        // A password alone is not a credential pair.
        assert!(settings.credentials().is_none());
    }

    #[test]
    fn file_without_bus_section_is_fine() {
        let file = settings_file(r#"{"Logging": {"Level": "Debug"}}"#);
        assert_eq!(
            BusSettings::from_file(file.path()).unwrap(),
            BusSettings::default()
        );
    }

    #[test]
    fn malformed_file_is_rejected() {
        let file = settings_file("{ not json");
        assert!(matches!(
            BusSettings::from_file(file.path()),
            Err(ConfigurationError::InvalidSettings(_))
        ));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let mut settings = BusSettings::default();
        let err = settings
            .apply(SettingsOverrides {
                timeout_ms: Some(0),
                ..SettingsOverrides::default()
            })
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidSettings(_)));
    }

    #[test]
    fn flags_override_file() {
        let file = settings_file(r#"{"bus": {"url": "nats://file:4222", "timeout_ms": 1000}}"#);
        let path = file.path().to_str().unwrap().to_string();
        let cli = Cli::try_parse_from([
            "svc",
            "--settings",
            path.as_str(),
            "--nats-url",
            "nats://flag:4222",
        ])
        .unwrap();
        let settings = cli.bus.resolve().unwrap();
        assert_eq!(settings.url, "nats://flag:4222");
        assert_eq!(settings.connect_timeout, Duration::from_millis(1000));
    }
}
