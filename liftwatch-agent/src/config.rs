//! Configuration management
//!
//! Handles:
//! - Environment variables, with `.env` support through dotenvy
//! - Optional TOML file (`LIFTWATCH_CONFIG` or the OS config directory)
//! - Validation of sink and tunnel settings before anything starts
//!
//! The resulting [`AppConfig`] is built once at startup and handed to each
//! component by reference.

use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_STATUS_URL: &str = "https://skirose.com/snow-report/";
pub const DEFAULT_IP_ECHO_URL: &str = "https://checkip.amazonaws.com";
pub const DEFAULT_SOCIAL_API_URL: &str = "https://api.twitter.com/2/tweets";
pub const DEFAULT_EMAIL_SUBJECT: &str = "Mt. Rose Lift Status Update";
pub const DEFAULT_LOCAL_LOG_PATH: &str = "mt_rose_lift_status.log";
/// Upper bound for poll and rotation intervals (one week)
pub const MAX_INTERVAL_SECS: u64 = 7 * 24 * 3600;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Delivery channel identifiers accepted in `NOTIFICATION_SYSTEMS`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SinkKind {
    Social,
    Email,
    LocalLog,
}

impl SinkKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "social" | "twitter" => Some(Self::Social),
            "email" => Some(Self::Email),
            "local-log" | "local_log" => Some(Self::LocalLog),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Social => "social",
            Self::Email => "email",
            Self::LocalLog => "local-log",
        }
    }
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// String that never shows up in logs or `Debug` output
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone)]
pub struct SocialConfig {
    pub api_key: String,
    pub api_secret: Secret,
    pub access_token: String,
    pub access_token_secret: Secret,
    pub api_url: String,
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub user: String,
    pub password: Secret,
    pub recipients: Vec<String>,
    pub subject: String,
    pub smtp_host: String,
    pub smtp_port: u16,
}

/// Whether the tunnel client is launched through `sudo`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SudoMode {
    /// Use sudo when it can be found on `PATH`
    Auto,
    Always,
    Never,
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub config_dir: PathBuf,
    pub credentials_file: PathBuf,
    pub rotation_interval: Duration,
    pub binary: String,
    pub sudo: SudoMode,
    /// `None` waits for the handshake forever
    pub handshake_timeout: Option<Duration>,
    pub settle_delay: Duration,
    pub ip_echo_url: String,
}

/// What the poll loop does when a notification sink fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkFailurePolicy {
    /// Log the failure and keep polling
    Continue,
    /// Stop the loop, leaving restarts to the process supervisor
    Abort,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub status_url: String,
    pub poll_interval: Duration,
    /// Enabled sinks, deduplicated, in dispatch order
    pub sinks: Vec<SinkKind>,
    pub social: Option<SocialConfig>,
    pub email: Option<EmailConfig>,
    pub local_log_path: PathBuf,
    pub tunnel: Option<TunnelConfig>,
    pub sink_failure_policy: SinkFailurePolicy,
    pub max_consecutive_failures: u32,
}

impl AppConfig {
    /// Load from the process environment, `.env` and the optional TOML file
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!("Loaded environment overrides from {}", path.display());
        }

        let file = match Self::config_file_path() {
            Some(path) => {
                info!("Reading configuration file {}", path.display());
                FileSettings::read(&path)?
            }
            None => FileSettings::default(),
        };

        Self::from_lookup(|key| std::env::var(key).ok().or_else(|| file.get(key)))
    }

    /// Build a config from any key/value source; keys use the env var spelling
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let settings = Settings { lookup };

        let sinks = parse_sinks(&settings.required("NOTIFICATION_SYSTEMS")?)?;

        let social = if sinks.contains(&SinkKind::Social) {
            Some(SocialConfig {
                api_key: settings.required("API_KEY")?,
                api_secret: Secret::new(settings.required("API_SECRET_KEY")?),
                access_token: settings.required("ACCESS_TOKEN")?,
                access_token_secret: Secret::new(settings.required("ACCESS_TOKEN_SECRET")?),
                api_url: settings.or_default("SOCIAL_API_URL", DEFAULT_SOCIAL_API_URL),
            })
        } else {
            None
        };

        let email = if sinks.contains(&SinkKind::Email) {
            let recipients: Vec<String> = settings
                .required("EMAIL_RECIPIENTS")?
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect();
            if recipients.is_empty() {
                return Err(ConfigError::Invalid {
                    key: "EMAIL_RECIPIENTS",
                    reason: "no recipient listed".to_string(),
                });
            }
            Some(EmailConfig {
                user: settings.required("EMAIL_USER")?,
                password: Secret::new(settings.required("EMAIL_PASSWORD")?),
                recipients,
                subject: settings.or_default("EMAIL_SUBJECT", DEFAULT_EMAIL_SUBJECT),
                smtp_host: settings.or_default("SMTP_HOST", "smtp.gmail.com"),
                smtp_port: settings.parsed_or("SMTP_PORT", 465u16)?,
            })
        } else {
            None
        };

        let tunnel = if settings.flag("USE_VPN")? {
            Some(TunnelConfig {
                config_dir: PathBuf::from(settings.required("VPN_CONFIG_DIR")?),
                credentials_file: PathBuf::from(settings.required("VPN_CREDENTIALS_FILE")?),
                rotation_interval: settings.seconds("VPN_SWITCH_INTERVAL")?,
                binary: settings.or_default("VPN_BINARY", "openvpn"),
                sudo: parse_sudo_mode(settings.optional("VPN_USE_SUDO").as_deref())?,
                handshake_timeout: match settings.parsed_or("VPN_HANDSHAKE_TIMEOUT", 120u64)? {
                    0 => None,
                    secs => Some(Duration::from_secs(secs)),
                },
                settle_delay: Duration::from_secs(settings.parsed_or("VPN_SETTLE_DELAY", 10u64)?),
                ip_echo_url: settings.or_default("IP_ECHO_URL", DEFAULT_IP_ECHO_URL),
            })
        } else {
            None
        };

        let sink_failure_policy = match settings.optional("SINK_FAILURE_POLICY").as_deref() {
            None | Some("continue") => SinkFailurePolicy::Continue,
            Some("abort") => SinkFailurePolicy::Abort,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "SINK_FAILURE_POLICY",
                    reason: format!("expected `continue` or `abort`, got `{other}`"),
                })
            }
        };

        let max_consecutive_failures = settings.parsed_or("MAX_CONSECUTIVE_FAILURES", 5u32)?;
        if max_consecutive_failures == 0 {
            return Err(ConfigError::Invalid {
                key: "MAX_CONSECUTIVE_FAILURES",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            status_url: settings.or_default("STATUS_URL", DEFAULT_STATUS_URL),
            poll_interval: settings.seconds("UPDATE_INTERVAL")?,
            sinks,
            social,
            email,
            local_log_path: PathBuf::from(
                settings.or_default("LOCAL_LOG_PATH", DEFAULT_LOCAL_LOG_PATH),
            ),
            tunnel,
            sink_failure_policy,
            max_consecutive_failures,
        })
    }

    pub fn sink_enabled(&self, kind: SinkKind) -> bool {
        self.sinks.contains(&kind)
    }

    /// `LIFTWATCH_CONFIG` if set, otherwise `<config dir>/liftwatch/config.toml` when it exists
    pub fn config_file_path() -> Option<PathBuf> {
        if let Ok(explicit) = std::env::var("LIFTWATCH_CONFIG") {
            return Some(PathBuf::from(explicit));
        }

        let mut path = dirs::config_dir()?;
        path.push("liftwatch");
        path.push("config.toml");
        path.exists().then_some(path)
    }
}

struct Settings<F> {
    lookup: F,
}

impl<F> Settings<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.optional(key).ok_or(ConfigError::Missing(key))
    }

    fn or_default(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parsed_or<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: fmt::Display,
    {
        match self.optional(key) {
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: e.to_string(),
            }),
            None => Ok(default),
        }
    }

    fn seconds(&self, key: &'static str) -> Result<Duration, ConfigError> {
        let raw = self.required(key)?;
        let secs: u64 = raw.parse().map_err(|e: std::num::ParseIntError| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        })?;
        if secs == 0 {
            return Err(ConfigError::Invalid {
                key,
                reason: "must be greater than zero".to_string(),
            });
        }
        if secs > MAX_INTERVAL_SECS {
            return Err(ConfigError::Invalid {
                key,
                reason: format!("must be at most {MAX_INTERVAL_SECS} seconds"),
            });
        }
        Ok(Duration::from_secs(secs))
    }

    fn flag(&self, key: &'static str) -> Result<bool, ConfigError> {
        match self.optional(key).map(|v| v.to_ascii_lowercase()).as_deref() {
            None | Some("0" | "false" | "no" | "off") => Ok(false),
            Some("1" | "true" | "yes" | "on") => Ok(true),
            Some(other) => Err(ConfigError::Invalid {
                key,
                reason: format!("expected a boolean, got `{other}`"),
            }),
        }
    }
}

fn parse_sinks(raw: &str) -> Result<Vec<SinkKind>, ConfigError> {
    let mut sinks = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        let kind = SinkKind::parse(name).ok_or_else(|| ConfigError::Invalid {
            key: "NOTIFICATION_SYSTEMS",
            reason: format!("unknown sink `{name}`"),
        })?;
        sinks.push(kind);
    }
    sinks.sort();
    sinks.dedup();
    Ok(sinks)
}

fn parse_sudo_mode(raw: Option<&str>) -> Result<SudoMode, ConfigError> {
    match raw.map(str::to_ascii_lowercase).as_deref() {
        None | Some("auto") => Ok(SudoMode::Auto),
        Some("always" | "true" | "1") => Ok(SudoMode::Always),
        Some("never" | "false" | "0") => Ok(SudoMode::Never),
        Some(other) => Err(ConfigError::Invalid {
            key: "VPN_USE_SUDO",
            reason: format!("expected `auto`, `always` or `never`, got `{other}`"),
        }),
    }
}

/// Flat TOML table using the lowercase spelling of the env keys
#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    #[serde(flatten)]
    table: toml::Table,
}

impl FileSettings {
    fn read(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, &content)
    }

    fn parse(path: &Path, content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }

    fn get(&self, key: &str) -> Option<String> {
        match self.table.get(&key.to_ascii_lowercase())? {
            toml::Value::String(s) => Some(s.clone()),
            toml::Value::Integer(i) => Some(i.to_string()),
            toml::Value::Float(f) => Some(f.to_string()),
            toml::Value::Boolean(b) => Some(b.to_string()),
            toml::Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_minimal_local_log_config() {
        let config = AppConfig::from_lookup(lookup(&[
            ("NOTIFICATION_SYSTEMS", "local_log"),
            ("UPDATE_INTERVAL", "60"),
        ]))
        .unwrap();

        assert_eq!(config.sinks, vec![SinkKind::LocalLog]);
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(config.status_url, DEFAULT_STATUS_URL);
        assert!(config.tunnel.is_none());
        assert!(config.social.is_none());
        assert_eq!(config.sink_failure_policy, SinkFailurePolicy::Continue);
        assert_eq!(config.local_log_path, PathBuf::from(DEFAULT_LOCAL_LOG_PATH));
    }

    #[test]
    fn test_sink_aliases_are_deduplicated_in_dispatch_order() {
        let config = AppConfig::from_lookup(lookup(&[
            ("NOTIFICATION_SYSTEMS", "local-log, twitter,local_log"),
            ("UPDATE_INTERVAL", "30"),
            ("API_KEY", "k"),
            ("API_SECRET_KEY", "ks"),
            ("ACCESS_TOKEN", "t"),
            ("ACCESS_TOKEN_SECRET", "ts"),
        ]))
        .unwrap();

        assert_eq!(config.sinks, vec![SinkKind::Social, SinkKind::LocalLog]);
        assert_eq!(config.social.unwrap().api_url, DEFAULT_SOCIAL_API_URL);
    }

    #[test]
    fn test_unknown_sink_is_rejected() {
        let err = AppConfig::from_lookup(lookup(&[
            ("NOTIFICATION_SYSTEMS", "pager"),
            ("UPDATE_INTERVAL", "30"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "NOTIFICATION_SYSTEMS", .. }));
    }

    #[test]
    fn test_email_requires_credentials() {
        let err = AppConfig::from_lookup(lookup(&[
            ("NOTIFICATION_SYSTEMS", "email"),
            ("UPDATE_INTERVAL", "30"),
            ("EMAIL_RECIPIENTS", "a@example.com"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("EMAIL_USER")));
    }

    #[test]
    fn test_email_recipients_are_split() {
        let config = AppConfig::from_lookup(lookup(&[
            ("NOTIFICATION_SYSTEMS", "email"),
            ("UPDATE_INTERVAL", "30"),
            ("EMAIL_USER", "bot@example.com"),
            ("EMAIL_PASSWORD", "hunter2"),
            ("EMAIL_RECIPIENTS", "a@example.com, b@example.com,"),
        ]))
        .unwrap();

        let email = config.email.unwrap();
        assert_eq!(email.recipients, vec!["a@example.com", "b@example.com"]);
        assert_eq!(email.subject, DEFAULT_EMAIL_SUBJECT);
        assert_eq!(email.smtp_port, 465);
        assert!(!format!("{:?}", email.password).contains("hunter2"));
    }

    #[test]
    fn test_vpn_settings() {
        let config = AppConfig::from_lookup(lookup(&[
            ("NOTIFICATION_SYSTEMS", "local_log"),
            ("UPDATE_INTERVAL", "30"),
            ("USE_VPN", "true"),
            ("VPN_SWITCH_INTERVAL", "3600"),
            ("VPN_CONFIG_DIR", "/etc/openvpn/profiles"),
            ("VPN_CREDENTIALS_FILE", "/etc/openvpn/auth.txt"),
            ("VPN_HANDSHAKE_TIMEOUT", "0"),
            ("VPN_USE_SUDO", "never"),
        ]))
        .unwrap();

        let tunnel = config.tunnel.unwrap();
        assert_eq!(tunnel.rotation_interval, Duration::from_secs(3600));
        assert_eq!(tunnel.handshake_timeout, None);
        assert_eq!(tunnel.sudo, SudoMode::Never);
        assert_eq!(tunnel.settle_delay, Duration::from_secs(10));
        assert_eq!(tunnel.binary, "openvpn");
    }

    #[test]
    fn test_zero_poll_interval_is_rejected() {
        let err = AppConfig::from_lookup(lookup(&[
            ("NOTIFICATION_SYSTEMS", "local_log"),
            ("UPDATE_INTERVAL", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "UPDATE_INTERVAL", .. }));
    }

    #[test]
    fn test_oversized_intervals_are_rejected() {
        let too_long = (MAX_INTERVAL_SECS + 1).to_string();
        let err = AppConfig::from_lookup(lookup(&[
            ("NOTIFICATION_SYSTEMS", "local_log"),
            ("UPDATE_INTERVAL", u64::MAX.to_string().as_str()),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "UPDATE_INTERVAL", .. }));

        let err = AppConfig::from_lookup(lookup(&[
            ("NOTIFICATION_SYSTEMS", "local_log"),
            ("UPDATE_INTERVAL", "60"),
            ("USE_VPN", "yes"),
            ("VPN_SWITCH_INTERVAL", too_long.as_str()),
            ("VPN_CONFIG_DIR", "/etc/openvpn/profiles"),
            ("VPN_CREDENTIALS_FILE", "/etc/openvpn/auth.txt"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "VPN_SWITCH_INTERVAL", .. }));

        let week = MAX_INTERVAL_SECS.to_string();
        let config = AppConfig::from_lookup(lookup(&[
            ("NOTIFICATION_SYSTEMS", "local_log"),
            ("UPDATE_INTERVAL", week.as_str()),
        ]))
        .unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(MAX_INTERVAL_SECS));
    }

    #[test]
    fn test_file_settings_use_lowercase_keys() {
        let file = FileSettings::parse(
            Path::new("config.toml"),
            "notification_systems = [\"email\", \"local_log\"]\nupdate_interval = 45\nuse_vpn = false\n",
        )
        .unwrap();

        assert_eq!(file.get("NOTIFICATION_SYSTEMS").as_deref(), Some("email,local_log"));
        assert_eq!(file.get("UPDATE_INTERVAL").as_deref(), Some("45"));
        assert_eq!(file.get("USE_VPN").as_deref(), Some("false"));
        assert_eq!(file.get("STATUS_URL"), None);
    }
}
