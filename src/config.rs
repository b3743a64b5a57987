//! Configuration for the sidecar.
//!
//! [`SidecarConfig`] is built once at startup, either through the builder
//! methods or from the process environment, and is read-only afterwards.

use crate::notify::{EventKind, PayloadFormat};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Default control port address.
pub const DEFAULT_CONTROL_ADDRESS: &str = "127.0.0.1:9051";

/// Default egress verification endpoint.
pub const DEFAULT_EXTERNAL_ENDPOINT: &str = "https://check.torproject.org/api/ip";

/// Local SOCKS proxy every egress probe is routed through.
pub const DEFAULT_PROXY_URL: &str = "socks5h://127.0.0.1:9050";

/// Errors found while validating a configuration.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// Control port address is empty.
    #[error("control port address must not be empty")]
    EmptyControlAddress,

    /// A timeout was configured as zero.
    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),

    /// The webhook URL is not an http(s) URL.
    #[error("invalid webhook URL '{0}': expected http:// or https://")]
    InvalidWebhookUrl(String),
}

/// Settings for the control-port connection.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// `host:port` of the control port.
    pub address: String,
    /// Shared secret sent with AUTHENTICATE, if any.
    pub password: Option<String>,
    /// Bound on dialing and authenticating.
    pub connect_timeout: Duration,
    /// Bound on one command/reply exchange.
    pub command_timeout: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_CONTROL_ADDRESS.to_string(),
            password: None,
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(10),
        }
    }
}

/// Settings for webhook notifications.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Receiver URL; `None` disables notifications.
    pub url: Option<String>,
    /// Payload dialect.
    pub format: PayloadFormat,
    /// Event kinds that are delivered.
    pub events: Vec<EventKind>,
    /// Bound on one delivery.
    pub timeout: Duration,
    /// Cap on concurrently running deliveries.
    pub max_in_flight: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: None,
            format: PayloadFormat::Discord,
            events: EventKind::ALL.to_vec(),
            timeout: Duration::from_secs(10),
            max_in_flight: 8,
        }
    }
}

/// Complete sidecar configuration.
#[derive(Debug, Clone)]
pub struct SidecarConfig {
    /// Control-port connection settings.
    pub control: ControlConfig,
    /// Port the HTTP server listens on.
    pub http_port: u16,
    /// Per-request timeout for egress probes.
    pub external_timeout: Duration,
    /// Egress verification endpoints, tried in order.
    pub external_endpoints: Vec<String>,
    /// Proxy URL used by egress probes.
    pub proxy_url: String,
    /// Log level name (`DEBUG`, `INFO`, ...).
    pub log_level: String,
    /// Webhook notification settings.
    pub webhook: WebhookConfig,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            control: ControlConfig::default(),
            http_port: 8085,
            external_timeout: Duration::from_secs(15),
            external_endpoints: vec![DEFAULT_EXTERNAL_ENDPOINT.to_string()],
            proxy_url: DEFAULT_PROXY_URL.to_string(),
            log_level: "INFO".to_string(),
            webhook: WebhookConfig::default(),
        }
    }
}

impl SidecarConfig {
    /// Create a new configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the control port address.
    pub fn control_address(mut self, address: impl Into<String>) -> Self {
        self.control.address = address.into();
        self
    }

    /// Set the control port shared secret.
    pub fn control_password(mut self, password: impl Into<String>) -> Self {
        self.control.password = Some(password.into());
        self
    }

    /// Set the control-port dial timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.control.connect_timeout = timeout;
        self
    }

    /// Set the control-port command timeout.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.control.command_timeout = timeout;
        self
    }

    /// Set the HTTP listen port.
    pub fn http_port(mut self, port: u16) -> Self {
        self.http_port = port;
        self
    }

    /// Set the egress probe timeout.
    pub fn external_timeout(mut self, timeout: Duration) -> Self {
        self.external_timeout = timeout;
        self
    }

    /// Replace the egress verification endpoints.
    pub fn external_endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.external_endpoints = endpoints.into_iter().map(Into::into).collect();
        self
    }

    /// Set the webhook receiver URL.
    pub fn webhook_url(mut self, url: impl Into<String>) -> Self {
        self.webhook.url = Some(url.into());
        self
    }

    /// Set the webhook payload dialect.
    pub fn webhook_format(mut self, format: PayloadFormat) -> Self {
        self.webhook.format = format;
        self
    }

    /// Restrict which events are delivered.
    pub fn webhook_events(mut self, events: &[EventKind]) -> Self {
        self.webhook.events = events.to_vec();
        self
    }

    /// Set the webhook delivery timeout.
    pub fn webhook_timeout(mut self, timeout: Duration) -> Self {
        self.webhook.timeout = timeout;
        self
    }

    /// Read only `LOG_LEVEL` from the process environment.
    ///
    /// The binary installs tracing with this before [`SidecarConfig::from_env`]
    /// so that fallback warnings raised while loading are not lost.
    pub fn log_level_from_env() -> String {
        log_level_from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// Values are trimmed and empty values count as unset. Malformed
    /// numbers and durations fall back to their defaults with a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let defaults = Self::default();

        let control = ControlConfig {
            address: get("TOR_CONTROL_ADDRESS").unwrap_or(defaults.control.address),
            password: get("TOR_CONTROL_PASSWORD"),
            ..defaults.control
        };

        let http_port = parse_or("HEALTH_PORT", get("HEALTH_PORT"), defaults.http_port);

        let external_timeout = get("HEALTH_EXTERNAL_TIMEOUT")
            .map(|raw| {
                Duration::from_secs(parse_or(
                    "HEALTH_EXTERNAL_TIMEOUT",
                    Some(raw),
                    defaults.external_timeout.as_secs(),
                ))
            })
            .unwrap_or(defaults.external_timeout);

        let external_endpoints = get("HEALTH_EXTERNAL_ENDPOINTS")
            .map(|raw| split_list(&raw))
            .filter(|list| !list.is_empty())
            .unwrap_or(defaults.external_endpoints);

        let log_level = log_level_from_lookup(&lookup);

        let format = match get("WEBHOOK_TEMPLATE") {
            None => PayloadFormat::Discord,
            Some(raw) => PayloadFormat::parse(&raw).unwrap_or_else(|| {
                warn!(
                    template = %raw,
                    valid_options = "discord, slack, gotify, json",
                    "invalid webhook template, defaulting to json"
                );
                PayloadFormat::Json
            }),
        };

        let events = get("WEBHOOK_EVENTS")
            .map(|raw| parse_events(&raw))
            .filter(|events| !events.is_empty())
            .unwrap_or(defaults.webhook.events);

        let timeout = get("WEBHOOK_TIMEOUT")
            .map(|raw| parse_duration_or("WEBHOOK_TIMEOUT", &raw, defaults.webhook.timeout))
            .unwrap_or(defaults.webhook.timeout);

        Self {
            control,
            http_port,
            external_timeout,
            external_endpoints,
            proxy_url: defaults.proxy_url,
            log_level,
            webhook: WebhookConfig {
                url: get("WEBHOOK_URL"),
                format,
                events,
                timeout,
                max_in_flight: defaults.webhook.max_in_flight,
            },
        }
    }

    /// Reject configurations the sidecar cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.control.address.trim().is_empty() {
            return Err(ConfigError::EmptyControlAddress);
        }
        if self.control.connect_timeout.is_zero() || self.control.command_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("control timeout"));
        }
        if self.external_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("external check timeout"));
        }
        if self.webhook.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("webhook timeout"));
        }
        if let Some(url) = &self.webhook.url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::InvalidWebhookUrl(url.clone()));
            }
        }
        Ok(())
    }
}

/// `LOG_LEVEL`, upper-cased, or `INFO` when unset or blank.
pub fn log_level_from_lookup<F>(lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup("LOG_LEVEL")
        .map(|level| level.trim().to_uppercase())
        .filter(|level| !level.is_empty())
        .unwrap_or_else(|| "INFO".to_string())
}

fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display + Copy,
    T::Err: std::fmt::Display,
{
    let Some(raw) = raw else {
        return default;
    };

    match raw.parse() {
        Ok(value) => value,
        Err(err) => {
            warn!(key, value = %raw, default = %default, error = %err, "invalid configuration value");
            default
        }
    }
}

/// Durations accept humantime syntax (`30s`, `1m 30s`); bare integers are seconds.
fn parse_duration_or(key: &str, raw: &str, default: Duration) -> Duration {
    if let Ok(secs) = raw.parse::<u64>() {
        return Duration::from_secs(secs);
    }

    match humantime::parse_duration(raw) {
        Ok(duration) => duration,
        Err(err) => {
            warn!(
                key,
                value = %raw,
                default = ?default,
                error = %err,
                "invalid duration configuration value"
            );
            default
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_events(raw: &str) -> Vec<EventKind> {
    split_list(raw)
        .into_iter()
        .filter_map(|name| {
            let kind = EventKind::parse(&name);
            if kind.is_none() {
                warn!(event = %name, "ignoring unknown webhook event");
            }
            kind
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> SidecarConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SidecarConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]);
        assert_eq!(config.control.address, "127.0.0.1:9051");
        assert!(config.control.password.is_none());
        assert_eq!(config.http_port, 8085);
        assert_eq!(config.external_timeout, Duration::from_secs(15));
        assert_eq!(config.external_endpoints, vec![DEFAULT_EXTERNAL_ENDPOINT]);
        assert_eq!(config.log_level, "INFO");
        assert!(config.webhook.url.is_none());
        assert_eq!(config.webhook.format, PayloadFormat::Discord);
        assert_eq!(config.webhook.events, EventKind::ALL.to_vec());
        assert_eq!(config.webhook.timeout, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_log_level_read_on_its_own() {
        let asked = std::sync::Mutex::new(Vec::new());
        let level = log_level_from_lookup(|key| {
            asked.lock().unwrap().push(key.to_string());
            Some(" debug ".to_string())
        });

        assert_eq!(level, "DEBUG");
        assert_eq!(*asked.lock().unwrap(), vec!["LOG_LEVEL"]);
        assert_eq!(log_level_from_lookup(|_| Some("  ".to_string())), "INFO");
        assert_eq!(log_level_from_lookup(|_| None), "INFO");
        assert_eq!(load(&[("LOG_LEVEL", "warn")]).log_level, "WARN");
    }

    #[test]
    fn test_custom_values() {
        let config = load(&[
            ("TOR_CONTROL_ADDRESS", "localhost:9999"),
            ("TOR_CONTROL_PASSWORD", "secret123"),
            ("HEALTH_PORT", "9000"),
            ("HEALTH_EXTERNAL_TIMEOUT", "30"),
            (
                "HEALTH_EXTERNAL_ENDPOINTS",
                "https://example.com/api, ,https://test.com/check",
            ),
            ("LOG_LEVEL", "debug"),
            ("WEBHOOK_URL", "https://hooks.example.com/webhook"),
            ("WEBHOOK_TEMPLATE", "Slack"),
            ("WEBHOOK_EVENTS", "circuit_renewed,bootstrap_failed"),
            ("WEBHOOK_TIMEOUT", "30s"),
        ]);

        assert_eq!(config.control.address, "localhost:9999");
        assert_eq!(config.control.password.as_deref(), Some("secret123"));
        assert_eq!(config.http_port, 9000);
        assert_eq!(config.external_timeout, Duration::from_secs(30));
        assert_eq!(
            config.external_endpoints,
            vec!["https://example.com/api", "https://test.com/check"]
        );
        assert_eq!(config.log_level, "DEBUG");
        assert_eq!(
            config.webhook.url.as_deref(),
            Some("https://hooks.example.com/webhook")
        );
        assert_eq!(config.webhook.format, PayloadFormat::Slack);
        assert_eq!(
            config.webhook.events,
            vec![EventKind::CircuitRenewed, EventKind::BootstrapFailed]
        );
        assert_eq!(config.webhook.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = load(&[
            ("HEALTH_PORT", "not-a-port"),
            ("HEALTH_EXTERNAL_TIMEOUT", "soon"),
            ("WEBHOOK_TIMEOUT", "forever"),
            ("WEBHOOK_TEMPLATE", "teams"),
            ("WEBHOOK_EVENTS", "nonsense"),
        ]);

        assert_eq!(config.http_port, 8085);
        assert_eq!(config.external_timeout, Duration::from_secs(15));
        assert_eq!(config.webhook.timeout, Duration::from_secs(10));
        assert_eq!(config.webhook.format, PayloadFormat::Json);
        assert_eq!(config.webhook.events, EventKind::ALL.to_vec());
    }

    #[test]
    fn test_whitespace_counts_as_unset() {
        let config = load(&[("TOR_CONTROL_ADDRESS", "   "), ("TOR_CONTROL_PASSWORD", " ")]);
        assert_eq!(config.control.address, DEFAULT_CONTROL_ADDRESS);
        assert!(config.control.password.is_none());
    }

    #[test]
    fn test_bare_integer_duration() {
        let config = load(&[("WEBHOOK_TIMEOUT", "7")]);
        assert_eq!(config.webhook.timeout, Duration::from_secs(7));
    }

    #[test]
    fn test_config_builder() {
        let config = SidecarConfig::new()
            .control_address("tor:9051")
            .control_password("hunter2")
            .connect_timeout(Duration::from_secs(1))
            .http_port(0)
            .external_endpoints(["https://ipinfo.io/json"])
            .webhook_url("http://localhost:1/hook")
            .webhook_format(PayloadFormat::Gotify)
            .webhook_events(&[EventKind::HealthChanged]);

        assert_eq!(config.control.address, "tor:9051");
        assert_eq!(config.control.password.as_deref(), Some("hunter2"));
        assert_eq!(config.control.connect_timeout, Duration::from_secs(1));
        assert_eq!(config.external_endpoints, vec!["https://ipinfo.io/json"]);
        assert_eq!(config.webhook.events, vec![EventKind::HealthChanged]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = SidecarConfig::new().control_address(" ");
        assert_eq!(config.validate(), Err(ConfigError::EmptyControlAddress));

        let config = SidecarConfig::new().webhook_timeout(Duration::ZERO);
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroTimeout("webhook timeout"))
        );

        let config = SidecarConfig::new().webhook_url("ftp://example.com");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidWebhookUrl(_))
        ));
    }
}
