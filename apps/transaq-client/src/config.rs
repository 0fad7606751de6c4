//! Client Configuration
//!
//! Session tuning knobs and broker credentials, loadable from environment
//! variables. The connector endpoint itself is never sourced from the
//! environment here; it is an explicit argument to the transport
//! constructor.

use std::time::Duration;

use crate::codec::XmlElement;
use crate::commands::EncodeError;

/// Session engine settings.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// How long `connect` waits for the connector's acknowledgement.
    pub connect_timeout: Duration,
    /// Deadline for a single command send on the transport.
    pub send_timeout: Duration,
    /// Capacity of the inbound payload channel inside the gRPC adapter.
    pub inbound_capacity: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(5),
            inbound_capacity: 1024,
        }
    }
}

impl ClientSettings {
    /// Create settings from environment variables, falling back to defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            connect_timeout: parse_env_duration_secs(
                "TRANSAQ_CLIENT_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout,
            ),
            send_timeout: parse_env_duration_secs(
                "TRANSAQ_CLIENT_SEND_TIMEOUT_SECS",
                defaults.send_timeout,
            ),
            inbound_capacity: parse_env_usize(
                "TRANSAQ_CLIENT_INBOUND_CAPACITY",
                defaults.inbound_capacity,
            ),
        }
    }
}

/// Broker session credentials and tuning for the `connect` command.
///
/// `Debug` redacts the password.
#[derive(Clone)]
pub struct ConnectParams {
    login: String,
    password: String,
    host: String,
    port: u16,
    rqdelay_ms: Option<u32>,
    session_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
    push_u_limits: Option<u32>,
    push_pos_equity: Option<u32>,
    milliseconds: bool,
}

impl ConnectParams {
    /// Create connect parameters with the default broker endpoint
    /// (`localhost:3939`).
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::InvalidParameter`] when login or password is
    /// empty.
    pub fn new(
        login: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, EncodeError> {
        let login = login.into();
        let password = password.into();
        if login.trim().is_empty() {
            return Err(EncodeError::InvalidParameter {
                name: "login",
                reason: "must not be empty".to_string(),
            });
        }
        if password.is_empty() {
            return Err(EncodeError::InvalidParameter {
                name: "password",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(Self {
            login,
            password,
            host: "localhost".to_string(),
            port: 3939,
            rqdelay_ms: None,
            session_timeout: None,
            request_timeout: None,
            push_u_limits: None,
            push_pos_equity: None,
            milliseconds: false,
        })
    }

    /// Create connect parameters from environment variables
    /// (`TRANSAQ_LOGIN`, `TRANSAQ_PASSWORD`, optional `TRANSAQ_HOST` and
    /// `TRANSAQ_PORT`).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for a missing or empty credential variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let login = require_env("TRANSAQ_LOGIN")?;
        let password = require_env("TRANSAQ_PASSWORD")?;
        let params = Self::new(login, password)
            .map_err(|_| ConfigError::EmptyValue("TRANSAQ_LOGIN".to_string()))?;
        let host = std::env::var("TRANSAQ_HOST").unwrap_or_else(|_| "localhost".to_string());
        let port = parse_env_u16("TRANSAQ_PORT", 3939);
        Ok(params.endpoint(host, port))
    }

    /// Override the broker server endpoint the connector should dial.
    #[must_use]
    pub fn endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Minimum delay between connector data pushes, in milliseconds.
    #[must_use]
    pub const fn rqdelay_ms(mut self, millis: u32) -> Self {
        self.rqdelay_ms = Some(millis);
        self
    }

    /// Broker session inactivity timeout.
    #[must_use]
    pub const fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Broker request timeout.
    #[must_use]
    pub const fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// United-portfolio limits push period, in seconds.
    #[must_use]
    pub const fn push_u_limits(mut self, seconds: u32) -> Self {
        self.push_u_limits = Some(seconds);
        self
    }

    /// Position equity push period, in seconds.
    #[must_use]
    pub const fn push_pos_equity(mut self, seconds: u32) -> Self {
        self.push_pos_equity = Some(seconds);
        self
    }

    /// Request millisecond-precision timestamps from the connector.
    #[must_use]
    pub const fn milliseconds(mut self) -> Self {
        self.milliseconds = true;
        self
    }

    /// Login name, for diagnostics.
    #[must_use]
    pub fn login(&self) -> &str {
        &self.login
    }

    pub(crate) fn fill_connect_command(&self, mut root: XmlElement) -> XmlElement {
        root = root
            .with_text_child("login", &self.login)
            .with_text_child("password", &self.password)
            .with_text_child("host", &self.host)
            .with_text_child("port", self.port.to_string());
        if let Some(millis) = self.rqdelay_ms {
            root = root.with_text_child("rqdelay", millis.to_string());
        }
        if let Some(timeout) = self.session_timeout {
            root = root.with_text_child("session_timeout", timeout.as_secs().to_string());
        }
        if let Some(timeout) = self.request_timeout {
            root = root.with_text_child("request_timeout", timeout.as_secs().to_string());
        }
        if let Some(seconds) = self.push_u_limits {
            root = root.with_text_child("push_u_limits", seconds.to_string());
        }
        if let Some(seconds) = self.push_pos_equity {
            root = root.with_text_child("push_pos_equity", seconds.to_string());
        }
        if self.milliseconds {
            root = root.with_text_child("milliseconds", "true");
        }
        root
    }
}

impl std::fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectParams")
            .field("login", &self.login)
            .field("password", &"[REDACTED]")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
}

fn require_env(key: &str) -> Result<String, ConfigError> {
    let value =
        std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))?;
    if value.is_empty() {
        return Err(ConfigError::EmptyValue(key.to_string()));
    }
    Ok(value)
}

fn parse_env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Command;

    #[test]
    fn default_settings() {
        let settings = ClientSettings::default();
        assert_eq!(settings.connect_timeout, Duration::from_secs(10));
        assert_eq!(settings.send_timeout, Duration::from_secs(5));
        assert_eq!(settings.inbound_capacity, 1024);
    }

    #[test]
    fn connect_params_require_credentials() {
        assert!(ConnectParams::new("", "secret").is_err());
        assert!(ConnectParams::new("TCNN1234", "").is_err());
    }

    #[test]
    fn debug_redacts_password() {
        let params = ConnectParams::new("TCNN1234", "hunter2").expect("valid");
        let rendered = format!("{params:?}");
        assert!(rendered.contains("TCNN1234"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn connect_command_encoding() {
        let params = ConnectParams::new("TCNN1234", "hunter2")
            .expect("valid")
            .endpoint("tr1.finam.ru", 3900)
            .rqdelay_ms(100)
            .milliseconds();
        let xml = Command::Connect(params).encode().expect("encodes");
        assert!(xml.starts_with("<command id=\"connect\">"));
        assert!(xml.contains("<login>TCNN1234</login>"));
        assert!(xml.contains("<host>tr1.finam.ru</host>"));
        assert!(xml.contains("<port>3900</port>"));
        assert!(xml.contains("<rqdelay>100</rqdelay>"));
        assert!(xml.contains("<milliseconds>true</milliseconds>"));
        assert!(!xml.contains("session_timeout"));
    }
}
