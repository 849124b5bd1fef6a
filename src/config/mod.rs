//! Runtime configuration.
//!
//! Values come from CLI flags with environment fallbacks (`CLAWGATE_PORT`,
//! `CLAWGATE_BIND`, `CLAWGATE_TOKEN`, `CLAWGATE_STATE_DIR`); validation is
//! owned here so the composition root can refuse unsafe combinations before
//! binding a socket.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which interface the listener binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BindMode {
    /// 127.0.0.1 only.
    #[default]
    Loopback,
    /// 0.0.0.0; requires a configured auth token.
    Lan,
}

impl FromStr for BindMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "loopback" => Ok(Self::Loopback),
            "lan" => Ok(Self::Lan),
            other => Err(ConfigError::InvalidBindMode(other.to_string())),
        }
    }
}

impl std::fmt::Display for BindMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Loopback => write!(f, "loopback"),
            Self::Lan => write!(f, "lan"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid bind mode {0:?} (must be \"loopback\" or \"lan\")")]
    InvalidBindMode(String),
    #[error("invalid port: 0")]
    InvalidPort,
    #[error("refusing to start: bind mode \"lan\" requires an auth token to prevent unauthenticated access")]
    LanRequiresToken,
}

/// Runtime configuration for the gateway process.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: BindMode,
    pub auth_token: Option<String>,
    pub state_dir: PathBuf,
    pub tick_interval: Duration,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.bind == BindMode::Lan && self.auth_token.as_deref().unwrap_or_default().is_empty() {
            return Err(ConfigError::LanRequiresToken);
        }
        Ok(())
    }
}

/// Default state directory: `$CLAWGATE_STATE_DIR`, else `~/.clawgate`, else
/// `./.clawgate` when no home directory is resolvable.
pub fn default_state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CLAWGATE_STATE_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    match std::env::var_os("HOME") {
        Some(home) if !home.is_empty() => PathBuf::from(home).join(".clawgate"),
        _ => PathBuf::from(".clawgate"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(port: u16, bind: BindMode, token: Option<&str>) -> Config {
        Config {
            port,
            bind,
            auth_token: token.map(str::to_string),
            state_dir: PathBuf::from("/tmp/clawgate-test"),
            tick_interval: Duration::from_secs(15),
        }
    }

    #[test]
    fn bind_mode_parses() {
        assert_eq!("loopback".parse::<BindMode>().unwrap(), BindMode::Loopback);
        assert_eq!("lan".parse::<BindMode>().unwrap(), BindMode::Lan);
        assert!("both".parse::<BindMode>().is_err());
    }

    #[test]
    fn loopback_without_token_is_fine() {
        assert!(config(18789, BindMode::Loopback, None).validate().is_ok());
    }

    #[test]
    fn lan_requires_token() {
        assert!(matches!(
            config(18789, BindMode::Lan, None).validate(),
            Err(ConfigError::LanRequiresToken)
        ));
        assert!(matches!(
            config(18789, BindMode::Lan, Some("")).validate(),
            Err(ConfigError::LanRequiresToken)
        ));
        assert!(config(18789, BindMode::Lan, Some("secret")).validate().is_ok());
    }

    #[test]
    fn port_zero_rejected() {
        assert!(matches!(
            config(0, BindMode::Loopback, None).validate(),
            Err(ConfigError::InvalidPort)
        ));
    }
}
