//! Name server configuration.
//!
//! ```yaml
//! name_server:
//!   request_address: "tcp://127.0.0.1:5555"
//!   publish_address: "tcp://127.0.0.1:5556"   # optional
//!   poll_interval: "100ms"
//!   join_timeout: "5s"
//!   event_buffer: 1024
//!   log_level: "info"
//! ```

use crate::server::ServerOptions;
use crate::transport::TransportAddress;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NameServerConfig {
    #[serde(default)]
    pub name_server: NameServerOptions,
}

/// Name server options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameServerOptions {
    #[serde(default = "default_request_address")]
    pub request_address: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_address: Option<String>,

    #[serde(default = "default_poll_interval", with = "duration_serde")]
    pub poll_interval: Duration,

    #[serde(default = "default_join_timeout", with = "duration_serde")]
    pub join_timeout: Duration,

    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for NameServerOptions {
    fn default() -> Self {
        Self {
            request_address: default_request_address(),
            publish_address: None,
            poll_interval: default_poll_interval(),
            join_timeout: default_join_timeout(),
            event_buffer: default_event_buffer(),
            log_level: default_log_level(),
        }
    }
}

impl NameServerConfig {
    /// Load configuration from a YAML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        Self::load_from_string(&content)
    }

    /// Load configuration from a YAML string
    pub fn load_from_string(content: &str) -> Result<Self> {
        let config: NameServerConfig =
            serde_yaml::from_str(content).context("Failed to parse YAML configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let options = &self.name_server;

        TransportAddress::parse(&options.request_address)
            .map_err(|e| anyhow!("Invalid request_address: {}", e))?;
        if let Some(publish) = &options.publish_address {
            TransportAddress::parse(publish).map_err(|e| anyhow!("Invalid publish_address: {}", e))?;
            if *publish == options.request_address {
                return Err(anyhow!("publish_address must differ from request_address"));
            }
        }

        if options.poll_interval.is_zero() {
            return Err(anyhow!("poll_interval must be greater than 0"));
        }
        if options.join_timeout.is_zero() {
            return Err(anyhow!("join_timeout must be greater than 0"));
        }
        if options.event_buffer == 0 {
            return Err(anyhow!("event_buffer must be greater than 0"));
        }

        match options.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
            _ => Err(anyhow!(
                "Invalid log level: {}, must be one of: trace, debug, info, warn, error",
                options.log_level
            )),
        }
    }

    /// Runtime options for [`NameServer::new`](crate::NameServer::new).
    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            poll_interval: self.name_server.poll_interval,
            join_timeout: self.name_server.join_timeout,
            event_buffer: self.name_server.event_buffer,
        }
    }
}

fn default_request_address() -> String {
    "tcp://127.0.0.1:5555".to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_join_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_event_buffer() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

// Durations are written as "250ms", "5s" or "2m"
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() != 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        // Check for "ms" BEFORE "s" since "ms" ends with 's'
        if let Some(num) = s.strip_suffix("ms") {
            let millis: u64 = num.trim().parse().map_err(|_| format!("Invalid duration: {}", s))?;
            Ok(Duration::from_millis(millis))
        } else if let Some(num) = s.strip_suffix('s') {
            let secs: u64 = num.trim().parse().map_err(|_| format!("Invalid duration: {}", s))?;
            Ok(Duration::from_secs(secs))
        } else if let Some(num) = s.strip_suffix('m') {
            let mins: u64 = num.trim().parse().map_err(|_| format!("Invalid duration: {}", s))?;
            Ok(Duration::from_secs(mins * 60))
        } else {
            Err(format!("Duration must end with 's', 'ms', or 'm': {}", s))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_full_config() {
        let yaml = r#"
name_server:
  request_address: "tcp://*:6000"
  publish_address: "tcp://*:6001"
  poll_interval: "250ms"
  join_timeout: "2s"
  event_buffer: 64
  log_level: "debug"
"#;
        let config = NameServerConfig::load_from_string(yaml).unwrap();
        let options = &config.name_server;

        assert_eq!(options.request_address, "tcp://*:6000");
        assert_eq!(options.publish_address.as_deref(), Some("tcp://*:6001"));
        assert_eq!(options.poll_interval, Duration::from_millis(250));
        assert_eq!(options.join_timeout, Duration::from_secs(2));

        let server_options = config.server_options();
        assert_eq!(server_options.event_buffer, 64);
        assert_eq!(server_options.join_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_defaults_apply() {
        let config = NameServerConfig::load_from_string("name_server: {}\n").unwrap();
        assert_eq!(config, NameServerConfig::default());
        assert!(config.name_server.publish_address.is_none());
        assert_eq!(config.server_options(), ServerOptions::default());
    }

    #[test]
    fn test_validation_failures() {
        let cases = [
            "name_server:\n  request_address: \"localhost:5555\"\n",
            "name_server:\n  publish_address: \"tcp://127.0.0.1:5555\"\n",
            "name_server:\n  poll_interval: \"0ms\"\n",
            "name_server:\n  join_timeout: \"0s\"\n",
            "name_server:\n  event_buffer: 0\n",
            "name_server:\n  log_level: \"loud\"\n",
        ];

        for yaml in cases {
            assert!(NameServerConfig::load_from_string(yaml).is_err(), "accepted: {}", yaml);
        }
    }

    #[test]
    fn test_bad_duration_is_parse_error() {
        let err = NameServerConfig::load_from_string("name_server:\n  join_timeout: \"5 hours\"\n").unwrap_err();
        assert!(err.to_string().contains("Failed to parse YAML configuration"));
    }

    #[test]
    fn test_parse_duration() {
        use duration_serde::parse_duration;

        assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert!(parse_duration("5").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("name-server.yaml");
        std::fs::write(&path, "name_server:\n  request_address: \"tcp://127.0.0.1:7000\"\n").unwrap();

        let config = NameServerConfig::load_from_file(&path).unwrap();
        assert_eq!(config.name_server.request_address, "tcp://127.0.0.1:7000");

        assert!(NameServerConfig::load_from_file(dir.path().join("missing.yaml")).is_err());
    }
}
