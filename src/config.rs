//! Key/value configuration and the template written on first start

use std::collections::HashMap;
use std::path::Path;

use crate::access::AllowList;
use crate::error::RelayError;
use crate::graph::GraphCredentials;

pub const DEFAULT_PORT: u16 = 25;
pub const DEFAULT_HOSTNAME: &str = "smtp-relay.local";
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 25 * 1024 * 1024;

pub const TEMPLATE: &str = "ALLOWED_IPS=127.0.0.1,192.168.0.0/24
SMTP_PORT=25
TENANT_ID=your_tenant_id_here
CLIENT_ID=your_client_id_here
CLIENT_SECRET=your_client_secret_here
SENDER=default_sender@example.com
";

const KEYS: [&str; 9] = [
    "ALLOWED_IPS",
    "SMTP_PORT",
    "SMTP_HOSTNAME",
    "TENANT_ID",
    "CLIENT_ID",
    "CLIENT_SECRET",
    "SENDER",
    "MAX_MESSAGE_SIZE",
    "SAVE_TO_SENT_ITEMS",
];

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub allow_list: AllowList,
    pub port: u16,
    pub hostname: String,
    pub sender: String,
    pub credentials: GraphCredentials,
    pub max_message_size: usize,
    pub save_to_sent_items: bool,
}

impl RelayConfig {
    /// Builds the configuration from already-collected settings.
    pub fn from_map(values: &HashMap<String, String>) -> Result<Self, RelayError> {
        let optional = |key: &str| {
            values
                .get(key)
                .map(|value| value.trim())
                .filter(|value| !value.is_empty())
        };
        let required = |key: &str| {
            optional(key)
                .map(str::to_string)
                .ok_or_else(|| RelayError::ConfigurationMissing(key.to_string()))
        };

        let port = match optional("SMTP_PORT") {
            Some(value) => value.parse().map_err(|_| RelayError::InvalidConfiguration {
                key: "SMTP_PORT",
                value: value.to_string(),
            })?,
            None => DEFAULT_PORT,
        };

        let max_message_size = match optional("MAX_MESSAGE_SIZE") {
            Some(value) => value.parse().map_err(|_| RelayError::InvalidConfiguration {
                key: "MAX_MESSAGE_SIZE",
                value: value.to_string(),
            })?,
            None => DEFAULT_MAX_MESSAGE_SIZE,
        };

        let save_to_sent_items = match optional("SAVE_TO_SENT_ITEMS") {
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => true,
                "false" | "no" | "0" => false,
                _ => {
                    return Err(RelayError::InvalidConfiguration {
                        key: "SAVE_TO_SENT_ITEMS",
                        value: value.to_string(),
                    })
                }
            },
            None => true,
        };

        Ok(Self {
            allow_list: AllowList::parse(optional("ALLOWED_IPS").unwrap_or_default()),
            port,
            hostname: optional("SMTP_HOSTNAME")
                .unwrap_or(DEFAULT_HOSTNAME)
                .to_string(),
            sender: required("SENDER")?,
            credentials: GraphCredentials {
                tenant_id: required("TENANT_ID")?,
                client_id: required("CLIENT_ID")?,
                client_secret: required("CLIENT_SECRET")?,
            },
            max_message_size,
            save_to_sent_items,
        })
    }

    /// Loads `path` into the process environment, then reads every known
    /// key from it. Variables already set in the environment win.
    pub fn load(path: &Path) -> Result<Self, RelayError> {
        dotenvy::from_path(path).map_err(|e| {
            RelayError::ConfigurationMissing(format!("{}: {}", path.display(), e))
        })?;

        let values = KEYS
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|value| (key.to_string(), value)))
            .collect();
        Self::from_map(&values)
    }
}

/// Writes the template when `path` does not exist yet.
///
/// Returns `true` if a template was written, in which case the caller must
/// not start the relay.
pub fn provision_template(path: &Path) -> Result<bool, RelayError> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, TEMPLATE)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    fn complete() -> HashMap<String, String> {
        settings(&[
            ("TENANT_ID", "tenant"),
            ("CLIENT_ID", "client"),
            ("CLIENT_SECRET", "secret"),
            ("SENDER", "Relay <relay@example.com>"),
        ])
    }

    #[test]
    fn test_defaults() {
        let config = RelayConfig::from_map(&complete()).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.hostname, DEFAULT_HOSTNAME);
        assert_eq!(config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
        assert!(config.save_to_sent_items);
        assert!(config.allow_list.is_empty());
        assert_eq!(config.sender, "Relay <relay@example.com>");
        assert_eq!(config.credentials.tenant_id, "tenant");
    }

    #[test]
    fn test_overrides() {
        let mut values = complete();
        values.extend(settings(&[
            ("ALLOWED_IPS", "127.0.0.1, 192.168.0.0/24"),
            ("SMTP_PORT", "2525"),
            ("SMTP_HOSTNAME", "relay.example.com"),
            ("MAX_MESSAGE_SIZE", "1024"),
            ("SAVE_TO_SENT_ITEMS", "no"),
        ]));
        let config = RelayConfig::from_map(&values).unwrap();
        assert_eq!(config.port, 2525);
        assert_eq!(config.hostname, "relay.example.com");
        assert_eq!(config.max_message_size, 1024);
        assert!(!config.save_to_sent_items);
        assert_eq!(config.allow_list.len(), 2);
    }

    #[test]
    fn test_missing_required_key() {
        let mut values = complete();
        values.insert("CLIENT_SECRET".into(), "   ".into());
        match RelayConfig::from_map(&values) {
            Err(RelayError::ConfigurationMissing(key)) => assert_eq!(key, "CLIENT_SECRET"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_invalid_port() {
        let mut values = complete();
        values.insert("SMTP_PORT".into(), "70000".into());
        assert!(matches!(
            RelayConfig::from_map(&values),
            Err(RelayError::InvalidConfiguration { key: "SMTP_PORT", .. })
        ));
    }

    #[test]
    fn test_provision_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay").join(".env");

        assert!(provision_template(&path).unwrap());
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("ALLOWED_IPS=127.0.0.1,192.168.0.0/24"));
        assert!(written.contains("SENDER=default_sender@example.com"));

        assert!(!provision_template(&path).unwrap());
    }

    #[test]
    fn test_template_is_loadable() {
        let values = TEMPLATE
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        let config = RelayConfig::from_map(&values).unwrap();
        assert_eq!(config.port, 25);
        assert_eq!(config.allow_list.len(), 2);
    }
}
