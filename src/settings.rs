//! Immutable settings shared by every callback.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::topic::{DeviceIdentity, InvalidDeviceIdentity};

/// Startup configuration errors. All of them are fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing MQTT username")]
    MissingMqttUsername,

    #[error("retry count must be at least 1")]
    ZeroRetryCount,

    #[error("invalid device password entry: {0}")]
    InvalidDeviceAddress(#[from] InvalidDeviceIdentity),

    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse device passwords in {path}: {source}")]
    DevicePasswords {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// JSON object mapping MAC address to device password.
#[derive(Debug, Default, Deserialize)]
#[serde(transparent)]
pub struct DevicePasswords(HashMap<String, String>);

impl DevicePasswords {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::DevicePasswords {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl From<HashMap<String, String>> for DevicePasswords {
    fn from(passwords: HashMap<String, String>) -> Self {
        Self(passwords)
    }
}

/// Reads a secret from the first line of a file, without the line break.
pub fn read_password_file(path: &Path) -> Result<String, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(text.lines().next().unwrap_or_default().to_string())
}

/// Settings bound at process start and shared read-only by all actors.
#[derive(Debug, Clone)]
pub struct CallbackSettings {
    retry_count: u32,
    device_passwords: HashMap<String, String>,
    fetch_device_info: bool,
    topic_prefix: String,
}

impl CallbackSettings {
    /// Validates the settings. Password keys are normalized to canonical MACs.
    pub fn new(
        retry_count: u32,
        device_passwords: DevicePasswords,
        fetch_device_info: bool,
        topic_prefix: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        if retry_count == 0 {
            return Err(ConfigError::ZeroRetryCount);
        }
        let device_passwords = device_passwords
            .0
            .into_iter()
            .map(|(mac, password)| {
                DeviceIdentity::parse(&mac).map(|identity| (identity.canonical().to_string(), password))
            })
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(Self {
            retry_count,
            device_passwords,
            fetch_device_info,
            topic_prefix: topic_prefix.into(),
        })
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn fetch_device_info(&self) -> bool {
        self.fetch_device_info
    }

    pub fn topic_prefix(&self) -> &str {
        &self.topic_prefix
    }

    pub fn device_password(&self, identity: &DeviceIdentity) -> Option<&str> {
        self.device_passwords
            .get(identity.canonical())
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn passwords_are_looked_up_case_insensitively() {
        let passwords = HashMap::from([("AA:BB:CC:DD:EE:FF".to_string(), "secret".to_string())]);
        let settings = CallbackSettings::new(3, passwords.into(), false, "homeassistant/").unwrap();

        let lower = DeviceIdentity::parse("aa:bb:cc:dd:ee:ff").unwrap();
        let bare = DeviceIdentity::parse("aabbccddeeff").unwrap();
        let other = DeviceIdentity::parse("11:22:33:44:55:66").unwrap();
        assert_eq!(settings.device_password(&lower), Some("secret"));
        assert_eq!(settings.device_password(&bare), Some("secret"));
        assert_eq!(settings.device_password(&other), None);
    }

    #[test]
    fn rejects_invalid_password_keys() {
        let passwords = HashMap::from([("kitchen".to_string(), "secret".to_string())]);
        let err = CallbackSettings::new(3, passwords.into(), false, "").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDeviceAddress(_)));
    }

    #[test]
    fn rejects_zero_retries() {
        let err = CallbackSettings::new(0, DevicePasswords::default(), false, "").unwrap_err();
        assert!(matches!(err, ConfigError::ZeroRetryCount));
    }

    #[test]
    fn loads_password_files() {
        let mut devices = tempfile::NamedTempFile::new().unwrap();
        write!(devices, r#"{{"11:22:33:44:55:66": "abc", "aabbccddeeff": "xyz"}}"#).unwrap();
        let passwords = DevicePasswords::load(devices.path()).unwrap();
        let settings = CallbackSettings::new(1, passwords, true, "").unwrap();
        let identity = DeviceIdentity::parse("AA:BB:CC:DD:EE:FF").unwrap();
        assert_eq!(settings.device_password(&identity), Some("xyz"));

        let mut broker = tempfile::NamedTempFile::new().unwrap();
        writeln!(broker, "hunter2").unwrap();
        writeln!(broker, "ignored").unwrap();
        assert_eq!(read_password_file(broker.path()).unwrap(), "hunter2");
    }

    #[test]
    fn reports_malformed_password_file() {
        let mut devices = tempfile::NamedTempFile::new().unwrap();
        write!(devices, "[1, 2]").unwrap();
        let err = DevicePasswords::load(devices.path()).unwrap_err();
        assert!(matches!(err, ConfigError::DevicePasswords { .. }));
    }
}
