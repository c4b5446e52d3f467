//! Node configuration, loadable from TOML.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// A round that has not resolved after this long is aborted.
    pub round_timeout_secs: u64,
    /// Bound on request/reply waits such as re-encryption share collection.
    pub request_timeout_secs: u64,
    pub max_faulty_dealers: usize,
    pub storage_namespace: String,
    pub mailbox_key: String,
    pub topic: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            round_timeout_secs: 30,
            request_timeout_secs: 30,
            max_faulty_dealers: 1,
            storage_namespace: "dkg".into(),
            mailbox_key: "inbox".into(),
            topic: "secret-committee".into(),
        }
    }
}

impl Config {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.round_timeout_secs == 0 || self.request_timeout_secs == 0 {
            return Err(Error::Config("timeouts must be positive".into()));
        }
        if self.storage_namespace.is_empty() || self.mailbox_key.is_empty() {
            return Err(Error::Config("storage keys must not be empty".into()));
        }
        Ok(())
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_secs(self.round_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml_str("round_timeout_secs = 5\ntopic = \"epoch\"\n").expect("parse");
        assert_eq!(config.round_timeout(), Duration::from_secs(5));
        assert_eq!(config.topic, "epoch");
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.max_faulty_dealers, 1);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        assert!(matches!(
            Config::from_toml_str("request_timeout_secs = 0"),
            Err(Error::Config(_))
        ));
    }
}
