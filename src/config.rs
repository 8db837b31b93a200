use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::parse_lease_time;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_path: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
    pub max_lifetime_seconds: u64,
    pub busy_timeout_seconds: u64,
    pub default_lease_time: String,
    pub allocation_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "nook.db".to_string(),
            max_connections: 10,
            min_connections: 0,
            acquire_timeout_seconds: 30,
            idle_timeout_seconds: 60,
            max_lifetime_seconds: 300,
            busy_timeout_seconds: 5,
            default_lease_time: "24h".to_string(),
            allocation_retries: 3,
        }
    }
}

impl Config {
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_path.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "database_path must not be empty".to_string(),
            ));
        }

        if self.max_connections == 0 {
            return Err(Error::InvalidConfig(
                "max_connections must be greater than 0".to_string(),
            ));
        }

        if self.min_connections > self.max_connections {
            return Err(Error::InvalidConfig(
                "min_connections must be less than or equal to max_connections".to_string(),
            ));
        }

        if parse_lease_time(&self.default_lease_time).is_err() {
            return Err(Error::InvalidConfig(format!(
                "default_lease_time '{}' is not a valid duration",
                self.default_lease_time
            )));
        }

        if self.allocation_retries == 0 {
            return Err(Error::InvalidConfig(
                "allocation_retries must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Database location with a leading `~/` expanded to the home directory.
    pub fn database_file(&self) -> PathBuf {
        if let Some(rest) = self.database_path.strip_prefix("~/")
            && let Some(home) = std::env::var_os("HOME")
        {
            return PathBuf::from(home).join(rest);
        }
        PathBuf::from(&self.database_path)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_seconds)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_seconds)
    }
}
