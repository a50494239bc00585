//! Configuration management for the service.
//!
//! Loaded from `config.toml` under the service's config directory and
//! created with defaults on first run.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
   bluetooth::rfcomm::{DEFAULT_CHANNEL, validate_channel},
   error::{BtError, Result},
};

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
   #[serde(default = "default_channel")]
   pub rfcomm_channel: u8,

   #[serde(default = "default_backlog")]
   pub listen_backlog: i32,

   #[serde(default)]
   pub nonblocking_accept: bool,

   /// Unset waits for HCI command completion indefinitely.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub hci_timeout_ms: Option<u64>,

   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub remote_name_timeout_ms: Option<u64>,

   #[serde(default = "default_accept_poll_interval")]
   pub accept_poll_interval_ms: u64,
}

const fn default_channel() -> u8 {
   DEFAULT_CHANNEL
}

const fn default_backlog() -> i32 {
   5
}

const fn default_accept_poll_interval() -> u64 {
   500
}

impl Default for Config {
   fn default() -> Self {
      Self {
         rfcomm_channel: default_channel(),
         listen_backlog: default_backlog(),
         nonblocking_accept: false,
         hci_timeout_ms: None,
         remote_name_timeout_ms: None,
         accept_poll_interval_ms: default_accept_poll_interval(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   pub fn load_from(config_path: &Path) -> Result<Self> {
      let config = if config_path.exists() {
         let contents = fs::read_to_string(config_path)?;
         toml::from_str::<Self>(&contents)?
      } else {
         let config = Self::default();
         config.save_to(config_path)?;
         config
      };
      config.validate()?;
      Ok(config)
   }

   /// Saves the configuration to disk.
   pub fn save_to(&self, config_path: &Path) -> Result<()> {
      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(config_path, contents)?;

      Ok(())
   }

   pub fn validate(&self) -> Result<()> {
      validate_channel(self.rfcomm_channel)?;
      Ok(())
   }

   pub fn hci_timeout(&self) -> Option<Duration> {
      self.hci_timeout_ms.map(Duration::from_millis)
   }

   pub fn remote_name_timeout(&self) -> Option<Duration> {
      self.remote_name_timeout_ms.map(Duration::from_millis)
   }

   pub const fn accept_poll_interval(&self) -> Duration {
      Duration::from_millis(self.accept_poll_interval_ms)
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("HCICOMM_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Some(dir) = dirs::config_dir() {
         dir
      } else {
         return Err(BtError::ConfigDirNotFound);
      };

      Ok(config_dir.join("hcicomm").join("config.toml"))
   }
}
