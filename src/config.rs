//! Configuration persistence.
//!
//! Two files under the user config directory: `daemon.toml` with the global
//! ear-pause policy, and `devices.toml` with one table per peer (keyed by MAC
//! address, colons replaced with underscores). I/O failures here are never
//! fatal; defaults take over.

use std::{collections::BTreeMap, env, fs, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
   error::{Error, Result},
   media::EarPauseMode,
};

const CONFIG_DIR_NAME: &str = "librepods";
const CONFIG_FILE_NAME: &str = "daemon.toml";
const DEVICES_FILE_NAME: &str = "devices.toml";

/// Global daemon configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
   pub ear_pause_mode: EarPauseMode,
}

/// On-disk shape of the global configuration. The raw integer is validated
/// on load so a hand-edited file cannot poison the policy.
#[derive(Serialize, Deserialize)]
struct RawConfig {
   #[serde(default = "default_ear_pause_mode")]
   ear_pause_mode: i32,
}

const fn default_ear_pause_mode() -> i32 {
   EarPauseMode::OneOut as i32
}

impl Default for Config {
   fn default() -> Self {
      Self {
         ear_pause_mode: EarPauseMode::OneOut,
      }
   }
}

impl Config {
   /// Loads the global configuration, creating a default file if none exists.
   pub fn load() -> Result<Self> {
      Self::load_in(&config_dir()?)
   }

   /// Saves the global configuration.
   pub fn save(&self) -> Result<()> {
      self.save_in(&config_dir()?)
   }

   fn load_in(dir: &PathBuf) -> Result<Self> {
      let path = dir.join(CONFIG_FILE_NAME);
      if !path.exists() {
         let config = Self::default();
         config.save_in(dir)?;
         return Ok(config);
      }

      let contents = fs::read_to_string(&path)?;
      let raw: RawConfig = toml::from_str(&contents)?;
      Ok(Self {
         ear_pause_mode: EarPauseMode::from_repr(raw.ear_pause_mode)
            .unwrap_or(EarPauseMode::OneOut),
      })
   }

   fn save_in(&self, dir: &PathBuf) -> Result<()> {
      fs::create_dir_all(dir)?;
      let raw = RawConfig {
         ear_pause_mode: self.ear_pause_mode as i32,
      };
      fs::write(dir.join(CONFIG_FILE_NAME), toml::to_string_pretty(&raw)?)?;
      Ok(())
   }
}

/// Per-peer settings, persisted as the peer reports or the user changes them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
   #[serde(default)]
   pub display_name: String,

   #[serde(default)]
   pub off_enabled: bool,
   #[serde(default = "default_true")]
   pub transparency_enabled: bool,
   #[serde(default = "default_true")]
   pub anc_enabled: bool,
   #[serde(default = "default_true")]
   pub adaptive_enabled: bool,

   #[serde(default)]
   pub conversational_awareness: bool,

   #[serde(default = "default_adaptive_level")]
   pub adaptive_level: i32,

   #[serde(default = "default_noise_mode")]
   pub noise_control_mode: String,

   #[serde(default)]
   pub has_saved_settings: bool,
}

const fn default_true() -> bool {
   true
}

const fn default_adaptive_level() -> i32 {
   50
}

fn default_noise_mode() -> String {
   "off".to_owned()
}

impl Default for DeviceProfile {
   fn default() -> Self {
      Self {
         display_name: String::new(),
         off_enabled: false,
         transparency_enabled: true,
         anc_enabled: true,
         adaptive_enabled: true,
         conversational_awareness: false,
         adaptive_level: default_adaptive_level(),
         noise_control_mode: default_noise_mode(),
         has_saved_settings: false,
      }
   }
}

impl DeviceProfile {
   /// Loads the profile stored for `address`, if any.
   pub fn load(address: &str) -> Option<Self> {
      let dir = config_dir().ok()?;
      Self::load_in(&dir, address)
   }

   /// Persists this profile for `address`.
   pub fn store(&self, address: &str) -> Result<()> {
      self.store_in(&config_dir()?, address)
   }

   fn load_in(dir: &PathBuf, address: &str) -> Option<Self> {
      let contents = fs::read_to_string(dir.join(DEVICES_FILE_NAME)).ok()?;
      let mut profiles: BTreeMap<String, Self> = toml::from_str(&contents).ok()?;
      profiles.remove(&profile_key(address))
   }

   fn store_in(&self, dir: &PathBuf, address: &str) -> Result<()> {
      fs::create_dir_all(dir)?;
      let path = dir.join(DEVICES_FILE_NAME);

      let mut profiles: BTreeMap<String, Self> = match fs::read_to_string(&path) {
         Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
         Err(_) => BTreeMap::new(),
      };
      profiles.insert(profile_key(address), self.clone());

      fs::write(path, toml::to_string_pretty(&profiles)?)?;
      Ok(())
   }
}

/// Table key for a peer: its MAC with colons replaced by underscores, so the
/// key stays a bare TOML identifier.
pub fn profile_key(address: &str) -> String {
   address.replace(':', "_")
}

fn config_dir() -> Result<PathBuf> {
   // Environment override first, mostly for tests and packaging.
   if let Ok(path) = env::var("LIBREPODS_CONFIG_DIR") {
      return Ok(PathBuf::from(path));
   }

   Ok(dirs::config_dir()
      .ok_or(Error::ConfigDirNotFound)?
      .join(CONFIG_DIR_NAME))
}

#[cfg(test)]
mod tests {
   use super::*;

   use tempfile::TempDir;

   #[test]
   fn profile_key_replaces_colons() {
      assert_eq!(profile_key("AA:BB:CC:DD:EE:FF"), "AA_BB_CC_DD_EE_FF");
   }

   #[test]
   fn config_round_trip() {
      let dir = TempDir::new().unwrap();
      let dir = dir.path().to_path_buf();

      // First load creates the default file.
      let config = Config::load_in(&dir).unwrap();
      assert_eq!(config.ear_pause_mode, EarPauseMode::OneOut);
      assert!(dir.join(CONFIG_FILE_NAME).exists());

      let config = Config {
         ear_pause_mode: EarPauseMode::BothOut,
      };
      config.save_in(&dir).unwrap();
      assert_eq!(Config::load_in(&dir).unwrap(), config);
   }

   #[test]
   fn invalid_ear_pause_mode_falls_back() {
      let dir = TempDir::new().unwrap();
      let dir = dir.path().to_path_buf();
      fs::write(dir.join(CONFIG_FILE_NAME), "ear_pause_mode = 9\n").unwrap();

      let config = Config::load_in(&dir).unwrap();
      assert_eq!(config.ear_pause_mode, EarPauseMode::OneOut);
   }

   #[test]
   fn profile_round_trip() {
      let dir = TempDir::new().unwrap();
      let dir = dir.path().to_path_buf();

      assert!(DeviceProfile::load_in(&dir, "AA:BB:CC:DD:EE:FF").is_none());

      let profile = DeviceProfile {
         display_name: "Office buds".to_owned(),
         off_enabled: true,
         transparency_enabled: false,
         anc_enabled: true,
         adaptive_enabled: true,
         conversational_awareness: true,
         adaptive_level: 80,
         noise_control_mode: "anc".to_owned(),
         has_saved_settings: true,
      };
      profile.store_in(&dir, "AA:BB:CC:DD:EE:FF").unwrap();

      let loaded = DeviceProfile::load_in(&dir, "AA:BB:CC:DD:EE:FF").unwrap();
      assert_eq!(loaded, profile);

      // A second peer lands in its own table.
      let other = DeviceProfile::default();
      other.store_in(&dir, "11:22:33:44:55:66").unwrap();
      assert_eq!(
         DeviceProfile::load_in(&dir, "AA:BB:CC:DD:EE:FF").unwrap(),
         profile
      );
      assert_eq!(
         DeviceProfile::load_in(&dir, "11:22:33:44:55:66").unwrap(),
         other
      );
   }
}
