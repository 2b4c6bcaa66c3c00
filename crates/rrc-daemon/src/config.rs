//! On-disk daemon configuration: TOML file, env-var override for the data
//! directory, per-field defaults. Mirrors `ochra-daemon/src/config.rs`'s
//! shape (nested config structs, `#[serde(default = "fn")]` per field,
//! load-falls-back-to-default), applied to the handful of knobs the
//! entrypoint actually needs: where the identity lives, which hub to dial,
//! and the nickname/room to join on connect.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use rrc_protocol::sanitize::parse_hex_hash;

fn default_dest_name() -> String {
    "rrc.hub".to_string()
}

fn default_identity_filename() -> String {
    "identity".to_string()
}

fn default_hub_cache_filename() -> String {
    "hubs.json".to_string()
}

/// Identity-related configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// File name (relative to the data directory) the keypair is stored
    /// under, unless overridden with an absolute path.
    #[serde(default = "default_identity_filename")]
    pub path: String,
    /// Display nickname offered in HELLO/JOIN, if any.
    #[serde(default)]
    pub nickname: Option<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            path: default_identity_filename(),
            nickname: None,
        }
    }
}

/// Hub-related configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HubConfig {
    /// Destination aspect name the hub is reachable under.
    #[serde(default = "default_dest_name")]
    pub dest_name: String,
    /// Hex-encoded hub destination hash. Empty until the operator configures
    /// a hub to connect to.
    #[serde(default)]
    pub hash: String,
    /// Room to join automatically once welcomed, if any.
    #[serde(default)]
    pub auto_join_room: Option<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            dest_name: default_dest_name(),
            hash: String::new(),
            auto_join_room: None,
        }
    }
}

/// Top-level daemon configuration, loaded from `config.toml` in the data
/// directory (or the path named by `RRC_DAEMON_CONFIG`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default = "default_hub_cache_filename")]
    pub hub_cache_filename: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            hub: HubConfig::default(),
            hub_cache_filename: default_hub_cache_filename(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from `config_path()`, falling back to defaults if
    /// the file is missing or fails to parse.
    pub fn load() -> Self {
        let path = config_path();
        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(err) => {
                    tracing::warn!(error = %err, path = %path.display(), "failed to parse config, using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Resolve `identity.path` against the data directory unless it is
    /// already absolute.
    pub fn identity_path(&self) -> PathBuf {
        resolve(&self.identity.path)
    }

    /// Resolve the hub discovery cache's location against the data
    /// directory.
    pub fn hub_cache_path(&self) -> PathBuf {
        resolve(&self.hub_cache_filename)
    }

    /// Decode `hub.hash` as a byte vector, if set and well-formed.
    pub fn hub_hash_bytes(&self) -> Option<Vec<u8>> {
        if self.hub.hash.is_empty() {
            return None;
        }
        parse_hex_hash(&self.hub.hash)
    }

    /// Persist this configuration back to `config_path()`, creating the data
    /// directory first if needed.
    pub fn save(&self) -> std::io::Result<()> {
        let path = config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        std::fs::write(path, contents)
    }
}

fn resolve(filename: &str) -> PathBuf {
    let path = Path::new(filename);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        data_dir().join(path)
    }
}

/// Path to the config file: `RRC_DAEMON_CONFIG` if set, else
/// `{data_dir}/config.toml`.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("RRC_DAEMON_CONFIG") {
        return PathBuf::from(path);
    }
    data_dir().join("config.toml")
}

/// The daemon's data directory: `RRC_DATA_DIR` if set, else a
/// platform-appropriate default under the user's home directory.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("RRC_DATA_DIR") {
        return PathBuf::from(dir);
    }
    default_data_dir()
}

#[cfg(target_os = "macos")]
fn default_data_dir() -> PathBuf {
    dirs_fallback("Library/Application Support/rrc")
}

#[cfg(target_os = "linux")]
fn default_data_dir() -> PathBuf {
    dirs_fallback(".local/share/rrc")
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
fn default_data_dir() -> PathBuf {
    dirs_fallback(".rrc")
}

fn dirs_fallback(subpath: &str) -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(subpath)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_configured_hub() {
        let config = DaemonConfig::default();
        assert!(config.hub_hash_bytes().is_none());
        assert_eq!(config.hub.dest_name, "rrc.hub");
    }

    #[test]
    fn hub_hash_bytes_decodes_hex() {
        let mut config = DaemonConfig::default();
        config.hub.hash = "aabbccdd".to_string();
        assert_eq!(config.hub_hash_bytes(), Some(vec![0xaa, 0xbb, 0xcc, 0xdd]));
    }

    #[test]
    fn hub_hash_bytes_rejects_malformed_hex() {
        let mut config = DaemonConfig::default();
        config.hub.hash = "not-hex".to_string();
        assert_eq!(config.hub_hash_bytes(), None);
    }

    #[test]
    fn missing_config_file_falls_back_to_default() {
        std::env::set_var("RRC_DAEMON_CONFIG", "/nonexistent/path/config.toml");
        let config = DaemonConfig::load();
        assert_eq!(config.identity.path, "identity");
        std::env::remove_var("RRC_DAEMON_CONFIG");
    }

    #[test]
    fn save_then_load_round_trips() {
        let path = std::env::temp_dir().join(format!(
            "rrc-daemon-config-save-test-{}.toml",
            std::process::id()
        ));
        std::env::set_var("RRC_DAEMON_CONFIG", &path);

        let mut config = DaemonConfig::default();
        config.hub.hash = "aabbccdd".to_string();
        config.identity.nickname = Some("nick".to_string());
        config.save().expect("save");

        let reloaded = DaemonConfig::load();
        assert_eq!(reloaded.hub.hash, "aabbccdd");
        assert_eq!(reloaded.identity.nickname, Some("nick".to_string()));

        std::env::remove_var("RRC_DAEMON_CONFIG");
        let _ = std::fs::remove_file(&path);
    }
}
