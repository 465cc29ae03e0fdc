//! Controller configuration, loaded once at startup.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("Failed to read config {path:?}: {source}")]
  Read {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("Failed to parse config: {0}")]
  Parse(#[from] serde_json::Error),
  #[error("Invalid config: {0}")]
  Invalid(String),
}

/// Controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
  /// Directory scanned for media files.
  pub media_dir: PathBuf,

  /// Regex a file name must fully match to enter the playlist.
  #[serde(default = "default_file_pattern")]
  pub file_pattern: String,

  /// Playlist file name, stored inside `media_dir`.
  #[serde(default = "default_playlist_file_name")]
  pub playlist_file_name: String,

  /// Path of the mpv control socket.
  #[serde(default = "default_socket_path")]
  pub socket_path: PathBuf,

  /// mpv output log. Empty or missing discards output; relative paths resolve against `media_dir`.
  #[serde(default)]
  pub log_path: Option<String>,

  /// Maximum seconds between state publications while playing.
  #[serde(default = "default_publish_interval")]
  pub publish_interval_seconds: u64,

  /// Custom MPV executable path (None = auto-detect).
  #[serde(default)]
  pub mpv_path: Option<String>,

  /// Additional MPV command-line arguments.
  #[serde(default)]
  pub mpv_args: Vec<String>,
}

fn default_file_pattern() -> String {
  r".*\.(mp4|mkv|avi|mov|webm)".to_string()
}

fn default_playlist_file_name() -> String {
  "playlist.txt".to_string()
}

fn default_socket_path() -> PathBuf {
  PathBuf::from("/tmp/mpv-bus.sock")
}

fn default_publish_interval() -> u64 {
  10
}

impl Config {
  /// Config with defaults for everything but the media directory.
  pub fn new(media_dir: impl Into<PathBuf>) -> Self {
    Self {
      media_dir: media_dir.into(),
      file_pattern: default_file_pattern(),
      playlist_file_name: default_playlist_file_name(),
      socket_path: default_socket_path(),
      log_path: None,
      publish_interval_seconds: default_publish_interval(),
      mpv_path: None,
      mpv_args: Vec::new(),
    }
  }

  /// Default config location: `<config dir>/mpv-bus/config.json`.
  pub fn default_path() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("mpv-bus");
    path.push("config.json");
    path
  }

  /// Read, parse and validate a JSON config file.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    let config: Config = serde_json::from_str(&content)?;
    config.validate()?;
    log::info!("Loaded config from {:?}", path);
    Ok(config)
  }

  /// Validate configuration values.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.media_dir.as_os_str().is_empty() {
      return Err(ConfigError::Invalid("mediaDir cannot be empty".to_string()));
    }
    self.file_regex()?;

    let name = Path::new(&self.playlist_file_name);
    if self.playlist_file_name.trim().is_empty() || name.file_name() != Some(name.as_os_str()) {
      return Err(ConfigError::Invalid(format!(
        "playlistFileName must be a bare file name, got {:?}",
        self.playlist_file_name
      )));
    }

    if self.publish_interval_seconds < 1 || self.publish_interval_seconds > 3600 {
      return Err(ConfigError::Invalid(
        "publishIntervalSeconds must be between 1 and 3600".to_string(),
      ));
    }

    if let Some(parent) = self.socket_path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent).map_err(|e| {
        ConfigError::Invalid(format!("socket directory {:?} unusable: {}", parent, e))
      })?;
    }

    Ok(())
  }

  /// Compile `file_pattern`, anchored so it must match the whole file name.
  pub fn file_regex(&self) -> Result<Regex, ConfigError> {
    Regex::new(&format!("^(?:{})$", self.file_pattern))
      .map_err(|e| ConfigError::Invalid(format!("filePattern: {}", e)))
  }

  /// Where the playlist is persisted.
  pub fn playlist_path(&self) -> PathBuf {
    self.media_dir.join(&self.playlist_file_name)
  }

  /// Resolve the player log location. `None` means discard output.
  pub fn resolved_log_path(&self) -> Option<PathBuf> {
    let raw = self.log_path.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
    let path = PathBuf::from(raw);
    if path.is_relative() {
      Some(self.media_dir.join(path))
    } else {
      Some(path)
    }
  }

  pub fn publish_interval(&self) -> std::time::Duration {
    std::time::Duration::from_secs(self.publish_interval_seconds)
  }
}
