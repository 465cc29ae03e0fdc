//! Directory scan and on-disk playlist cache.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use thiserror::Error;
use walkdir::{DirEntry, WalkDir};

use super::natural::natural_cmp;
use crate::config::Config;

#[derive(Error, Debug)]
pub enum PlaylistError {
  #[error("Media directory {0:?} not found")]
  DirectoryNotFound(PathBuf),
  #[error("No media files matching {pattern:?} in {dir:?}")]
  NoMatch { dir: PathBuf, pattern: String },
  #[error("Invalid file pattern: {0}")]
  InvalidPattern(String),
  #[error("Playlist I/O failed: {0}")]
  Io(#[from] std::io::Error),
}

/// Produces the ordered list of media files below a directory.
pub trait MediaScanner: Send + Sync {
  fn scan(&self, media_dir: &Path, pattern: &Regex) -> Result<Vec<PathBuf>, PlaylistError>;
}

/// Filesystem scanner.
///
/// Root files come first, then the files of each subdirectory tree, depth-first.
/// Every level is in natural order, files before directories. Symbolic links are
/// followed; a directory whose canonical path was already visited is not entered again.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsScanner;

impl FsScanner {
  fn matches(pattern: &Regex, path: &Path) -> bool {
    match path.file_name().and_then(|n| n.to_str()) {
      Some(name) => pattern.is_match(name),
      None => {
        log::debug!("Skipping non UTF-8 file name: {:?}", path);
        false
      }
    }
  }

  /// Sort key for a walk level: files first, then directories, each in natural order.
  fn level_order(a: &DirEntry, b: &DirEntry) -> std::cmp::Ordering {
    a.path()
      .is_dir()
      .cmp(&b.path().is_dir())
      .then_with(|| natural_cmp(&a.file_name().to_string_lossy(), &b.file_name().to_string_lossy()))
  }

  fn walk_subtree(
    dir: &Path,
    pattern: &Regex,
    visited: &mut HashSet<PathBuf>,
    out: &mut Vec<PathBuf>,
  ) {
    let walker = WalkDir::new(dir)
      .follow_links(true)
      .sort_by(Self::level_order)
      .into_iter()
      .filter_entry(|entry| {
        if !entry.file_type().is_dir() {
          return true;
        }
        match entry.path().canonicalize() {
          Ok(canonical) => {
            let fresh = visited.insert(canonical);
            if !fresh {
              log::debug!("Already visited {:?}, pruning", entry.path());
            }
            fresh
          }
          Err(e) => {
            log::warn!("Cannot resolve {:?}: {}", entry.path(), e);
            false
          }
        }
      });

    for item in walker {
      match item {
        Ok(entry) => {
          if entry.file_type().is_file() && Self::matches(pattern, entry.path()) {
            out.push(entry.into_path());
          }
        }
        Err(e) => log::warn!("Skipping unreadable entry during scan: {}", e),
      }
    }
  }
}

impl MediaScanner for FsScanner {
  fn scan(&self, media_dir: &Path, pattern: &Regex) -> Result<Vec<PathBuf>, PlaylistError> {
    if !media_dir.is_dir() {
      return Err(PlaylistError::DirectoryNotFound(media_dir.to_path_buf()));
    }
    let root = if media_dir.is_absolute() {
      media_dir.to_path_buf()
    } else {
      std::env::current_dir()?.join(media_dir)
    };

    let mut root_files = Vec::new();
    let mut sub_dirs = Vec::new();
    for entry in fs::read_dir(&root)? {
      let entry = entry?;
      let path = entry.path();
      let file_type = entry.file_type()?;

      // Dangling links count as non-directory links.
      let is_dir = if file_type.is_symlink() {
        fs::metadata(&path).map(|m| m.is_dir()).unwrap_or(false)
      } else {
        file_type.is_dir()
      };

      if is_dir {
        sub_dirs.push(path);
      } else if (file_type.is_file() || file_type.is_symlink()) && Self::matches(pattern, &path) {
        root_files.push(path);
      }
    }

    let by_name = |a: &PathBuf, b: &PathBuf| {
      natural_cmp(
        &a.file_name().unwrap_or_default().to_string_lossy(),
        &b.file_name().unwrap_or_default().to_string_lossy(),
      )
    };
    root_files.sort_by(by_name);
    sub_dirs.sort_by(by_name);

    let mut visited = HashSet::new();
    visited.insert(root.canonicalize()?);

    let mut files = root_files;
    for dir in &sub_dirs {
      Self::walk_subtree(dir, pattern, &mut visited, &mut files);
    }
    Ok(files)
  }
}

/// Builds or loads the playlist file for a config.
#[derive(Debug, Default)]
pub struct PlaylistBuilder<S = FsScanner> {
  scanner: S,
}

impl PlaylistBuilder<FsScanner> {
  pub fn new() -> Self {
    Self { scanner: FsScanner }
  }
}

impl<S: MediaScanner> PlaylistBuilder<S> {
  pub fn with_scanner(scanner: S) -> Self {
    Self { scanner }
  }

  /// Return the playlist for `config`.
  ///
  /// Without `force`, an existing playlist file is returned as-is and the media
  /// directory is not scanned. Otherwise the directory is scanned and the file rewritten.
  pub fn build(&self, config: &Config, force: bool) -> Result<Vec<PathBuf>, PlaylistError> {
    let playlist_path = config.playlist_path();

    if !force {
      if let Some(cached) = Self::load(&playlist_path) {
        log::info!("Using cached playlist {:?} ({} entries)", playlist_path, cached.len());
        return Ok(cached);
      }
    }

    if !config.media_dir.is_dir() {
      return Err(PlaylistError::DirectoryNotFound(config.media_dir.clone()));
    }
    let pattern = config
      .file_regex()
      .map_err(|e| PlaylistError::InvalidPattern(e.to_string()))?;

    let files = self.scanner.scan(&config.media_dir, &pattern)?;
    if files.is_empty() {
      return Err(PlaylistError::NoMatch {
        dir: config.media_dir.clone(),
        pattern: config.file_pattern.clone(),
      });
    }

    let body = files
      .iter()
      .map(|p| p.to_string_lossy())
      .collect::<Vec<_>>()
      .join("\n");
    fs::write(&playlist_path, body)?;

    log::info!("Playlist created with {} files at {:?}", files.len(), playlist_path);
    Ok(files)
  }

  /// Delete the persisted playlist. Failures are logged only.
  pub fn remove_cached(&self, config: &Config) {
    let path = config.playlist_path();
    match fs::remove_file(&path) {
      Ok(()) => log::info!("Removed playlist {:?}", path),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
      Err(e) => log::warn!("Failed to remove playlist {:?}: {}", path, e),
    }
  }

  /// Read a playlist file, one entry per line, blank lines included.
  /// An unreadable or blank file counts as absent.
  fn load(path: &Path) -> Option<Vec<PathBuf>> {
    if !path.is_file() {
      return None;
    }
    match fs::read_to_string(path) {
      Ok(content) if content.trim().is_empty() => None,
      Ok(content) => Some(content.lines().map(PathBuf::from).collect()),
      Err(e) => {
        log::warn!("Failed to read playlist {:?}: {}, rescanning", path, e);
        None
      }
    }
  }
}
