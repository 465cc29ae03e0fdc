//! MPV process detection, spawning and supervision.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::process::{Child, Command};

use crate::config::Config;

/// Interval between checks for the control socket.
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// How long the player gets to create its control socket.
const SOCKET_TIMEOUT: Duration = Duration::from_secs(10);
/// Grace period between SIGTERM and SIGKILL.
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ProcessError {
  #[error("MPV executable not found")]
  NotFound,
  #[error("Failed to spawn MPV: {0}")]
  SpawnFailed(#[from] std::io::Error),
  #[error("Control socket {path:?} did not appear within {waited:?}")]
  SocketTimeout { path: PathBuf, waited: Duration },
}

/// Find MPV executable in common locations.
pub fn find_mpv() -> Option<PathBuf> {
  // Check PATH first
  if let Ok(path) = which::which("mpv") {
    return Some(path);
  }

  let common_paths = [
    "/usr/bin/mpv",
    "/usr/local/bin/mpv",
    "/opt/homebrew/bin/mpv",
  ];
  common_paths
    .into_iter()
    .map(PathBuf::from)
    .find(|p| p.exists())
}

/// Command-line flags for a headless, looping kiosk player.
pub fn player_args(config: &Config) -> Vec<String> {
  let mut args = vec![
    format!("--input-ipc-server={}", config.socket_path.display()),
    "--vo=drm".to_string(),
    "--audio-device=alsa/default".to_string(),
    "--no-input-default-bindings".to_string(),
    "--no-input-cursor".to_string(),
    "--profile=sw-fast".to_string(),
    format!("--playlist={}", config.playlist_path().display()),
    "--loop-playlist".to_string(),
  ];
  args.extend(config.mpv_args.iter().cloned());
  args
}

/// Remove a stale control socket left by a previous run.
pub fn cleanup_socket(path: &Path) {
  match std::fs::remove_file(path) {
    Ok(()) => log::debug!("Removed stale socket {:?}", path),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
    Err(e) => log::warn!("Failed to remove socket {:?}: {}", path, e),
  }
}

/// Open the player's output sink. Falls back to discarding output.
fn open_log_sink(path: Option<&Path>) -> (Option<File>, Stdio, Stdio) {
  let Some(path) = path else {
    return (None, Stdio::null(), Stdio::null());
  };

  let opened = OpenOptions::new()
    .create(true)
    .append(true)
    .open(path)
    .and_then(|file| {
      let out = file.try_clone()?;
      let err = file.try_clone()?;
      Ok((file, out, err))
    });

  match opened {
    Ok((file, out, err)) => {
      log::info!("MPV output goes to {:?}", path);
      (Some(file), Stdio::from(out), Stdio::from(err))
    }
    Err(e) => {
      log::warn!("Cannot open MPV log {:?}: {}, discarding output", path, e);
      (None, Stdio::null(), Stdio::null())
    }
  }
}

/// A live player process.
#[derive(Debug)]
pub struct PlayerProcess {
  child: Child,
  log_sink: Option<File>,
  socket_path: PathBuf,
}

impl PlayerProcess {
  pub fn pid(&self) -> Option<u32> {
    self.child.id()
  }

  pub fn socket_path(&self) -> &Path {
    &self.socket_path
  }
}

/// Owns at most one player process at a time.
#[derive(Debug)]
pub struct ProcessSupervisor {
  process: Option<PlayerProcess>,
  socket_timeout: Duration,
  terminate_timeout: Duration,
}

impl Default for ProcessSupervisor {
  fn default() -> Self {
    Self::new()
  }
}

impl ProcessSupervisor {
  pub fn new() -> Self {
    Self {
      process: None,
      socket_timeout: SOCKET_TIMEOUT,
      terminate_timeout: TERMINATE_TIMEOUT,
    }
  }

  /// Override the socket readiness ceiling.
  pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
    self.socket_timeout = timeout;
    self
  }

  /// Override the grace period between SIGTERM and SIGKILL.
  pub fn with_terminate_timeout(mut self, timeout: Duration) -> Self {
    self.terminate_timeout = timeout;
    self
  }

  pub fn is_running(&self) -> bool {
    self.process.is_some()
  }

  pub fn process(&self) -> Option<&PlayerProcess> {
    self.process.as_ref()
  }

  /// Spawn the player and wait for its control socket.
  ///
  /// Does nothing if a player is already running. When the socket never shows
  /// up the spawned process is left running and not tracked.
  pub async fn start(&mut self, config: &Config) -> Result<(), ProcessError> {
    if let Some(process) = &self.process {
      log::info!("MPV is already running (pid: {:?})", process.pid());
      return Ok(());
    }

    let mpv_exe = config
      .mpv_path
      .as_ref()
      .filter(|s| !s.is_empty())
      .map(PathBuf::from)
      .or_else(find_mpv)
      .ok_or(ProcessError::NotFound)?;

    cleanup_socket(&config.socket_path);

    let log_path = config.resolved_log_path();
    let (log_sink, stdout, stderr) = open_log_sink(log_path.as_deref());

    let args = player_args(config);
    log::info!("Spawning MPV: {:?} {:?}", mpv_exe, args);

    let child = Command::new(&mpv_exe)
      .args(&args)
      .stdin(Stdio::null())
      .stdout(stdout)
      .stderr(stderr)
      .process_group(0)
      .spawn()?;
    let pid = child.id();

    if let Err(e) = wait_for_socket(&config.socket_path, self.socket_timeout).await {
      log::error!("MPV (pid: {:?}) never opened its control socket, leaving it running", pid);
      return Err(e);
    }

    log::info!("MPV started (pid: {:?})", pid);
    self.process = Some(PlayerProcess {
      child,
      log_sink,
      socket_path: config.socket_path.clone(),
    });
    Ok(())
  }

  /// Terminate the player: SIGTERM, then SIGKILL after the grace period.
  /// Never fails; every problem is logged.
  pub async fn stop(&mut self) {
    let Some(mut process) = self.process.take() else {
      log::debug!("No MPV process to stop");
      return;
    };

    match process.child.id() {
      Some(pid) => {
        log::info!("Terminating MPV process (pid: {})", pid);
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
          log::warn!("SIGTERM to {} failed: {}", pid, e);
        }
      }
      None => log::debug!("MPV process already reaped"),
    }

    match tokio::time::timeout(self.terminate_timeout, process.child.wait()).await {
      Ok(Ok(status)) => log::info!("MPV process exited with: {}", status),
      Ok(Err(e)) => log::error!("wait() failed: {}", e),
      Err(_) => {
        log::warn!(
          "MPV did not exit within {:?}, killing",
          self.terminate_timeout
        );
        match process.child.kill().await {
          Ok(()) => log::info!("MPV killed forcefully"),
          Err(e) => log::error!("kill() failed: {}", e),
        }
      }
    }

    drop(process.log_sink.take());
    cleanup_socket(&process.socket_path);
  }
}

/// Poll for `path` to exist.
async fn wait_for_socket(path: &Path, timeout: Duration) -> Result<(), ProcessError> {
  let deadline = tokio::time::Instant::now() + timeout;
  loop {
    if path.exists() {
      return Ok(());
    }
    if tokio::time::Instant::now() >= deadline {
      return Err(ProcessError::SocketTimeout {
        path: path.to_path_buf(),
        waited: timeout,
      });
    }
    tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
  }
}
