//! High-level MPV client: process, control session and observation as one unit.

use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::ipc::{self, IpcError, IpcSession, ObserveTask};
use super::process::{ProcessError, ProcessSupervisor};
use super::protocol::{PlayerEvent, OBSERVED_PROPERTIES};
use crate::config::Config;

/// Connection attempts once the control socket exists.
const CONNECT_RETRIES: u32 = 5;
/// Bound on waiting for the observation task during teardown.
const OBSERVER_STOP_WAIT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum MpvError {
  #[error("Process error: {0}")]
  Process(#[from] ProcessError),
  #[error("IPC error: {0}")]
  Ipc(#[from] IpcError),
}

/// High-level MPV client.
#[derive(Default)]
pub struct MpvClient {
  supervisor: ProcessSupervisor,
  session: Option<IpcSession>,
  observer: Option<ObserveTask>,
}

impl MpvClient {
  /// Create a new MPV client.
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_supervisor(supervisor: ProcessSupervisor) -> Self {
    Self {
      supervisor,
      session: None,
      observer: None,
    }
  }

  /// A player is running and its session is alive.
  pub fn is_active(&self) -> bool {
    self.supervisor.is_running() && self.session.as_ref().is_some_and(IpcSession::is_live)
  }

  /// Fires when the current session ends without [`MpvClient::stop`].
  pub fn session_closed(&self) -> Option<CancellationToken> {
    self.observer.as_ref().map(ObserveTask::closed)
  }

  /// Start MPV, connect to IPC and begin observing properties.
  ///
  /// Returns `false` when an active player was already there.
  pub async fn start<F>(&mut self, config: &Config, on_event: F) -> Result<bool, MpvError>
  where
    F: Fn(PlayerEvent) + Send + 'static,
  {
    if self.is_active() {
      log::info!("MPV already active");
      return Ok(false);
    }
    if self.supervisor.is_running() || self.session.is_some() {
      log::warn!("Found a dead MPV session, cleaning up before restart");
      self.stop().await;
    }

    self.supervisor.start(config).await?;

    let session = match IpcSession::connect(&config.socket_path, CONNECT_RETRIES).await {
      Ok(session) => session,
      Err(e) => {
        log::error!("Could not connect to MPV: {}", e);
        self.supervisor.stop().await;
        return Err(e.into());
      }
    };

    let observer = match session.observe(OBSERVED_PROPERTIES, on_event).await {
      Ok(observer) => observer,
      Err(e) => {
        log::error!("Could not observe MPV properties: {}", e);
        session.close();
        self.supervisor.stop().await;
        return Err(e.into());
      }
    };

    self.session = Some(session);
    self.observer = Some(observer);
    log::info!("MPV client connected");
    Ok(true)
  }

  /// Stop observation, close the session, then terminate the process.
  pub async fn stop(&mut self) {
    if let Some(observer) = self.observer.take() {
      observer.shutdown(OBSERVER_STOP_WAIT).await;
    }
    if let Some(session) = self.session.take() {
      log::info!("Closing IPC connection");
      session.close();
    }
    self.supervisor.stop().await;
    log::info!("MPV client stopped");
  }

  /// Forward a raw directive over a one-shot connection and return the reply.
  pub async fn command(&self, directive: &str) -> Result<String, MpvError> {
    if !self.is_active() {
      return Err(IpcError::NotConnected.into());
    }
    let process = self
      .supervisor
      .process()
      .ok_or(MpvError::Ipc(IpcError::NotConnected))?;
    Ok(ipc::request(process.socket_path(), directive).await?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_command_without_player_is_not_connected() {
    let client = MpvClient::new();
    assert!(!client.is_active());
    let err = client.command("cycle pause").await.unwrap_err();
    assert!(matches!(err, MpvError::Ipc(IpcError::NotConnected)));
  }

  #[tokio::test]
  async fn test_stop_when_idle_is_noop() {
    let mut client = MpvClient::new();
    client.stop().await;
    assert!(!client.is_active());
  }
}
