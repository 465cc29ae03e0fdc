//! Inbound command handling.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::mpv::{MpvClient, MpvError};
use crate::playlist::{PlaylistBuilder, PlaylistError};
use crate::publish::{Publish, PublishTicker};
use crate::state::{Phase, PlaybackState, PlaybackStateMachine};

/// Time given to the player to report property changes after a forwarded directive.
const SETTLE_DELAY: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum CommandError {
  #[error("Playlist error: {0}")]
  Playlist(#[from] PlaylistError),
  #[error("Player error: {0}")]
  Player(#[from] MpvError),
}

/// A command received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
  Play,
  Stop,
  ClearPlaylist,
  /// Any other directive, forwarded to the player as typed.
  Raw(String),
  Empty,
}

#[derive(Deserialize)]
struct Payload {
  #[serde(default)]
  command: String,
}

impl Command {
  /// Interpret a command name. Matching is case-insensitive.
  pub fn parse(name: &str) -> Self {
    let trimmed = name.trim();
    match trimmed.to_lowercase().as_str() {
      "" => Command::Empty,
      "play" => Command::Play,
      "stop" => Command::Stop,
      "clear-playlist" => Command::ClearPlaylist,
      _ => Command::Raw(trimmed.to_string()),
    }
  }

  /// Decode a bus payload: a JSON object with a `command` field, or a bare command line.
  /// Any other JSON document is rejected.
  pub fn from_payload(payload: &str) -> Result<Self, serde_json::Error> {
    let trimmed = payload.trim();
    match serde_json::from_str::<Value>(trimmed) {
      Ok(value @ Value::Object(_)) => {
        let payload: Payload = serde_json::from_value(value)?;
        Ok(Self::parse(&payload.command))
      }
      Ok(other) => Err(serde::de::Error::custom(format!(
        "expected a JSON object, got {}",
        other
      ))),
      Err(e) if trimmed.starts_with(['{', '[']) => Err(e),
      Err(_) => Ok(Self::parse(trimmed)),
    }
  }
}

/// What a handled command did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
  Started,
  AlreadyPlaying,
  Stopped,
  Restarted,
  Forwarded(String),
  Ignored,
}

/// Player resources that only exist while a session runs.
struct Player {
  client: MpvClient,
  ticker: Option<PublishTicker>,
  /// Disarms the task that watches for the session ending on its own.
  watchdog: Option<CancellationToken>,
}

/// Ticker first, then watchdog, observation, session and process; state goes back to idle.
async fn teardown(player: &mut Player, machine: &PlaybackStateMachine) {
  if let Some(ticker) = player.ticker.take() {
    ticker.stop().await;
  }
  if let Some(watchdog) = player.watchdog.take() {
    watchdog.cancel();
  }
  player.client.stop().await;
  machine.reset();
}

/// Unconditional publish of the current snapshot.
fn publish_now(machine: &PlaybackStateMachine, publisher: &dyn Publish) {
  let state = machine.force_publish(Instant::now());
  publisher.publish(&state);
}

/// Maps bus commands onto playlist, process and session operations.
///
/// Commands are handled one at a time. The observation task and the publish
/// ticker run alongside and share state only through [`PlaybackStateMachine`].
pub struct Controller {
  config: Arc<Config>,
  playlist: PlaylistBuilder,
  player: Arc<Mutex<Player>>,
  machine: Arc<PlaybackStateMachine>,
  publisher: Arc<dyn Publish>,
}

impl Controller {
  pub fn new(config: Config, publisher: Arc<dyn Publish>) -> Self {
    Self::with_client(config, publisher, MpvClient::new())
  }

  pub fn with_client(config: Config, publisher: Arc<dyn Publish>, client: MpvClient) -> Self {
    Self {
      config: Arc::new(config),
      playlist: PlaylistBuilder::new(),
      player: Arc::new(Mutex::new(Player {
        client,
        ticker: None,
        watchdog: None,
      })),
      machine: Arc::new(PlaybackStateMachine::new()),
      publisher,
    }
  }

  pub fn state(&self) -> PlaybackState {
    self.machine.snapshot()
  }

  pub fn phase(&self) -> Phase {
    self.machine.phase()
  }

  /// Decode and run a raw bus payload. Undecodable payloads are logged and ignored.
  pub async fn handle_payload(&self, payload: &str) -> Result<CommandOutcome, CommandError> {
    match Command::from_payload(payload) {
      Ok(command) => self.dispatch(command).await,
      Err(e) => {
        log::warn!("Invalid command payload {:?}: {}", payload, e);
        Ok(CommandOutcome::Ignored)
      }
    }
  }

  pub async fn dispatch(&self, command: Command) -> Result<CommandOutcome, CommandError> {
    match command {
      Command::Play => {
        log::info!("Received play command");
        let mut player = self.player.lock().await;
        self.play(&mut player, false).await
      }
      Command::Stop => {
        log::info!("Received stop command");
        let mut player = self.player.lock().await;
        teardown(&mut player, &self.machine).await;
        publish_now(&self.machine, self.publisher.as_ref());
        Ok(CommandOutcome::Stopped)
      }
      Command::ClearPlaylist => {
        log::info!("Received clear-playlist command");
        let mut player = self.player.lock().await;
        teardown(&mut player, &self.machine).await;
        self.playlist.remove_cached(&self.config);
        match self.play(&mut player, true).await {
          Ok(_) => Ok(CommandOutcome::Restarted),
          Err(e) => {
            publish_now(&self.machine, self.publisher.as_ref());
            Err(e)
          }
        }
      }
      Command::Raw(directive) => self.forward(&directive).await,
      Command::Empty => {
        log::info!("Ignoring empty command");
        Ok(CommandOutcome::Ignored)
      }
    }
  }

  /// Stop playback for good: used when the process exits.
  pub async fn shutdown(&self) {
    let mut player = self.player.lock().await;
    teardown(&mut player, &self.machine).await;
    publish_now(&self.machine, self.publisher.as_ref());
  }

  async fn play(&self, player: &mut Player, force: bool) -> Result<CommandOutcome, CommandError> {
    if player.ticker.is_some() && !player.client.is_active() {
      log::warn!("MPV went away, resetting before restart");
      teardown(player, &self.machine).await;
    }

    let playlist = match self.playlist.build(&self.config, force) {
      Ok(playlist) => playlist,
      Err(e) => {
        log::error!("Failed to prepare playlist: {}", e);
        return Err(e.into());
      }
    };
    log::info!("Playlist ready with {} files", playlist.len());

    let machine = self.machine.clone();
    let started = player
      .client
      .start(&self.config, move |event| {
        if let Some(change) = machine.apply(event) {
          log::trace!("State change: {:?}", change);
        }
      })
      .await;

    let outcome = match started {
      Ok(true) => {
        self.machine.started();
        player.ticker = Some(PublishTicker::spawn(
          self.machine.clone(),
          self.publisher.clone(),
          self.config.publish_interval(),
        ));
        player.watchdog = player.client.session_closed().map(|closed| self.watch(closed));
        log::info!("Playback started successfully");
        CommandOutcome::Started
      }
      Ok(false) => CommandOutcome::AlreadyPlaying,
      Err(e) => {
        log::error!("Failed to start playback: {}", e);
        return Err(e.into());
      }
    };

    publish_now(&self.machine, self.publisher.as_ref());
    Ok(outcome)
  }

  /// Return to idle when the session ends without a command asking for it.
  /// The returned token disarms the watch; it is cancelled under the player
  /// lock by every teardown.
  fn watch(&self, closed: CancellationToken) -> CancellationToken {
    let disarm = CancellationToken::new();
    let disarmed = disarm.clone();
    let player = self.player.clone();
    let machine = self.machine.clone();
    let publisher = self.publisher.clone();

    tokio::spawn(async move {
      tokio::select! {
        _ = disarmed.cancelled() => return,
        _ = closed.cancelled() => {}
      }
      let mut player = player.lock().await;
      if disarmed.is_cancelled() {
        return;
      }
      log::warn!("MPV session ended unexpectedly, returning to idle");
      teardown(&mut player, &machine).await;
      publish_now(&machine, publisher.as_ref());
    });

    disarm
  }

  async fn forward(&self, directive: &str) -> Result<CommandOutcome, CommandError> {
    let player = self.player.lock().await;
    if !player.client.is_active() {
      log::info!("Ignoring command '{}' - MPV not running", directive);
      return Ok(CommandOutcome::Ignored);
    }

    let reply = match player.client.command(directive).await {
      Ok(reply) => {
        log::info!("Executed: {} -> {}", directive, reply);
        reply
      }
      Err(e) => {
        log::warn!("Command '{}' failed: {}", directive, e);
        return Err(e.into());
      }
    };
    drop(player);

    tokio::time::sleep(SETTLE_DELAY).await;
    if let Some(state) = self
      .machine
      .poll_publish(Instant::now(), self.config.publish_interval())
    {
      self.publisher.publish(&state);
    }
    Ok(CommandOutcome::Forwarded(reply))
  }
}
