use std::path::PathBuf;
use std::sync::Arc;

mod bus;
pub mod command;
pub mod config;
pub mod mpv;
pub mod playlist;
pub mod publish;
pub mod state;

pub use bus::StdoutPublisher;
pub use command::{Command, CommandError, CommandOutcome, Controller};
pub use config::{Config, ConfigError};
pub use publish::Publish;
pub use state::{Phase, PlaybackState};

/// Load the config (first CLI argument or the default location) and serve
/// commands until the input stream ends. Only a config failure is an error.
pub async fn run() -> Result<(), ConfigError> {
  let config_path = std::env::args_os()
    .nth(1)
    .map(PathBuf::from)
    .unwrap_or_else(Config::default_path);
  let config = Config::load(&config_path)?;

  let controller = Controller::new(config, Arc::new(StdoutPublisher));
  log::info!("MPV bus controller started. Waiting for commands...");
  log::info!("Send 'play' command to start playback, 'stop' to stop");

  if let Err(e) = bus::serve(&controller).await {
    log::error!("Command stream error: {}", e);
  }

  controller.shutdown().await;
  Ok(())
}
