//! Line-oriented stand-in for the message bus: commands on stdin, state documents on stdout.

use std::io::Write;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use crate::command::Controller;
use crate::publish::Publish;
use crate::state::PlaybackState;

/// Writes each published state as one JSON line on stdout.
#[derive(Debug, Default)]
pub struct StdoutPublisher;

impl Publish for StdoutPublisher {
  fn publish(&self, state: &PlaybackState) {
    let line = match serde_json::to_string(state) {
      Ok(line) => line,
      Err(e) => {
        log::error!("Failed to encode state: {}", e);
        return;
      }
    };
    let mut out = std::io::stdout().lock();
    if let Err(e) = writeln!(out, "{}", line).and_then(|_| out.flush()) {
      log::error!("Failed to publish state: {}", e);
    }
  }
}

/// Read one command line. A line that is not UTF-8 comes back empty, so it is
/// skipped like a blank line instead of failing the stream.
async fn next_line<R: AsyncBufRead + Unpin>(
  reader: &mut R,
  buf: &mut Vec<u8>,
) -> std::io::Result<Option<String>> {
  buf.clear();
  if reader.read_until(b'\n', buf).await? == 0 {
    return Ok(None);
  }
  match std::str::from_utf8(&buf[..]) {
    Ok(line) => Ok(Some(line.trim_end_matches(['\r', '\n']).to_string())),
    Err(e) => {
      log::warn!("Ignoring command that is not UTF-8: {}", e);
      Ok(Some(String::new()))
    }
  }
}

/// Feed stdin lines to the controller until EOF or Ctrl-C.
pub async fn serve(controller: &Controller) -> std::io::Result<()> {
  let mut reader = BufReader::new(tokio::io::stdin());
  let mut buf = Vec::new();

  loop {
    tokio::select! {
      line = next_line(&mut reader, &mut buf) => match line? {
        Some(line) if line.trim().is_empty() => continue,
        Some(line) => match controller.handle_payload(&line).await {
          Ok(outcome) => log::debug!("Command outcome: {:?}", outcome),
          Err(e) => log::error!("Command failed: {}", e),
        },
        None => {
          log::info!("Command stream closed");
          break;
        }
      },
      _ = tokio::signal::ctrl_c() => {
        log::info!("Shutting down...");
        break;
      }
    }
  }
  Ok(())
}
