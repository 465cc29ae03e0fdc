//! Async IPC connection to MPV over its Unix control socket.
//!
//! Two ways of talking to the player:
//! - [`IpcSession`] is long-lived and carries property observation.
//! - [`request`] is a one-shot exchange on its own connection, so a slow
//!   command can never stall the observation stream.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_channel::{Receiver, Sender};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::protocol::{MpvCommand, MpvMessage, PlayerEvent};

/// How long the observation loop waits for data before checking liveness.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);
/// Ceiling for a whole ad-hoc request round-trip.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum IpcError {
  #[error("Connection failed: {0}")]
  ConnectionFailed(String),
  #[error("Not connected")]
  NotConnected,
  #[error("Session is already being observed")]
  AlreadyObserving,
  #[error("I/O failed: {0}")]
  Io(#[from] std::io::Error),
  #[error("Command timeout")]
  Timeout,
}

/// Writer channel message.
enum WriteMessage {
  Line(Vec<u8>),
  Close,
}

/// Long-lived duplex session with the player.
pub struct IpcSession {
  write_tx: Sender<WriteMessage>,
  reader: Mutex<Option<OwnedReadHalf>>,
  live: Arc<AtomicBool>,
  _writer_handle: JoinHandle<()>,
}

impl IpcSession {
  /// Connect to the control socket, retrying a few times.
  pub async fn connect(path: &Path, retry_count: u32) -> Result<Self, IpcError> {
    let mut last_error = None;

    for attempt in 0..retry_count.max(1) {
      if attempt > 0 {
        tokio::time::sleep(Duration::from_millis(100 * (attempt as u64 + 1))).await;
      }

      match UnixStream::connect(path).await {
        Ok(stream) => return Ok(Self::setup(stream)),
        Err(e) => {
          log::debug!("IPC connect attempt {} failed: {}", attempt + 1, e);
          last_error = Some(e);
        }
      }
    }

    Err(IpcError::ConnectionFailed(
      last_error.map_or_else(|| "unknown error".to_string(), |e| e.to_string()),
    ))
  }

  fn setup(stream: UnixStream) -> Self {
    let (reader, writer) = stream.into_split();
    let live = Arc::new(AtomicBool::new(true));
    let (write_tx, write_rx) = async_channel::unbounded::<WriteMessage>();

    let writer_live = live.clone();
    let writer_handle = tokio::spawn(async move {
      Self::writer_loop(writer, write_rx).await;
      writer_live.store(false, Ordering::SeqCst);
    });

    log::info!("MPV IPC session connected");
    Self {
      write_tx,
      reader: Mutex::new(Some(reader)),
      live,
      _writer_handle: writer_handle,
    }
  }

  async fn writer_loop(mut writer: OwnedWriteHalf, write_rx: Receiver<WriteMessage>) {
    while let Ok(msg) = write_rx.recv().await {
      match msg {
        WriteMessage::Line(mut data) => {
          data.push(b'\n');
          if let Err(e) = writer.write_all(&data).await {
            log::error!("MPV IPC write error: {}", e);
            break;
          }
          if let Err(e) = writer.flush().await {
            log::error!("MPV IPC flush error: {}", e);
            break;
          }
        }
        WriteMessage::Close => {
          log::info!("MPV IPC writer closing");
          break;
        }
      }
    }
    let _ = writer.shutdown().await;
  }

  pub fn is_live(&self) -> bool {
    self.live.load(Ordering::SeqCst)
  }

  /// Queue a command for the player. Replies arrive on the observation stream.
  pub async fn send(&self, cmd: &MpvCommand) -> Result<(), IpcError> {
    if !self.is_live() {
      return Err(IpcError::NotConnected);
    }
    let json = serde_json::to_vec(cmd).map_err(|e| IpcError::Io(e.into()))?;
    log::debug!("Sending MPV command: {}", String::from_utf8_lossy(&json));
    self
      .write_tx
      .send(WriteMessage::Line(json))
      .await
      .map_err(|_| IpcError::NotConnected)
  }

  /// Observe `properties` and feed decoded changes to `on_event` from a background task.
  pub async fn observe<F>(&self, properties: &[&str], on_event: F) -> Result<ObserveTask, IpcError>
  where
    F: Fn(PlayerEvent) + Send + 'static,
  {
    if !self.is_live() {
      return Err(IpcError::NotConnected);
    }
    let reader = self.reader.lock().take().ok_or(IpcError::AlreadyObserving)?;

    for (id, name) in properties.iter().enumerate() {
      self
        .send(&MpvCommand::observe_property(id as i64 + 1, name))
        .await?;
    }

    let cancel = CancellationToken::new();
    let closed = CancellationToken::new();
    let live = self.live.clone();
    let token = cancel.clone();
    let lost = closed.clone();
    let handle = tokio::spawn(async move {
      if !Self::reader_loop(reader, live, token, on_event).await {
        lost.cancel();
      }
    });

    log::info!("Observing {:?}", properties);
    Ok(ObserveTask {
      cancel,
      closed,
      handle,
    })
  }

  /// Returns `true` when stopped through `cancel`, `false` when the session was lost.
  async fn reader_loop<F: Fn(PlayerEvent)>(
    reader: OwnedReadHalf,
    live: Arc<AtomicBool>,
    cancel: CancellationToken,
    on_event: F,
  ) -> bool {
    log::info!("MPV IPC reader loop started");
    let mut lines = BufReader::new(reader).lines();

    loop {
      tokio::select! {
        _ = cancel.cancelled() => {
          log::info!("MPV observation cancelled");
          return true;
        }
        next = tokio::time::timeout(POLL_TIMEOUT, lines.next_line()) => match next {
          Err(_) => {
            if !live.load(Ordering::SeqCst) {
              log::info!("MPV session no longer live, ending observation");
              return false;
            }
          }
          Ok(Ok(Some(line))) => Self::handle_line(&line, &on_event),
          Ok(Ok(None)) => {
            log::info!("MPV IPC connection closed");
            live.store(false, Ordering::SeqCst);
            return false;
          }
          Ok(Err(e)) => {
            log::error!("MPV IPC read error: {}", e);
            live.store(false, Ordering::SeqCst);
            return false;
          }
        }
      }
    }
  }

  fn handle_line<F: Fn(PlayerEvent)>(line: &str, on_event: &F) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
      return;
    }

    match MpvMessage::parse(trimmed) {
      Ok(MpvMessage::Event(event)) => match PlayerEvent::from(&event) {
        PlayerEvent::Ignored => log::trace!("Ignoring MPV event {:?}", event.event),
        decoded => on_event(decoded),
      },
      Ok(MpvMessage::Response(response)) => {
        if response.is_success() {
          log::debug!("MPV reply for request_id={}", response.request_id);
        } else {
          log::warn!(
            "MPV rejected request_id={}: {}",
            response.request_id,
            response.error
          );
        }
      }
      Err(e) => log::warn!("Failed to parse MPV message: {} - {}", e, trimmed),
    }
  }

  /// Mark the session dead and stop the writer.
  pub fn close(&self) {
    self.live.store(false, Ordering::SeqCst);
    let _ = self.write_tx.try_send(WriteMessage::Close);
  }
}

impl Drop for IpcSession {
  fn drop(&mut self) {
    self.close();
  }
}

/// Handle to a running observation loop.
pub struct ObserveTask {
  cancel: CancellationToken,
  closed: CancellationToken,
  handle: JoinHandle<()>,
}

impl ObserveTask {
  pub fn is_finished(&self) -> bool {
    self.handle.is_finished()
  }

  /// Fires when the session ends on its own (EOF, read error, lost liveness).
  /// Not fired by [`ObserveTask::shutdown`].
  pub fn closed(&self) -> CancellationToken {
    self.closed.clone()
  }

  /// Cancel the loop and wait up to `wait` for it to exit.
  pub async fn shutdown(self, wait: Duration) {
    self.cancel.cancel();
    let mut handle = self.handle;
    match tokio::time::timeout(wait, &mut handle).await {
      Ok(Ok(())) => log::debug!("MPV observation task finished"),
      Ok(Err(e)) => log::error!("MPV observation task failed: {}", e),
      Err(_) => {
        log::warn!("MPV observation task did not stop within {:?}, aborting", wait);
        handle.abort();
      }
    }
  }
}

/// Send one raw directive on a fresh connection and read a single reply.
pub async fn request(path: &Path, directive: &str) -> Result<String, IpcError> {
  let exchange = async {
    let mut stream = UnixStream::connect(path)
      .await
      .map_err(|e| IpcError::ConnectionFailed(e.to_string()))?;
    stream.write_all(format!("{}\n", directive).as_bytes()).await?;

    let mut buf = vec![0u8; 1024];
    let n = stream.read(&mut buf).await?;
    Ok::<_, IpcError>(String::from_utf8_lossy(&buf[..n]).trim().to_string())
  };

  tokio::time::timeout(REQUEST_TIMEOUT, exchange)
    .await
    .map_err(|_| IpcError::Timeout)?
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::net::UnixListener;

  async fn wait_until<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..40 {
      if check() {
        return true;
      }
      tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
  }

  #[tokio::test]
  async fn test_observe_registers_properties_and_decodes_events() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mpv.sock");
    let listener = UnixListener::bind(&path).unwrap();

    let server = tokio::spawn(async move {
      let (stream, _) = listener.accept().await.unwrap();
      let (read, mut write) = stream.into_split();
      let mut lines = BufReader::new(read).lines();
      let mut observed = Vec::new();
      for _ in 0..2 {
        observed.push(lines.next_line().await.unwrap().unwrap());
      }
      write
        .write_all(
          concat!(
            "{\"error\":\"success\",\"request_id\":1}\n",
            "{\"event\":\"property-change\",\"name\":\"pause\",\"data\":true}\n",
            "garbage line\n",
            "{\"event\":\"property-change\",\"name\":\"mute\",\"data\":true}\n",
            "{\"event\":\"property-change\",\"name\":\"volume\",\"data\":30.0}\n",
          )
          .as_bytes(),
        )
        .await
        .unwrap();
      (observed, write)
    });

    let session = IpcSession::connect(&path, 1).await.unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let task = session
      .observe(&["pause", "volume"], move |e| sink.lock().push(e))
      .await
      .unwrap();

    let (observed, _write) = server.await.unwrap();
    assert!(observed[0].contains(r#""observe_property",1,"pause""#));
    assert!(observed[1].contains(r#""observe_property",2,"volume""#));

    assert!(wait_until(|| events.lock().len() == 2).await);
    assert_eq!(
      *events.lock(),
      vec![PlayerEvent::Pause(true), PlayerEvent::Volume(30.0)]
    );

    task.shutdown(Duration::from_secs(2)).await;
  }

  #[tokio::test]
  async fn test_second_observe_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mpv.sock");
    let listener = UnixListener::bind(&path).unwrap();
    let _server = tokio::spawn(async move {
      let (stream, _) = listener.accept().await.unwrap();
      tokio::time::sleep(Duration::from_secs(5)).await;
      drop(stream);
    });

    let session = IpcSession::connect(&path, 1).await.unwrap();
    let task = session.observe(&[], |_| {}).await.unwrap();
    assert!(matches!(
      session.observe(&[], |_| {}).await,
      Err(IpcError::AlreadyObserving)
    ));
    task.shutdown(Duration::from_secs(2)).await;
  }

  #[tokio::test]
  async fn test_send_after_close_is_not_connected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mpv.sock");
    let _listener = UnixListener::bind(&path).unwrap();

    let session = IpcSession::connect(&path, 1).await.unwrap();
    session.close();
    let err = session
      .send(&MpvCommand::observe_property(1, "pause"))
      .await
      .unwrap_err();
    assert!(matches!(err, IpcError::NotConnected));
  }

  #[tokio::test]
  async fn test_observation_ends_when_peer_closes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mpv.sock");
    let listener = UnixListener::bind(&path).unwrap();
    let server = tokio::spawn(async move {
      let (stream, _) = listener.accept().await.unwrap();
      drop(stream);
    });

    let session = IpcSession::connect(&path, 1).await.unwrap();
    server.await.unwrap();
    let task = session.observe(&[], |_| {}).await.unwrap();
    let closed = task.closed();
    assert!(wait_until(|| task.is_finished()).await);
    assert!(!session.is_live());
    assert!(closed.is_cancelled());
  }

  #[tokio::test]
  async fn test_observation_ends_when_closed_on_quiet_peer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mpv.sock");
    let listener = UnixListener::bind(&path).unwrap();
    let _server = tokio::spawn(async move {
      let (stream, _) = listener.accept().await.unwrap();
      tokio::time::sleep(Duration::from_secs(10)).await;
      drop(stream);
    });

    let session = IpcSession::connect(&path, 1).await.unwrap();
    let task = session.observe(&[], |_| {}).await.unwrap();
    let closed = task.closed();
    session.close();

    // The peer stays silent, so only the liveness check after a poll timeout ends the loop.
    let finished = tokio::time::timeout(POLL_TIMEOUT + Duration::from_millis(500), async {
      while !task.is_finished() {
        tokio::time::sleep(Duration::from_millis(20)).await;
      }
    })
    .await;
    assert!(finished.is_ok());
    assert!(closed.is_cancelled());
  }

  #[tokio::test]
  async fn test_shutdown_does_not_signal_closed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mpv.sock");
    let listener = UnixListener::bind(&path).unwrap();
    let _server = tokio::spawn(async move {
      let (stream, _) = listener.accept().await.unwrap();
      tokio::time::sleep(Duration::from_secs(5)).await;
      drop(stream);
    });

    let session = IpcSession::connect(&path, 1).await.unwrap();
    let task = session.observe(&[], |_| {}).await.unwrap();
    let closed = task.closed();
    task.shutdown(Duration::from_secs(2)).await;
    assert!(!closed.is_cancelled());
    assert!(session.is_live());
  }

  #[tokio::test]
  async fn test_connect_missing_socket() {
    let dir = tempfile::tempdir().unwrap();
    let err = IpcSession::connect(&dir.path().join("absent.sock"), 2)
      .await
      .err()
      .unwrap();
    assert!(matches!(err, IpcError::ConnectionFailed(_)));
  }

  #[tokio::test]
  async fn test_request_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mpv.sock");
    let listener = UnixListener::bind(&path).unwrap();
    tokio::spawn(async move {
      let (stream, _) = listener.accept().await.unwrap();
      let (read, mut write) = stream.into_split();
      let line = BufReader::new(read).lines().next_line().await.unwrap().unwrap();
      assert_eq!(line, "cycle pause");
      write
        .write_all(b"{\"data\":null,\"error\":\"success\"}\n")
        .await
        .unwrap();
    });

    let reply = request(&path, "cycle pause").await.unwrap();
    assert_eq!(reply, r#"{"data":null,"error":"success"}"#);
  }

  #[tokio::test]
  async fn test_request_times_out_on_silent_peer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mpv.sock");
    let listener = UnixListener::bind(&path).unwrap();
    tokio::spawn(async move {
      let (stream, _) = listener.accept().await.unwrap();
      tokio::time::sleep(Duration::from_secs(3)).await;
      drop(stream);
    });

    let err = request(&path, "stop").await.unwrap_err();
    assert!(matches!(err, IpcError::Timeout));
  }
}
