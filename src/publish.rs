//! Outbound state publication.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::state::{PlaybackState, PlaybackStateMachine};

/// Period of the publish-worthiness check.
pub const TICK_PERIOD: Duration = Duration::from_millis(500);

/// Sink for state documents, provided by the bus collaborator.
pub trait Publish: Send + Sync {
  fn publish(&self, state: &PlaybackState);
}

impl<F> Publish for F
where
  F: Fn(&PlaybackState) + Send + Sync,
{
  fn publish(&self, state: &PlaybackState) {
    self(state)
  }
}

/// Periodic debounce check, alive for as long as a player session is.
pub struct PublishTicker {
  cancel: CancellationToken,
  handle: JoinHandle<()>,
}

impl PublishTicker {
  pub fn spawn(
    machine: Arc<PlaybackStateMachine>,
    publisher: Arc<dyn Publish>,
    interval: Duration,
  ) -> Self {
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    let handle = tokio::spawn(async move {
      let mut ticks = tokio::time::interval(TICK_PERIOD);
      ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

      loop {
        tokio::select! {
          _ = token.cancelled() => break,
          _ = ticks.tick() => {
            if let Some(state) = machine.poll_publish(Instant::now(), interval) {
              log::debug!("Publishing {:?} at {:.1}s", state.phase, state.position_seconds);
              publisher.publish(&state);
            }
          }
        }
      }
      log::debug!("Publish ticker stopped");
    });

    Self { cancel, handle }
  }

  pub async fn stop(self) {
    self.cancel.cancel();
    if let Err(e) = self.handle.await {
      log::error!("Publish ticker failed: {}", e);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::mpv::PlayerEvent;
  use parking_lot::Mutex;

  #[tokio::test]
  async fn test_ticker_publishes_significant_changes_only() {
    let machine = Arc::new(PlaybackStateMachine::new());
    let published = Arc::new(Mutex::new(Vec::<PlaybackState>::new()));
    let sink = published.clone();
    let publisher: Arc<dyn Publish> = Arc::new(move |s: &PlaybackState| sink.lock().push(s.clone()));

    let ticker = PublishTicker::spawn(machine.clone(), publisher, Duration::from_secs(3600));
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(published.lock().is_empty(), "idle state is never ticked out");

    machine.started();
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(published.lock().len(), 1);

    machine.apply(PlayerEvent::TimePos(0.2));
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(published.lock().len(), 1);

    machine.apply(PlayerEvent::TimePos(2.0));
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(published.lock().len(), 2);
    assert_eq!(published.lock()[1].position_seconds, 2.0);

    ticker.stop().await;
  }
}
