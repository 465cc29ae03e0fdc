//! Playback state: folding player events into a snapshot, and deciding when it is worth publishing.

use std::path::Path;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::mpv::PlayerEvent;

/// Position drift that warrants a publish, in seconds.
const POSITION_THRESHOLD: f64 = 0.5;
/// Volume change that warrants a publish, in percent.
const VOLUME_THRESHOLD: f64 = 1.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
  #[default]
  Idle,
  Playing,
  Paused,
}

/// Snapshot published to the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
  pub phase: Phase,
  pub current_path: Option<String>,
  pub current_title: Option<String>,
  pub volume_percent: f64,
  pub position_seconds: f64,
  pub duration_seconds: f64,
}

impl Default for PlaybackState {
  fn default() -> Self {
    Self {
      phase: Phase::Idle,
      current_path: None,
      current_title: None,
      volume_percent: 100.0,
      position_seconds: 0.0,
      duration_seconds: 0.0,
    }
  }
}

/// What an applied event changed.
#[derive(Debug, Clone, PartialEq)]
pub enum StateChange {
  Phase(Phase),
  Track { path: String, title: String },
  Position(f64),
  Duration(f64),
  Volume(f64),
}

/// Last path segment, used as the display title.
fn title_of(path: &str) -> String {
  Path::new(path)
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_else(|| path.to_string())
}

impl PlaybackState {
  pub fn is_active(&self) -> bool {
    self.phase != Phase::Idle
  }

  /// Apply one decoded event. Returns `None` when nothing changed.
  pub fn apply(&mut self, event: PlayerEvent) -> Option<StateChange> {
    match event {
      PlayerEvent::Pause(paused) => {
        let phase = if paused { Phase::Paused } else { Phase::Playing };
        if phase == self.phase {
          return None;
        }
        log::info!("Phase {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
        Some(StateChange::Phase(phase))
      }
      PlayerEvent::Path(path) => {
        if self.current_path.as_deref() == Some(path.as_str()) {
          return None;
        }
        let title = title_of(&path);
        log::info!("Now playing: {}", title);
        self.current_path = Some(path.clone());
        self.current_title = Some(title.clone());
        Some(StateChange::Track { path, title })
      }
      PlayerEvent::TimePos(pos) => {
        self.position_seconds = pos;
        Some(StateChange::Position(pos))
      }
      PlayerEvent::Duration(duration) => {
        self.duration_seconds = duration;
        Some(StateChange::Duration(duration))
      }
      PlayerEvent::Volume(volume) => {
        self.volume_percent = volume;
        Some(StateChange::Volume(volume))
      }
      PlayerEvent::Ignored => None,
    }
  }
}

/// Whether `current` differs enough from the last published snapshot, or the
/// interval since the last publish has run out.
pub fn should_publish(
  current: &PlaybackState,
  previous: Option<&PlaybackState>,
  last_publish: Option<Instant>,
  now: Instant,
  interval: Duration,
) -> bool {
  let (Some(previous), Some(last_publish)) = (previous, last_publish) else {
    return true;
  };

  current.phase != previous.phase
    || current.current_path != previous.current_path
    || current.current_title != previous.current_title
    || (current.position_seconds - previous.position_seconds).abs() > POSITION_THRESHOLD
    || (current.volume_percent - previous.volume_percent).abs() > VOLUME_THRESHOLD
    || now.saturating_duration_since(last_publish) >= interval
}

struct Inner {
  state: PlaybackState,
  published: Option<(PlaybackState, Instant)>,
}

/// Sole owner of the playback snapshot. Event handling, lifecycle transitions
/// and publish decisions all go through its lock.
pub struct PlaybackStateMachine {
  inner: Mutex<Inner>,
}

impl Default for PlaybackStateMachine {
  fn default() -> Self {
    Self::new()
  }
}

impl PlaybackStateMachine {
  pub fn new() -> Self {
    Self {
      inner: Mutex::new(Inner {
        state: PlaybackState::default(),
        published: None,
      }),
    }
  }

  pub fn snapshot(&self) -> PlaybackState {
    self.inner.lock().state.clone()
  }

  pub fn phase(&self) -> Phase {
    self.inner.lock().state.phase
  }

  /// Fold a player event into the snapshot.
  pub fn apply(&self, event: PlayerEvent) -> Option<StateChange> {
    self.inner.lock().state.apply(event)
  }

  /// The player was launched and is playing.
  pub fn started(&self) {
    let mut inner = self.inner.lock();
    if !inner.state.is_active() {
      inner.state.phase = Phase::Playing;
    }
  }

  /// Back to idle defaults; the player is gone.
  pub fn reset(&self) {
    self.inner.lock().state = PlaybackState::default();
  }

  /// Periodic check: the snapshot to publish, if any. Recorded as published.
  /// Never publishes while idle.
  pub fn poll_publish(&self, now: Instant, interval: Duration) -> Option<PlaybackState> {
    let mut inner = self.inner.lock();
    if !inner.state.is_active() {
      return None;
    }
    let (previous, last) = match &inner.published {
      Some((state, at)) => (Some(state), Some(*at)),
      None => (None, None),
    };
    if !should_publish(&inner.state, previous, last, now, interval) {
      return None;
    }
    let snapshot = inner.state.clone();
    inner.published = Some((snapshot.clone(), now));
    Some(snapshot)
  }

  /// Unconditional publish for lifecycle transitions. Recorded as published.
  pub fn force_publish(&self, now: Instant) -> PlaybackState {
    let mut inner = self.inner.lock();
    let snapshot = inner.state.clone();
    inner.published = Some((snapshot.clone(), now));
    snapshot
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn at(position: f64, volume: f64) -> PlaybackState {
    PlaybackState {
      phase: Phase::Playing,
      position_seconds: position,
      volume_percent: volume,
      ..PlaybackState::default()
    }
  }

  #[test]
  fn test_debounce_thresholds() {
    let start = Instant::now();
    let interval = Duration::from_secs(10);
    let previous = at(10.0, 50.0);
    let soon = start + Duration::from_secs(1);

    assert!(!should_publish(&at(10.3, 50.0), Some(&previous), Some(start), soon, interval));
    assert!(should_publish(&at(10.6, 50.0), Some(&previous), Some(start), soon, interval));
    assert!(!should_publish(&at(10.0, 51.0), Some(&previous), Some(start), soon, interval));
    assert!(should_publish(&at(10.0, 51.5), Some(&previous), Some(start), soon, interval));
    assert!(should_publish(
      &at(10.3, 50.0),
      Some(&previous),
      Some(start),
      start + interval,
      interval
    ));
  }

  #[test]
  fn test_debounce_phase_and_track() {
    let start = Instant::now();
    let interval = Duration::from_secs(10);
    let previous = at(10.0, 50.0);

    let mut paused = previous.clone();
    paused.phase = Phase::Paused;
    assert!(should_publish(&paused, Some(&previous), Some(start), start, interval));

    let mut moved = previous.clone();
    moved.current_path = Some("/m/b.mp4".to_string());
    assert!(should_publish(&moved, Some(&previous), Some(start), start, interval));

    assert!(should_publish(&previous, None, None, start, interval));
  }

  #[test]
  fn test_pause_transitions() {
    let mut state = at(0.0, 100.0);
    assert_eq!(state.apply(PlayerEvent::Pause(false)), None);
    assert_eq!(
      state.apply(PlayerEvent::Pause(true)),
      Some(StateChange::Phase(Phase::Paused))
    );
    assert_eq!(state.apply(PlayerEvent::Pause(true)), None);
    assert_eq!(
      state.apply(PlayerEvent::Pause(false)),
      Some(StateChange::Phase(Phase::Playing))
    );
  }

  #[test]
  fn test_repeated_path_is_one_change() {
    let mut state = at(0.0, 100.0);
    let first = state.apply(PlayerEvent::Path("/media/show/ep1.mp4".to_string()));
    assert_eq!(
      first,
      Some(StateChange::Track {
        path: "/media/show/ep1.mp4".to_string(),
        title: "ep1.mp4".to_string(),
      })
    );
    assert_eq!(state.apply(PlayerEvent::Path("/media/show/ep1.mp4".to_string())), None);
    assert_eq!(state.current_title.as_deref(), Some("ep1.mp4"));
  }

  #[test]
  fn test_numeric_properties_are_unconditional() {
    let mut state = at(0.0, 100.0);
    assert_eq!(state.apply(PlayerEvent::TimePos(3.5)), Some(StateChange::Position(3.5)));
    assert_eq!(state.apply(PlayerEvent::TimePos(3.5)), Some(StateChange::Position(3.5)));
    assert_eq!(state.apply(PlayerEvent::Duration(60.0)), Some(StateChange::Duration(60.0)));
    assert_eq!(state.apply(PlayerEvent::Volume(40.0)), Some(StateChange::Volume(40.0)));
    assert_eq!(state.apply(PlayerEvent::Ignored), None);
    assert_eq!(state.duration_seconds, 60.0);
    assert_eq!(state.volume_percent, 40.0);
  }

  #[test]
  fn test_machine_lifecycle() {
    let machine = PlaybackStateMachine::new();
    assert_eq!(machine.phase(), Phase::Idle);

    machine.started();
    machine.apply(PlayerEvent::Path("/m/a.mp4".to_string()));
    assert_eq!(machine.phase(), Phase::Playing);
    machine.apply(PlayerEvent::Pause(true));
    machine.started();
    assert_eq!(machine.phase(), Phase::Paused);

    machine.reset();
    assert_eq!(machine.snapshot(), PlaybackState::default());
  }

  #[test]
  fn test_poll_publish_only_while_active() {
    let machine = PlaybackStateMachine::new();
    let now = Instant::now();
    let interval = Duration::from_secs(10);
    assert!(machine.poll_publish(now, interval).is_none());

    machine.started();
    assert!(machine.poll_publish(now, interval).is_some());
    assert!(machine.poll_publish(now, interval).is_none());

    machine.apply(PlayerEvent::TimePos(0.4));
    assert!(machine.poll_publish(now, interval).is_none());
    machine.apply(PlayerEvent::TimePos(0.6));
    assert!(machine.poll_publish(now, interval).is_some());

    assert!(machine.poll_publish(now + interval, interval).is_some());
  }

  #[test]
  fn test_force_publish_resets_debounce() {
    let machine = PlaybackStateMachine::new();
    let now = Instant::now();
    machine.started();
    let forced = machine.force_publish(now);
    assert_eq!(forced.phase, Phase::Playing);
    assert!(machine.poll_publish(now, Duration::from_secs(10)).is_none());
  }

  #[test]
  fn test_state_json_shape() {
    let json = serde_json::to_value(PlaybackState::default()).unwrap();
    assert_eq!(json["phase"], "idle");
    assert!(json["currentPath"].is_null());
    assert_eq!(json["volumePercent"], 100.0);
    assert!(json.get("positionSeconds").is_some());
    assert!(json.get("durationSeconds").is_some());
    assert!(json.get("currentTitle").is_some());
  }
}
