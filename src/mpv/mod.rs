//! MPV IPC module - spawns and controls an external MPV player via JSON IPC.
//!
//! Architecture:
//! - `process.rs` - MPV binary detection, spawning and termination
//! - `ipc.rs` - Unix socket session with observation loop, plus one-shot requests
//! - `protocol.rs` - JSON command/response types and event decoding
//! - `client.rs` - High-level MPV client tying the above together

mod client;
mod ipc;
mod process;
mod protocol;

pub use client::{MpvClient, MpvError};
pub use ipc::{request, IpcError, IpcSession, ObserveTask};
pub use process::{cleanup_socket, find_mpv, player_args, ProcessError, ProcessSupervisor};
pub use protocol::{MpvCommand, MpvEvent, MpvMessage, PlayerEvent, OBSERVED_PROPERTIES};
