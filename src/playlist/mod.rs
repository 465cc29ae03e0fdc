//! Playlist construction from a media directory.
//!
//! - `natural.rs` - natural-order string comparison
//! - `builder.rs` - directory scan, on-disk playlist cache

mod builder;
mod natural;

pub use builder::{FsScanner, MediaScanner, PlaylistBuilder, PlaylistError};
pub use natural::natural_cmp;
