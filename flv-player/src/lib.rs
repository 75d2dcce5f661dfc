pub mod app;
pub mod codec;
pub mod config;
pub mod controller;
pub mod errors;
pub mod events;
pub mod loader;
pub mod serde_helpers;
pub mod sink;
#[cfg(test)]
pub(crate) mod test_support;
pub mod transmuxer;
pub mod worker;

pub use common::{BufferedRanges, InitSegment, Keyframe, KeyframeIndex, MediaSegment, StreamMetadata, TimeRange, TrackType};
pub use controller::{IngestionState, PlaybackController, Player, PlayerHandle, PlayerStatus};
pub use errors::*;
pub use events::{ErrorKind, PlayerEvent, TransmuxEvent};
