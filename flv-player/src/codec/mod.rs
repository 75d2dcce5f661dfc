//! Container demuxing behind a push-style interface.
//!
//! The transmuxer feeds raw bytes through [`Codec::set_input`] and learns how
//! many were consumed; anything left over is offered again, prefixed to the
//! next chunk.

pub mod amf;
pub mod flv;

use bytes::Bytes;
use common::{Keyframe, StreamMetadata, TrackType};

use crate::errors::CodecError;

pub use flv::{FlvCodec, FlvCodecFactory};

/// Sink for everything a codec produces while consuming input
pub trait CodecOutput {
    /// Track configuration; either side may be absent
    fn on_init_segment(&mut self, video: Option<Bytes>, audio: Option<Bytes>);

    fn on_media_segment(&mut self, track: TrackType, timestamp_ms: u64, data: Bytes);

    /// Malformed input; decoding continues with the next parsable unit
    fn on_error(&mut self, error: CodecError);

    fn on_metadata(&mut self, metadata: StreamMetadata);
}

/// Stateful container decoder
pub trait Codec: Send {
    /// Consume as many whole units from `data` as possible and return the
    /// number of bytes used.
    fn set_input(&mut self, data: &[u8], out: &mut dyn CodecOutput) -> usize;

    /// The next input starts at `keyframe` instead of continuing the stream
    fn seek(&mut self, keyframe: &Keyframe);
}

pub trait CodecFactory: Send + Sync {
    fn create(&self) -> Box<dyn Codec>;
}

impl<F> CodecFactory for F
where
    F: Fn() -> Box<dyn Codec> + Send + Sync,
{
    fn create(&self) -> Box<dyn Codec> {
        self()
    }
}
