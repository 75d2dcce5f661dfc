use bytes::Bytes;
use common::{Keyframe, KeyframeIndex, StreamMetadata, TrackType};
use tracing::{debug, warn};

use super::amf::{self, AmfValue};
use super::{Codec, CodecFactory, CodecOutput};
use crate::errors::CodecError;

const FILE_HEADER_LEN: usize = 9;
const PREVIOUS_TAG_SIZE_LEN: usize = 4;
const TAG_HEADER_LEN: usize = 11;

const TAG_AUDIO: u8 = 8;
const TAG_VIDEO: u8 = 9;
const TAG_SCRIPT: u8 = 18;

const SOUND_FORMAT_AAC: u8 = 10;
const CODEC_AVC: u8 = 7;
const CODEC_HEVC: u8 = 12;

const PACKET_SEQUENCE_HEADER: u8 = 0;
const PACKET_END_OF_SEQUENCE: u8 = 2;

/// FLV demuxer.
///
/// Splits the container into per-track init and media segments and reports
/// the `onMetaData` script tag, including its keyframe index when present.
/// Only whole tags (header, body and trailing size field) are consumed.
#[derive(Debug, Default)]
pub struct FlvCodec {
    header_parsed: bool,
    rejected: bool,
    /// Absolute source offset of the next unconsumed byte
    position: u64,
}

impl FlvCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the consumed length, 0 while more bytes are needed
    fn parse_file_header(&mut self, data: &[u8], out: &mut dyn CodecOutput) -> usize {
        if data.len() < FILE_HEADER_LEN {
            return 0;
        }

        if &data[..3] != b"FLV" || data[3] != 1 {
            self.reject(out, "missing FLV signature or unsupported version".to_string());
            return data.len();
        }

        let data_offset = u32::from_be_bytes([data[5], data[6], data[7], data[8]]) as usize;
        if data_offset < FILE_HEADER_LEN {
            self.reject(out, format!("header length {} is too short", data_offset));
            return data.len();
        }

        let needed = data_offset + PREVIOUS_TAG_SIZE_LEN;
        if data.len() < needed {
            return 0;
        }

        let flags = data[4];
        debug!(
            "FLV header: audio={}, video={}",
            flags & 0x04 != 0,
            flags & 0x01 != 0
        );
        self.header_parsed = true;
        needed
    }

    fn reject(&mut self, out: &mut dyn CodecOutput, reason: String) {
        warn!("Rejecting input: {}", reason);
        self.rejected = true;
        out.on_error(CodecError::InvalidHeader { reason });
    }

    fn malformed(&self, offset: u64, reason: impl Into<String>) -> CodecError {
        CodecError::MalformedTag {
            offset,
            reason: reason.into(),
        }
    }

    fn parse_audio(&self, offset: u64, timestamp_ms: u64, body: &[u8], out: &mut dyn CodecOutput) {
        let Some(&flags) = body.first() else {
            out.on_error(self.malformed(offset, "empty audio tag"));
            return;
        };

        if flags >> 4 != SOUND_FORMAT_AAC {
            out.on_media_segment(TrackType::Audio, timestamp_ms, Bytes::copy_from_slice(body));
            return;
        }

        match body.get(1) {
            Some(&PACKET_SEQUENCE_HEADER) => {
                out.on_init_segment(None, Some(Bytes::copy_from_slice(&body[2..])));
            }
            Some(_) => out.on_media_segment(TrackType::Audio, timestamp_ms, Bytes::copy_from_slice(body)),
            None => out.on_error(self.malformed(offset, "AAC tag without packet type")),
        }
    }

    fn parse_video(&self, offset: u64, timestamp_ms: u64, body: &[u8], out: &mut dyn CodecOutput) {
        let Some(&flags) = body.first() else {
            out.on_error(self.malformed(offset, "empty video tag"));
            return;
        };

        let codec_id = flags & 0x0F;
        if codec_id != CODEC_AVC && codec_id != CODEC_HEVC {
            out.on_media_segment(TrackType::Video, timestamp_ms, Bytes::copy_from_slice(body));
            return;
        }

        // frame/codec byte, packet type, 24-bit composition time
        if body.len() < 5 {
            out.on_error(self.malformed(offset, "truncated AVC video tag"));
            return;
        }

        match body[1] {
            PACKET_SEQUENCE_HEADER => out.on_init_segment(Some(Bytes::copy_from_slice(&body[5..])), None),
            PACKET_END_OF_SEQUENCE => {}
            _ => out.on_media_segment(TrackType::Video, timestamp_ms, Bytes::copy_from_slice(body)),
        }
    }

    fn parse_script(&self, offset: u64, body: &[u8], out: &mut dyn CodecOutput) {
        match amf::decode_script_data(body) {
            Ok((name, value)) if name == "onMetaData" => out.on_metadata(metadata_from_amf(&value)),
            Ok((name, _)) => debug!("Ignoring script tag {} at byte {}", name, offset),
            Err(e) => out.on_error(e),
        }
    }
}

/// Build stream metadata from an `onMetaData` value.
///
/// Keyframe times arrive in seconds; entries that do not advance the time are
/// dropped so the resulting index stays strictly increasing.
pub fn metadata_from_amf(value: &AmfValue) -> StreamMetadata {
    let duration = value.get("duration").and_then(AmfValue::as_f64).unwrap_or(0.0);

    let index = value.get("keyframes").and_then(|keyframes| {
        let times = keyframes.get("times")?.as_numbers()?;
        let positions = keyframes.get("filepositions")?.as_numbers()?;

        let mut index_times: Vec<u64> = Vec::with_capacity(times.len());
        let mut index_offsets = Vec::with_capacity(times.len());
        for (t, p) in times.iter().zip(positions.iter()) {
            if !t.is_finite() || !p.is_finite() || *t < 0.0 || *p < 0.0 {
                continue;
            }
            let time_ms = (t * 1000.0).round() as u64;
            if index_times.last().map_or(true, |last| time_ms > *last) {
                index_times.push(time_ms);
                index_offsets.push(*p as u64);
            }
        }

        if index_times.is_empty() {
            return None;
        }
        KeyframeIndex::new(index_times, index_offsets)
    });

    StreamMetadata::new(duration, index)
}

impl Codec for FlvCodec {
    fn set_input(&mut self, data: &[u8], out: &mut dyn CodecOutput) -> usize {
        if self.rejected {
            self.position += data.len() as u64;
            return data.len();
        }

        let mut offset = 0;
        if !self.header_parsed {
            offset = self.parse_file_header(data, out);
            self.position += offset as u64;
            if !self.header_parsed {
                return offset;
            }
        }

        while data.len() - offset >= TAG_HEADER_LEN {
            let header = &data[offset..offset + TAG_HEADER_LEN];
            let tag_type = header[0] & 0x1F;
            let body_len = u32::from_be_bytes([0, header[1], header[2], header[3]]) as usize;
            let timestamp_ms =
                u32::from_be_bytes([header[7], header[4], header[5], header[6]]) as u64;

            let total = TAG_HEADER_LEN + body_len + PREVIOUS_TAG_SIZE_LEN;
            if data.len() - offset < total {
                break;
            }

            let tag_offset = self.position;
            let body = &data[offset + TAG_HEADER_LEN..offset + TAG_HEADER_LEN + body_len];
            match tag_type {
                TAG_AUDIO => self.parse_audio(tag_offset, timestamp_ms, body, out),
                TAG_VIDEO => self.parse_video(tag_offset, timestamp_ms, body, out),
                TAG_SCRIPT => self.parse_script(tag_offset, body, out),
                other => out.on_error(self.malformed(tag_offset, format!("unknown tag type {}", other))),
            }

            offset += total;
            self.position += total as u64;
        }

        offset
    }

    /// Offset 0 restarts at the file header
    fn seek(&mut self, keyframe: &Keyframe) {
        debug!(
            "Codec resuming at keyframe {}ms (byte {})",
            keyframe.time_ms, keyframe.byte_offset
        );
        self.header_parsed = keyframe.byte_offset != 0;
        self.rejected = false;
        self.position = keyframe.byte_offset;
    }
}

#[derive(Debug, Default, Clone)]
pub struct FlvCodecFactory;

impl CodecFactory for FlvCodecFactory {
    fn create(&self) -> Box<dyn Codec> {
        Box::new(FlvCodec::new())
    }
}
