use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Track carried by a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackType {
    Video,
    Audio,
}

impl TrackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackType::Video => "video",
            TrackType::Audio => "audio",
        }
    }
}

impl std::fmt::Display for TrackType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A random-access point: decode time plus the byte offset of the tag that starts it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyframe {
    pub time_ms: u64,
    pub byte_offset: u64,
}

impl Keyframe {
    pub fn new(time_ms: u64, byte_offset: u64) -> Self {
        Self { time_ms, byte_offset }
    }

    /// Keyframe time in seconds, the unit the presentation sink works in
    pub fn time_secs(&self) -> f64 {
        self.time_ms as f64 / 1000.0
    }
}

/// Sparse keyframe index: two index-aligned sequences, `times` strictly increasing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyframeIndex {
    times: Vec<u64>,
    byte_offsets: Vec<u64>,
}

impl KeyframeIndex {
    /// Build an index from parallel sequences.
    ///
    /// Returns `None` when the lengths differ or `times` is not strictly increasing.
    pub fn new(times: Vec<u64>, byte_offsets: Vec<u64>) -> Option<Self> {
        if times.len() != byte_offsets.len() {
            return None;
        }
        if times.windows(2).any(|w| w[0] >= w[1]) {
            return None;
        }
        Some(Self { times, byte_offsets })
    }

    pub fn times(&self) -> &[u64] {
        &self.times
    }

    pub fn byte_offsets(&self) -> &[u64] {
        &self.byte_offsets
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Keyframe> {
        Some(Keyframe::new(*self.times.get(index)?, *self.byte_offsets.get(index)?))
    }

    /// Keyframe to restart decoding from for `target_ms`.
    ///
    /// Halves the candidate range `[lo, hi)` until one candidate remains. A midpoint
    /// later than the target drops the upper half including the midpoint; an earlier
    /// one keeps the midpoint as the new lower bound. `lo` therefore always holds a
    /// keyframe at or before the target, so the result is the nearest keyframe not
    /// after `target_ms`. Targets before the first keyframe clamp to it.
    pub fn nearest(&self, target_ms: u64) -> Option<Keyframe> {
        if self.times.is_empty() {
            return None;
        }

        let mut lo = 0;
        let mut hi = self.times.len();
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            let time = self.times[mid];
            if time > target_ms {
                hi = mid;
            } else if time < target_ms {
                lo = mid;
            } else {
                return self.get(mid);
            }
        }
        self.get(lo)
    }
}

/// Stream-level information reported by the codec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMetadata {
    /// Duration in seconds
    pub duration: f64,
    pub has_keyframes_index: bool,
    pub keyframes_index: Option<KeyframeIndex>,
}

impl StreamMetadata {
    pub fn new(duration: f64, keyframes_index: Option<KeyframeIndex>) -> Self {
        Self {
            duration,
            has_keyframes_index: keyframes_index.is_some(),
            keyframes_index,
        }
    }

    /// The index, only when the flag says one is present
    pub fn seekable_index(&self) -> Option<&KeyframeIndex> {
        if self.has_keyframes_index {
            self.keyframes_index.as_ref()
        } else {
            None
        }
    }
}

/// Track initialization bytes; must reach the sink before that track's media
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitSegment {
    pub track: TrackType,
    pub data: Bytes,
}

/// Playable bytes for one track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaSegment {
    pub track: TrackType,
    pub timestamp_ms: u64,
    pub data: Bytes,
}

/// Half-open `[start, end)` interval in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, seconds: f64) -> bool {
        seconds >= self.start && seconds < self.end
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Ordered, disjoint ranges already available for playback
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferedRanges {
    ranges: Vec<TimeRange>,
}

impl BufferedRanges {
    pub fn new(mut ranges: Vec<TimeRange>) -> Self {
        ranges.retain(|r| r.end > r.start);
        ranges.sort_by(|a, b| a.start.total_cmp(&b.start));
        Self { ranges }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn ranges(&self) -> &[TimeRange] {
        &self.ranges
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// The range holding `seconds`, if any
    pub fn range_containing(&self, seconds: f64) -> Option<TimeRange> {
        self.ranges.iter().copied().find(|r| r.contains(seconds))
    }

    pub fn contains(&self, seconds: f64) -> bool {
        self.range_containing(seconds).is_some()
    }
}

impl From<Vec<(f64, f64)>> for BufferedRanges {
    fn from(pairs: Vec<(f64, f64)>) -> Self {
        Self::new(pairs.into_iter().map(|(s, e)| TimeRange::new(s, e)).collect())
    }
}
