use crate::error::{ProtocolError, Result};
use crate::types::*;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Commands posted to the offload worker.
///
/// Commands that open a loader session carry a generation number, raised for
/// every new session. Segments echo it so output of a replaced session can be
/// recognised after the fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerCommand {
    /// Prepare the codec session
    Init,
    /// Open a loader on the configured source
    LoadSource { generation: u64 },
    /// Reopen the loader at a keyframe's byte offset
    Seek { source: Keyframe, generation: u64 },
    /// Feed bytes read outside the worker
    Pipe { source: PipedChunk },
    Pause,
    Resume,
    /// Reopen the loader at the start of the source
    Refresh { generation: u64 },
    Destroy,
}

/// Raw bytes handed to the worker by `Pipe`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipedChunk {
    pub data: Bytes,
    pub byte_start: u64,
    pub keyframe: Option<Keyframe>,
}

/// Messages posted back by the offload worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerResponse {
    /// Bytes consumed from a piped chunk
    PipeCallback { source: usize },
    MediaSegmentInit { source: InitSegment },
    /// `generation` is that of the loader session the segment was read from
    MediaSegment { source: MediaSegment, generation: u64 },
    Metadata { source: StreamMetadata },
    DemuxError { source: String },
    Error { source: String },
}

/// Envelope carrying a sequence number so the receiver can verify FIFO delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerMessage<T> {
    pub sequence_number: u64,
    pub body: T,
}

/// Serialize a message for the worker channel
pub fn encode<T: Serialize>(sequence_number: u64, body: &T) -> Result<Vec<u8>> {
    #[derive(Serialize)]
    struct Borrowed<'a, T> {
        sequence_number: u64,
        body: &'a T,
    }
    bincode::serialize(&Borrowed { sequence_number, body })
        .map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Deserialize a message from the worker channel
pub fn decode<T: for<'de> Deserialize<'de>>(frame: &[u8]) -> Result<WorkerMessage<T>> {
    bincode::deserialize(frame).map_err(|e| ProtocolError::Decode(e.to_string()))
}

/// Tracks the expected sequence number on one side of the channel
#[derive(Debug, Default)]
pub struct SequenceCounter {
    next: u64,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number to stamp on the next outgoing message
    pub fn next_outgoing(&mut self) -> u64 {
        let n = self.next;
        self.next += 1;
        n
    }

    /// Check an incoming message is the one expected next
    pub fn accept(&mut self, sequence_number: u64) -> Result<()> {
        if sequence_number != self.next {
            return Err(ProtocolError::OutOfOrder {
                expected: self.next,
                received: sequence_number,
            });
        }
        self.next += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_frame_decodes_to_same_command() {
        let cmd = WorkerCommand::Seek {
            source: Keyframe::new(2000, 40960),
            generation: 3,
        };
        let frame = encode(7, &cmd).unwrap();
        let msg: WorkerMessage<WorkerCommand> = decode(&frame).unwrap();
        assert_eq!(msg.sequence_number, 7);
        assert_eq!(msg.body, cmd);
    }

    #[test]
    fn test_response_carries_payload_bytes() {
        let resp = WorkerResponse::MediaSegment {
            source: MediaSegment {
                track: TrackType::Audio,
                timestamp_ms: 23,
                data: Bytes::from_static(&[0xAF, 0x01, 0x21]),
            },
            generation: 2,
        };
        let frame = encode(0, &resp).unwrap();
        let msg: WorkerMessage<WorkerResponse> = decode(&frame).unwrap();
        match msg.body {
            WorkerResponse::MediaSegment { source, generation } => {
                assert_eq!(generation, 2);
                assert_eq!(source.track, TrackType::Audio);
                assert_eq!(&source.data[..], &[0xAF, 0x01, 0x21]);
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_garbage_frame_is_decode_error() {
        let result = decode::<WorkerCommand>(&[0xFF, 0xFF, 0xFF]);
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_sequence_counter_detects_reordering() {
        let mut tx = SequenceCounter::new();
        let mut rx = SequenceCounter::new();
        let a = tx.next_outgoing();
        let b = tx.next_outgoing();
        assert!(rx.accept(a).is_ok());
        assert!(rx.accept(b).is_ok());
        let err = rx.accept(5).unwrap_err();
        assert!(matches!(err, ProtocolError::OutOfOrder { expected: 2, received: 5 }));
    }
}
