//! Stream identifiers and per-stream sequence numbering.
//!
//! Every accepted stream gets a server-minted [`StreamId`]. Sequence numbers
//! start at 1 and grow by one for each emitted `chunk` and once more for the
//! final `end`; nothing may follow the `end`.

use crate::envelope::{Envelope, Modifier};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(pub Uuid);

impl StreamId {
    /// Mint a new random stream ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for StreamId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(StreamId)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SequenceError {
    #[error("Stream {0} already ended")]
    AlreadyEnded(StreamId),

    #[error("Stream {stream_id} expected seq {expected} but saw {actual}")]
    OutOfOrder {
        stream_id: StreamId,
        expected: u64,
        actual: u64,
    },

    #[error("Envelope for stream {0} has no sequence number")]
    MissingSeq(StreamId),

    #[error("Server envelope has no stream id")]
    MissingStreamId,

    #[error("Start envelopes are never emitted on a stream")]
    UnexpectedStart,
}

/// Lifecycle of one stream on the emitting side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// Acknowledged, nothing emitted yet.
    Accepted,
    /// At least one chunk emitted.
    Streaming,
    /// Terminal `end` emitted.
    Ended,
}

/// Assigns sequence numbers for a single stream at emission time.
#[derive(Debug, Clone)]
pub struct StreamSequencer {
    stream_id: StreamId,
    last_seq: u64,
    phase: StreamPhase,
}

impl StreamSequencer {
    pub fn new(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            last_seq: 0,
            phase: StreamPhase::Accepted,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Reserve the sequence number for the next chunk.
    pub fn next_chunk(&mut self) -> Result<u64, SequenceError> {
        if self.phase == StreamPhase::Ended {
            return Err(SequenceError::AlreadyEnded(self.stream_id));
        }
        self.last_seq += 1;
        self.phase = StreamPhase::Streaming;
        Ok(self.last_seq)
    }

    /// Reserve the sequence number for the terminal `end`.
    pub fn next_end(&mut self) -> Result<u64, SequenceError> {
        if self.phase == StreamPhase::Ended {
            return Err(SequenceError::AlreadyEnded(self.stream_id));
        }
        self.last_seq += 1;
        self.phase = StreamPhase::Ended;
        Ok(self.last_seq)
    }
}

/// Receiving-side check that server envelopes obey start→chunk*→end with
/// gapless sequence numbers, tracked independently per stream id.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    streams: HashMap<StreamId, StreamSequencer>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observed server envelope.
    pub fn observe(&mut self, envelope: &Envelope) -> Result<(), SequenceError> {
        let stream_id = envelope.stream_id.ok_or(SequenceError::MissingStreamId)?;
        let actual = envelope.seq.ok_or(SequenceError::MissingSeq(stream_id))?;
        let sequencer = self
            .streams
            .entry(stream_id)
            .or_insert_with(|| StreamSequencer::new(stream_id));
        let expected = match envelope.modifier {
            Modifier::Chunk => sequencer.next_chunk()?,
            Modifier::End => sequencer.next_end()?,
            Modifier::Start => return Err(SequenceError::UnexpectedStart),
        };
        if expected != actual {
            return Err(SequenceError::OutOfOrder {
                stream_id,
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Whether the given stream has received its `end`.
    pub fn is_ended(&self, stream_id: StreamId) -> bool {
        self.streams
            .get(&stream_id)
            .map(|s| s.phase() == StreamPhase::Ended)
            .unwrap_or(false)
    }

    /// Streams that have been observed but not yet ended.
    pub fn open_streams(&self) -> Vec<StreamId> {
        self.streams
            .values()
            .filter(|s| s.phase() != StreamPhase::Ended)
            .map(StreamSequencer::stream_id)
            .collect()
    }
}
