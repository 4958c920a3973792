use crate::buffers::ChannelBuffers;
use crate::wire::{decode_frame, Topic, DEFAULT_MAX_FRAME_BYTES};
use tracing::debug;

/// Outcome of handling one raw frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Routed(Topic),
    Dropped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemuxStats {
    pub routed: u64,
    pub dropped: u64,
}

/// Parses inbound text frames and routes each to exactly one buffer.
///
/// Handling a frame is a single synchronous call that finishes before the
/// next frame is looked at, so per-topic order is arrival order.
#[derive(Debug, Clone)]
pub struct Demultiplexer {
    max_frame_bytes: usize,
    stats: DemuxStats,
}

impl Default for Demultiplexer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Demultiplexer {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            stats: DemuxStats::default(),
        }
    }

    pub fn on_frame(&mut self, raw: &str, buffers: &mut ChannelBuffers) -> Dispatch {
        match decode_frame(raw, self.max_frame_bytes) {
            Ok(frame) => {
                let topic = buffers.ingest(frame);
                self.stats.routed += 1;
                Dispatch::Routed(topic)
            }
            Err(err) => {
                self.stats.dropped += 1;
                debug!(event = "frame_dropped", error = %err, bytes = raw.len());
                Dispatch::Dropped
            }
        }
    }

    pub fn stats(&self) -> DemuxStats {
        self.stats
    }
}
