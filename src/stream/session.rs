//! Frame-in-flight bookkeeping.
//!
//! A session holds at most one frame. Its chunks are pulled lazily from the
//! [`ChunkIter`] into a small ordered queue; the head of the queue is the
//! chunk being sent. A chunk leaves the queue only when the link confirms it,
//! so a timed-out chunk is simply sent again.

use crate::ble::{Chunk, ChunkId, ChunkIter};
use log::debug;
use std::collections::VecDeque;

/// The single frame-in-flight slot and its pending chunks.
#[derive(Debug)]
pub struct StreamSession {
    in_flight: Option<ChunkIter>,
    pending: VecDeque<Chunk>,
    capacity: usize,
    last_acked: Option<ChunkId>,
    consecutive_timeouts: u32,
}

impl StreamSession {
    /// Create an empty session that buffers up to `capacity` chunks.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            in_flight: None,
            pending: VecDeque::with_capacity(capacity),
            capacity,
            last_acked: None,
            consecutive_timeouts: 0,
        }
    }

    /// Take ownership of a new frame's chunks.
    ///
    /// Returns the iterator back if a frame is already in flight.
    pub fn load(&mut self, chunks: ChunkIter) -> Result<(), ChunkIter> {
        if self.in_flight.is_some() {
            return Err(chunks);
        }
        debug!(
            "Frame {} loaded: {} bytes in {} chunks",
            chunks.frame_seq(),
            chunks.frame().len(),
            chunks.total()
        );
        self.in_flight = Some(chunks);
        self.consecutive_timeouts = 0;
        Ok(())
    }

    /// Check if a frame is in flight.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Sequence number of the frame in flight.
    pub fn in_flight_seq(&self) -> Option<u32> {
        self.in_flight.as_ref().map(ChunkIter::frame_seq)
    }

    /// Chunk to send next, refilling the queue from the frame.
    pub fn front(&mut self) -> Option<&Chunk> {
        if let Some(chunks) = self.in_flight.as_mut() {
            while self.pending.len() < self.capacity {
                match chunks.next() {
                    Some(chunk) => self.pending.push_back(chunk),
                    None => break,
                }
            }
        }
        self.pending.front()
    }

    /// Number of chunks buffered ahead of the link.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Record a confirmed chunk.
    ///
    /// Returns the frame sequence number when this completes the frame.
    /// An id that is not the queue head is ignored.
    pub fn ack(&mut self, id: ChunkId) -> Option<u32> {
        if self.pending.front().map(Chunk::id) != Some(id) {
            debug!("Ignoring ack for {} (not at head)", id);
            return None;
        }
        let chunk = self.pending.pop_front()?;
        self.last_acked = Some(id);
        self.consecutive_timeouts = 0;

        let exhausted = self
            .in_flight
            .as_ref()
            .map_or(true, |chunks| chunks.remaining() == 0);
        if chunk.is_final() || (exhausted && self.pending.is_empty()) {
            self.in_flight = None;
            self.pending.clear();
            return Some(id.frame_seq);
        }
        None
    }

    /// Count a send timeout on the head chunk. Returns the consecutive count.
    pub fn record_timeout(&mut self) -> u32 {
        self.consecutive_timeouts += 1;
        self.consecutive_timeouts
    }

    /// Consecutive timeouts since the last confirmed chunk.
    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    /// Last chunk the link confirmed.
    pub fn last_acked(&self) -> Option<ChunkId> {
        self.last_acked
    }

    /// Discard the frame in flight and its queued chunks.
    ///
    /// Returns the dropped frame's sequence number, if any.
    pub fn drop_frame(&mut self) -> Option<u32> {
        self.pending.clear();
        self.consecutive_timeouts = 0;
        let seq = self.in_flight.take().map(|chunks| chunks.frame_seq());
        if let Some(seq) = seq {
            debug!("Dropped frame {}", seq);
        }
        seq
    }

    /// Return to the empty state for a new connection.
    pub fn reset(&mut self) {
        self.drop_frame();
        self.last_acked = None;
    }
}
