//! JPEG frame chunking for BLE notifications.
//!
//! A VGA JPEG is tens of kilobytes while a single BLE notification carries at
//! most the negotiated MTU. This module splits one frame into a sequence of
//! chunks the viewer can put back together by order alone.
//!
//! # Chunk Format
//!
//! Each chunk has an 8-byte little-endian header:
//! ```text
//! [frame_seq: 4 bytes][chunk_index: 2 bytes][chunk_count: 2 bytes][payload: N bytes]
//! ```
//!
//! `chunk_count` holds the number of chunks in the frame in its low 15 bits.
//! Bit 15 (`FINAL_FLAG`) is set on the last chunk of the frame and nowhere
//! else. The payload length is the write length minus the header.
//!
//! # Example
//!
//! ```
//! use esp32_cam_ble::ble::Chunker;
//! use esp32_cam_ble::camera::Frame;
//!
//! let chunker = Chunker::new(100); // 100-byte MTU, 92-byte payloads
//! let frame = Frame::new(0, tokio::time::Instant::now(), vec![0u8; 250]);
//!
//! let sizes: Vec<usize> = chunker.begin(frame).unwrap().map(|c| c.payload().len()).collect();
//! assert_eq!(sizes, vec![92, 92, 66]);
//! ```

use crate::camera::Frame;
use std::fmt;
use std::iter::FusedIterator;

/// Header size in bytes (frame_seq + chunk_index + chunk_count).
pub const PROTOCOL_OVERHEAD: usize = 8;

/// Marks the last chunk of a frame in the `chunk_count` field.
pub const FINAL_FLAG: u16 = 0x8000;

/// Largest chunk count the header can express.
pub const MAX_CHUNKS_PER_FRAME: usize = (FINAL_FLAG - 1) as usize;

/// Identifies one chunk within a streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkId {
    /// Parent frame sequence number.
    pub frame_seq: u32,
    /// Position within the frame, starting at 0.
    pub index: u16,
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.frame_seq, self.index)
    }
}

/// One fragment of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    frame_seq: u32,
    index: u16,
    count: u16,
    payload: Vec<u8>,
}

impl Chunk {
    /// Create a chunk.
    ///
    /// `count` is the total number of chunks in the frame; the chunk is final
    /// when `index + 1 == count`.
    pub fn new(frame_seq: u32, index: u16, count: u16, payload: Vec<u8>) -> Self {
        Self {
            frame_seq,
            index,
            count,
            payload,
        }
    }

    /// Chunk identity.
    pub fn id(&self) -> ChunkId {
        ChunkId {
            frame_seq: self.frame_seq,
            index: self.index,
        }
    }

    /// Parent frame sequence number.
    #[inline]
    pub fn frame_seq(&self) -> u32 {
        self.frame_seq
    }

    /// Position within the frame.
    #[inline]
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Number of chunks in the parent frame.
    #[inline]
    pub fn count(&self) -> u16 {
        self.count
    }

    /// Check if this is the last chunk of its frame.
    #[inline]
    pub fn is_final(&self) -> bool {
        self.index.checked_add(1) == Some(self.count)
    }

    /// Payload bytes (without header).
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serialized length (header + payload).
    pub fn wire_len(&self) -> usize {
        PROTOCOL_OVERHEAD + self.payload.len()
    }

    /// Raw value of the `chunk_count` header field.
    fn count_field(&self) -> u16 {
        if self.is_final() {
            self.count | FINAL_FLAG
        } else {
            self.count
        }
    }

    /// Serialize chunk to bytes (header + payload).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.wire_len()];
        // Cannot fail: the buffer is exactly wire_len() long
        let _ = self.write_to(&mut bytes);
        bytes
    }

    /// Serialize chunk into provided buffer.
    ///
    /// Returns the number of bytes written, or error if buffer too small.
    pub fn write_to(&self, buf: &mut [u8]) -> Result<usize, ChunkError> {
        let total_len = self.wire_len();
        if buf.len() < total_len {
            return Err(ChunkError::BufferTooSmall);
        }
        buf[0..4].copy_from_slice(&self.frame_seq.to_le_bytes());
        buf[4..6].copy_from_slice(&self.index.to_le_bytes());
        buf[6..8].copy_from_slice(&self.count_field().to_le_bytes());
        buf[PROTOCOL_OVERHEAD..total_len].copy_from_slice(&self.payload);
        Ok(total_len)
    }

    /// Deserialize chunk from bytes.
    ///
    /// Rejects headers whose final flag disagrees with the index and count.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChunkError> {
        if bytes.len() < PROTOCOL_OVERHEAD {
            return Err(ChunkError::TooShort);
        }
        let frame_seq = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let index = u16::from_le_bytes([bytes[4], bytes[5]]);
        let count_field = u16::from_le_bytes([bytes[6], bytes[7]]);
        let count = count_field & !FINAL_FLAG;
        let flagged_final = count_field & FINAL_FLAG != 0;

        if count == 0 || index >= count || flagged_final != (index + 1 == count) {
            return Err(ChunkError::InvalidHeader);
        }

        Ok(Self {
            frame_seq,
            index,
            count,
            payload: bytes[PROTOCOL_OVERHEAD..].to_vec(),
        })
    }
}

/// Errors that can occur while chunking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkError {
    /// Frame has no data. Treated as a skipped tick.
    EmptyFrame,
    /// MTU cannot carry the header plus at least one payload byte.
    MtuTooSmall,
    /// Frame would need more chunks than the header can count.
    TooManyChunks(usize),
    /// Chunk data is too short to contain header.
    TooShort,
    /// Header fields are inconsistent.
    InvalidHeader,
    /// Buffer too small for serialization.
    BufferTooSmall,
}

impl fmt::Display for ChunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyFrame => write!(f, "cannot chunk empty frame"),
            Self::MtuTooSmall => write!(f, "MTU too small (minimum: {})", PROTOCOL_OVERHEAD + 1),
            Self::TooManyChunks(n) => {
                write!(f, "frame needs {} chunks (max {})", n, MAX_CHUNKS_PER_FRAME)
            }
            Self::TooShort => write!(f, "chunk too short"),
            Self::InvalidHeader => write!(f, "invalid chunk header"),
            Self::BufferTooSmall => write!(f, "buffer too small for chunk"),
        }
    }
}

impl std::error::Error for ChunkError {}

/// Splits frames into MTU-sized chunks.
#[derive(Debug, Clone)]
pub struct Chunker {
    /// Maximum write size (including header).
    mtu: usize,
}

impl Chunker {
    /// Create a new chunker with the given MTU.
    ///
    /// # Panics
    ///
    /// Panics if MTU is not larger than [`PROTOCOL_OVERHEAD`].
    pub fn new(mtu: usize) -> Self {
        Self::try_new(mtu).expect("MTU must be greater than protocol overhead")
    }

    /// Try to create a new chunker with the given MTU.
    pub fn try_new(mtu: usize) -> Result<Self, ChunkError> {
        if mtu <= PROTOCOL_OVERHEAD {
            return Err(ChunkError::MtuTooSmall);
        }
        Ok(Self { mtu })
    }

    /// Adopt a renegotiated MTU.
    ///
    /// Only frames started afterwards use it; an iterator already handed out
    /// keeps the payload size it was created with.
    pub fn set_mtu(&mut self, mtu: usize) -> Result<(), ChunkError> {
        if mtu <= PROTOCOL_OVERHEAD {
            return Err(ChunkError::MtuTooSmall);
        }
        self.mtu = mtu;
        Ok(())
    }

    /// Current MTU.
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Get the maximum payload size per chunk.
    pub fn max_payload(&self) -> usize {
        self.mtu - PROTOCOL_OVERHEAD
    }

    /// Number of chunks a frame of `len` bytes needs.
    pub fn chunk_count(&self, len: usize) -> usize {
        len.div_ceil(self.max_payload())
    }

    /// Start chunking a frame.
    ///
    /// Takes ownership of the frame. The returned iterator yields chunks
    /// lazily, in index order, exactly once.
    pub fn begin(&self, frame: Frame) -> Result<ChunkIter, ChunkError> {
        if frame.is_empty() {
            return Err(ChunkError::EmptyFrame);
        }
        let count = self.chunk_count(frame.len());
        if count > MAX_CHUNKS_PER_FRAME {
            return Err(ChunkError::TooManyChunks(count));
        }
        Ok(ChunkIter {
            frame,
            max_payload: self.max_payload(),
            count: count as u16,
            next_index: 0,
        })
    }
}

/// Lazy, finite, non-restartable sequence of chunks for one frame.
///
/// Owns the frame until it is dropped, which makes it the frame-in-flight slot.
#[derive(Debug)]
pub struct ChunkIter {
    frame: Frame,
    max_payload: usize,
    count: u16,
    next_index: u16,
}

impl ChunkIter {
    /// Sequence number of the frame being chunked.
    pub fn frame_seq(&self) -> u32 {
        self.frame.seq()
    }

    /// Total chunks in the frame.
    pub fn total(&self) -> u16 {
        self.count
    }

    /// Payload size fixed for this frame.
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Chunks not yet yielded.
    pub fn remaining(&self) -> usize {
        usize::from(self.count - self.next_index)
    }

    /// Get a reference to the frame.
    pub fn frame(&self) -> &Frame {
        &self.frame
    }
}

impl Iterator for ChunkIter {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.next_index >= self.count {
            return None;
        }
        let start = usize::from(self.next_index) * self.max_payload;
        let end = (start + self.max_payload).min(self.frame.len());
        let chunk = Chunk::new(
            self.frame.seq(),
            self.next_index,
            self.count,
            self.frame.data()[start..end].to_vec(),
        );
        self.next_index += 1;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for ChunkIter {}

impl FusedIterator for ChunkIter {}
