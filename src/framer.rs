//! Re-assembles the unframed byte stream coming from the BMS into frames.
//!
//! A frame ends at the first stop byte (0x77) after the previous frame. The
//! stop byte is kept as the last byte so the caller can validate the
//! terminator and checksum. Chunk boundaries from the transport are
//! irrelevant: a frame may arrive in many chunks and a chunk may carry many
//! frames.

use crate::protocol::{MAX_FRAME_LENGTH, STOP_BYTE};

#[derive(Debug)]
pub struct StreamFramer {
    buffer: Vec<u8>,
    max_length: usize,
    resyncing: bool,
}

impl Default for StreamFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamFramer {
    pub fn new() -> Self {
        Self::with_max_length(MAX_FRAME_LENGTH)
    }

    /// A framer that drops buffered data once it grows past `max_length`
    /// without containing a stop byte.
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(max_length),
            max_length,
            resyncing: false,
        }
    }

    /// Appends a chunk received from the transport.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() > self.max_length && !self.buffer.contains(&STOP_BYTE) {
            log::warn!(
                "No stop byte within {} bytes, dropping {:02X?}",
                self.max_length,
                self.buffer
            );
            self.buffer.clear();
            self.resyncing = false;
        }
    }

    /// Marks the pending bytes as the head of an abandoned frame. The frame
    /// they complete is dropped instead of returned.
    pub fn resync(&mut self) {
        log::warn!("Abandoning partial frame {:02X?}", self.buffer);
        self.resyncing = true;
    }

    /// Removes and returns the oldest complete frame.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            let end = self.buffer.iter().position(|b| *b == STOP_BYTE)?;
            let frame: Vec<u8> = self.buffer.drain(..=end).collect();
            if self.resyncing {
                self.resyncing = false;
                log::warn!("Dropping remainder of abandoned frame {frame:02X?}");
                continue;
            }
            log::trace!("framed {frame:02X?}");
            return Some(frame);
        }
    }

    /// Drains every complete frame currently buffered, oldest first.
    pub fn frames(&mut self) -> impl Iterator<Item = Vec<u8>> + '_ {
        std::iter::from_fn(move || self.next_frame())
    }

    /// Appends `chunk` and returns the frames it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.extend(chunk);
        self.frames().collect()
    }

    /// Drops complete frames nobody asked for. A trailing partial frame is
    /// kept. Returns the number of frames dropped.
    pub fn discard_complete(&mut self) -> usize {
        let mut dropped = 0;
        while let Some(frame) = self.next_frame() {
            log::warn!("Discarding unsolicited frame {frame:02X?}");
            dropped += 1;
        }
        dropped
    }

    /// Bytes received but not yet part of a complete frame.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }
}
