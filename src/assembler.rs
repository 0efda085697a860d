use crate::protocol::{END_BYTE, MAX_FRAME_LENGTH};

/// Collects notification chunks until a frame terminator shows up.
///
/// A frame is complete as soon as the collected bytes end in the end byte.
/// Bytes piling up beyond `max_len` without a terminator are thrown away, so a
/// device that never terminates its frame cannot grow the buffer forever.
#[derive(Debug)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
    max_len: usize,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::with_max_len(MAX_FRAME_LENGTH)
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(max_len.min(MAX_FRAME_LENGTH)),
            max_len,
        }
    }

    /// Appends `chunk` and returns the whole buffer if it now forms a complete frame.
    pub fn feed(&mut self, chunk: &[u8]) -> Option<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        if self.buffer.last() == Some(&END_BYTE) {
            return Some(std::mem::take(&mut self.buffer));
        }
        if self.buffer.len() > self.max_len {
            log::warn!(
                "Discarding {} buffered bytes without end byte (limit {})",
                self.buffer.len(),
                self.max_len
            );
            self.buffer.clear();
        }
        None
    }

    pub fn clear(&mut self) {
        if !self.buffer.is_empty() {
            log::debug!("Dropping partial frame: {:02X?}", self.buffer);
        }
        self.buffer.clear();
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}
