//! Marker-delimited frame extraction from a live byte stream.
//!
//! Raw-binary workers write complete JPEG images back to back on stdout,
//! interleaved with the odd status line. Reads arrive in arbitrary chunks, so
//! a frame may be split across any number of them.

use axis_bridge_types::FrameData;

use super::error::FrameError;

/// JPEG start-of-image marker.
pub const JPEG_START: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker.
pub const JPEG_END: [u8; 2] = [0xFF, 0xD9];

/// Largest partial frame kept before the assembler gives up on it.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Stateful scanner turning chunks into complete frames.
///
/// The buffer either starts with the start marker (a frame is in progress)
/// or holds at most `start_marker.len() - 1` bytes that could still become
/// the beginning of one.
#[derive(Debug)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
    start_marker: Vec<u8>,
    end_marker: Vec<u8>,
    max_buffer: usize,
    /// Where the end-marker search resumes within an in-progress frame.
    end_scan: usize,
}

impl FrameAssembler {
    /// Assembler for JPEG frames.
    pub fn new(max_buffer: usize) -> Self {
        Self::with_markers(&JPEG_START, &JPEG_END, max_buffer)
    }

    pub fn with_markers(start_marker: &[u8], end_marker: &[u8], max_buffer: usize) -> Self {
        assert!(
            !start_marker.is_empty() && !end_marker.is_empty(),
            "frame markers must not be empty"
        );
        Self {
            buffer: Vec::new(),
            start_marker: start_marker.to_vec(),
            end_marker: end_marker.to_vec(),
            max_buffer,
            end_scan: 0,
        }
    }

    /// True while a start marker has been seen without its end marker.
    pub fn in_frame(&self) -> bool {
        self.buffer.starts_with(&self.start_marker)
    }

    /// Bytes currently held back.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial frame.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.end_scan = 0;
    }

    /// Append `chunk` and return every frame it completes, in stream order.
    ///
    /// Bytes outside any start/end pair are discarded. An in-progress frame
    /// that grows past the limit is dropped and reported as
    /// [`FrameError::Overflow`]; extraction resumes with the next start marker.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<FrameData, FrameError>> {
        let mut frames = Vec::new();
        let mut rest = chunk;

        loop {
            let (frame, used) = self.push_until_frame(rest);
            rest = &rest[used..];
            match frame {
                Some(frame) => frames.push(frame),
                None => break,
            }
            if rest.is_empty() {
                break;
            }
        }

        frames
    }

    /// Consume `chunk` up to the end of the first frame it completes.
    ///
    /// Returns that frame (or overflow) and how many bytes of `chunk` were
    /// used. Bytes past the frame's end marker are left to the caller, which
    /// lets text between frames be read by someone else.
    pub fn push_until_frame(
        &mut self,
        chunk: &[u8],
    ) -> (Option<Result<FrameData, FrameError>>, usize) {
        let held = self.buffer.len();
        self.buffer.extend_from_slice(chunk);

        let mut dropped = 0;
        if !self.in_frame() {
            match find(&self.buffer, &self.start_marker, 0) {
                Some(start) => {
                    self.buffer.drain(..start);
                    self.end_scan = 0;
                    dropped = start;
                }
                None => {
                    // Keep a tail that may be the first half of a split marker
                    let keep = (self.start_marker.len() - 1).min(self.buffer.len());
                    let cut = self.buffer.len() - keep;
                    self.buffer.drain(..cut);
                    return (None, chunk.len());
                }
            }
        }

        let from = self.end_scan.max(self.start_marker.len());
        if let Some(end) = find(&self.buffer, &self.end_marker, from) {
            let end = end + self.end_marker.len();
            let frame = FrameData::from(&self.buffer[..end]);
            // Everything after `end` came from `chunk`
            let used = (end + dropped).saturating_sub(held).min(chunk.len());
            self.reset();
            return (Some(Ok(frame)), used);
        }

        self.end_scan = self
            .buffer
            .len()
            .saturating_sub(self.end_marker.len() - 1);
        if self.buffer.len() > self.max_buffer {
            let buffered = self.buffer.len();
            self.reset();
            return (
                Some(Err(FrameError::Overflow {
                    buffered,
                    limit: self.max_buffer,
                })),
                chunk.len(),
            );
        }
        (None, chunk.len())
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}
