//! Splits a worker's stdout into typed events.
//!
//! Two wire formats exist and are chosen per worker:
//! - [`OutputProtocol::LineTagged`]: every message is a text line; frames are
//!   base64 on `FRAME:` lines.
//! - [`OutputProtocol::RawBinary`]: text control lines interleaved with raw
//!   JPEG bytes, which go through the [`FrameAssembler`].

use axis_bridge_types::{StatusPayload, WorkerEvent};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::{debug, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::error::FrameError;
use super::frame_assembler::{FrameAssembler, JPEG_START};

lazy_static::lazy_static! {
    static ref CONTROL_PREFIX: Regex =
        Regex::new(r"^(?:STATUS|FRAME|ERROR|CAMERA_FOUND):").expect("valid control prefix pattern");
}

/// Stdout framing used by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputProtocol {
    LineTagged,
    RawBinary,
}

impl OutputProtocol {
    pub fn decoder(self, max_frame_bytes: usize) -> Box<dyn OutputDecoder> {
        match self {
            OutputProtocol::LineTagged => Box::new(LineTaggedDecoder::new(max_frame_bytes)),
            OutputProtocol::RawBinary => Box::new(RawBinaryDecoder::new(max_frame_bytes)),
        }
    }
}

/// Per-worker decoding strategy. Owned by the worker's reader task.
pub trait OutputDecoder: Send {
    /// Consume one read from stdout.
    fn decode(&mut self, chunk: &[u8]) -> Vec<WorkerEvent>;

    /// Stdout reached end of file.
    fn finish(&mut self) -> Vec<WorkerEvent>;
}

/// A recognised control message, borrowed from the line it was parsed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlLine<'a> {
    Status(&'a str),
    Frame(&'a str),
    Error(&'a str),
    DeviceFound(&'a str),
}

impl<'a> ControlLine<'a> {
    /// Status first, then frame, then the rest; `None` for anything else.
    pub fn parse(line: &'a str) -> Option<Self> {
        if let Some(payload) = line.strip_prefix("STATUS:") {
            Some(ControlLine::Status(payload))
        } else if let Some(payload) = line.strip_prefix("FRAME:") {
            Some(ControlLine::Frame(payload))
        } else if let Some(text) = line.strip_prefix("ERROR:") {
            Some(ControlLine::Error(text))
        } else {
            line.strip_prefix("CAMERA_FOUND:")
                .map(ControlLine::DeviceFound)
        }
    }

    pub fn into_event(self) -> WorkerEvent {
        match self {
            ControlLine::Status(payload) => WorkerEvent::Status(StatusPayload::parse(payload)),
            ControlLine::Frame(payload) => match STANDARD.decode(payload.trim()) {
                Ok(bytes) => WorkerEvent::Frame(bytes.into()),
                Err(e) => frame_error(FrameError::InvalidPayload(e.to_string())),
            },
            ControlLine::Error(text) => WorkerEvent::ErrorLine(text.trim().to_string()),
            ControlLine::DeviceFound(path) => {
                WorkerEvent::Status(StatusPayload::DeviceFound(path.trim().to_string()))
            }
        }
    }
}

fn frame_error(err: FrameError) -> WorkerEvent {
    warn!("[DEMUX] {err}");
    WorkerEvent::ErrorLine(err.to_string())
}

fn classify_line(line: &str) -> Option<WorkerEvent> {
    let line = line.trim_end_matches('\r');
    if line.trim().is_empty() {
        return None;
    }
    Some(match ControlLine::parse(line) {
        Some(control) => control.into_event(),
        None => WorkerEvent::Status(StatusPayload::Untagged(line.to_string())),
    })
}

/// Protocol A: newline-delimited text.
#[derive(Debug)]
pub struct LineTaggedDecoder {
    pending: Vec<u8>,
    max_line: usize,
    /// Set after an overflow; bytes are dropped until the next newline.
    discarding: bool,
}

impl LineTaggedDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            pending: Vec::new(),
            // base64 inflates by 4/3
            max_line: max_frame_bytes.saturating_mul(4) / 3 + 64,
            discarding: false,
        }
    }
}

impl OutputDecoder for LineTaggedDecoder {
    fn decode(&mut self, chunk: &[u8]) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        let mut start = 0;

        for (i, byte) in chunk.iter().enumerate() {
            if *byte != b'\n' {
                continue;
            }
            let line_start = std::mem::replace(&mut start, i + 1);
            if self.discarding {
                self.discarding = false;
                continue;
            }
            self.pending.extend_from_slice(&chunk[line_start..i]);
            let line = std::mem::take(&mut self.pending);
            events.extend(classify_line(&String::from_utf8_lossy(&line)));
        }

        if self.discarding {
            return events;
        }
        self.pending.extend_from_slice(&chunk[start..]);
        if self.pending.len() > self.max_line {
            let buffered = self.pending.len();
            self.pending.clear();
            self.discarding = true;
            events.push(frame_error(FrameError::Overflow {
                buffered,
                limit: self.max_line,
            }));
        }

        events
    }

    fn finish(&mut self) -> Vec<WorkerEvent> {
        self.discarding = false;
        let line = std::mem::take(&mut self.pending);
        classify_line(&String::from_utf8_lossy(&line))
            .into_iter()
            .collect()
    }
}

/// Longest control line accepted in a raw-binary stream.
const MAX_CONTROL_LINE: usize = 64 * 1024;

/// Tags a control line may start with, for spotting one cut short by a read.
const CONTROL_TAGS: [&[u8]; 4] = [b"STATUS:", b"FRAME:", b"ERROR:", b"CAMERA_FOUND:"];

/// Protocol B: control lines and raw JPEG bytes on one stream.
///
/// Between frames, text starting with a control prefix is read up to its
/// newline, even when the line spans several reads. A start marker opens a
/// frame and every byte up to its end marker is payload. Anything else
/// between frames is dropped a line at a time.
#[derive(Debug)]
pub struct RawBinaryDecoder {
    assembler: FrameAssembler,
    /// Bytes between frames that need the next read to be classified: an
    /// unterminated control line, a cut-off tag, or half a start marker.
    carry: Vec<u8>,
    /// Set after an oversized control line; bytes are dropped until its newline.
    discarding: bool,
}

impl RawBinaryDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            assembler: FrameAssembler::new(max_frame_bytes),
            carry: Vec::new(),
            discarding: false,
        }
    }

    /// Feed frame bytes up to the first frame end; returns what is left.
    fn push_frame_bytes<'c>(
        &mut self,
        bytes: &'c [u8],
        events: &mut Vec<WorkerEvent>,
    ) -> &'c [u8] {
        let (frame, used) = self.assembler.push_until_frame(bytes);
        match frame {
            Some(Ok(frame)) => events.push(WorkerEvent::Frame(frame)),
            Some(Err(e)) => events.push(frame_error(e)),
            None => {}
        }
        &bytes[used..]
    }
}

fn is_control_start(bytes: &[u8]) -> bool {
    let window = &bytes[..bytes.len().min(16)];
    CONTROL_PREFIX.is_match(&String::from_utf8_lossy(window))
}

fn is_cut_tag(bytes: &[u8]) -> bool {
    CONTROL_TAGS
        .iter()
        .any(|tag| bytes.len() < tag.len() && tag.starts_with(bytes))
}

impl OutputDecoder for RawBinaryDecoder {
    fn decode(&mut self, chunk: &[u8]) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        let joined;
        let mut rest: &[u8] = if self.carry.is_empty() {
            chunk
        } else {
            let mut carried = std::mem::take(&mut self.carry);
            carried.extend_from_slice(chunk);
            joined = carried;
            &joined
        };

        while !rest.is_empty() {
            if self.assembler.in_frame() {
                rest = self.push_frame_bytes(rest, &mut events);
                continue;
            }

            if self.discarding {
                match rest.iter().position(|b| *b == b'\n') {
                    Some(end) => {
                        self.discarding = false;
                        rest = &rest[end + 1..];
                        continue;
                    }
                    None => break,
                }
            }

            let skip = rest
                .iter()
                .position(|b| *b != b'\n' && *b != b'\r')
                .unwrap_or(rest.len());
            rest = &rest[skip..];
            if rest.is_empty() {
                break;
            }
            let line_end = rest.iter().position(|b| *b == b'\n');

            if is_control_start(rest) {
                match line_end {
                    Some(end) => {
                        events.extend(classify_line(&String::from_utf8_lossy(&rest[..end])));
                        rest = &rest[end + 1..];
                    }
                    None if rest.len() > MAX_CONTROL_LINE => {
                        self.discarding = true;
                        events.push(frame_error(FrameError::Overflow {
                            buffered: rest.len(),
                            limit: MAX_CONTROL_LINE,
                        }));
                        break;
                    }
                    None => {
                        self.carry = rest.to_vec();
                        break;
                    }
                }
                continue;
            }

            if is_cut_tag(rest) {
                self.carry = rest.to_vec();
                break;
            }

            let frame_start = rest
                .windows(JPEG_START.len())
                .position(|w| w == JPEG_START)
                .filter(|start| line_end.map_or(true, |end| *start < end));
            match (frame_start, line_end) {
                (Some(start), _) => {
                    if start > 0 {
                        debug!("[DEMUX] Dropping {start} bytes before frame start");
                    }
                    rest = self.push_frame_bytes(&rest[start..], &mut events);
                }
                (None, Some(end)) => {
                    debug!("[DEMUX] Dropping {end} byte non-control line");
                    rest = &rest[end + 1..];
                }
                (None, None) => {
                    // Half a start marker may end the read
                    if rest.ends_with(&JPEG_START[..1]) {
                        self.carry = JPEG_START[..1].to_vec();
                    }
                    break;
                }
            }
        }

        events
    }

    fn finish(&mut self) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        let carry = std::mem::take(&mut self.carry);
        if !self.discarding && is_control_start(&carry) {
            events.extend(classify_line(&String::from_utf8_lossy(&carry)));
        }
        self.discarding = false;

        if self.assembler.in_frame() {
            debug!(
                "[DEMUX] Discarding {} bytes of incomplete frame",
                self.assembler.buffered()
            );
        }
        self.assembler.reset();
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axis_bridge_types::WorkerReport;

    fn frame(bytes: &[u8]) -> WorkerEvent {
        WorkerEvent::Frame(bytes.into())
    }

    #[test]
    fn test_control_line_order() {
        assert_eq!(
            ControlLine::parse("STATUS:FRAME:x"),
            Some(ControlLine::Status("FRAME:x"))
        );
        assert_eq!(
            ControlLine::parse("CAMERA_FOUND:/dev/video0"),
            Some(ControlLine::DeviceFound("/dev/video0"))
        );
        assert_eq!(ControlLine::parse("FPS: 29.9"), None);
    }

    #[test]
    fn test_line_tagged_frames_and_status() {
        let mut decoder = OutputProtocol::LineTagged.decoder(1024);
        let payload = STANDARD.encode(b"\xFF\xD8jpeg\xFF\xD9");
        let input = format!("STATUS:Camera ready\nFRAME:{payload}\nNo webcam found\n");

        let events = decoder.decode(input.as_bytes());
        assert_eq!(
            events,
            vec![
                WorkerEvent::Status(StatusPayload::Message("Camera ready".to_string())),
                frame(b"\xFF\xD8jpeg\xFF\xD9"),
                WorkerEvent::Status(StatusPayload::Untagged("No webcam found".to_string())),
            ]
        );
    }

    #[test]
    fn test_line_tagged_split_lines() {
        let mut decoder = LineTaggedDecoder::new(1024);
        assert!(decoder.decode(b"CAMERA_FO").is_empty());
        assert!(decoder.decode(b"UND:/dev/vid").is_empty());
        let events = decoder.decode(b"eo2\r\nERROR: boom\n");
        assert_eq!(
            events,
            vec![
                WorkerEvent::Status(StatusPayload::DeviceFound("/dev/video2".to_string())),
                WorkerEvent::ErrorLine("boom".to_string()),
            ]
        );

        // Unterminated last line is flushed at end of stream
        assert!(decoder.decode(b"STATUS:bye").is_empty());
        assert_eq!(
            decoder.finish(),
            vec![WorkerEvent::Status(StatusPayload::Message("bye".to_string()))]
        );
    }

    #[test]
    fn test_bad_base64_does_not_stop_stream() {
        let mut decoder = LineTaggedDecoder::new(1024);
        let good = STANDARD.encode(b"ok");
        let events = decoder.decode(format!("FRAME:@@@not-base64\nFRAME:{good}\n").as_bytes());
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], WorkerEvent::ErrorLine(_)));
        assert_eq!(events[1], frame(b"ok"));
    }

    #[test]
    fn test_line_tagged_overflow_skips_rest_of_line() {
        let mut decoder = LineTaggedDecoder::new(30);
        let long = format!("FRAME:{}", "A".repeat(100));

        let events = decoder.decode(long.as_bytes());
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], WorkerEvent::ErrorLine(e) if e.contains("overflow")));

        // The tail of the oversized line must not surface as its own event
        let events = decoder.decode(b"BBBBBBBBBBBBBBBBBBBB==\nSTATUS:ok\n");
        assert_eq!(
            events,
            vec![WorkerEvent::Status(StatusPayload::Message("ok".to_string()))]
        );
    }

    #[test]
    fn test_raw_binary_interleaved() {
        let mut decoder = OutputProtocol::RawBinary.decoder(1024);

        let events = decoder.decode(b"STATUS:RECORDING_SAVED:/v/a.mp4\n\xFF\xD8ab");
        assert_eq!(
            events,
            vec![WorkerEvent::Status(StatusPayload::RecordingSaved(
                "/v/a.mp4".to_string()
            ))]
        );

        let events = decoder.decode(b"cd\xFF\xD9");
        assert_eq!(events, vec![frame(b"\xFF\xD8abcd\xFF\xD9")]);

        let events = decoder.decode(
            b"STATUS:{\"recording\": false, \"video_path\": null, \"processed_path\": null}\n",
        );
        assert_eq!(
            events,
            vec![WorkerEvent::Status(StatusPayload::Report(WorkerReport {
                recording: false,
                video_path: None,
                processed_path: None,
            }))]
        );
    }

    #[test]
    fn test_raw_binary_mid_frame_bytes_are_payload() {
        let mut decoder = RawBinaryDecoder::new(1024);
        assert!(decoder.decode(b"\xFF\xD8").is_empty());
        // Looks like a control line but a frame is in progress
        let events = decoder.decode(b"STATUS:x\n\xFF\xD9");
        assert_eq!(events, vec![frame(b"\xFF\xD8STATUS:x\n\xFF\xD9")]);
    }

    #[test]
    fn test_raw_binary_status_after_frame_in_same_read() {
        let mut decoder = RawBinaryDecoder::new(1024);
        let events =
            decoder.decode(b"\xFF\xD8abc\xFF\xD9STATUS:RECORDING_SAVED:/v/a.mp4\n\xFF\xD8z\xFF\xD9");
        assert_eq!(
            events,
            vec![
                frame(b"\xFF\xD8abc\xFF\xD9"),
                WorkerEvent::Status(StatusPayload::RecordingSaved("/v/a.mp4".to_string())),
                frame(b"\xFF\xD8z\xFF\xD9"),
            ]
        );
    }

    #[test]
    fn test_raw_binary_control_line_split_across_reads() {
        let mut decoder = RawBinaryDecoder::new(1024);
        assert!(decoder.decode(b"STATUS:RECORDING_SA").is_empty());
        let events = decoder.decode(b"VED:/v/a.mp4\n");
        assert_eq!(
            events,
            vec![WorkerEvent::Status(StatusPayload::RecordingSaved(
                "/v/a.mp4".to_string()
            ))]
        );

        // Cut inside the tag itself
        assert_eq!(
            decoder.decode(b"\xFF\xD8a\xFF\xD9ST"),
            vec![frame(b"\xFF\xD8a\xFF\xD9")]
        );
        let events = decoder.decode(b"ATUS:PROCESSED_FILE:/v/a_p.mp4\n");
        assert_eq!(
            events,
            vec![WorkerEvent::Status(StatusPayload::ProcessedFile(
                "/v/a_p.mp4".to_string()
            ))]
        );

        // Unterminated line is still delivered at end of stream
        assert!(decoder.decode(b"STATUS:bye").is_empty());
        assert_eq!(
            decoder.finish(),
            vec![WorkerEvent::Status(StatusPayload::Message("bye".to_string()))]
        );
    }

    #[test]
    fn test_raw_binary_drops_unknown_text_between_frames() {
        let mut decoder = RawBinaryDecoder::new(1024);
        let events = decoder.decode(b"Camera warming up\nSTATUS:ready\n\xFF");
        assert_eq!(
            events,
            vec![WorkerEvent::Status(StatusPayload::Message("ready".to_string()))]
        );
        // Start marker split across reads
        let events = decoder.decode(b"\xD8x\xFF\xD9");
        assert_eq!(events, vec![frame(b"\xFF\xD8x\xFF\xD9")]);
    }

    #[test]
    fn test_raw_binary_discards_partial_frame_at_eof() {
        let mut decoder = RawBinaryDecoder::new(1024);
        assert!(decoder.decode(b"\xFF\xD8half").is_empty());
        assert!(decoder.finish().is_empty());
        assert!(decoder.decode(b"\xFF\xD9").is_empty());
    }
}
