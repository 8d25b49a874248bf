//! Meshtastic stream-API framer.
//!
//! Binary messages on a serial or TCP link are emitted as:
//!
//!   `0x94 0xC3 <len_hi> <len_lo> <protobuf bytes>`
//!
//! Between frames the device may print plain-text debug console output, so the
//! framer is fed arbitrary chunks, skips anything that is not a header, and
//! yields whole payloads when available. A header with an implausible length
//! is treated as noise and resynchronization continues one byte later.
use bytes::{Buf, BytesMut};

use crate::mesh::MeshError;

pub const START1: u8 = 0x94;
pub const START2: u8 = 0xC3;
const HEADER_LEN: usize = 4;
/// Largest payload the stream API allows.
pub const MAX_PAYLOAD: usize = 512;

#[derive(Debug)]
pub struct StreamFramer {
    buf: BytesMut,
    skipped: usize,
}

impl Default for StreamFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamFramer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
            skipped: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of non-frame bytes discarded so far (console text, line noise).
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Extract the next complete payload, if one is buffered.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            // Realign to a header start.
            match self.buf.iter().position(|&b| b == START1) {
                Some(0) => {}
                Some(pos) => {
                    self.skipped += pos;
                    self.buf.advance(pos);
                }
                None => {
                    self.skipped += self.buf.len();
                    self.buf.clear();
                    return None;
                }
            }
            if self.buf.len() < 2 {
                return None;
            }
            if self.buf[1] != START2 {
                self.skipped += 1;
                self.buf.advance(1);
                continue;
            }
            if self.buf.len() < HEADER_LEN {
                return None;
            }

            let declared = ((self.buf[2] as usize) << 8) | (self.buf[3] as usize);
            if declared == 0 || declared > MAX_PAYLOAD {
                self.skipped += 1;
                self.buf.advance(1);
                continue;
            }
            if self.buf.len() < HEADER_LEN + declared {
                return None;
            }

            self.buf.advance(HEADER_LEN);
            return Some(self.buf.split_to(declared).to_vec());
        }
    }

    /// Drain every complete payload currently buffered.
    pub fn drain_frames(&mut self) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame() {
            frames.push(frame);
        }
        frames
    }
}

/// Prefix `payload` with the stream header.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, MeshError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(MeshError::FrameTooLarge(payload.len()));
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(START1);
    out.push(START2);
    out.push(((payload.len() >> 8) & 0xFF) as u8);
    out.push((payload.len() & 0xFF) as u8);
    out.extend_from_slice(payload);
    Ok(out)
}
