// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Framing used between brokers on internal endpoints.
//!
//! ```text
//! relay:   [0xF1][hops u8][len u32 BE][payload]
//! channel: [0xF2][channel u16 BE][len u32 BE][payload]
//! ```
//!
//! Neither family is recognized on external endpoints.

use std::sync::Arc;

use super::{
    FrameLimits, FrameResult, Framer, HandshakeContext, Recognition, Recognizer, MAX_FRAME_HEADER,
};
use crate::error::ReasonCode;

/// Relay frame marker.
pub const RELAY_MARKER: u8 = 0xF1;
/// Channel frame marker.
pub const CHANNEL_MARKER: u8 = 0xF2;

const RELAY_HEADER: usize = 6;
const CHANNEL_HEADER: usize = 7;

/// Both formats: marker, tag bytes, then a u32 length ending the header.
fn frame_tagged(
    buf: &[u8],
    limits: &FrameLimits,
    marker: u8,
    header: usize,
) -> FrameResult {
    if buf.len() < header {
        return FrameResult::NeedMore(header);
    }
    if buf[0] != marker {
        return FrameResult::Invalid(ReasonCode::BadLength);
    }
    let l = header - 4;
    let len = u32::from_be_bytes([buf[l], buf[l + 1], buf[l + 2], buf[l + 3]]) as usize;
    if let Err(rc) = limits.check(header, len) {
        return FrameResult::Invalid(rc);
    }
    if buf.len() < header + len {
        return FrameResult::NeedMore(header + len);
    }
    let kind = match header {
        RELAY_HEADER => u32::from(buf[1]),
        _ => u32::from(u16::from_be_bytes([buf[1], buf[2]])),
    };
    FrameResult::Frame { header, len, kind }
}

// ============================================================================
// Relay
// ============================================================================

/// Relay framer; the kind carries the hop count.
#[derive(Debug, Default)]
pub struct RelayFramer;

impl RelayFramer {
    pub fn new() -> Self {
        Self
    }
}

impl Framer for RelayFramer {
    fn family(&self) -> &str {
        "fwd"
    }

    fn frame(&self, buf: &[u8], limits: &FrameLimits) -> FrameResult {
        frame_tagged(buf, limits, RELAY_MARKER, RELAY_HEADER)
    }

    fn add_frame(
        &self,
        header: &mut [u8; MAX_FRAME_HEADER],
        len: usize,
        kind: u32,
    ) -> Result<usize, ReasonCode> {
        let len = u32::try_from(len).map_err(|_| ReasonCode::MessageTooBig)?;
        header[0] = RELAY_MARKER;
        header[1] = u8::try_from(kind).map_err(|_| ReasonCode::BadLength)?;
        header[2..6].copy_from_slice(&len.to_be_bytes());
        Ok(RELAY_HEADER)
    }
}

pub struct RelayRecognizer {
    framer: Arc<RelayFramer>,
}

impl RelayRecognizer {
    pub fn new() -> Self {
        Self {
            framer: Arc::new(RelayFramer),
        }
    }
}

impl Default for RelayRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Recognizer for RelayRecognizer {
    fn name(&self) -> &str {
        "fwd"
    }

    fn try_recognize(&self, prefix: &[u8], ctx: &HandshakeContext) -> Recognition {
        if ctx.internal && prefix.first() == Some(&RELAY_MARKER) {
            Recognition::Recognized(self.framer.clone())
        } else {
            Recognition::NotMatched
        }
    }
}

// ============================================================================
// Channel multiplexing
// ============================================================================

/// Channel framer; the kind carries the channel number.
#[derive(Debug, Default)]
pub struct ChannelFramer;

impl ChannelFramer {
    pub fn new() -> Self {
        Self
    }
}

impl Framer for ChannelFramer {
    fn family(&self) -> &str {
        "mux"
    }

    fn frame(&self, buf: &[u8], limits: &FrameLimits) -> FrameResult {
        frame_tagged(buf, limits, CHANNEL_MARKER, CHANNEL_HEADER)
    }

    fn add_frame(
        &self,
        header: &mut [u8; MAX_FRAME_HEADER],
        len: usize,
        kind: u32,
    ) -> Result<usize, ReasonCode> {
        let len = u32::try_from(len).map_err(|_| ReasonCode::MessageTooBig)?;
        let channel = u16::try_from(kind).map_err(|_| ReasonCode::BadLength)?;
        header[0] = CHANNEL_MARKER;
        header[1..3].copy_from_slice(&channel.to_be_bytes());
        header[3..7].copy_from_slice(&len.to_be_bytes());
        Ok(CHANNEL_HEADER)
    }
}

pub struct ChannelRecognizer {
    framer: Arc<ChannelFramer>,
}

impl ChannelRecognizer {
    pub fn new() -> Self {
        Self {
            framer: Arc::new(ChannelFramer),
        }
    }
}

impl Default for ChannelRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Recognizer for ChannelRecognizer {
    fn name(&self) -> &str {
        "mux"
    }

    fn try_recognize(&self, prefix: &[u8], ctx: &HandshakeContext) -> Recognition {
        if ctx.internal && prefix.first() == Some(&CHANNEL_MARKER) {
            Recognition::Recognized(self.framer.clone())
        } else {
            Recognition::NotMatched
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framer::encode_frame;
    use crate::framer::tests::{feed_chunks, limits, random_cuts};

    #[test]
    fn test_relay_layout() {
        let bytes = encode_frame(&RelayFramer, b"xy", 3).unwrap();
        assert_eq!(bytes, b"\xF1\x03\0\0\0\x02xy");
        assert_eq!(
            RelayFramer.frame(&bytes, &limits()),
            FrameResult::Frame {
                header: 6,
                len: 2,
                kind: 3
            }
        );
    }

    #[test]
    fn test_channel_layout() {
        let bytes = encode_frame(&ChannelFramer, b"z", 0x0102).unwrap();
        assert_eq!(bytes, b"\xF2\x01\x02\0\0\0\x01z");
        let frames = feed_chunks(&ChannelFramer, &bytes, &[1, 4]).unwrap();
        assert_eq!(frames, vec![(b"z".to_vec(), 0x0102)]);
    }

    #[test]
    fn test_relay_random_splits() {
        let long = vec![0xA5u8; 700];
        let stream = [
            encode_frame(&RelayFramer, &long, 2).unwrap(),
            encode_frame(&RelayFramer, b"", 0).unwrap(),
            encode_frame(&RelayFramer, b"tail", 9).unwrap(),
        ]
        .concat();
        for _ in 0..200 {
            let frames = feed_chunks(&RelayFramer, &stream, &random_cuts(stream.len())).unwrap();
            assert_eq!(
                frames,
                vec![(long.clone(), 2), (Vec::new(), 0), (b"tail".to_vec(), 9)]
            );
        }
    }

    #[test]
    fn test_channel_random_splits() {
        let stream = [
            encode_frame(&ChannelFramer, b"open", 1).unwrap(),
            encode_frame(&ChannelFramer, &[7u8; 300], 0xFFFF).unwrap(),
        ]
        .concat();
        for _ in 0..200 {
            let frames = feed_chunks(&ChannelFramer, &stream, &random_cuts(stream.len())).unwrap();
            assert_eq!(frames, vec![(b"open".to_vec(), 1), (vec![7u8; 300], 0xFFFF)]);
        }
    }

    #[test]
    fn test_oversize_rejected_from_header() {
        let mut lim = limits();
        lim.max_message_size = 16;
        assert_eq!(
            RelayFramer.frame(b"\xF1\x01\0\0\0\x20", &lim),
            FrameResult::Invalid(ReasonCode::MessageTooBig)
        );
        assert_eq!(
            ChannelFramer.frame(b"\xF2\0\x01\0\0\0\x20", &lim),
            FrameResult::Invalid(ReasonCode::MessageTooBig)
        );

        let mut first = limits();
        first.first_packet_max = 16;
        assert_eq!(
            RelayFramer.frame(b"\xF1\x01\0\0\0\x20", &first),
            FrameResult::Invalid(ReasonCode::FirstPacketTooLarge)
        );
        assert_eq!(
            ChannelFramer.frame(b"\xF2\0\x01\0\0\0\x20", &first),
            FrameResult::Invalid(ReasonCode::FirstPacketTooLarge)
        );
    }

    #[test]
    fn test_wrong_marker() {
        assert_eq!(
            ChannelFramer.frame(b"\xF1\0\0\0\0\0\0", &limits()),
            FrameResult::Invalid(ReasonCode::BadLength)
        );
    }
}
