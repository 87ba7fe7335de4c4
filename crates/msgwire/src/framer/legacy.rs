// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Legacy short-frame format, tried last.
//!
//! ```text
//! [0xFE][kind u8][len u16 BE][payload]
//! ```
//!
//! Sessions open with kind 0x01, so the recognizer keys on `FE 01`.

use std::sync::Arc;

use super::{
    FrameLimits, FrameResult, Framer, HandshakeContext, Recognition, Recognizer, MAX_FRAME_HEADER,
};
use crate::error::ReasonCode;

const LEGACY_MARKER: u8 = 0xFE;
const LEGACY_OPEN: u8 = 0x01;
const LEGACY_HEADER: usize = 4;

#[derive(Debug, Default)]
pub struct LegacyFramer;

impl LegacyFramer {
    pub fn new() -> Self {
        Self
    }
}

impl Framer for LegacyFramer {
    fn family(&self) -> &str {
        "legacy"
    }

    fn frame(&self, buf: &[u8], limits: &FrameLimits) -> FrameResult {
        if buf.len() < LEGACY_HEADER {
            return FrameResult::NeedMore(LEGACY_HEADER);
        }
        if buf[0] != LEGACY_MARKER {
            return FrameResult::Invalid(ReasonCode::BadLength);
        }
        let len = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
        if let Err(rc) = limits.check(LEGACY_HEADER, len) {
            return FrameResult::Invalid(rc);
        }
        if buf.len() < LEGACY_HEADER + len {
            return FrameResult::NeedMore(LEGACY_HEADER + len);
        }
        FrameResult::Frame {
            header: LEGACY_HEADER,
            len,
            kind: u32::from(buf[1]),
        }
    }

    fn add_frame(
        &self,
        header: &mut [u8; MAX_FRAME_HEADER],
        len: usize,
        kind: u32,
    ) -> Result<usize, ReasonCode> {
        let len = u16::try_from(len).map_err(|_| ReasonCode::MessageTooBig)?;
        header[0] = LEGACY_MARKER;
        header[1] = u8::try_from(kind).map_err(|_| ReasonCode::BadLength)?;
        header[2..4].copy_from_slice(&len.to_be_bytes());
        Ok(LEGACY_HEADER)
    }
}

pub struct LegacyRecognizer {
    framer: Arc<LegacyFramer>,
}

impl LegacyRecognizer {
    pub fn new() -> Self {
        Self {
            framer: Arc::new(LegacyFramer),
        }
    }
}

impl Default for LegacyRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Recognizer for LegacyRecognizer {
    fn name(&self) -> &str {
        "legacy"
    }

    fn try_recognize(&self, prefix: &[u8], _ctx: &HandshakeContext) -> Recognition {
        match prefix {
            [LEGACY_MARKER] => Recognition::NeedMore(2),
            [LEGACY_MARKER, LEGACY_OPEN, ..] => Recognition::Recognized(self.framer.clone()),
            _ => Recognition::NotMatched,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framer::encode_frame;
    use crate::framer::tests::{feed_chunks, limits, random_cuts};

    #[test]
    fn test_legacy_frame() {
        assert_eq!(
            LegacyFramer.frame(b"\xFE\x01\0\x02ab", &limits()),
            FrameResult::Frame {
                header: 4,
                len: 2,
                kind: 1
            }
        );
    }

    #[test]
    fn test_legacy_random_splits() {
        let body = vec![0x33u8; 500];
        let stream = [
            encode_frame(&LegacyFramer, b"hi", 1).unwrap(),
            encode_frame(&LegacyFramer, &body, 4).unwrap(),
        ]
        .concat();
        for _ in 0..200 {
            let frames = feed_chunks(&LegacyFramer, &stream, &random_cuts(stream.len())).unwrap();
            assert_eq!(frames, vec![(b"hi".to_vec(), 1), (body.clone(), 4)]);
        }
    }

    #[test]
    fn test_legacy_oversize_rejected_from_header() {
        let mut lim = limits();
        lim.max_message_size = 16;
        assert_eq!(
            LegacyFramer.frame(b"\xFE\x01\x01\0", &lim),
            FrameResult::Invalid(ReasonCode::MessageTooBig)
        );
        let mut first = limits();
        first.first_packet_max = 16;
        assert_eq!(
            LegacyFramer.frame(b"\xFE\x01\x01\0", &first),
            FrameResult::Invalid(ReasonCode::FirstPacketTooLarge)
        );
    }

    #[test]
    fn test_legacy_payload_limit() {
        let mut hdr = [0u8; MAX_FRAME_HEADER];
        assert_eq!(
            LegacyFramer.add_frame(&mut hdr, 70_000, 1),
            Err(ReasonCode::MessageTooBig)
        );
    }
}
