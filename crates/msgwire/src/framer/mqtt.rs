// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT fixed-header framing.
//!
//! ```text
//! +---------+----------------------------+-----------------+
//! | command | remaining length (varint)  | payload         |
//! | u8      | 1..=4 bytes, 7 bits each   |                 |
//! +---------+----------------------------+-----------------+
//! ```

use std::sync::Arc;

use super::{
    FrameLimits, FrameResult, Framer, HandshakeContext, Recognition, Recognizer, MAX_FRAME_HEADER,
};
use crate::error::ReasonCode;

/// Largest remaining length a 4-byte varint can carry.
pub const MQTT_MAX_LENGTH: usize = 268_435_455;

/// CONNECT command byte.
const MQTT_CONNECT: u8 = 0x10;

const MAX_VARINT_BYTES: usize = 4;

enum VarInt {
    Done { value: usize, bytes: usize },
    Incomplete,
    Invalid,
}

/// Decode the remaining-length varint starting at `buf[0]`.
fn decode_varint(buf: &[u8]) -> VarInt {
    let mut value = 0usize;
    for i in 0..MAX_VARINT_BYTES {
        let Some(&b) = buf.get(i) else {
            return VarInt::Incomplete;
        };
        value |= usize::from(b & 0x7F) << (7 * i);
        if b & 0x80 == 0 {
            return VarInt::Done {
                value,
                bytes: i + 1,
            };
        }
    }
    VarInt::Invalid
}

/// MQTT framer.
#[derive(Debug, Default)]
pub struct MqttFramer;

impl MqttFramer {
    pub fn new() -> Self {
        Self
    }
}

impl Framer for MqttFramer {
    fn family(&self) -> &str {
        "mqtt"
    }

    fn frame(&self, buf: &[u8], limits: &FrameLimits) -> FrameResult {
        if buf.len() < 2 {
            return FrameResult::NeedMore(2);
        }
        let (len, varint) = match decode_varint(&buf[1..]) {
            VarInt::Done { value, bytes } => (value, bytes),
            VarInt::Incomplete => return FrameResult::NeedMore(buf.len() + 1),
            VarInt::Invalid => return FrameResult::Invalid(ReasonCode::BadLength),
        };
        let header = 1 + varint;
        if let Err(rc) = limits.check(header, len) {
            return FrameResult::Invalid(rc);
        }
        let total = header + len;
        if buf.len() < total {
            return FrameResult::NeedMore(total);
        }
        FrameResult::Frame {
            header,
            len,
            kind: u32::from(buf[0]),
        }
    }

    fn add_frame(
        &self,
        header: &mut [u8; MAX_FRAME_HEADER],
        len: usize,
        kind: u32,
    ) -> Result<usize, ReasonCode> {
        if len > MQTT_MAX_LENGTH {
            return Err(ReasonCode::MessageTooBig);
        }
        header[0] = u8::try_from(kind).map_err(|_| ReasonCode::BadLength)?;
        let mut n = 1;
        let mut rest = len;
        loop {
            let mut b = (rest & 0x7F) as u8;
            rest >>= 7;
            if rest > 0 {
                b |= 0x80;
            }
            header[n] = b;
            n += 1;
            if rest == 0 {
                return Ok(n);
            }
        }
    }
}

/// Matches a CONNECT packet with a well-formed remaining length.
pub struct MqttRecognizer {
    framer: Arc<MqttFramer>,
}

impl MqttRecognizer {
    pub fn new() -> Self {
        Self {
            framer: Arc::new(MqttFramer),
        }
    }
}

impl Default for MqttRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Recognizer for MqttRecognizer {
    fn name(&self) -> &str {
        "mqtt"
    }

    fn try_recognize(&self, prefix: &[u8], _ctx: &HandshakeContext) -> Recognition {
        if prefix.first() != Some(&MQTT_CONNECT) {
            return Recognition::NotMatched;
        }
        match decode_varint(&prefix[1..]) {
            VarInt::Done { .. } => Recognition::Recognized(self.framer.clone()),
            VarInt::Incomplete => Recognition::NeedMore(prefix.len() + 1),
            VarInt::Invalid => Recognition::NotMatched,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framer::encode_frame;
    use crate::framer::tests::{feed_chunks, limits, random_cuts};

    #[test]
    fn test_mqtt_varint_sizes() {
        let mut hdr = [0u8; MAX_FRAME_HEADER];
        assert_eq!(MqttFramer.add_frame(&mut hdr, 0, 0x30).unwrap(), 2);
        assert_eq!(MqttFramer.add_frame(&mut hdr, 127, 0x30).unwrap(), 2);
        assert_eq!(MqttFramer.add_frame(&mut hdr, 128, 0x30).unwrap(), 3);
        assert_eq!(&hdr[..3], &[0x30, 0x80, 0x01]);
        assert_eq!(MqttFramer.add_frame(&mut hdr, 16_384, 0x30).unwrap(), 4);
        assert_eq!(
            MqttFramer.add_frame(&mut hdr, MQTT_MAX_LENGTH, 0x30).unwrap(),
            5
        );
        assert_eq!(&hdr[1..5], &[0xFF, 0xFF, 0xFF, 0x7F]);
        assert_eq!(
            MqttFramer.add_frame(&mut hdr, MQTT_MAX_LENGTH + 1, 0x30),
            Err(ReasonCode::MessageTooBig)
        );
    }

    #[test]
    fn test_mqtt_frame() {
        let bytes = b"\x30\x03abc";
        assert_eq!(
            MqttFramer.frame(bytes, &limits()),
            FrameResult::Frame {
                header: 2,
                len: 3,
                kind: 0x30
            }
        );
    }

    #[test]
    fn test_mqtt_partial_varint() {
        assert_eq!(MqttFramer.frame(b"\x30", &limits()), FrameResult::NeedMore(2));
        assert_eq!(
            MqttFramer.frame(b"\x30\x80", &limits()),
            FrameResult::NeedMore(3)
        );
    }

    #[test]
    fn test_mqtt_fifth_length_byte_rejected() {
        assert_eq!(
            MqttFramer.frame(b"\x30\xFF\xFF\xFF\xFF\x01", &limits()),
            FrameResult::Invalid(ReasonCode::BadLength)
        );
    }

    #[test]
    fn test_mqtt_first_packet_limit() {
        let mut lim = limits();
        lim.first_packet_max = 10;
        assert_eq!(
            MqttFramer.frame(b"\x10\x20", &lim),
            FrameResult::Invalid(ReasonCode::FirstPacketTooLarge)
        );
    }

    #[test]
    fn test_mqtt_recognizer() {
        let ctx = HandshakeContext {
            tls: crate::config::TlsMode::Disabled,
            tls_active: false,
            internal: false,
        };
        let r = MqttRecognizer::new();
        assert!(matches!(r.try_recognize(b"\x10", &ctx), Recognition::NeedMore(2)));
        assert!(matches!(
            r.try_recognize(b"\x10\x80", &ctx),
            Recognition::NeedMore(3)
        ));
        assert!(matches!(
            r.try_recognize(b"\x10\x0c", &ctx),
            Recognition::Recognized(_)
        ));
        assert!(matches!(r.try_recognize(b"\x30\x0c", &ctx), Recognition::NotMatched));
    }

    #[test]
    fn test_mqtt_byte_at_a_time() {
        let payload = vec![0x5Au8; 300];
        let stream = [
            encode_frame(&MqttFramer, &payload, 0x10).unwrap(),
            encode_frame(&MqttFramer, b"", 0xC0).unwrap(),
        ]
        .concat();
        let cuts: Vec<usize> = (1..stream.len()).collect();
        let frames = feed_chunks(&MqttFramer, &stream, &cuts).unwrap();
        assert_eq!(frames, vec![(payload, 0x10), (Vec::new(), 0xC0)]);
    }

    #[test]
    fn test_mqtt_random_splits() {
        let payload = vec![0x11u8; 20_000];
        let stream = [
            encode_frame(&MqttFramer, b"conn", 0x10).unwrap(),
            encode_frame(&MqttFramer, &payload, 0x30).unwrap(),
        ]
        .concat();
        for _ in 0..100 {
            let frames = feed_chunks(&MqttFramer, &stream, &random_cuts(stream.len())).unwrap();
            assert_eq!(frames, vec![(b"conn".to_vec(), 0x10), (payload.clone(), 0x30)]);
        }
    }

    #[test]
    fn test_mqtt_too_big_from_header() {
        let mut lim = limits();
        lim.max_message_size = 100;
        assert_eq!(
            MqttFramer.frame(b"\x30\xC8\x01", &lim),
            FrameResult::Invalid(ReasonCode::MessageTooBig)
        );
    }
}
