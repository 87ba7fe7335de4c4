// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Handshake recognition and wire framing.
//!
//! The first bytes of an inbound stream go through a [`FramerChain`]: an
//! ordered list of [`Recognizer`]s, each of which either selects a
//! [`Framer`], asks for more bytes, asks for a TLS handshake, or passes.
//!
//! # Chain order
//!
//! ```text
//! rpc (4-byte BE length) -> mqtt (varint) -> TLS record -> HTTP request line
//!     -> [internal endpoints: fwd relay, mux channel]
//!     -> registered external recognizers -> legacy signature
//! ```
//!
//! Once selected, a framer splits the stream into frames and writes outbound
//! headers. Framers are stateless; the per-connection partial frame lives in
//! an [`Assembler`].

mod http;
mod internal;
mod legacy;
mod mqtt;
mod rpc;

pub use http::{HttpFramer, HttpRecognizer};
pub use internal::{ChannelFramer, ChannelRecognizer, RelayFramer, RelayRecognizer};
pub use legacy::{LegacyFramer, LegacyRecognizer};
pub use mqtt::{MqttFramer, MqttRecognizer, MQTT_MAX_LENGTH};
pub use rpc::{RpcFramer, RpcRecognizer};

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::TlsMode;
use crate::error::ReasonCode;

/// Largest header any built-in framer writes.
pub const MAX_FRAME_HEADER: usize = 16;

/// Extra room reserved when a partial frame is stashed.
const ASSEMBLY_SLACK: usize = 1024;

// ============================================================================
// Framer
// ============================================================================

/// Size limits applied while framing.
#[derive(Clone, Copy, Debug)]
pub struct FrameLimits {
    /// Largest payload accepted
    pub max_message_size: usize,
    /// Largest frame accepted before the first successful exchange
    pub first_packet_max: usize,
    /// Set once a frame has been delivered on this connection
    pub first_exchange_done: bool,
}

impl FrameLimits {
    /// Check a declared frame before any payload is buffered.
    pub fn check(&self, header: usize, len: usize) -> Result<(), ReasonCode> {
        if len > self.max_message_size {
            return Err(ReasonCode::MessageTooBig);
        }
        if !self.first_exchange_done && header.saturating_add(len) > self.first_packet_max {
            return Err(ReasonCode::FirstPacketTooLarge);
        }
        Ok(())
    }
}

/// Result of [`Framer::frame`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameResult {
    /// A complete frame starts at the buffer start
    Frame {
        /// Header length
        header: usize,
        /// Payload length following the header
        len: usize,
        /// Frame kind passed to the upper layer
        kind: u32,
    },
    /// Call again once this many bytes (counted from the buffer start) are available
    NeedMore(usize),
    /// Fatal framing error
    Invalid(ReasonCode),
}

/// Wire framing of one protocol family.
pub trait Framer: Send + Sync + fmt::Debug {
    /// Protocol family name (`"mqtt"`, `"rpc"`, ...).
    fn family(&self) -> &str;

    /// Inspect `buf` for one frame starting at offset 0.
    fn frame(&self, buf: &[u8], limits: &FrameLimits) -> FrameResult;

    /// Write the header for a `len`-byte payload of `kind` into `header`.
    ///
    /// Returns the header length.
    fn add_frame(
        &self,
        header: &mut [u8; MAX_FRAME_HEADER],
        len: usize,
        kind: u32,
    ) -> Result<usize, ReasonCode>;
}

// ============================================================================
// Recognizer chain
// ============================================================================

/// What the handshake bytes say about the connection.
#[derive(Clone, Debug)]
pub enum Recognition {
    /// Use this framer
    Recognized(Arc<dyn Framer>),
    /// TLS record signature; start a TLS handshake
    StartTls,
    /// Ask again once this many bytes are available
    NeedMore(usize),
    /// Not this recognizer
    NotMatched,
}

/// Endpoint facts a recognizer may depend on.
#[derive(Clone, Copy, Debug)]
pub struct HandshakeContext {
    /// TLS policy of the endpoint
    pub tls: TlsMode,
    /// A TLS session is already running
    pub tls_active: bool,
    /// Internal endpoint
    pub internal: bool,
}

/// Handshake byte-pattern recognizer.
pub trait Recognizer: Send + Sync {
    /// Name used in trace records.
    fn name(&self) -> &str;

    /// Inspect the stream prefix.
    fn try_recognize(&self, prefix: &[u8], ctx: &HandshakeContext) -> Recognition;
}

/// Recognizes a TLS record header (handshake content type, major version 3).
#[derive(Debug, Default)]
pub struct TlsRecognizer;

/// TLS record content type for handshake messages.
pub const TLS_HANDSHAKE_RECORD: u8 = 0x16;

impl Recognizer for TlsRecognizer {
    fn name(&self) -> &str {
        "tls"
    }

    fn try_recognize(&self, prefix: &[u8], ctx: &HandshakeContext) -> Recognition {
        if ctx.tls != TlsMode::Optional || ctx.tls_active {
            return Recognition::NotMatched;
        }
        match prefix {
            [TLS_HANDSHAKE_RECORD] => Recognition::NeedMore(2),
            [TLS_HANDSHAKE_RECORD, 0x03, ..] => Recognition::StartTls,
            _ => Recognition::NotMatched,
        }
    }
}

/// Ordered recognizer chain.
pub struct FramerChain {
    builtin: Vec<Box<dyn Recognizer>>,
    internal: Vec<Box<dyn Recognizer>>,
    external: RwLock<Vec<Arc<dyn Recognizer>>>,
    legacy: Box<dyn Recognizer>,
}

impl FramerChain {
    /// Chain with every built-in recognizer.
    pub fn new() -> Self {
        Self {
            builtin: vec![
                Box::new(RpcRecognizer::new()),
                Box::new(MqttRecognizer::new()),
                Box::new(TlsRecognizer),
                Box::new(HttpRecognizer::new()),
            ],
            internal: vec![
                Box::new(RelayRecognizer::new()),
                Box::new(ChannelRecognizer::new()),
            ],
            external: RwLock::new(Vec::new()),
            legacy: Box::new(LegacyRecognizer::new()),
        }
    }

    /// Append an external recognizer, evaluated after the built-ins.
    pub fn register(&self, recognizer: Arc<dyn Recognizer>) {
        log::debug!("[msgwire] Register framer recognizer: {}", recognizer.name());
        self.external.write().push(recognizer);
    }

    /// Run the chain. The first recognizer that does not pass decides.
    pub fn recognize(&self, prefix: &[u8], ctx: &HandshakeContext) -> Recognition {
        if prefix.is_empty() {
            return Recognition::NeedMore(1);
        }
        let internal: &[Box<dyn Recognizer>] = if ctx.internal { &self.internal } else { &[] };
        for r in self.builtin.iter().chain(internal.iter()) {
            match r.try_recognize(prefix, ctx) {
                Recognition::NotMatched => {}
                other => return other,
            }
        }
        for r in self.external.read().iter() {
            match r.try_recognize(prefix, ctx) {
                Recognition::NotMatched => {}
                other => return other,
            }
        }
        self.legacy.try_recognize(prefix, ctx)
    }
}

impl Default for FramerChain {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Assembler
// ============================================================================

/// Per-connection accumulation of a partial frame.
///
/// Complete frames found directly in the incoming slice are dispatched
/// without copying; only a trailing partial frame is stashed, with room for
/// the byte count the framer asked for.
#[derive(Debug, Default)]
pub struct Assembler {
    buf: Vec<u8>,
    need: usize,
}

impl Assembler {
    /// Empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes waiting for a frame boundary or for recognition.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Total bytes the framer asked for (0 when idle).
    pub fn need(&self) -> usize {
        self.need
    }

    /// Keep bytes without framing them (handshake prefix).
    pub fn stash(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Drop everything buffered.
    pub fn clear(&mut self) {
        self.buf = Vec::new();
        self.need = 0;
    }

    /// Take the stashed bytes.
    pub fn take(&mut self) -> Vec<u8> {
        self.need = 0;
        std::mem::take(&mut self.buf)
    }

    /// Feed `data` and dispatch every complete frame to `sink` in order.
    ///
    /// `limits.first_exchange_done` is set after the first delivered frame.
    /// Stops at the first error from the framer or the sink.
    pub fn push<F>(
        &mut self,
        framer: &dyn Framer,
        data: &[u8],
        limits: &mut FrameLimits,
        mut sink: F,
    ) -> Result<(), ReasonCode>
    where
        F: FnMut(&[u8], u32) -> Result<(), ReasonCode>,
    {
        if self.buf.is_empty() {
            let used = Self::run(framer, data, limits, &mut sink, &mut self.need)?;
            if used < data.len() {
                let rest = &data[used..];
                self.buf
                    .reserve(self.need.max(rest.len()) + ASSEMBLY_SLACK);
                self.buf.extend_from_slice(rest);
            }
            return Ok(());
        }

        self.buf.extend_from_slice(data);
        if self.buf.len() < self.need {
            return Ok(());
        }
        let used = Self::run(framer, &self.buf, limits, &mut sink, &mut self.need)?;
        if used >= self.buf.len() {
            self.buf = Vec::new();
        } else {
            self.buf.drain(..used);
        }
        Ok(())
    }

    fn run<F>(
        framer: &dyn Framer,
        data: &[u8],
        limits: &mut FrameLimits,
        sink: &mut F,
        need: &mut usize,
    ) -> Result<usize, ReasonCode>
    where
        F: FnMut(&[u8], u32) -> Result<(), ReasonCode>,
    {
        let mut off = 0;
        while off < data.len() {
            match framer.frame(&data[off..], limits) {
                FrameResult::Frame { header, len, kind } => {
                    let start = off + header;
                    sink(&data[start..start + len], kind)?;
                    limits.first_exchange_done = true;
                    off = start + len;
                }
                FrameResult::NeedMore(n) => {
                    *need = n;
                    return Ok(off);
                }
                FrameResult::Invalid(rc) => return Err(rc),
            }
        }
        *need = 0;
        Ok(off)
    }
}

/// Build a complete outbound frame (header + payload) with `framer`.
pub fn encode_frame(framer: &dyn Framer, payload: &[u8], kind: u32) -> Result<Vec<u8>, ReasonCode> {
    let mut header = [0u8; MAX_FRAME_HEADER];
    let n = framer.add_frame(&mut header, payload.len(), kind)?;
    let mut out = Vec::with_capacity(n + payload.len());
    out.extend_from_slice(&header[..n]);
    out.extend_from_slice(payload);
    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn limits() -> FrameLimits {
        FrameLimits {
            max_message_size: 1024 * 1024,
            first_packet_max: 1024 * 1024,
            first_exchange_done: false,
        }
    }

    fn ctx(tls: TlsMode, internal: bool) -> HandshakeContext {
        HandshakeContext {
            tls,
            tls_active: false,
            internal,
        }
    }

    /// Feed `stream` in the given chunk sizes and collect dispatched frames.
    pub(crate) fn feed_chunks(
        framer: &dyn Framer,
        stream: &[u8],
        cuts: &[usize],
    ) -> Result<Vec<(Vec<u8>, u32)>, ReasonCode> {
        let mut asm = Assembler::new();
        let mut lim = limits();
        let mut out = Vec::new();
        let mut pos = 0;
        for &cut in cuts.iter().chain(std::iter::once(&stream.len())) {
            let end = cut.min(stream.len()).max(pos);
            asm.push(framer, &stream[pos..end], &mut lim, |p, k| {
                out.push((p.to_vec(), k));
                Ok(())
            })?;
            pos = end;
        }
        Ok(out)
    }

    /// Up to five sorted random cut points inside a `len`-byte stream.
    pub(crate) fn random_cuts(len: usize) -> Vec<usize> {
        let mut cuts: Vec<usize> = (0..fastrand::usize(0..6))
            .map(|_| fastrand::usize(0..len))
            .collect();
        cuts.sort_unstable();
        cuts
    }

    fn family(r: Recognition) -> Option<String> {
        match r {
            Recognition::Recognized(f) => Some(f.family().to_string()),
            _ => None,
        }
    }

    #[test]
    fn test_chain_rpc() {
        let chain = FramerChain::new();
        let c = ctx(TlsMode::Disabled, false);
        assert_eq!(
            family(chain.recognize(b"\0\0\0\x37\x28", &c)),
            Some("rpc".into())
        );
        assert!(matches!(chain.recognize(b"\0\0", &c), Recognition::NeedMore(5)));
    }

    #[test]
    fn test_chain_mqtt() {
        let chain = FramerChain::new();
        let c = ctx(TlsMode::Disabled, false);
        assert_eq!(
            family(chain.recognize(b"\x10\x10\0\x04MQTT", &c)),
            Some("mqtt".into())
        );
        assert_eq!(
            family(chain.recognize(b"\x10\x12\0\x06MQIsdp", &c)),
            Some("mqtt".into())
        );
    }

    #[test]
    fn test_chain_http() {
        let chain = FramerChain::new();
        let c = ctx(TlsMode::Disabled, false);
        assert_eq!(
            family(chain.recognize(b"GET /mqtt HTTP/1.1\r\n", &c)),
            Some("http".into())
        );
    }

    #[test]
    fn test_chain_unknown() {
        let chain = FramerChain::new();
        let c = ctx(TlsMode::Disabled, false);
        assert!(matches!(
            chain.recognize(b"\x55\x55\x55\x55", &c),
            Recognition::NotMatched
        ));
        assert!(matches!(chain.recognize(b"", &c), Recognition::NeedMore(1)));
    }

    #[test]
    fn test_chain_tls_depends_on_mode() {
        let chain = FramerChain::new();
        let hello = b"\x16\x03\x01\x02\x00";
        assert!(matches!(
            chain.recognize(hello, &ctx(TlsMode::Optional, false)),
            Recognition::StartTls
        ));
        assert!(matches!(
            chain.recognize(b"\x16", &ctx(TlsMode::Optional, false)),
            Recognition::NeedMore(2)
        ));
        assert!(matches!(
            chain.recognize(hello, &ctx(TlsMode::Disabled, false)),
            Recognition::NotMatched
        ));
        let active = HandshakeContext {
            tls: TlsMode::Optional,
            tls_active: true,
            internal: false,
        };
        assert!(matches!(chain.recognize(hello, &active), Recognition::NotMatched));
    }

    #[test]
    fn test_chain_internal_only() {
        let chain = FramerChain::new();
        let relay = b"\xF1\x01\0\0\0\x01";
        assert!(matches!(
            chain.recognize(relay, &ctx(TlsMode::Disabled, false)),
            Recognition::NotMatched
        ));
        assert_eq!(
            family(chain.recognize(relay, &ctx(TlsMode::Disabled, true))),
            Some("fwd".into())
        );
        assert_eq!(
            family(chain.recognize(b"\xF2\0\x07\0\0\0\x01", &ctx(TlsMode::Disabled, true))),
            Some("mux".into())
        );
    }

    #[test]
    fn test_chain_legacy_last() {
        let chain = FramerChain::new();
        assert_eq!(
            family(chain.recognize(b"\xFE\x01\0\x02", &ctx(TlsMode::Disabled, false))),
            Some("legacy".into())
        );
    }

    struct StarRecognizer;

    impl Recognizer for StarRecognizer {
        fn name(&self) -> &str {
            "star"
        }

        fn try_recognize(&self, prefix: &[u8], _ctx: &HandshakeContext) -> Recognition {
            if prefix[0] == b'*' {
                Recognition::Recognized(Arc::new(RpcFramer::new()))
            } else {
                Recognition::NotMatched
            }
        }
    }

    #[test]
    fn test_chain_external() {
        let chain = FramerChain::new();
        let c = ctx(TlsMode::Disabled, false);
        assert!(matches!(chain.recognize(b"*abc", &c), Recognition::NotMatched));
        chain.register(Arc::new(StarRecognizer));
        assert!(matches!(chain.recognize(b"*abc", &c), Recognition::Recognized(_)));
    }

    #[test]
    fn test_limits_check() {
        let mut lim = FrameLimits {
            max_message_size: 100,
            first_packet_max: 50,
            first_exchange_done: false,
        };
        assert_eq!(lim.check(2, 101), Err(ReasonCode::MessageTooBig));
        assert_eq!(lim.check(2, 60), Err(ReasonCode::FirstPacketTooLarge));
        lim.first_exchange_done = true;
        assert_eq!(lim.check(2, 60), Ok(()));
    }

    #[test]
    fn test_assembler_split_reads() {
        let framer = RpcFramer::new();
        let a = encode_frame(&framer, b"first", 1).unwrap();
        let b = encode_frame(&framer, b"second-payload", 2).unwrap();
        let stream = [a, b].concat();

        for _ in 0..200 {
            let frames = feed_chunks(&framer, &stream, &random_cuts(stream.len())).unwrap();
            assert_eq!(
                frames,
                vec![(b"first".to_vec(), 1), (b"second-payload".to_vec(), 2)]
            );
        }
    }

    #[test]
    fn test_assembler_sink_error_stops() {
        let framer = RpcFramer::new();
        let stream = [
            encode_frame(&framer, b"a", 1).unwrap(),
            encode_frame(&framer, b"b", 1).unwrap(),
        ]
        .concat();
        let mut asm = Assembler::new();
        let mut lim = limits();
        let mut seen = 0;
        let rc = asm.push(&framer, &stream, &mut lim, |_, _| {
            seen += 1;
            Err(ReasonCode::ProtocolClose)
        });
        assert_eq!(rc, Err(ReasonCode::ProtocolClose));
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_assembler_sets_first_exchange() {
        let framer = RpcFramer::new();
        let mut asm = Assembler::new();
        let mut lim = limits();
        let frame = encode_frame(&framer, b"x", 0).unwrap();
        asm.push(&framer, &frame, &mut lim, |_, _| Ok(())).unwrap();
        assert!(lim.first_exchange_done);
    }

    #[test]
    fn test_assembler_stash_then_flush() {
        let framer = RpcFramer::new();
        let frame = encode_frame(&framer, b"hello", 3).unwrap();
        let mut asm = Assembler::new();
        asm.stash(&frame[..3]);
        assert_eq!(asm.buffered().len(), 3);
        let mut lim = limits();
        let mut got = Vec::new();
        asm.push(&framer, &frame[3..], &mut lim, |p, k| {
            got.push((p.to_vec(), k));
            Ok(())
        })
        .unwrap();
        assert_eq!(got, vec![(b"hello".to_vec(), 3)]);
        assert!(asm.buffered().is_empty());
    }
}
