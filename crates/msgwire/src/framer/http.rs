// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HTTP/1.x request framing.
//!
//! A frame is the request head up to and including the blank line, followed
//! by `Content-Length` body bytes. The whole request is handed up as one
//! payload; outbound data is written as-is.

use std::sync::Arc;

use super::{
    FrameLimits, FrameResult, Framer, HandshakeContext, Recognition, Recognizer, MAX_FRAME_HEADER,
};
use crate::error::ReasonCode;

/// Request verbs, truncated to four bytes.
const VERBS: [&[u8; 4]; 7] = [b"GET ", b"POST", b"PUT ", b"HEAD", b"DELE", b"OPTI", b"PATC"];

/// Longest request head accepted.
pub const HTTP_MAX_HEAD: usize = 16 * 1024;

const HEAD_END: &[u8] = b"\r\n\r\n";

/// HTTP framer.
#[derive(Debug, Default)]
pub struct HttpFramer;

impl HttpFramer {
    pub fn new() -> Self {
        Self
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_END.len())
        .position(|w| w == HEAD_END)
        .map(|p| p + HEAD_END.len())
}

/// `Content-Length` of a complete request head; 0 when absent.
fn content_length(head: &[u8]) -> Result<usize, ReasonCode> {
    let text = std::str::from_utf8(head).map_err(|_| ReasonCode::BadLength)?;
    for line in text.split("\r\n").skip(1) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            return value.trim().parse().map_err(|_| ReasonCode::BadLength);
        }
    }
    Ok(0)
}

impl Framer for HttpFramer {
    fn family(&self) -> &str {
        "http"
    }

    fn frame(&self, buf: &[u8], limits: &FrameLimits) -> FrameResult {
        let scan = &buf[..buf.len().min(HTTP_MAX_HEAD)];
        let Some(head) = find_head_end(scan) else {
            if buf.len() >= HTTP_MAX_HEAD {
                return FrameResult::Invalid(ReasonCode::MessageTooBig);
            }
            if let Err(rc) = limits.check(0, buf.len()) {
                return FrameResult::Invalid(rc);
            }
            return FrameResult::NeedMore(buf.len() + 1);
        };
        let body = match content_length(&buf[..head]) {
            Ok(n) => n,
            Err(rc) => return FrameResult::Invalid(rc),
        };
        let len = head.saturating_add(body);
        if let Err(rc) = limits.check(0, len) {
            return FrameResult::Invalid(rc);
        }
        if buf.len() < len {
            return FrameResult::NeedMore(len);
        }
        FrameResult::Frame {
            header: 0,
            len,
            kind: 0,
        }
    }

    fn add_frame(
        &self,
        _header: &mut [u8; MAX_FRAME_HEADER],
        _len: usize,
        _kind: u32,
    ) -> Result<usize, ReasonCode> {
        Ok(0)
    }
}

/// Matches a known request verb.
pub struct HttpRecognizer {
    framer: Arc<HttpFramer>,
}

impl HttpRecognizer {
    pub fn new() -> Self {
        Self {
            framer: Arc::new(HttpFramer),
        }
    }
}

impl Default for HttpRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Recognizer for HttpRecognizer {
    fn name(&self) -> &str {
        "http"
    }

    fn try_recognize(&self, prefix: &[u8], _ctx: &HandshakeContext) -> Recognition {
        if prefix.len() < 4 {
            if VERBS.iter().any(|v| v.starts_with(prefix)) {
                return Recognition::NeedMore(4);
            }
            return Recognition::NotMatched;
        }
        if VERBS.iter().any(|v| prefix[..4] == v[..]) {
            Recognition::Recognized(self.framer.clone())
        } else {
            Recognition::NotMatched
        }
    }
}
