// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Length-prefixed RPC framing.
//!
//! ```text
//! +--------------------+--------+------------------------+
//! | body length (u32)  | kind   | payload                |
//! | big-endian         | u8     | body length - 1 bytes  |
//! +--------------------+--------+------------------------+
//! ```
//!
//! The body length counts the kind byte, so it is never zero. A valid header
//! always starts with a zero byte while frames stay under 16 MiB, which is
//! what the recognizer keys on.

use std::sync::Arc;

use super::{
    FrameLimits, FrameResult, Framer, HandshakeContext, Recognition, Recognizer, MAX_FRAME_HEADER,
};
use crate::error::ReasonCode;

/// Header size: 4-byte length + kind byte.
pub const RPC_HEADER_SIZE: usize = 5;

/// RPC framer.
#[derive(Debug, Default)]
pub struct RpcFramer;

impl RpcFramer {
    pub fn new() -> Self {
        Self
    }
}

impl Framer for RpcFramer {
    fn family(&self) -> &str {
        "rpc"
    }

    fn frame(&self, buf: &[u8], limits: &FrameLimits) -> FrameResult {
        if buf.len() < RPC_HEADER_SIZE {
            return FrameResult::NeedMore(RPC_HEADER_SIZE);
        }
        let body = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if body == 0 {
            return FrameResult::Invalid(ReasonCode::BadLength);
        }
        let len = body - 1;
        if let Err(rc) = limits.check(RPC_HEADER_SIZE, len) {
            return FrameResult::Invalid(rc);
        }
        let total = RPC_HEADER_SIZE + len;
        if buf.len() < total {
            return FrameResult::NeedMore(total);
        }
        FrameResult::Frame {
            header: RPC_HEADER_SIZE,
            len,
            kind: u32::from(buf[4]),
        }
    }

    fn add_frame(
        &self,
        header: &mut [u8; MAX_FRAME_HEADER],
        len: usize,
        kind: u32,
    ) -> Result<usize, ReasonCode> {
        let kind = u8::try_from(kind).map_err(|_| ReasonCode::BadLength)?;
        let body = u32::try_from(len + 1).map_err(|_| ReasonCode::MessageTooBig)?;
        header[..4].copy_from_slice(&body.to_be_bytes());
        header[4] = kind;
        Ok(RPC_HEADER_SIZE)
    }
}

/// Matches a leading zero byte once a full header is present.
pub struct RpcRecognizer {
    framer: Arc<RpcFramer>,
}

impl RpcRecognizer {
    pub fn new() -> Self {
        Self {
            framer: Arc::new(RpcFramer),
        }
    }
}

impl Default for RpcRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Recognizer for RpcRecognizer {
    fn name(&self) -> &str {
        "rpc"
    }

    fn try_recognize(&self, prefix: &[u8], _ctx: &HandshakeContext) -> Recognition {
        match prefix.first() {
            Some(0) if prefix.len() < RPC_HEADER_SIZE => Recognition::NeedMore(RPC_HEADER_SIZE),
            Some(0) => Recognition::Recognized(self.framer.clone()),
            _ => Recognition::NotMatched,
        }
    }
}
