// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # msgwire - broker connection and transport engine
//!
//! Accepts TCP connections (optionally TLS), works out which wire protocol
//! a new connection speaks from its first bytes, splits the stream into
//! frames for an upper-layer [`ProtocolHandler`] and manages the connection
//! lifecycle with bounded output buffering and graceful shutdown.
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                     Upper layer (ProtocolHandler)                   |
//! |        receive() <- frames          send() / close() -> queue       |
//! +---------------------------------------------------------------------+
//! |                         Framer chain                                |
//! |   rpc | mqtt | TLS sniff | http | fwd | mux | external | legacy      |
//! +---------------------------------------------------------------------+
//! |                        I/O processors                               |
//! |   connection state machine | TLS sessions | buffer pool + queues    |
//! +---------------------------------------------------------------------+
//! |            Acceptor | readiness thread | timers | delivery          |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Transport`] | Running engine: endpoints, outbound connects, admin actions |
//! | [`Connection`] | One connection as seen by the upper layer |
//! | [`ProtocolHandler`] | Receiver of framed payloads |
//! | [`EndpointConfig`] | Listener and protocol policy |
//! | [`SecurityProfile`] | TLS material referenced by endpoints |
//! | [`ReasonCode`] | Why a connection was closed |

mod acceptor;
pub mod admin;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod endpoint;
pub mod error;
pub mod framer;
pub mod handler;
mod lists;
pub mod metrics;
pub mod pattern;
mod processor;
mod readiness;
pub mod registry;
pub mod state;
mod timers;
pub mod tls;
pub mod transport;

pub use admin::{ConnectionQuery, ConnectionSelector, Direction};
pub use config::{ConfigFile, EndpointConfig, SecurityProfile, TlsMode, TlsVersion, TransportConfig};
pub use connection::{Connection, ConnectionSnapshot, SendFlags};
pub use delivery::Delivery;
pub use endpoint::{Endpoint, EndpointSnapshot, OUTGOING_ENDPOINT};
pub use error::{ReasonCode, Result, SendStatus, TransportError};
pub use framer::{Framer, FrameResult, Recognition, Recognizer};
pub use handler::ProtocolHandler;
pub use state::LifeState;
pub use tls::{ClientTls, TlsContext};
pub use transport::{OutboundOptions, Transport};
