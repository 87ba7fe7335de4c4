// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types and close reason codes.
//!
//! Three families live here:
//! - [`ReasonCode`] - why a connection was closed (recorded in logs and statistics)
//! - [`SendStatus`] - result of queueing outbound data on a connection
//! - [`TransportError`] - failures of the engine API itself (config, bind, admin)
//!
//! Per-connection problems never escape as [`TransportError`]; they close the
//! affected connection with a [`ReasonCode`].

use std::fmt;
use std::io;
use std::net::SocketAddr;

// ============================================================================
// Close reason codes
// ============================================================================

/// Reason a connection was closed or refused.
///
/// The numeric value is stable and appears in close records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ReasonCode {
    /// Normal close requested by the protocol layer
    ProtocolClose = 0,
    /// Peer closed the socket
    ClosedByPeer = 1,
    /// Unrecoverable socket error
    SocketError = 2,
    /// Active connection ceiling reached
    ServerCapacity = 100,
    /// Nothing arrived within the first-packet timeout
    NoFirstPacket = 101,
    /// First frame larger than allowed before the first exchange
    FirstPacketTooLarge = 102,
    /// Frame larger than the endpoint maximum message size
    MessageTooBig = 103,
    /// Malformed length encoding
    BadLength = 104,
    /// No recognizer matched the handshake bytes
    UnknownProtocol = 105,
    /// Recognized protocol is not enabled on the endpoint
    ProtocolNotAllowed = 106,
    /// TLS handshake failed
    TlsHandshakeFailed = 200,
    /// Peer certificate rejected or revoked
    CertificateInvalid = 201,
    /// TLS context could not be created for the endpoint
    ServerUnavailable = 202,
    /// Connection deadline passed
    ConnectionExpired = 300,
    /// Endpoint disabled or administratively disconnected
    EndpointDisabled = 301,
    /// Revalidation against the current revocation list failed
    ConnectNotAuthorized = 302,
    /// Client identity matches a disabled client set
    ClientSetDisabled = 303,
    /// Administrative force-disconnect
    ForcedDisconnect = 304,
    /// Engine shutdown
    ServerTerminating = 305,
    /// Outbound connect failed
    ConnectFailed = 400,
}

impl ReasonCode {
    /// Stable numeric value.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Default human readable text for close records.
    pub fn message(self) -> &'static str {
        match self {
            ReasonCode::ProtocolClose => "The connection was closed by the protocol",
            ReasonCode::ClosedByPeer => "The connection was closed by the client",
            ReasonCode::SocketError => "A socket error occurred",
            ReasonCode::ServerCapacity => "The server is at its connection limit",
            ReasonCode::NoFirstPacket => "No data was received on the connection",
            ReasonCode::FirstPacketTooLarge => "The first packet is too large",
            ReasonCode::MessageTooBig => "The message is larger than the endpoint allows",
            ReasonCode::BadLength => "The frame length is not valid",
            ReasonCode::UnknownProtocol => "The connection protocol is not recognized",
            ReasonCode::ProtocolNotAllowed => "The protocol is not allowed on this endpoint",
            ReasonCode::TlsHandshakeFailed => "The TLS handshake failed",
            ReasonCode::CertificateInvalid => "The certificate is not valid",
            ReasonCode::ServerUnavailable => "The secure endpoint is not available",
            ReasonCode::ConnectionExpired => "Connection expired",
            ReasonCode::EndpointDisabled => "The endpoint is disabled",
            ReasonCode::ConnectNotAuthorized => "The connection is not authorized",
            ReasonCode::ClientSetDisabled => "Connections from this client are disabled",
            ReasonCode::ForcedDisconnect => "Force disconnect",
            ReasonCode::ServerTerminating => {
                "The connection was closed because the server was shutdown"
            }
            ReasonCode::ConnectFailed => "The outgoing connection failed",
        }
    }

    /// Whether this reason counts as a failed connection in endpoint statistics.
    pub fn is_failure(self) -> bool {
        !matches!(
            self,
            ReasonCode::ProtocolClose
                | ReasonCode::ClosedByPeer
                | ReasonCode::ConnectionExpired
                | ReasonCode::EndpointDisabled
                | ReasonCode::ForcedDisconnect
                | ReasonCode::ServerTerminating
        )
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

// ============================================================================
// Send status
// ============================================================================

/// Result of [`Connection::send`](crate::Connection::send).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum SendStatus {
    /// Data queued
    Ok = 0,
    /// Connection not yet able to send (no framer selected)
    BadState = 1001,
    /// Connection is closing or closed
    Closed = 1002,
    /// Data queued, but the connection is now suspended
    Suspend = 1003,
    /// Payload exceeds the endpoint send limit
    Alloc = 1004,
}

impl SendStatus {
    /// Whether the data was accepted into the send queue.
    pub fn is_queued(self) -> bool {
        matches!(self, SendStatus::Ok | SendStatus::Suspend)
    }
}

// ============================================================================
// Engine errors
// ============================================================================

/// Errors returned by the engine API.
#[derive(Debug)]
pub enum TransportError {
    /// Configuration rejected by validation
    InvalidConfig(&'static str),
    /// Configuration file could not be parsed
    ConfigParse(String),
    /// Listener could not be bound
    Bind {
        /// Address that failed
        addr: SocketAddr,
        /// Underlying error
        source: io::Error,
    },
    /// Named endpoint does not exist
    UnknownEndpoint(String),
    /// Named security profile does not exist
    UnknownSecurityProfile(String),
    /// TLS setup failed
    Tls(String),
    /// Client set expression does not compile
    ClientSetNotValid(String),
    /// Bounded wait expired
    TimedOut,
    /// Requested object not found
    NotFound,
    /// Engine already stopped
    Stopped,
    /// Other I/O failure
    Io(io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            TransportError::ConfigParse(msg) => write!(f, "configuration parse error: {}", msg),
            TransportError::Bind { addr, source } => {
                write!(f, "unable to listen on {}: {}", addr, source)
            }
            TransportError::UnknownEndpoint(name) => write!(f, "unknown endpoint: {}", name),
            TransportError::UnknownSecurityProfile(name) => {
                write!(f, "unknown security profile: {}", name)
            }
            TransportError::Tls(msg) => write!(f, "TLS error: {}", msg),
            TransportError::ClientSetNotValid(msg) => write!(f, "client set not valid: {}", msg),
            TransportError::TimedOut => write!(f, "operation timed out"),
            TransportError::NotFound => write!(f, "not found"),
            TransportError::Stopped => write!(f, "transport stopped"),
            TransportError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Bind { source, .. } => Some(source),
            TransportError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Io(e)
    }
}

impl From<TransportError> for io::Error {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Io(inner) => inner,
            TransportError::Bind { source, .. } => source,
            TransportError::TimedOut => io::Error::new(io::ErrorKind::TimedOut, e.to_string()),
            TransportError::NotFound
            | TransportError::UnknownEndpoint(_)
            | TransportError::UnknownSecurityProfile(_) => {
                io::Error::new(io::ErrorKind::NotFound, e.to_string())
            }
            other => io::Error::new(io::ErrorKind::InvalidInput, other.to_string()),
        }
    }
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, TransportError>;
