// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Engine configuration.
//!
//! Provides the configuration records consumed by the engine:
//! - [`TransportConfig`] - process-wide settings (threads, pools, timers)
//! - [`EndpointConfig`] - one listener and its protocol policy
//! - [`SecurityProfile`] - TLS material and policy referenced by endpoints
//! - [`ConfigFile`] - TOML loader for all of the above
//!
//! # Example
//!
//! ```
//! use msgwire::{EndpointConfig, TlsMode};
//!
//! let endpoint = EndpointConfig::new("mqtt", 1883)
//!     .with_protocols(&["mqtt"])
//!     .with_max_message_size(256 * 1024);
//! assert!(endpoint.validate().is_ok());
//! assert_eq!(endpoint.tls, TlsMode::Disabled);
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

/// Default size of each pooled outbound buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Queued buffer count above which a connection is suspended.
pub const DEFAULT_SUSPEND_QUEUE_LIMIT: usize = 128;

/// Default active connection ceiling.
pub const ACTIVE_CONNECTION_MAX_DEFAULT: usize = 2_000_000;

const MIN_BUFFER_SIZE: usize = 512;
const MAX_BUFFER_SIZE: usize = 1024 * 1024;
const MIN_POOL_BYTES: u64 = 32 * 1024 * 1024;

// ============================================================================
// Transport (process-wide) configuration
// ============================================================================

/// Process-wide engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Number of I/O processor threads (one more is added for admin endpoints)
    pub io_processors: usize,

    /// Size of each pooled outbound buffer and of the receive scratch buffer
    pub buffer_size: usize,

    /// Total pool budget, divided across processors
    pub max_pool_bytes: u64,

    /// Ceiling on active non-admin connections
    pub active_connections_max: usize,

    /// Monitoring slots available to live connections
    pub monitor_capacity: u32,

    /// Freed slots kept in quarantine before reuse (0 = capacity / 20)
    pub monitor_free_limit: u32,

    /// Largest frame tolerated before the first successful exchange
    pub first_packet_max: usize,

    /// Connections without a first frame after this long are closed
    pub first_packet_timeout_ms: u64,

    /// Closed-list sweep interval
    pub cleanup_interval_ms: u64,

    /// First-packet sweep interval
    pub ddos_interval_ms: u64,

    /// Expiration scan interval
    pub expire_interval_ms: u64,

    /// Receive buffer growth check interval
    pub rcvbuf_check_interval_ms: u64,

    /// Shutdown escalation tick
    pub sledge_interval_ms: u64,

    /// Ticks before a stalled graceful shutdown is forced
    pub sledge_ticks: u8,

    /// Upper bound for SO_RCVBUF growth
    pub max_recv_buffer: usize,

    /// Upper bound for SO_SNDBUF growth
    pub max_send_buffer: usize,

    /// Connections accepted per listener per wake-up
    pub accept_batch: usize,

    /// Bounded wait for a client set to drain
    pub client_set_wait_ms: u64,

    /// Bounded wait for close-all at shutdown
    pub close_all_wait_ms: u64,

    /// Queued buffer count above which a connection is suspended
    pub suspend_queue_limit: usize,

    /// IPv4 CIDR ranges whose connection records are logged at debug level
    pub nolog: Vec<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            io_processors: 4,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_pool_bytes: 500 * 1024 * 1024,
            active_connections_max: ACTIVE_CONNECTION_MAX_DEFAULT,
            monitor_capacity: 100_000,
            monitor_free_limit: 0,
            first_packet_max: 1024 * 1024,
            first_packet_timeout_ms: 60_000,
            cleanup_interval_ms: 3_000,
            ddos_interval_ms: 60_000,
            expire_interval_ms: 30_000,
            rcvbuf_check_interval_ms: 30_000,
            sledge_interval_ms: 200,
            sledge_ticks: 8,
            max_recv_buffer: 4 * 1024 * 1024,
            max_send_buffer: 4 * 1024 * 1024,
            accept_batch: 64,
            client_set_wait_ms: 180_000,
            close_all_wait_ms: 60_000,
            suspend_queue_limit: DEFAULT_SUSPEND_QUEUE_LIMIT,
            nolog: Vec::new(),
        }
    }
}

impl TransportConfig {
    /// Set the number of I/O processors.
    pub fn with_io_processors(mut self, count: usize) -> Self {
        self.io_processors = count;
        self
    }

    /// Set the active connection ceiling.
    pub fn with_active_connections_max(mut self, max: usize) -> Self {
        self.active_connections_max = max;
        self
    }

    /// Set the pooled buffer size.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set the total pool budget.
    pub fn with_max_pool_bytes(mut self, bytes: u64) -> Self {
        self.max_pool_bytes = bytes;
        self
    }

    /// Set monitoring capacity and quarantine size.
    pub fn with_monitoring(mut self, capacity: u32, free_limit: u32) -> Self {
        self.monitor_capacity = capacity;
        self.monitor_free_limit = free_limit;
        self
    }

    /// Set the first-packet size cap.
    pub fn with_first_packet_max(mut self, bytes: usize) -> Self {
        self.first_packet_max = bytes;
        self
    }

    /// Set the first-packet timeout and the sweep interval that enforces it.
    pub fn with_first_packet_timeout(mut self, timeout: Duration, sweep: Duration) -> Self {
        self.first_packet_timeout_ms = duration_ms(timeout);
        self.ddos_interval_ms = duration_ms(sweep);
        self
    }

    /// Set the closed-list sweep interval.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval_ms = duration_ms(interval);
        self
    }

    /// Set the expiration scan interval.
    pub fn with_expire_interval(mut self, interval: Duration) -> Self {
        self.expire_interval_ms = duration_ms(interval);
        self
    }

    /// Set the client-set drain wait.
    pub fn with_client_set_wait(mut self, wait: Duration) -> Self {
        self.client_set_wait_ms = duration_ms(wait);
        self
    }

    /// Set the close-all wait used at shutdown.
    pub fn with_close_all_wait(mut self, wait: Duration) -> Self {
        self.close_all_wait_ms = duration_ms(wait);
        self
    }

    /// Set the no-log address ranges.
    pub fn with_nolog(mut self, ranges: Vec<String>) -> Self {
        self.nolog = ranges;
        self
    }

    /// Pooled buffer size clamped to the supported range.
    pub fn effective_buffer_size(&self) -> usize {
        self.buffer_size.clamp(MIN_BUFFER_SIZE, MAX_BUFFER_SIZE)
    }

    /// Pool budget per processor (the admin processor gets a share too).
    pub fn pool_bytes_per_processor(&self) -> u64 {
        self.max_pool_bytes.max(MIN_POOL_BYTES) / (self.io_processors as u64 + 1)
    }

    /// Quarantine size, defaulting to 5% of capacity.
    pub fn effective_free_limit(&self) -> u32 {
        if self.monitor_free_limit == 0 {
            self.monitor_capacity / 20
        } else {
            self.monitor_free_limit
        }
    }

    /// First-packet timeout.
    pub fn first_packet_timeout(&self) -> Duration {
        Duration::from_millis(self.first_packet_timeout_ms)
    }

    /// Closed-list sweep interval.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    /// First-packet sweep interval.
    pub fn ddos_interval(&self) -> Duration {
        Duration::from_millis(self.ddos_interval_ms)
    }

    /// Expiration scan interval.
    pub fn expire_interval(&self) -> Duration {
        Duration::from_millis(self.expire_interval_ms)
    }

    /// Receive buffer growth check interval.
    pub fn rcvbuf_check_interval(&self) -> Duration {
        Duration::from_millis(self.rcvbuf_check_interval_ms)
    }

    /// Shutdown escalation tick.
    pub fn sledge_interval(&self) -> Duration {
        Duration::from_millis(self.sledge_interval_ms)
    }

    /// Client-set drain wait.
    pub fn client_set_wait(&self) -> Duration {
        Duration::from_millis(self.client_set_wait_ms)
    }

    /// Close-all wait.
    pub fn close_all_wait(&self) -> Duration {
        Duration::from_millis(self.close_all_wait_ms)
    }

    /// Validate configuration.
    pub fn validate(&self) -> std::result::Result<(), &'static str> {
        if self.io_processors == 0 {
            return Err("io_processors must be > 0");
        }
        if self.io_processors > 256 {
            return Err("io_processors too large (> 256)");
        }
        if self.active_connections_max == 0 {
            return Err("active_connections_max must be > 0");
        }
        if self.monitor_capacity == 0 {
            return Err("monitor_capacity must be > 0");
        }
        if self.first_packet_max < 64 {
            return Err("first_packet_max must be >= 64");
        }
        if self.cleanup_interval_ms == 0
            || self.ddos_interval_ms == 0
            || self.expire_interval_ms == 0
            || self.rcvbuf_check_interval_ms == 0
            || self.sledge_interval_ms == 0
        {
            return Err("timer intervals must be > 0");
        }
        if self.sledge_ticks == 0 {
            return Err("sledge_ticks must be > 0");
        }
        if self.accept_batch == 0 {
            return Err("accept_batch must be > 0");
        }
        if self.suspend_queue_limit == 0 {
            return Err("suspend_queue_limit must be > 0");
        }
        Ok(())
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// Endpoint configuration
// ============================================================================

/// TLS policy of an endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Plaintext only; TLS-looking input is an unknown protocol
    #[default]
    Disabled,
    /// Sniff the first bytes and start TLS when they look like a TLS record
    Optional,
    /// Every connection starts with a TLS handshake
    Required,
}

impl TlsMode {
    /// Whether a TLS context is needed for this mode.
    pub fn needs_context(self) -> bool {
        !matches!(self, TlsMode::Disabled)
    }
}

/// Configuration of one listening endpoint.
///
/// Endpoint names starting with `!` are internal: they accept the relay and
/// channel framings and are hidden from default monitoring queries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Unique endpoint name
    pub name: String,

    /// Bind address (None = all interfaces)
    pub interface: Option<IpAddr>,

    /// Listen port (0 = ephemeral)
    pub port: u16,

    /// Protocol families allowed (empty = all)
    pub protocols: Vec<String>,

    /// TLS policy
    pub tls: TlsMode,

    /// Security profile used when `tls` is not `Disabled`
    pub security_profile: Option<String>,

    /// Message hub reference (opaque to the engine)
    pub message_hub: Option<String>,

    /// Largest inbound frame accepted
    pub max_message_size: usize,

    /// Largest outbound payload accepted by `send`
    pub max_send_size: usize,

    /// Batch outbound writes (opaque hint for protocol engines)
    pub batching: bool,

    /// Listener running
    pub enabled: bool,

    /// Admin endpoint: pinned to the admin processor, exempt from the ceiling
    pub admin: bool,

    /// Listen backlog
    pub backlog: u32,

    /// Disable Nagle's algorithm on accepted sockets
    pub nodelay: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            interface: None,
            port: 0,
            protocols: Vec::new(),
            tls: TlsMode::Disabled,
            security_profile: None,
            message_hub: None,
            max_message_size: 4 * 1024 * 1024,
            max_send_size: 64 * 1024 * 1024,
            batching: false,
            enabled: true,
            admin: false,
            backlog: 1024,
            nodelay: true,
        }
    }
}

impl EndpointConfig {
    /// Create an endpoint listening on all interfaces.
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
            ..Default::default()
        }
    }

    /// Bind to a specific interface.
    pub fn with_interface(mut self, addr: IpAddr) -> Self {
        self.interface = Some(addr);
        self
    }

    /// Restrict allowed protocol families.
    pub fn with_protocols(mut self, protocols: &[&str]) -> Self {
        self.protocols = protocols.iter().map(|p| p.to_ascii_lowercase()).collect();
        self
    }

    /// Set TLS policy and the security profile it uses.
    pub fn with_tls(mut self, mode: TlsMode, profile: impl Into<String>) -> Self {
        self.tls = mode;
        self.security_profile = Some(profile.into());
        self
    }

    /// Set the maximum inbound message size.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the maximum outbound payload size.
    pub fn with_max_send_size(mut self, size: usize) -> Self {
        self.max_send_size = size;
        self
    }

    /// Mark as admin endpoint.
    pub fn admin(mut self) -> Self {
        self.admin = true;
        self
    }

    /// Enable or disable the listener.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Internal endpoints are named with a leading `!`.
    pub fn is_internal(&self) -> bool {
        self.name.starts_with('!')
    }

    /// Whether `family` may be used on this endpoint.
    pub fn allows_protocol(&self, family: &str) -> bool {
        self.protocols.is_empty()
            || self
                .protocols
                .iter()
                .any(|p| p == "*" || p.eq_ignore_ascii_case(family))
    }

    /// Socket address to bind.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(
            self.interface.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            self.port,
        )
    }

    /// Whether replacing `self` with `new` needs a listener restart.
    ///
    /// Everything else is applied live.
    pub fn needs_restart(&self, new: &EndpointConfig) -> bool {
        self.interface != new.interface
            || self.port != new.port
            || self.tls != new.tls
            || self.security_profile != new.security_profile
            || self.admin != new.admin
            || self.backlog != new.backlog
    }

    /// Validate configuration.
    pub fn validate(&self) -> std::result::Result<(), &'static str> {
        if self.name.is_empty() {
            return Err("endpoint name must not be empty");
        }
        if self.max_message_size == 0 {
            return Err("max_message_size must be > 0");
        }
        if self.max_message_size > 1024 * 1024 * 1024 {
            return Err("max_message_size too large (> 1 GB)");
        }
        if self.max_send_size == 0 {
            return Err("max_send_size must be > 0");
        }
        if self.tls.needs_context() && self.security_profile.is_none() {
            return Err("TLS endpoints require a security_profile");
        }
        Ok(())
    }
}

// ============================================================================
// Security profile
// ============================================================================

/// Minimum TLS protocol version.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsVersion {
    /// TLS 1.2 and newer
    #[default]
    #[serde(rename = "tls1.2")]
    Tls12,
    /// TLS 1.3 only
    #[serde(rename = "tls1.3")]
    Tls13,
}

/// TLS material and policy shared by endpoints.
///
/// PEM material may be inline (`*_pem`) or read from a file (`*_file`).
/// Inline values win when both are present.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityProfile {
    /// Profile name referenced by endpoints
    pub name: String,

    /// Minimum protocol version
    pub min_version: TlsVersion,

    /// Allowed cipher suite names (empty = provider defaults)
    pub ciphers: Vec<String>,

    /// Require and verify a client certificate
    pub client_cert_required: bool,

    /// Server certificate chain
    pub cert_pem: Option<String>,
    /// Server certificate chain file
    pub cert_file: Option<PathBuf>,

    /// Server private key
    pub key_pem: Option<String>,
    /// Server private key file
    pub key_file: Option<PathBuf>,

    /// Trusted CAs for client certificates
    pub ca_pem: Option<String>,
    /// Trusted CA file
    pub ca_file: Option<PathBuf>,

    /// Certificate revocation lists
    pub crl_pem: Option<String>,
    /// Certificate revocation list file
    pub crl_file: Option<PathBuf>,

    /// Pre-shared-key identities
    pub psk_identities: Vec<String>,
}

impl SecurityProfile {
    /// Create a profile from inline PEM material.
    pub fn new(name: impl Into<String>, cert_pem: String, key_pem: String) -> Self {
        Self {
            name: name.into(),
            cert_pem: Some(cert_pem),
            key_pem: Some(key_pem),
            ..Default::default()
        }
    }

    /// Require client certificates issued by `ca_pem`.
    pub fn with_client_ca(mut self, ca_pem: String) -> Self {
        self.ca_pem = Some(ca_pem);
        self.client_cert_required = true;
        self
    }

    /// Set the revocation list.
    pub fn with_crl(mut self, crl_pem: String) -> Self {
        self.crl_pem = Some(crl_pem);
        self
    }

    /// Set the minimum protocol version.
    pub fn with_min_version(mut self, version: TlsVersion) -> Self {
        self.min_version = version;
        self
    }

    /// Restrict cipher suites.
    pub fn with_ciphers(mut self, ciphers: &[&str]) -> Self {
        self.ciphers = ciphers.iter().map(|c| (*c).to_string()).collect();
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> std::result::Result<(), &'static str> {
        if self.name.is_empty() {
            return Err("security profile name must not be empty");
        }
        if self.cert_pem.is_none() && self.cert_file.is_none() {
            return Err("security profile requires a certificate");
        }
        if self.key_pem.is_none() && self.key_file.is_none() {
            return Err("security profile requires a private key");
        }
        if self.client_cert_required && self.ca_pem.is_none() && self.ca_file.is_none() {
            return Err("client_cert_required needs trusted CA material");
        }
        if !self.psk_identities.is_empty() {
            return Err("pre-shared keys are not supported by the TLS provider");
        }
        Ok(())
    }

    pub(crate) fn cert_bytes(&self) -> Result<Option<Vec<u8>>> {
        load_pem(self.cert_pem.as_deref(), self.cert_file.as_deref())
    }

    pub(crate) fn key_bytes(&self) -> Result<Option<Vec<u8>>> {
        load_pem(self.key_pem.as_deref(), self.key_file.as_deref())
    }

    pub(crate) fn ca_bytes(&self) -> Result<Option<Vec<u8>>> {
        load_pem(self.ca_pem.as_deref(), self.ca_file.as_deref())
    }

    pub(crate) fn crl_bytes(&self) -> Result<Option<Vec<u8>>> {
        load_pem(self.crl_pem.as_deref(), self.crl_file.as_deref())
    }
}

fn load_pem(inline: Option<&str>, file: Option<&Path>) -> Result<Option<Vec<u8>>> {
    if let Some(pem) = inline {
        return Ok(Some(pem.as_bytes().to_vec()));
    }
    match file {
        Some(path) => Ok(Some(std::fs::read(path)?)),
        None => Ok(None),
    }
}

// ============================================================================
// Configuration file
// ============================================================================

/// Parsed configuration file.
///
/// ```toml
/// [transport]
/// io_processors = 2
///
/// [[security_profile]]
/// name = "default"
/// cert_file = "/etc/broker/server.pem"
/// key_file = "/etc/broker/server.key"
///
/// [[endpoint]]
/// name = "mqtts"
/// port = 8883
/// tls = "required"
/// security_profile = "default"
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    /// Process-wide settings
    pub transport: TransportConfig,

    /// Endpoints
    #[serde(rename = "endpoint")]
    pub endpoints: Vec<EndpointConfig>,

    /// Security profiles
    #[serde(rename = "security_profile")]
    pub security_profiles: Vec<SecurityProfile>,
}

impl ConfigFile {
    /// Parse from a TOML string and validate every record.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(text).map_err(|e| TransportError::ConfigParse(e.to_string()))?;
        file.validate()?;
        Ok(file)
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<()> {
        self.transport
            .validate()
            .map_err(TransportError::InvalidConfig)?;
        for profile in &self.security_profiles {
            profile.validate().map_err(TransportError::InvalidConfig)?;
        }
        for endpoint in &self.endpoints {
            endpoint.validate().map_err(TransportError::InvalidConfig)?;
            if let Some(name) = &endpoint.security_profile {
                if endpoint.tls.needs_context()
                    && !self.security_profiles.iter().any(|p| &p.name == name)
                {
                    return Err(TransportError::UnknownSecurityProfile(name.clone()));
                }
            }
        }
        Ok(())
    }
}
