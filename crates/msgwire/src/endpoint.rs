// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Live endpoint objects.
//!
//! An [`Endpoint`] wraps the current [`EndpointConfig`], the TLS context of
//! its security profile and its statistics block. Configuration and TLS
//! context are swapped atomically on update; connections created earlier
//! keep the `Arc`s they were created with.

use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::Mutex;

use crate::config::EndpointConfig;
use crate::metrics::{EndpointStats, EndpointStatsSnapshot};
use crate::pattern::wildcard_match;
use crate::tls::TlsContext;

/// Name of the built-in endpoint that owns outbound connections.
pub const OUTGOING_ENDPOINT: &str = "!Outgoing";

/// A configured endpoint.
pub struct Endpoint {
    name: String,
    config: ArcSwap<EndpointConfig>,
    tls: ArcSwapOption<TlsContext>,
    stats: EndpointStats,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Endpoint {
    pub(crate) fn new(config: EndpointConfig, tls: Option<Arc<TlsContext>>) -> Self {
        Self {
            name: config.name.clone(),
            config: ArcSwap::from_pointee(config),
            tls: ArcSwapOption::new(tls),
            stats: EndpointStats::new(),
            local_addr: Mutex::new(None),
        }
    }

    /// Endpoint name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current configuration.
    pub fn config(&self) -> Arc<EndpointConfig> {
        self.config.load_full()
    }

    pub(crate) fn set_config(&self, config: EndpointConfig) {
        self.config.store(Arc::new(config));
    }

    /// Current TLS context, if the endpoint has a security profile.
    pub fn tls(&self) -> Option<Arc<TlsContext>> {
        self.tls.load_full()
    }

    pub(crate) fn set_tls(&self, tls: Option<Arc<TlsContext>>) {
        self.tls.store(tls);
    }

    /// Statistics block.
    pub fn stats(&self) -> &EndpointStats {
        &self.stats
    }

    /// Bound listener address while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub(crate) fn set_local_addr(&self, addr: Option<SocketAddr>) {
        *self.local_addr.lock() = addr;
    }

    pub fn is_admin(&self) -> bool {
        self.config.load().admin
    }

    pub fn is_internal(&self) -> bool {
        self.config.load().is_internal()
    }

    pub fn snapshot(&self) -> EndpointSnapshot {
        let config = self.config();
        EndpointSnapshot {
            name: self.name.clone(),
            port: config.port,
            local_addr: self.local_addr(),
            enabled: config.enabled,
            admin: config.admin,
            tls: self.tls().map(|t| t.profile().to_string()),
            stats: self.stats.snapshot(),
        }
    }

    /// Match against an admin pattern. Internal endpoints only match
    /// patterns that start with `!`.
    pub(crate) fn matches(&self, pattern: &str) -> bool {
        if self.is_internal() && !pattern.starts_with('!') {
            return false;
        }
        wildcard_match(pattern, &self.name)
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("local_addr", &self.local_addr())
            .finish_non_exhaustive()
    }
}

/// Owned monitoring view of an endpoint.
#[derive(Clone, Debug)]
pub struct EndpointSnapshot {
    pub name: String,
    pub port: u16,
    pub local_addr: Option<SocketAddr>,
    pub enabled: bool,
    pub admin: bool,
    /// Security profile name
    pub tls: Option<String>,
    pub stats: EndpointStatsSnapshot,
}
