// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Administrative actions: forced disconnects, client sets, certificate
//! revalidation and monitoring queries.
//!
//! Closes requested here never run on the caller's thread. They are queued
//! to the delivery thread, which calls [`Connection::close`] from there.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use regex::Regex;

use crate::connection::{Connection, ConnectionSnapshot};
use crate::delivery::Delivery;
use crate::endpoint::{Endpoint, EndpointSnapshot};
use crate::error::{ReasonCode, Result, TransportError};
use crate::pattern::{matches_opt, wildcard_match};
use crate::state::LifeState;
use crate::transport::Core;

/// Poll interval while waiting for a client set to drain.
const CLIENT_SET_POLL: Duration = Duration::from_millis(20);

// ============================================================================
// Client sets
// ============================================================================

struct ClientSet {
    pattern: String,
    regex: Regex,
    count: u32,
    reason: ReasonCode,
}

/// Disabled client identity expressions.
pub struct ClientSets {
    sets: Mutex<Vec<ClientSet>>,
}

impl ClientSets {
    pub fn new() -> Self {
        Self {
            sets: Mutex::new(Vec::new()),
        }
    }

    /// Disable clients whose id matches `pattern` (a regular expression).
    ///
    /// Disabling an already disabled pattern bumps its reference count.
    pub fn disable(&self, pattern: &str, reason: ReasonCode) -> Result<()> {
        let mut sets = self.sets.lock();
        if let Some(set) = sets.iter_mut().find(|s| s.pattern == pattern) {
            set.count += 1;
            set.reason = reason;
            return Ok(());
        }
        let regex = Regex::new(pattern).map_err(|e| TransportError::ClientSetNotValid(e.to_string()))?;
        sets.push(ClientSet {
            pattern: pattern.to_string(),
            regex,
            count: 1,
            reason,
        });
        Ok(())
    }

    /// Drop one reference to `pattern`. Returns `false` if it was not disabled.
    pub fn enable(&self, pattern: &str) -> bool {
        let mut sets = self.sets.lock();
        let Some(pos) = sets.iter().position(|s| s.pattern == pattern) else {
            return false;
        };
        sets[pos].count -= 1;
        if sets[pos].count == 0 {
            sets.remove(pos);
        }
        true
    }

    /// Reason code of the first disabled set matching `client_id`.
    pub fn check(&self, client_id: &str) -> Option<ReasonCode> {
        let sets = self.sets.lock();
        sets.iter()
            .find(|s| s.regex.is_match(client_id))
            .map(|s| s.reason)
    }

    pub fn is_empty(&self) -> bool {
        self.sets.lock().is_empty()
    }
}

impl Default for ClientSets {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Selectors
// ============================================================================

/// Selects connections for a forced disconnect. `None` fields match all.
///
/// String fields are `*` wildcard patterns. A `user_id` of `""` selects
/// connections without a user id.
#[derive(Clone, Debug, Default)]
pub struct ConnectionSelector {
    pub endpoint: Option<String>,
    pub client_id: Option<String>,
    pub user_id: Option<String>,
    /// Peer IP address
    pub address: Option<String>,
}

impl ConnectionSelector {
    pub fn client_id(pattern: impl Into<String>) -> Self {
        Self {
            client_id: Some(pattern.into()),
            ..Default::default()
        }
    }

    fn matches(&self, conn: &Connection) -> bool {
        let Some(client_id) = conn.client_id() else {
            return false;
        };
        if conn.endpoint().is_internal() {
            return false;
        }
        let user_ok = match (self.user_id.as_deref(), conn.user_id()) {
            (None, _) => true,
            (Some(""), user) => user.is_none(),
            (Some(p), Some(user)) => wildcard_match(p, &user),
            (Some(_), None) => false,
        };
        user_ok
            && matches_opt(self.client_id.as_deref(), &client_id)
            && matches_opt(self.endpoint.as_deref(), conn.endpoint().name())
            && matches_opt(self.address.as_deref(), &conn.peer_addr().ip().to_string())
    }
}

/// Connection direction filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Filter for [`Transport::connection_monitor`](crate::Transport::connection_monitor).
#[derive(Clone, Debug, Default)]
pub struct ConnectionQuery {
    /// Client id pattern
    pub name: Option<String>,
    pub protocol: Option<String>,
    /// Endpoint pattern. Internal endpoints are listed only when it starts with `!`.
    pub endpoint: Option<String>,
    pub user_id: Option<String>,
    /// Peer IP address pattern
    pub client_address: Option<String>,
    /// Inclusive peer port range
    pub ports: Option<(u16, u16)>,
    pub direction: Option<Direction>,
}

impl ConnectionQuery {
    fn matches(&self, conn: &Connection) -> bool {
        let Some(client_id) = conn.client_id() else {
            return false;
        };
        let show_internal = self.endpoint.as_deref().is_some_and(|p| p.starts_with('!'));
        if conn.endpoint().is_internal() && !show_internal {
            return false;
        }
        if let Some((low, high)) = self.ports {
            let port = conn.peer_addr().port();
            if port < low || port > high {
                return false;
            }
        }
        if let Some(direction) = self.direction {
            let outgoing = direction == Direction::Outgoing;
            if conn.is_outgoing() != outgoing {
                return false;
            }
        }
        let protocol = conn.protocol().unwrap_or_default();
        let user = conn.user_id().unwrap_or_default();
        matches_opt(self.name.as_deref(), &client_id)
            && matches_opt(self.protocol.as_deref(), &protocol)
            && matches_opt(self.endpoint.as_deref(), conn.endpoint().name())
            && matches_opt(self.user_id.as_deref(), &user)
            && matches_opt(
                self.client_address.as_deref(),
                &conn.peer_addr().ip().to_string(),
            )
    }
}

// ============================================================================
// Engine operations
// ============================================================================

impl Core {
    /// Queue a close of `conn` on the delivery thread.
    pub(crate) fn schedule_close(&self, conn: &Arc<Connection>, reason: ReasonCode) -> bool {
        self.delivery.add(
            conn.clone(),
            Box::new(move |c| {
                c.close(reason, true, None);
                Delivery::Done
            }),
        )
    }

    /// Close every connection of endpoints matching `pattern`.
    pub(crate) fn disconnect_endpoint(&self, pattern: &str, reason: ReasonCode) -> usize {
        let count = self.close_where(|ep| ep.matches(pattern), reason);
        if count > 0 {
            log::info!("[msgwire] Disconnecting {} connections on endpoints {}", count, pattern);
        }
        count
    }

    /// Close every connection of the endpoint named exactly `name`.
    pub(crate) fn close_endpoint(&self, name: &str, reason: ReasonCode) -> usize {
        let count = self.close_where(|ep| ep.name() == name, reason);
        if count > 0 {
            log::info!("[msgwire] Closing {} connections on endpoint {}", count, name);
        }
        count
    }

    fn close_where(&self, select: impl Fn(&Endpoint) -> bool, reason: ReasonCode) -> usize {
        let mut count = 0;
        for conn in self.lists.snapshot_active() {
            if conn.state().is_live() && select(conn.endpoint()) && self.schedule_close(&conn, reason) {
                count += 1;
            }
        }
        count
    }

    /// Forced disconnect by selector. Each connection is counted once.
    pub(crate) fn close_connections(&self, selector: Option<&ConnectionSelector>) -> usize {
        let mut count = 0;
        for conn in self.lists.snapshot_active() {
            if !conn.state().is_live() || conn.is_admin_closed() {
                continue;
            }
            let selected = match selector {
                Some(s) => s.matches(&conn),
                None => conn.client_id().is_some() && !conn.endpoint().is_internal(),
            };
            if selected && conn.mark_admin_closed() && self.schedule_close(&conn, ReasonCode::ForcedDisconnect) {
                count += 1;
            }
        }
        log::info!("[msgwire] Forced disconnect of {} connections", count);
        count
    }

    /// Close checked connections whose client id matches `pattern` and wait
    /// until none is left, up to `client_set_wait`.
    pub(crate) fn close_client_set(&self, pattern: &str, reason: ReasonCode) -> Result<()> {
        let regex = Regex::new(pattern).map_err(|e| TransportError::ClientSetNotValid(e.to_string()))?;
        let deadline = Instant::now() + self.config.client_set_wait();
        loop {
            let mut remaining = 0usize;
            for conn in self.lists.snapshot_active() {
                if !conn.is_client_checked() || conn.endpoint().is_internal() {
                    continue;
                }
                let Some(client_id) = conn.client_id() else {
                    continue;
                };
                if !regex.is_match(&client_id) {
                    continue;
                }
                match conn.state() {
                    LifeState::Opening | LifeState::Open => {
                        if conn.mark_admin_closed() {
                            self.schedule_close(&conn, reason);
                        }
                        remaining += 1;
                    }
                    LifeState::Closing => remaining += 1,
                    LifeState::Closed => {}
                }
            }
            if remaining == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                log::warn!(
                    "[msgwire] Client set {} still has {} connections after {:?}",
                    pattern,
                    remaining,
                    self.config.client_set_wait()
                );
                return Err(TransportError::TimedOut);
            }
            thread::sleep(CLIENT_SET_POLL);
        }
    }

    /// Disable `pattern` and drain its connections. On time-out the set is
    /// enabled again.
    pub(crate) fn disable_client_set(&self, pattern: &str, reason: ReasonCode) -> Result<()> {
        self.client_sets.disable(pattern, reason)?;
        log::info!("[msgwire] Client set disabled: {} ({})", pattern, reason);
        if let Err(e) = self.close_client_set(pattern, reason) {
            self.client_sets.enable(pattern);
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn enable_client_set(&self, pattern: &str) -> bool {
        let enabled = self.client_sets.enable(pattern);
        if enabled {
            log::info!("[msgwire] Client set enabled: {}", pattern);
        }
        enabled
    }

    /// Recheck peer certificates on `endpoint` against its current
    /// revocation list and close the revoked ones.
    pub(crate) fn revoke_connections(&self, endpoint: &str) -> Result<usize> {
        let ep = self
            .endpoints
            .read()
            .get(endpoint)
            .cloned()
            .ok_or_else(|| TransportError::UnknownEndpoint(endpoint.to_string()))?;
        let Some(tls) = ep.tls() else {
            return Ok(0);
        };
        let mut count = 0;
        for conn in self.lists.snapshot_active() {
            if conn.endpoint().name() != endpoint || !conn.state().is_live() {
                continue;
            }
            let Some(der) = conn.peer_certificate() else {
                continue;
            };
            if tls.is_revoked(&der) && self.schedule_close(&conn, ReasonCode::ConnectNotAuthorized) {
                count += 1;
            }
        }
        log::info!("[msgwire] Revalidation on {} closed {} connections", endpoint, count);
        Ok(count)
    }

    pub(crate) fn connection_monitor(
        &self,
        query: &ConnectionQuery,
        position: u32,
        max: usize,
    ) -> (Vec<ConnectionSnapshot>, u32) {
        let (page, next) = self.registry.page(position, max, |c| query.matches(c));
        (page.iter().map(|c| c.snapshot()).collect(), next)
    }

    pub(crate) fn endpoint_monitor(&self, pattern: &str) -> Vec<EndpointSnapshot> {
        let mut out: Vec<EndpointSnapshot> = self
            .endpoints
            .read()
            .values()
            .filter(|ep| ep.matches(pattern))
            .map(|ep| ep.snapshot())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}
