//! The routing table: subdomain -> listen port -> backend address -> target.
//!
//! Backends register themselves (or are registered by the control plane)
//! with a lease that expires after [`ROUTE_TTL`] unless renewed by a repeated
//! add. Expiry is evaluated lazily whenever a slot is touched; there is no
//! background sweeper, so an entry nobody looks at again simply sits until
//! its owning subdomain is removed.

use crate::config::PortMap;
use hyper::Uri;
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// How long a registered backend stays routable without a renewing add.
pub const ROUTE_TTL: Duration = Duration::from_secs(30);

/// Error type for route registration
#[derive(Debug, Error)]
pub enum RouteError {
    /// The backend address does not form a valid origin URI
    #[error("invalid backend address '{address}:{port}': {source}")]
    InvalidAddress {
        address: String,
        port: u16,
        #[source]
        source: hyper::http::uri::InvalidUri,
    },
    /// The backend address parsed but carries no host component
    #[error("backend address '{address}' has no host")]
    MissingHost { address: String },
}

/// One forwarding target: a backend origin plus its lease deadline.
///
/// Cloned out of the table on lookup so proxying never holds the table lock.
#[derive(Debug, Clone)]
pub struct RouteTarget {
    address: String,
    origin: Uri,
    deadline: Instant,
}

impl RouteTarget {
    fn new(address: &str, target_port: u16, ttl: Duration) -> Result<Self, RouteError> {
        let origin: Uri = format!("http://{}:{}", address, target_port)
            .parse()
            .map_err(|source| RouteError::InvalidAddress {
                address: address.to_string(),
                port: target_port,
                source,
            })?;
        if origin.host().map(str::is_empty).unwrap_or(true) {
            return Err(RouteError::MissingHost {
                address: address.to_string(),
            });
        }
        Ok(Self {
            address: address.to_string(),
            origin,
            deadline: Instant::now() + ttl,
        })
    }

    /// The backend address this target forwards to (typically an IP).
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The `http://address:port` origin requests are rewritten against.
    pub fn origin(&self) -> &Uri {
        &self.origin
    }

    fn alive(&self) -> bool {
        Instant::now() < self.deadline
    }

    fn renew(&mut self, ttl: Duration) {
        self.deadline = Instant::now() + ttl;
    }
}

/// The per-subdomain bucket set: listen port -> backend address -> target.
#[derive(Debug, Default)]
struct PortBuckets {
    by_port: HashMap<u16, HashMap<String, RouteTarget>>,
}

impl PortBuckets {
    /// Non-mutating scan used under the shared lock: returns any alive
    /// candidate and whether the bucket holds expired entries to prune.
    fn scan(&self, port: u16) -> (Option<&RouteTarget>, bool) {
        let Some(targets) = self.by_port.get(&port) else {
            return (None, false);
        };
        let mut live = None;
        let mut expired = false;
        for target in targets.values() {
            if target.alive() {
                if live.is_none() {
                    live = Some(target);
                }
            } else {
                expired = true;
            }
        }
        (live, expired)
    }

    /// Drops every expired entry for `port` and returns any alive candidate.
    /// No ordering guarantee among multiple live candidates.
    fn select_live(&mut self, port: u16) -> Option<RouteTarget> {
        let targets = self.by_port.get_mut(&port)?;
        targets.retain(|address, target| {
            let alive = target.alive();
            if !alive {
                info!(address, port, "backend lease expired, dropping target");
            }
            alive
        });
        targets.values().next().cloned()
    }

    /// Checks one specific address. Alive entries get their lease renewed
    /// (the check itself is a keep-alive signal); expired ones are dropped.
    fn has_live(&mut self, port: u16, address: &str, ttl: Duration) -> bool {
        let Some(targets) = self.by_port.get_mut(&port) else {
            return false;
        };
        match targets.get_mut(address) {
            Some(target) if target.alive() => {
                target.renew(ttl);
                debug!(address, port, "backend lease renewed");
                true
            }
            Some(_) => {
                info!(address, port, "backend lease expired, dropping target");
                targets.remove(address);
                false
            }
            None => false,
        }
    }

    fn insert(&mut self, port: u16, address: String, target: RouteTarget) {
        self.by_port.entry(port).or_default().insert(address, target);
    }

    #[cfg(test)]
    fn len(&self, port: u16) -> usize {
        self.by_port.get(&port).map_or(0, HashMap::len)
    }
}

/// The concurrent routing table.
///
/// One reader/writer lock guards the whole subdomain map. `exists` and
/// `subdomains` take the shared lock; `add` and `remove` take the exclusive
/// lock. `lookup` starts on an upgradable read and only upgrades to the
/// exclusive lock when its scan observed expired entries, so the lazy prune
/// never mutates shared state under a shared lock.
pub struct RoutingTable {
    port_maps: Vec<PortMap>,
    ttl: Duration,
    domains: RwLock<HashMap<String, PortBuckets>>,
}

impl RoutingTable {
    /// Create a table with the default 30s lease TTL.
    pub fn new(port_maps: Vec<PortMap>) -> Self {
        Self::with_ttl(port_maps, ROUTE_TTL)
    }

    /// Create a table with a custom lease TTL.
    pub fn with_ttl(port_maps: Vec<PortMap>, ttl: Duration) -> Self {
        Self {
            port_maps,
            ttl,
            domains: RwLock::new(HashMap::new()),
        }
    }

    /// The static listen/target port maps this table was built with.
    pub fn port_maps(&self) -> &[PortMap] {
        &self.port_maps
    }

    /// Register or renew a backend for `subdomain`.
    ///
    /// For every configured listen port whose target equals `target_port`,
    /// ensures a live target for `address` — renewing the lease when one is
    /// already there, inserting a fresh one otherwise. Safe to call
    /// repeatedly; the control plane uses it as a heartbeat.
    ///
    /// A `target_port` with no matching listen port still creates the
    /// subdomain entry (so `exists` reports it) but no routes, and is only
    /// logged. A malformed `address` fails the call without touching the
    /// table.
    pub fn add(&self, subdomain: &str, address: &str, target_port: u16) -> Result<(), RouteError> {
        let subdomain = subdomain.to_ascii_lowercase();
        // Validate the origin before taking the lock so a bad address
        // leaves prior state intact.
        let target = RouteTarget::new(address, target_port, self.ttl)?;

        let mut domains = self.domains.write();
        let buckets = domains.entry(subdomain.clone()).or_default();
        let mut matched = false;
        for pm in self.port_maps.iter().filter(|pm| pm.target == target_port) {
            matched = true;
            if buckets.has_live(pm.listen, address, self.ttl) {
                continue;
            }
            buckets.insert(pm.listen, address.to_string(), target.clone());
            info!(
                subdomain,
                listen_port = pm.listen,
                address,
                target_port,
                "registered backend route"
            );
        }
        if !matched {
            warn!(
                subdomain,
                address, target_port, "no listen port maps to this target port"
            );
        }
        Ok(())
    }

    /// Delete the whole entry for `subdomain`, live or not. Silent when the
    /// subdomain is unknown.
    pub fn remove(&self, subdomain: &str) {
        let subdomain = subdomain.to_ascii_lowercase();
        info!(subdomain, "removing subdomain");
        self.domains.write().remove(&subdomain);
    }

    /// Whether `subdomain` is registered, exactly or via a wildcard pattern.
    /// Liveness is not consulted: a subdomain whose targets have all expired
    /// still exists until explicitly removed.
    pub fn exists(&self, subdomain: &str) -> bool {
        let subdomain = subdomain.to_ascii_lowercase();
        let domains = self.domains.read();
        domains.contains_key(&subdomain)
            || domains.keys().any(|pattern| label_match(pattern, &subdomain))
    }

    /// All registered subdomain keys, in no particular order.
    pub fn subdomains(&self) -> Vec<String> {
        self.domains.read().keys().cloned().collect()
    }

    /// Resolve `subdomain` on `port` to an alive forwarding target.
    ///
    /// Exact keys win over wildcard patterns; among patterns the first match
    /// is taken in unspecified scan order. Expired targets observed during
    /// the scan are pruned (under the exclusive lock) as a side effect.
    pub fn lookup(&self, subdomain: &str, port: u16) -> Option<RouteTarget> {
        let subdomain = subdomain.to_ascii_lowercase();
        let domains = self.domains.upgradable_read();

        let key = if domains.contains_key(&subdomain) {
            subdomain
        } else {
            domains
                .keys()
                .find(|pattern| label_match(pattern, &subdomain))?
                .clone()
        };

        let (live, expired) = domains.get(&key)?.scan(port);
        if !expired {
            return live.cloned();
        }

        // Expired entries observed: take the exclusive lock to prune them,
        // then select again under it.
        let mut domains = RwLockUpgradableReadGuard::upgrade(domains);
        domains.get_mut(&key)?.select_live(port)
    }
}

/// Glob match over a single hostname label.
///
/// `*` matches any run of characters and `?` exactly one; neither crosses a
/// `.` boundary, so `pr-*` matches `pr-123` but never `pr-123.extra`.
pub(crate) fn label_match(pattern: &str, label: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let l: Vec<char> = label.chars().collect();
    let (mut pi, mut li) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while li < l.len() {
        if pi < p.len() && (p[pi] == l[li] || (p[pi] == '?' && l[li] != '.')) {
            pi += 1;
            li += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, li));
            pi += 1;
        } else if let Some((star_pi, star_li)) = star {
            if l[star_li] == '.' {
                return false;
            }
            star = Some((star_pi, star_li + 1));
            pi = star_pi + 1;
            li = star_li + 1;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
