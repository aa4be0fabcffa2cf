//! TTL-bounded lookup cache
//!
//! A write-through/read-through accelerator over deployment records, keyed by
//! subdomain, deployment id, and port reservation. Strictly advisory: every
//! caller treats a miss (or an unreadable entry) by going to the persisted
//! store, so losing the cache only costs latency, never correctness.

use crate::store::DeploymentRecord;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// TTLs for the cache key spaces
#[derive(Debug, Clone, Copy)]
pub struct CacheTtls {
    /// Record snapshots and subdomain→id mappings
    pub snapshot: Duration,
    /// Negative port-reservation markers
    pub reservation: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            snapshot: Duration::from_secs(3600),
            reservation: Duration::from_secs(120),
        }
    }
}

struct Entry {
    value: String,
    expires_at: Instant,
}

/// String-keyed TTL map with typed helpers for the three key spaces
pub struct LookupCache {
    entries: DashMap<String, Entry>,
    ttls: CacheTtls,
}

impl LookupCache {
    pub fn new(ttls: CacheTtls) -> Self {
        Self {
            entries: DashMap::new(),
            ttls,
        }
    }

    /// Get a value, expiring it lazily if its TTL has lapsed
    pub fn get(&self, key: &str) -> Option<String> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    pub fn set_with_ttl(&self, key: impl Into<String>, value: impl Into<String>, ttl: Duration) {
        self.entries.insert(
            key.into(),
            Entry {
                value: value.into(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Drop every expired entry; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }

    // ---- key spaces ----

    pub fn subdomain_key(subdomain: &str) -> String {
        format!("sub:{}", subdomain)
    }

    pub fn deployment_key(id: &str) -> String {
        format!("dep:{}", id)
    }

    pub fn port_key(port: u16) -> String {
        format!("port:{}", port)
    }

    /// Deployment id cached for a subdomain
    pub fn get_subdomain(&self, subdomain: &str) -> Option<String> {
        self.get(&Self::subdomain_key(subdomain))
    }

    /// Cached record snapshot; a snapshot that no longer parses counts as a
    /// miss
    pub fn get_snapshot(&self, id: &str) -> Option<DeploymentRecord> {
        self.get(&Self::deployment_key(id))
            .and_then(|json| serde_json::from_str(&json).ok())
    }

    /// Write-through a record: refreshes both the subdomain mapping and the
    /// snapshot
    pub fn put_record(&self, record: &DeploymentRecord) {
        self.set_with_ttl(
            Self::subdomain_key(&record.subdomain),
            record.id.clone(),
            self.ttls.snapshot,
        );
        if let Ok(json) = serde_json::to_string(record) {
            self.set_with_ttl(Self::deployment_key(&record.id), json, self.ttls.snapshot);
        }
    }

    /// Drop the snapshot for a deployment (the subdomain mapping may stay;
    /// it only points at the id)
    pub fn invalidate_snapshot(&self, id: &str) {
        self.delete(&Self::deployment_key(id));
    }

    /// Whether a negative reservation marker exists for a port
    pub fn port_reserved(&self, port: u16) -> bool {
        self.get(&Self::port_key(port)).is_some()
    }

    /// Write a short-TTL reservation marker for a port
    pub fn reserve_port(&self, port: u16) {
        self.set_with_ttl(Self::port_key(port), "reserved", self.ttls.reservation);
    }
}
