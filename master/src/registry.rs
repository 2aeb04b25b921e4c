//! Server registry management and expiry for the master server
//!
//! This module handles the directory side of server discovery, including:
//! - Upserting server records as confirmed info responses arrive
//! - Merging fresh info attributes into existing records
//! - Point-in-time snapshots for client queries and notifications
//! - Time-based expiry with permanent seed entries exempt from pruning
//!
//! The registry is the single authority on which game servers are
//! currently visible to querying clients.

use log::info;
use shared::ServerEntry;
use std::collections::HashMap;
use std::time::Duration;

/// Keyed store of live server records
///
/// Records are indexed by their `host:port` address string, so repeated
/// info responses from the same server update one record instead of
/// accumulating duplicates. Seed entries registered at startup are marked
/// permanent and survive every prune sweep.
pub struct ServerRegistry {
    /// Known servers indexed by "host:port"
    servers: HashMap<String, ServerEntry>,
}

impl ServerRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self {
            servers: HashMap::new(),
        }
    }

    /// Inserts or refreshes a server record and merges its info attributes
    ///
    /// A new record is created on first contact; subsequent upserts refresh
    /// the activity timestamp and overlay the incoming key/value pairs onto
    /// the stored ones, so keys absent from this update keep their previous
    /// values. Returns a clone of the stored record for notification fan-out.
    pub fn upsert(&mut self, host: &str, port: u16, info: HashMap<String, String>) -> ServerEntry {
        let key = format!("{}:{}", host, port);
        let entry = self.servers.entry(key).or_insert_with(|| {
            info!("Registered server {}:{}", host, port);
            ServerEntry::new(host.to_string(), port)
        });
        entry.last_update = std::time::Instant::now();
        entry.info.extend(info);
        entry.clone()
    }

    /// Registers a permanent seed entry that pruning never removes
    ///
    /// Seed entries keep well-known servers listed even when they do not
    /// send heartbeats, and are silently replaced if re-added.
    pub fn add_permanent(&mut self, host: &str, port: u16) {
        let key = format!("{}:{}", host, port);
        let mut entry = ServerEntry::new(host.to_string(), port);
        entry.permanent = true;
        info!("Seeded permanent server {}:{}", host, port);
        self.servers.insert(key, entry);
    }

    /// Returns a point-in-time copy of every record
    ///
    /// The snapshot is detached from the registry, so callers can encode or
    /// serialize it without holding the lock that guards the live map.
    pub fn snapshot(&self) -> Vec<ServerEntry> {
        self.servers.values().cloned().collect()
    }

    /// Removes records that have not been refreshed within `expiry`
    ///
    /// Permanent seed entries are skipped regardless of age. Returns the
    /// number of records removed so the sweep can be logged by the caller.
    pub fn prune(&mut self, expiry: Duration) -> usize {
        let expired: Vec<String> = self
            .servers
            .iter()
            .filter(|(_, entry)| !entry.permanent && entry.is_expired(expiry))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            if let Some(entry) = self.servers.remove(key) {
                info!("Pruned server {}:{}", entry.host, entry.port);
            }
        }

        expired.len()
    }

    /// Returns the number of currently listed servers
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Returns true if no servers are currently listed
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
