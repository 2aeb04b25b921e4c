//! Subscriber tracking for incremental registry updates
//!
//! Clients that query the directory or send an explicit `subscribe` are
//! remembered here so they can be pushed fresh `getserversResponse`
//! packets whenever the registry changes. Each address carries the time
//! of its last query, and subscribers that stay silent past the expiry
//! window are dropped from the fan-out during the periodic sweep.

use log::info;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Set of client addresses that receive push notifications
pub struct SubscriberSet {
    /// Subscribed clients and the time of their last query
    subscribers: HashMap<SocketAddr, Instant>,
}

impl SubscriberSet {
    /// Creates an empty subscriber set
    pub fn new() -> Self {
        Self {
            subscribers: HashMap::new(),
        }
    }

    /// Adds a subscriber or refreshes its last-query time
    ///
    /// Returns true if the address was not subscribed before.
    pub fn touch(&mut self, addr: SocketAddr) -> bool {
        let fresh = self.subscribers.insert(addr, Instant::now()).is_none();
        if fresh {
            info!("Client {} subscribed to updates", addr);
        }
        fresh
    }

    /// Returns every subscribed address for notification fan-out
    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.subscribers.keys().copied().collect()
    }

    /// Removes subscribers whose last query is older than `expiry`
    ///
    /// Returns the number of addresses removed.
    pub fn prune(&mut self, expiry: Duration) -> usize {
        let stale: Vec<SocketAddr> = self
            .subscribers
            .iter()
            .filter(|(_, last_query)| last_query.elapsed() > expiry)
            .map(|(addr, _)| *addr)
            .collect();

        for addr in &stale {
            self.subscribers.remove(addr);
            info!("Dropped stale subscriber {}", addr);
        }

        stale.len()
    }

    /// Returns the number of current subscribers
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    /// Returns true if nobody is subscribed
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

impl Default for SubscriberSet {
    fn default() -> Self {
        Self::new()
    }
}
