//! # Master Server Library
//!
//! Discovery directory for game servers speaking the out-of-band UDP
//! protocol (`heartbeat` / `getinfo` / `getservers` / `infoResponse` /
//! `subscribe`). Game servers announce themselves with heartbeats, the
//! directory challenges them with `getinfo`, and confirmed servers become
//! visible to clients through packed binary `getserversResponse` replies.
//! Clients that query the directory are also registered as subscribers and
//! receive incremental updates as the registry changes.
//!
//! ## Module Organization
//!
//! ### Registry Module (`registry`)
//! Concurrent keyed store of live server records: info-merge upserts,
//! point-in-time snapshots, and time-based expiry with permanent seed
//! entries that pruning never touches.
//!
//! ### Subscribers Module (`subscribers`)
//! Set of client addresses that opted into push notifications, with
//! last-query timestamps so stale subscribers age out of the fan-out.
//!
//! ### Network Module (`network`)
//! UDP socket ownership, the receive loop, the protocol dispatcher, the
//! periodic prune task, and the trusted manual-refresh ingestion path.
//!
//! ## Concurrency
//!
//! One task owns the receive loop, one runs the periodic sweep; they share
//! the registry and subscriber set behind `tokio::sync::RwLock` only. Sends
//! are fire-and-forget, matching UDP semantics: a lost reply is recovered by
//! the next heartbeat or query cycle, never by a retry.

pub mod network;
pub mod registry;
pub mod subscribers;
