/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Byte-budgeted response cache
//!
//! Entries are keyed by a 64-bit hash of `(context, class, qtype, qname)`;
//! the context string is the DoH URL so entries from different profiles
//! never collide. The cache is bounded by total stored bytes, with moka's
//! TinyLFU admission deciding what survives under pressure. Expiry is
//! implicit: TTLs are aged at read time and an entry whose RRs have all
//! expired reads as a miss.

use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use rustc_hash::FxHasher;

use crate::core::app_clock::AppClock;
use crate::dns::ttl::adjusted_response;
use crate::dns::Query;

/// Per-entry overhead charged on top of the message bytes
const KEY_COST: u32 = 8;

/// Stable 64-bit key for one `(context, question)` pair
pub fn cache_key(context: &str, query: &Query) -> u64 {
    let mut h = FxHasher::default();
    h.write(context.as_bytes());
    h.write_u16(query.class);
    h.write_u16(query.qtype);
    h.write(query.qname.as_bytes());
    h.finish()
}

/// A stored response plus the instant it was stored
#[derive(Clone)]
pub struct CacheValue {
    /// Milliseconds since process start, from [`AppClock`]
    pub stored_at: u64,
    /// Complete response message as received upstream
    pub msg: Arc<Vec<u8>>,
    /// Transport label of the upstream that produced it
    pub upstream_label: &'static str,
}

/// Hit/miss counters, shared with whoever wants to report them
#[derive(Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn inserts(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }
}

pub struct ResponseCache {
    cache: Cache<u64, CacheValue>,
    max_ttl: Option<u32>,
    stats: Arc<CacheStats>,
}

impl ResponseCache {
    /// Create a cache bounded by `budget_bytes`
    ///
    /// `max_ttl` caps the effective TTL of every stored RR: served TTLs
    /// never exceed it and entries expire once it has elapsed.
    pub fn new(budget_bytes: u64, max_ttl: Option<Duration>) -> Self {
        let cache = Cache::builder()
            .max_capacity(budget_bytes)
            .weigher(|_key: &u64, value: &CacheValue| value.msg.len() as u32 + KEY_COST)
            .build();
        Self {
            cache,
            max_ttl: max_ttl.map(|d| d.as_secs() as u32),
            stats: Arc::new(CacheStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }

    /// Look up a response and age its TTLs
    ///
    /// Returns the adjusted message bytes and the value's upstream label.
    /// An entry whose RRs have expired (or whose stored bytes no longer
    /// walk cleanly) is invalidated and reads as a miss, so a returned
    /// response always carries a positive effective TTL.
    pub fn get(&self, key: u64, new_id: u16) -> Option<(Vec<u8>, &'static str)> {
        let value = match self.cache.get(&key) {
            Some(v) => v,
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let age_secs =
            (AppClock::elapsed_millis().saturating_sub(value.stored_at) / 1000) as u32;

        match adjusted_response(&value.msg, new_id, age_secs, self.max_ttl) {
            Some((bytes, _min_ttl)) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some((bytes, value.upstream_label))
            }
            None => {
                self.cache.invalidate(&key);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a response; admission and eviction are handled by the cache
    pub fn set(&self, key: u64, msg: Vec<u8>, upstream_label: &'static str) {
        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
        self.cache.insert(
            key,
            CacheValue {
                stored_at: AppClock::elapsed_millis(),
                msg: Arc::new(msg),
                upstream_label,
            },
        );
    }

    /// Approximate number of live entries
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Approximate stored bytes
    pub fn weighted_size(&self) -> u64 {
        self.cache.weighted_size()
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.cache.invalidate_all();
    }
}
