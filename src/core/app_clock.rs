/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! High-performance application clock
//!
//! Provides efficient timestamp access without syscall overhead.
//! A background task updates the time periodically, allowing hot-path
//! code (cache age checks, endpoint probe intervals, transport idle
//! tracking) to read time with a single atomic load.

use std::ops::Add;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Once, OnceLock};
use std::time::Duration;
use tokio::time::Instant;

/// Application start time (set once during initialization)
static START_INSTANT: OnceLock<Instant> = OnceLock::new();

/// Cached milliseconds since start (updated by background task)
static GLOBAL_NOW: AtomicU64 = AtomicU64::new(0);

/// Ensures clock is initialized only once
static CLOCK_INIT: Once = Once::new();

/// Lock-free millisecond clock backed by a background updater task
pub struct AppClock {}

impl AppClock {
    /// Start the background clock updater task
    ///
    /// Safe to call multiple times (only runs once via `Once`)
    pub fn start() {
        CLOCK_INIT.call_once(|| {
            START_INSTANT
                .set(Instant::now())
                .expect("clock initialization should never fail");

            tokio::spawn(async move {
                loop {
                    let base = START_INSTANT.get().unwrap();
                    GLOBAL_NOW.store(base.elapsed().as_millis() as u64, Ordering::Relaxed);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                }
            });
        })
    }

    /// Get current time as Instant (based on cached milliseconds)
    pub fn now() -> Instant {
        let base = START_INSTANT.get().expect("AppClock::start not called");
        base.add(AppClock::elapsed())
    }

    /// Get milliseconds elapsed since application start
    ///
    /// Hot-path function; relaxed atomic load only.
    pub fn elapsed_millis() -> u64 {
        GLOBAL_NOW.load(Ordering::Relaxed)
    }

    /// Get duration since application start
    pub fn elapsed() -> Duration {
        Duration::from_millis(Self::elapsed_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clock_advances_after_start() {
        AppClock::start();
        let first = AppClock::elapsed_millis();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = AppClock::elapsed_millis();
        assert!(second >= first);
    }
}
