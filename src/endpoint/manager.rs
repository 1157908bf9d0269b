/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Endpoint election and health tracking
//!
//! The manager walks its providers in order and elects the first endpoint
//! that passes a probe. Requests flow through [`Manager::with_active`],
//! which counts consecutive failures; hitting the threshold schedules one
//! recovery test (CAS on the testing flag keeps probes from piling up).
//! A test elects by atomic swap, so readers keep serving through the old
//! endpoint until the moment the new one is in place.
//!
//! DNS53 fallback endpoints are only eligible while the captive-portal
//! window is open: ten minutes from startup and from each network change,
//! or permanently when captive-portal detection is configured.

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use http::Method;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::core::app_clock::AppClock;
use crate::core::error::{ProxyError, Result};
use crate::dns::is_response;
use crate::endpoint::provider::Provider;
use crate::endpoint::Endpoint;
use crate::transport::DohRequest;

/// Consecutive errors before a recovery test is scheduled
pub const DEFAULT_ERROR_THRESHOLD: u32 = 10;
/// Minimum interval between opportunistic tests
pub const DEFAULT_MIN_TEST_INTERVAL: Duration = Duration::from_secs(2 * 3600);
/// Grace period during which DNS53 fallback is allowed
pub const CAPTIVE_PORTAL_WINDOW: Duration = Duration::from_secs(600);

const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);
const RECOVERY_DEADLINE: Duration = Duration::from_secs(60);

struct ActiveState {
    endpoint: Endpoint,
    consecutive_errors: AtomicU32,
}

type ChangeCallback = Box<dyn Fn(&Endpoint) + Send + Sync>;

pub struct Manager {
    providers: Vec<Arc<dyn Provider>>,
    active: ArcSwapOption<ActiveState>,
    on_change: Mutex<Option<ChangeCallback>>,
    /// Domain used in probe GETs; any resolvable name works
    test_domain: String,
    error_threshold: u32,
    min_test_interval: Duration,
    /// At most one probe in flight; set by CAS
    testing: AtomicBool,
    last_test_ms: AtomicU64,
    /// DNS53 fallback allowed until this instant (ms); u64::MAX = always
    window_until_ms: AtomicU64,
}

impl Manager {
    pub fn new(providers: Vec<Arc<dyn Provider>>, detect_captive_portals: bool) -> Arc<Self> {
        let window = if detect_captive_portals {
            u64::MAX
        } else {
            AppClock::elapsed_millis() + CAPTIVE_PORTAL_WINDOW.as_millis() as u64
        };
        Arc::new(Self {
            providers,
            active: ArcSwapOption::empty(),
            on_change: Mutex::new(None),
            test_domain: "probe-test.example.com".to_string(),
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            min_test_interval: DEFAULT_MIN_TEST_INTERVAL,
            testing: AtomicBool::new(false),
            last_test_ms: AtomicU64::new(0),
            window_until_ms: AtomicU64::new(window),
        })
    }

    /// Register the endpoint-change callback
    ///
    /// Called after the swap, never during, so the callback observes the
    /// new endpoint as active.
    pub fn on_change(&self, callback: impl Fn(&Endpoint) + Send + Sync + 'static) {
        *self.on_change.lock().expect("on_change lock") = Some(Box::new(callback));
    }

    /// Reopen the DNS53 fallback window (startup and network changes)
    pub fn reopen_window(&self) {
        let until = self.window_until_ms.load(Ordering::Relaxed);
        if until == u64::MAX {
            return;
        }
        self.window_until_ms.store(
            AppClock::elapsed_millis() + CAPTIVE_PORTAL_WINDOW.as_millis() as u64,
            Ordering::Relaxed,
        );
    }

    fn window_open(&self) -> bool {
        AppClock::elapsed_millis() < self.window_until_ms.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> Option<Endpoint> {
        self.active.load().as_ref().map(|s| s.endpoint.clone())
    }

    /// Walk providers until a probe passes, backing off between rounds
    ///
    /// Runs until an endpoint is elected; callers bound it with their own
    /// deadline when indefinite retry is not acceptable.
    pub async fn test(&self) {
        let mut backoff = BACKOFF_START;
        loop {
            if self.test_once().await {
                return;
            }
            debug!(backoff = ?backoff, "no endpoint elected, retrying");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
    }

    /// One walk over all providers; true when an endpoint was elected
    pub async fn test_once(&self) -> bool {
        let previous = self.active();
        for provider in &self.providers {
            let endpoints = match provider.fetch().await {
                Ok(list) => list,
                Err(e) => {
                    warn!(provider = provider.name(), error = %e, "provider fetch failed");
                    continue;
                }
            };
            for endpoint in endpoints {
                if matches!(endpoint, Endpoint::Dns(_)) && !self.window_open() {
                    continue;
                }
                // Reusing the matching active endpoint keeps its live
                // connection pool instead of dialing from scratch.
                let candidate = match &previous {
                    Some(prev) if *prev == endpoint => prev.clone(),
                    _ => endpoint,
                };
                match self.probe(&candidate).await {
                    Ok(()) => {
                        self.elect(candidate, previous.as_ref());
                        return true;
                    }
                    Err(e) => {
                        debug!(endpoint = %candidate, error = %e, "probe failed");
                    }
                }
            }
        }
        false
    }

    fn elect(&self, endpoint: Endpoint, previous: Option<&Endpoint>) {
        let changed = previous != Some(&endpoint);
        info!(endpoint = %endpoint, changed, "endpoint elected");
        self.active.store(Some(Arc::new(ActiveState {
            endpoint: endpoint.clone(),
            consecutive_errors: AtomicU32::new(0),
        })));
        self.last_test_ms
            .store(AppClock::elapsed_millis(), Ordering::Relaxed);
        if changed {
            if let Some(callback) = self.on_change.lock().expect("on_change lock").as_ref() {
                callback(&endpoint);
            }
        }
    }

    /// Health probe
    ///
    /// DoH endpoints must answer `GET /?name=<domain>` with HTTP 200 and a
    /// body that starts like a DNS response (QR bit set) — a captive
    /// portal's HTML passes the status check but not the body check.
    /// DNS53 endpoints always pass; they are the last resort and a probe
    /// should not be able to de-elect them.
    async fn probe(&self, endpoint: &Endpoint) -> Result<()> {
        match endpoint {
            Endpoint::Dns(_) => Ok(()),
            Endpoint::Doh(doh) => {
                let response = doh
                    .transport()
                    .round_trip(DohRequest {
                        method: Method::GET,
                        path_and_query: format!("/?name={}", self.test_domain),
                        headers: Vec::new(),
                        body: Bytes::new(),
                    })
                    .await?;
                if response.status != 200 {
                    return Err(ProxyError::UpstreamStatus(response.status));
                }
                if !is_response(&response.body) {
                    return Err(ProxyError::bad_body("probe body is not a DNS response"));
                }
                Ok(())
            }
        }
    }

    /// Run `f` against the active endpoint, tracking health
    ///
    /// Lazily elects when nothing is active yet. Errors that count against
    /// the endpoint bump the consecutive-error counter; at the threshold
    /// exactly one recovery test is scheduled. Success zeroes the counter
    /// and may schedule an opportunistic test when the last one is old.
    pub async fn with_active<T, F, Fut>(self: &Arc<Self>, f: F) -> Result<T>
    where
        F: FnOnce(Endpoint) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.active.load().is_none() {
            self.test_once().await;
        }
        let state = match self.active.load_full() {
            Some(state) => state,
            None => return Err(ProxyError::upstream("no endpoint available")),
        };

        match f(state.endpoint.clone()).await {
            Ok(value) => {
                state.consecutive_errors.store(0, Ordering::Relaxed);
                self.maybe_schedule_opportunistic();
                Ok(value)
            }
            Err(e) => {
                if e.counts_against_endpoint() {
                    let errors = state.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
                    if errors == self.error_threshold {
                        self.schedule_test("recovery");
                    }
                }
                Err(e)
            }
        }
    }

    fn maybe_schedule_opportunistic(self: &Arc<Self>) {
        let last = self.last_test_ms.load(Ordering::Relaxed);
        let now = AppClock::elapsed_millis();
        if now.saturating_sub(last) > self.min_test_interval.as_millis() as u64 {
            self.schedule_test("opportunistic");
        }
    }

    /// Schedule an async test; the CAS guarantees at most one in flight
    fn schedule_test(self: &Arc<Self>, reason: &'static str) {
        if self
            .testing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        debug!(reason, "scheduling endpoint test");
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let _ = timeout(RECOVERY_DEADLINE, manager.test()).await;
            manager
                .last_test_ms
                .store(AppClock::elapsed_millis(), Ordering::Relaxed);
            manager.testing.store(false, Ordering::Release);
        });
    }
}
