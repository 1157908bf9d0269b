/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Core runtime support: error type, CLI options, clock and logging setup.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

pub mod app_clock;
pub mod error;
pub mod log;
pub mod runtime;

/// Runtime control over the log filter (the `trace` control command)
pub struct LogHandle {
    handle: reload::Handle<EnvFilter, Registry>,
    base: String,
    tracing: AtomicBool,
}

impl LogHandle {
    /// Flip per-query debug logging on or off; returns the new state
    pub fn toggle_trace(&self) -> bool {
        let on = !self.tracing.load(Ordering::Relaxed);
        let level = if on { "debug" } else { self.base.as_str() };
        let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
        if self.handle.reload(filter).is_ok() {
            self.tracing.store(on, Ordering::Relaxed);
            on
        } else {
            !on
        }
    }
}

/// Initialize logging with an optional file appender
///
/// Returns a WorkerGuard that must be kept alive for the process lifetime so
/// buffered log lines are flushed on exit, plus a handle for runtime filter
/// changes.
pub fn init_log(level: &str, file: Option<&str>) -> (WorkerGuard, LogHandle) {
    let (file_writer, guard) = if let Some(file_path) = file {
        let path = std::path::Path::new(file_path);
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let name = path
            .file_name()
            .map(|n| n.to_owned())
            .unwrap_or_else(|| "havendns.log".into());
        let file_appender = tracing_appender::rolling::never(dir, name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        (Some(non_blocking), Some(guard))
    } else {
        (None, None)
    };

    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, handle) = reload::Layer::new(filter);

    let console_layer = fmt::layer().with_writer(std::io::stdout);

    let subscriber = Registry::default().with(filter_layer).with(console_layer);

    if let Some(writer) = file_writer {
        subscriber.with(fmt::layer().with_writer(writer)).init();
    } else {
        subscriber.init();
    }

    let log_handle = LogHandle {
        handle,
        base: level.to_string(),
        tracing: AtomicBool::new(false),
    };
    let guard = guard.unwrap_or_else(|| tracing_appender::non_blocking(std::io::sink()).1);
    (guard, log_handle)
}
