// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: GPL-3.0-only

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "distinst-storage.log";

/// Logs to stderr, and to a file in `log_dir`. The returned guard flushes the
/// file when dropped, so it must be held for the life of the process.
pub fn init(log_dir: &Path) -> Option<WorkerGuard> {
    let env_filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);

    if let Err(why) = std::fs::create_dir_all(log_dir) {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(stderr_layer)
            .init();

        tracing::warn!("logging to stderr only, as {:?} is unavailable: {}", log_dir, why);
        return None;
    }

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, LOG_FILE));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Some(guard)
}
