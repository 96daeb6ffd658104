use std::{io, path::Path};

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::lodestone::config;

/// Keeps the non-blocking log writer alive for the life of the process.
#[derive(Debug)]
pub struct LogGuard {
    _guard: WorkerGuard,
}

pub fn init(logging: &config::LoggingConfig) -> anyhow::Result<LogGuard> {
    let level = logging.level.trim().to_ascii_lowercase();
    let fmt = logging.format.trim().to_ascii_lowercase();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            let directive = match level.as_str() {
                "debug" | "info" | "warn" | "error" => level.as_str(),
                _ => "info",
            };
            EnvFilter::try_new(directive)
        })
        .context("logging: init filter")?;

    let (writer, guard) = match logging.output.trim() {
        "stderr" | "" => tracing_appender::non_blocking(io::stderr()),
        "stdout" => tracing_appender::non_blocking(io::stdout()),
        "discard" => tracing_appender::non_blocking(io::sink()),
        other => {
            let p = Path::new(other);
            if let Some(parent) = p.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("logging: mkdir {}", parent.display()))?;
                }
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(p)
                .with_context(|| format!("logging: open {}", p.display()))?;
            tracing_appender::non_blocking(file)
        }
    };

    let base = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(fmt != "json")
        .with_target(true)
        .with_file(logging.add_source)
        .with_line_number(logging.add_source);

    let base = if fmt == "json" {
        base.json().boxed()
    } else {
        base.boxed()
    };

    tracing_subscriber::registry().with(filter).with(base).init();

    Ok(LogGuard { _guard: guard })
}
