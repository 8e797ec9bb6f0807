// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Logger initialization.
//!
//! Two independently routed streams: the standard stream carries
//! INFO/DEBUG events, the error stream WARN/ERROR. Each resolves to
//! stdout/stderr, a file (parent directories created), or nowhere.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::Level;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// Destination of one log stream, as configured.
enum Sink {
    Stdout,
    Stderr,
    Discard,
    File(Arc<File>),
}

fn open_log_file(path: &str) -> Result<Arc<File>> {
    let path = Path::new(path);
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("cannot create log directory {}", dir.display()))?;
        }
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("cannot open log file {}", path.display()))?;
    Ok(Arc::new(file))
}

fn resolve(spec: &str, default: Sink) -> Result<Sink> {
    match spec {
        "" => Ok(default),
        "stdout" => Ok(Sink::Stdout),
        "stderr" => Ok(Sink::Stderr),
        "discard" => Ok(Sink::Discard),
        path => Ok(Sink::File(open_log_file(path)?)),
    }
}

fn make_writer(sink: Sink) -> BoxMakeWriter {
    match sink {
        Sink::Stdout => BoxMakeWriter::new(io::stdout),
        Sink::Stderr => BoxMakeWriter::new(io::stderr),
        Sink::Discard => BoxMakeWriter::new(io::sink),
        Sink::File(file) => BoxMakeWriter::new(file),
    }
}

/// Installs the global subscriber. Failing to open a configured log file
/// is a startup failure, not a silent fallback.
pub fn init(verbose: bool, stdlog: &str, errlog: &str) -> Result<()> {
    let std_sink = resolve(stdlog, Sink::Stdout)?;
    // both streams on one file share a handle instead of double-opening
    let err_sink = match (&std_sink, errlog) {
        (Sink::File(file), e) if e == stdlog => Sink::File(Arc::clone(file)),
        _ => resolve(errlog, Sink::Stderr)?,
    };

    let std_cap = if verbose { Level::DEBUG } else { Level::INFO };
    let std_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(make_writer(std_sink))
        .with_filter(filter_fn(move |meta| {
            let level = *meta.level();
            level >= Level::INFO && level <= std_cap
        }));

    let err_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(make_writer(err_sink))
        .with_filter(filter_fn(|meta| *meta.level() <= Level::WARN));

    tracing_subscriber::registry()
        .with(std_layer)
        .with(err_layer)
        .try_init()
        .context("logger already initialized")?;
    Ok(())
}
