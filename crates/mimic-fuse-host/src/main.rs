// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! mimic — mount a WebDAV share as a local filesystem.

mod adapter;
mod config;
mod logging;

use std::path::PathBuf;
use std::process::{Command, ExitCode};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::{info, warn};

use adapter::MimicFuse;
use config::{load_file_config, parse_duration, user_config_path, Config};
use mimic_core::bufcache::BufferCache;
use mimic_core::fs::DavFs;
use mimic_core::node_cache::{DEFAULT_MAX_ENTRIES, DEFAULT_TTL};
use mimic_webdav::DavClient;

#[derive(Parser)]
#[command(name = "mimic", about = "Mount a WebDAV share as a local filesystem")]
struct Args {
    /// Mount point directory
    mountpoint: Option<String>,

    /// WebDAV server URL
    server_url: Option<String>,

    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// username:password (shorthand)
    #[arg(short, long)]
    user: Option<String>,

    /// Cache TTL, e.g. "1s" or "500ms"
    #[arg(short, long)]
    ttl: Option<String>,

    /// Cache max entries
    #[arg(short, long)]
    max_entries: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Standard log destination: a path, "stdout" or "discard"
    #[arg(short, long)]
    stdlog: Option<String>,

    /// Error log destination: a path, "stderr" or "discard"
    #[arg(short, long)]
    errlog: Option<String>,

    /// Print the resolved config file path and exit
    #[arg(long)]
    where_config: bool,
}

/// Flags beat the config file; the file beats built-in defaults.
fn resolve_config(args: &Args) -> Result<Config> {
    let file = load_file_config(args.config.as_deref())?;

    let mountpoint = args
        .mountpoint
        .clone()
        .or(file.mpoint)
        .ok_or_else(|| anyhow!("no mountpoint given (argument or config `mpoint`)"))?;
    let url = args
        .server_url
        .clone()
        .or(file.url)
        .ok_or_else(|| anyhow!("no server URL given (argument or config `url`)"))?;

    let mut username = file.username.unwrap_or_default();
    let mut password = file.password.unwrap_or_default();
    if let Some(user) = &args.user {
        match user.split_once(':') {
            Some((u, p)) => {
                username = u.to_string();
                password = p.to_string();
            }
            None => username = user.clone(),
        }
    }

    let ttl = match args.ttl.as_deref().or(file.ttl.as_deref()) {
        Some(spec) => parse_duration(spec)?,
        None => DEFAULT_TTL,
    };

    Ok(Config {
        mountpoint,
        url,
        username,
        password,
        ttl,
        max_entries: args.max_entries.or(file.max_entries).unwrap_or(DEFAULT_MAX_ENTRIES),
        verbose: args.verbose || file.verbose.unwrap_or(false),
        stdlog: args.stdlog.clone().or(file.std).unwrap_or_default(),
        errlog: args.errlog.clone().or(file.err).unwrap_or_default(),
    })
}

/// Advisory lock file inside the mountpoint; a second mimic on the same
/// directory fails fast instead of racing the first.
#[cfg(unix)]
fn lock_mountpoint(mountpoint: &str) -> Result<std::fs::File> {
    use std::os::fd::AsRawFd;

    let lock_path = std::path::Path::new(mountpoint).join(".mimic.lock");
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&lock_path)
        .with_context(|| format!("cannot open lock file {}", lock_path.display()))?;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        return Err(anyhow!("mountpoint {mountpoint} busy or locked"));
    }
    Ok(file)
}

fn run(args: Args) -> Result<()> {
    let config = resolve_config(&args)?;

    logging::init(config.verbose, &config.stdlog, &config.errlog)?;
    info!(
        mountpoint = %config.mountpoint,
        url = %config.url,
        ttl = ?config.ttl,
        max_entries = config.max_entries,
        "starting mimic"
    );

    let buffers = Arc::new(BufferCache::new());
    let client = DavClient::connect(
        &config.url,
        &config.username,
        &config.password,
        config.ttl,
        config.max_entries,
        Arc::clone(&buffers),
    )?;

    // fail before mounting when the server is unreachable or the
    // credentials are wrong
    use mimic_core::remote::RemoteClient;
    client.stat("/").with_context(|| format!("cannot reach {}", config.url))?;

    let engine = Arc::new(DavFs::new(Arc::new(client), buffers));
    let filesystem = MimicFuse::new(engine, config.ttl);

    #[cfg(unix)]
    let _mount_lock = lock_mountpoint(&config.mountpoint)?;

    let options = vec![
        fuser::MountOption::FSName("mimic".to_string()),
        fuser::MountOption::Subtype("mimicfs".to_string()),
        fuser::MountOption::AutoUnmount,
        fuser::MountOption::DefaultPermissions,
    ];

    info!(mountpoint = %config.mountpoint, "mounting");
    let session = fuser::spawn_mount2(filesystem, &config.mountpoint, &options)
        .with_context(|| format!("fuse mount failed on {}", config.mountpoint))?;

    let mountpoint = config.mountpoint.clone();
    ctrlc::set_handler(move || {
        info!(mountpoint = %mountpoint, "unmounting");
        // ask the kernel to detach; lazy unmount as a fallback when
        // processes still hold files open
        let detached = Command::new("fusermount3")
            .args(["-uz", &mountpoint])
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if !detached {
            let _ = Command::new("umount").arg(&mountpoint).status();
        }
    })
    .context("cannot install signal handler")?;

    session.join();
    info!("unmounted");
    Ok(())
}

fn main() -> ExitCode {
    // clap exits 2 on usage errors
    let args = Args::parse();

    if args.where_config {
        match user_config_path() {
            Ok(path) => {
                println!("{}", path.display());
                return ExitCode::SUCCESS;
            }
            Err(err) => {
                eprintln!("{err:#}");
                return ExitCode::FAILURE;
            }
        }
    }

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "exiting on error");
            eprintln!("mimic: {err:#}");
            ExitCode::FAILURE
        }
    }
}
