//! `s3fsmount` — mounts an S3-compatible object store as a POSIX filesystem
//! via FUSE.
//!
//! Parses the CLI, initializes logging, validates the mountpoint, constructs
//! the filesystem, probes the bucket, and spawns the FUSE session. Unmount
//! is driven by a `ctrlc` handler; backgrounding uses a `setsid()`-based
//! single-fork daemonization path.

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use s3fs_fuse::config::{self, Cli, Config};
use s3fs_fuse::hooks::S3Hook;
use s3fs_fuse::S3Fs;

/// Process exit codes.
mod exit_code {
    pub const OK: u8 = 0;
    pub const MOUNT_FAILED: u8 = 1;
    pub const UNREACHABLE_ENDPOINT: u8 = 2;
    pub const AUTH_FAILED: u8 = 3;
    pub const BAD_CONFIG: u8 = 64;
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(config::verbosity_filter(
                    cli.verbose,
                    cli.verbose_requests,
                ))
            }),
        )
        .init();

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %e, "fatal error");
            ExitCode::from(exit_code::MOUNT_FAILED)
        }
    }
}

fn run(cli: Cli) -> Result<u8> {
    let foreground = cli.foreground;

    let config = match Config::resolve(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("s3fsmount: {e:#}");
            return Ok(exit_code::BAD_CONFIG);
        }
    };

    config::resolve_mountpoint(&config.mountpoint)
        .with_context(|| format!("mountpoint {}", config.mountpoint.display()))?;

    if !foreground {
        #[cfg(unix)]
        {
            daemonize().context("daemonizing")?;
        }
    }

    let hook = Arc::new(S3Hook::new(
        config.access_key.clone(),
        config.secret_key.clone(),
        config.region.clone(),
        config.bucket.clone(),
    ));

    let fs = S3Fs::new(&config, hook);

    info!(
        endpoint = %config.endpoint,
        bucket = %config.bucket,
        mountpoint = %config.mountpoint.display(),
        "probing bucket before mount"
    );

    if let Err(e) = fs.probe() {
        error!(error = %e, "startup probe failed");
        return Ok(match e {
            s3fs_fuse::FsError::PermissionDenied => exit_code::AUTH_FAILED,
            _ => exit_code::UNREACHABLE_ENDPOINT,
        });
    }

    let mut options = vec![
        fuser::MountOption::FSName("s3fs".to_string()),
        fuser::MountOption::Subtype("s3fs-fuse".to_string()),
        fuser::MountOption::DefaultPermissions,
    ];
    if !foreground {
        options.push(fuser::MountOption::AutoUnmount);
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        info!("received interrupt, unmounting");
        r.store(false, Ordering::SeqCst);
    })
    .context("installing signal handler")?;

    info!("mounting filesystem (press Ctrl+C to unmount)");
    let session = fuser::spawn_mount2(fs, &config.mountpoint, &options)
        .context("mounting FUSE filesystem")?;

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    drop(session);
    info!("filesystem unmounted");
    Ok(exit_code::OK)
}

/// Detaches from the controlling terminal via a single `fork()` + `setsid()`,
/// performed in-process (no re-exec) since this binary has no subcommands
/// to separate a "daemon child" invocation from.
#[cfg(unix)]
fn daemonize() -> Result<()> {
    use std::io;

    // SAFETY: fork() is called before any additional threads have been
    // spawned by this process; the child immediately calls setsid() and
    // either execs nothing further or returns to safe, non-async-signal
    // sensitive Rust code.
    match unsafe { nix::unistd::fork() }.context("fork")? {
        nix::unistd::ForkResult::Parent { .. } => {
            std::process::exit(0);
        }
        nix::unistd::ForkResult::Child => {
            nix::unistd::setsid().map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        }
    }
    Ok(())
}
