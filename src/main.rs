// ============================================
// WinForge - main.rs
// ============================================
// This is the entry point of the application.
//
// The program flow is:
// 1. main() starts, parses arguments, checks elevation
// 2. A background thread polls the update manifest (startup notice)
// 3. The provisioning pipeline runs on a worker thread
// 4. main() drains the progress channel and renders it — the worker
//    never touches the terminal directly
// ============================================

use std::sync::mpsc;

use anyhow::{bail, Result};
use clap::Parser;

use winforge::pipeline::{self, ProgressSink, SystemTooling};
use winforge::{
    builds, updater, CancelToken, Edition, ForgeConfig, ProvisioningJob, Stage, UpgradeMethod,
};

// ============================================
// COMMAND LINE
// ============================================

/// Windows provisioning pipeline: resolve a UUP build, assemble an
/// install image, mount it, and optionally trigger an in-place upgrade.
#[derive(Debug, Parser)]
#[command(name = "winforge", version, about)]
struct Cli {
    /// Build channel to provision (label or tag, e.g. "24H2", "Canary")
    #[arg(long, default_value = "24H2")]
    channel: String,

    /// Windows edition (Professional, Home, Enterprise, Education)
    #[arg(long, default_value = "Professional")]
    edition: String,

    /// Trigger an in-place upgrade after mounting: "setup" launches the
    /// image's setup.exe, "windows-update" drives the update session
    #[arg(long)]
    install: Option<String>,

    /// List the selectable channels and exit
    #[arg(long)]
    list_channels: bool,

    /// Apply a pending self-update and exit
    #[arg(long)]
    self_update: bool,

    /// Skip the startup update check
    #[arg(long)]
    no_update_check: bool,
}

// ============================================
// MAIN FUNCTION
// ============================================

fn main() -> Result<()> {
    let cli = Cli::parse();

    println!("============================================");
    println!("WinForge v{}", env!("CARGO_PKG_VERSION"));
    println!("============================================");

    if cli.list_channels {
        for channel in builds::CHANNELS {
            println!("  {:<12} {}", channel.search, channel.label);
        }
        return Ok(());
    }

    let config = ForgeConfig::load();

    if cli.self_update {
        return apply_self_update(&config);
    }

    // Provisioning mounts images and kicks off OS upgrades — that
    // needs administrator rights, checked once before any job starts.
    check_elevation()?;

    if !cli.no_update_check {
        spawn_update_check(config.clone());
    }

    // Resolve the selection before spawning anything so bad arguments
    // fail fast with a readable message.
    let channel = builds::find_channel(&cli.channel)
        .ok_or_else(|| anyhow::anyhow!("unknown channel '{}' (try --list-channels)", cli.channel))?;
    let edition: Edition = cli
        .edition
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    let install = match &cli.install {
        Some(method) => Some(
            method
                .parse::<UpgradeMethod>()
                .map_err(|e| anyhow::anyhow!(e))?,
        ),
        None => None,
    };

    let job = ProvisioningJob {
        channel,
        edition,
        install,
    };

    println!("[Main] provisioning {} / {}", channel.label, edition);

    // ============================================
    // WORKER + OBSERVER
    // ============================================
    // The pipeline runs on its own thread; this thread is the observer.
    // ProgressEvents flow through a bounded channel, the CancelToken
    // flows the other way (unused by the CLI today, but the seam is
    // where a frontend would hook its cancel button).

    let (event_tx, event_rx) = mpsc::sync_channel(64);
    let cancel = CancelToken::new();

    let worker = {
        let job = job.clone();
        let config = config.clone();
        let cancel = cancel.clone();
        std::thread::spawn(move || {
            let tooling = SystemTooling::new(&config);
            pipeline::run(&job, &tooling, &config, ProgressSink::new(event_tx), &cancel)
        })
    };

    // Drain events until the worker drops its sender.
    let mut last_stage = None;
    for event in event_rx {
        if last_stage != Some(event.stage) {
            println!("--- {} ---", event.stage);
            last_stage = Some(event.stage);
        }
        println!("[{:>3}%] {}", event.percent, event.message);
    }

    let report = match worker.join() {
        Ok(report) => report,
        Err(_) => bail!("pipeline worker panicked"),
    };

    // ============================================
    // SUMMARY
    // ============================================

    match report.final_stage {
        Stage::Completed => {
            if let Some(drive) = &report.mounted_drive {
                println!("Image mounted at {}\\", drive);
            }
            if let Some(workspace) = &report.workspace {
                println!("Workspace retained at {}", workspace.display());
            }
            if let Some(outcome) = &report.upgrade {
                println!("Upgrade result: {} (code {})", outcome.detail, outcome.result_code);
            }
            Ok(())
        }
        Stage::Cancelled => {
            println!("Job cancelled — workspace and mounts cleaned up.");
            std::process::exit(1);
        }
        _ => {
            let (kind, message) = report
                .error
                .as_ref()
                .map(|e| (e.kind(), e.to_string()))
                .unwrap_or(("Unknown", "no error recorded".to_string()));
            eprintln!("Job failed [{}]: {}", kind, message);
            std::process::exit(1);
        }
    }
}

// ============================================
// ELEVATION CHECK
// ============================================

/// Mounting images and triggering upgrades require administrator
/// rights on Windows. Fail up front rather than half-way into a job.
#[cfg(windows)]
fn check_elevation() -> Result<()> {
    let elevated = unsafe { winapi::um::shellapi::IsUserAnAdmin() != 0 };
    if !elevated {
        return Err(winforge::ProvisionError::ElevationRequired(
            "re-run winforge from an elevated prompt".into(),
        )
        .into());
    }
    Ok(())
}

#[cfg(not(windows))]
fn check_elevation() -> Result<()> {
    // Nothing to check — the mount/upgrade stages refuse on their own
    // when they are reached off-Windows.
    println!("[Main] not on Windows: mount and upgrade stages will be unavailable");
    Ok(())
}

// ============================================
// SELF-UPDATE
// ============================================

/// Startup check on a background thread. Errors are swallowed — the
/// user didn't ask for this check, so a dead endpoint prints nothing.
fn spawn_update_check(config: ForgeConfig) {
    std::thread::spawn(move || {
        let result = updater::check_for_updates(&config);
        if result.update_available {
            println!(
                "[Updater] v{} is available (running v{}) — apply with --self-update",
                result.latest_version, result.current_version
            );
        }
    });
}

/// Foreground check-and-apply for --self-update.
fn apply_self_update(config: &ForgeConfig) -> Result<()> {
    let check = updater::check_for_updates(config);
    if !check.error.is_empty() {
        bail!("update check failed: {}", check.error);
    }
    if !check.update_available {
        println!(
            "Already up to date (v{} running, v{} published).",
            check.current_version, check.latest_version
        );
        return Ok(());
    }

    println!(
        "Updating v{} -> v{}...",
        check.current_version, check.latest_version
    );
    let message = updater::download_and_replace_exe(config, &check, |percent| {
        print!("\r[{:>3}%]", percent);
        use std::io::Write;
        let _ = std::io::stdout().flush();
    })
    .map_err(|e| anyhow::anyhow!(e))?;

    println!("\n{}", message);
    Ok(())
}
