// ============================================
// updater.rs - Self-update from a release manifest
// ============================================
// This module handles auto-updating winforge itself.
//
// How it works:
// 1. On startup (background thread), we poll a small JSON manifest
//    to see if a newer version exists.
// 2. If an update is available, a notice is printed; the user applies
//    it with --self-update.
// 3. The new EXE is downloaded to a staging file and its SHA-256 is
//    verified against the manifest before anything is touched.
// 4. The `self_replace` crate swaps the running EXE with the new one —
//    the platform-safe two-process handoff (a running EXE cannot
//    delete its own image).
// 5. The user restarts to use the new version.
// ============================================

use serde::Deserialize;
use std::io::{Read, Write};

use crate::config::ForgeConfig;
use crate::retry::verify_file_hash;

/// Staging filename for the downloaded replacement (next to the EXE).
const STAGING_FILE_NAME: &str = "winforge_update.tmp";

// ============================================
// DATA STRUCTURES
// ============================================

/// The release manifest the update endpoint serves.
/// We only include the fields we care about — serde ignores the rest.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateManifest {
    /// Latest released version, e.g. "1.2.0" (a "v" prefix is tolerated)
    pub version: String,

    /// Direct download URL of the replacement executable
    pub download_url: String,

    /// Expected SHA-256 of the replacement executable. Optional in the
    /// manifest, but without it the download is accepted unverified.
    #[serde(default)]
    pub sha256: Option<String>,
}

/// The result of checking the manifest for updates.
/// On any error, `update_available` is false and `error` has a message.
#[derive(Debug, Clone)]
pub struct UpdateCheckResult {
    /// Is a newer version available?
    pub update_available: bool,

    /// The latest version string (e.g. "1.2.0"), without any "v" prefix
    pub latest_version: String,

    /// The version of the currently running EXE
    pub current_version: String,

    /// Download URL for the new EXE (empty if no update)
    pub download_url: String,

    /// Expected digest of the new EXE (empty if the manifest omits it)
    pub expected_sha256: String,

    /// Error message if the check failed (empty on success)
    pub error: String,
}

// ============================================
// UPDATE CHECK
// ============================================

/// Poll the update manifest and compare against our version.
///
/// Safe to call from a background thread; blocks for at most the
/// configured HTTP timeout. On any error (no internet, bad JSON, ...)
/// it returns a result with update_available = false and the error
/// message filled in — a dead update endpoint never disturbs startup.
pub fn check_for_updates(config: &ForgeConfig) -> UpdateCheckResult {
    // Our version is baked in at compile time from Cargo.toml
    let current_version = env!("CARGO_PKG_VERSION").to_string();

    // Helper: create a "failed" result with an error message
    let make_error = |msg: String| UpdateCheckResult {
        update_available: false,
        latest_version: String::new(),
        current_version: current_version.clone(),
        download_url: String::new(),
        expected_sha256: String::new(),
        error: msg,
    };

    let client = match reqwest::blocking::Client::builder()
        .user_agent(concat!("WinForge/", env!("CARGO_PKG_VERSION")))
        .timeout(config.http_timeout())
        .build()
    {
        Ok(c) => c,
        Err(e) => return make_error(format!("Failed to create HTTP client: {}", e)),
    };

    let response = match client.get(&config.update_url).send() {
        Ok(r) => r,
        Err(e) => return make_error(format!("Could not reach update endpoint: {}", e)),
    };

    if !response.status().is_success() {
        return make_error(format!(
            "Update endpoint returned status {}",
            response.status()
        ));
    }

    // Read the body as text, then parse it as JSON. We do this instead
    // of response.json() to avoid needing the reqwest "json" feature.
    let body_text = match response.text() {
        Ok(t) => t,
        Err(e) => return make_error(format!("Failed to read response: {}", e)),
    };

    let manifest: UpdateManifest = match serde_json::from_str(&body_text) {
        Ok(m) => m,
        Err(e) => return make_error(format!("Failed to parse update manifest: {}", e)),
    };

    // Strip a "v" prefix if the manifest carries one (e.g. "v1.2.0")
    let latest_version = manifest
        .version
        .strip_prefix('v')
        .unwrap_or(&manifest.version)
        .to_string();

    let update_available = is_newer_version(&current_version, &latest_version);

    UpdateCheckResult {
        update_available,
        latest_version,
        current_version,
        download_url: manifest.download_url,
        expected_sha256: manifest.sha256.unwrap_or_default(),
        error: String::new(),
    }
}

// ============================================
// VERSION COMPARISON
// ============================================

/// Compare two version strings (e.g. "0.1.0" vs "1.2.0").
/// Returns true if `latest` is strictly newer than `current`.
///
/// Uses simple numeric comparison of major.minor.patch.
/// Non-numeric parts are treated as 0 (safe fallback).
fn is_newer_version(current: &str, latest: &str) -> bool {
    // Parse a version string like "1.2.3" into (1, 2, 3)
    let parse = |s: &str| -> (u32, u32, u32) {
        let parts: Vec<u32> = s.split('.').map(|p| p.parse().unwrap_or(0)).collect();
        (
            parts.first().copied().unwrap_or(0), // major
            parts.get(1).copied().unwrap_or(0),  // minor
            parts.get(2).copied().unwrap_or(0),  // patch
        )
    };

    // Rust tuples compare element by element: (1,2,3) > (1,2,0) is true
    parse(latest) > parse(current)
}

// ============================================
// DOWNLOAD, VERIFY AND SELF-REPLACE
// ============================================

/// Download the new EXE, verify its digest, and replace the running
/// one.
///
/// How self-replacement works on Windows:
/// 1. Download the new EXE to a staging file next to the running EXE
/// 2. Verify the staging file's SHA-256 against the manifest
/// 3. The self_replace crate moves the running EXE aside (renames it)
/// 4. The new EXE is copied into the original filename
/// 5. The old EXE is scheduled for deletion when the process exits
/// 6. User must restart winforge to use the new version
///
/// This function blocks during download. The progress_callback receives
/// values 0-100.
pub fn download_and_replace_exe(
    config: &ForgeConfig,
    check: &UpdateCheckResult,
    progress_callback: impl Fn(u8),
) -> Result<String, String> {
    if check.download_url.is_empty() {
        return Err("No download URL — run the update check first".to_string());
    }

    println!("[Updater] downloading update from {}", check.download_url);
    progress_callback(0);

    let client = reqwest::blocking::Client::builder()
        .user_agent(concat!("WinForge/", env!("CARGO_PKG_VERSION")))
        .redirect(reqwest::redirect::Policy::limited(10))
        .timeout(config.download_timeout())
        .build()
        .map_err(|e| format!("Failed to create HTTP client: {}", e))?;

    // Stage next to the running EXE so the final rename stays on one volume
    let app_dir = crate::tools::app_directory();
    let staging_path = app_dir.join(STAGING_FILE_NAME);

    let response = client
        .get(&check.download_url)
        .send()
        .map_err(|e| format!("Failed to connect to download server: {}", e))?;

    if !response.status().is_success() {
        return Err(format!("Download failed with status: {}", response.status()));
    }

    // Total size for progress tracking (may be 0 if the server is quiet)
    let total_size = response.content_length().unwrap_or(0);
    let mut downloaded: u64 = 0;

    let mut file = std::fs::File::create(&staging_path)
        .map_err(|e| format!("Failed to create staging file: {}", e))?;

    let mut reader = response;
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .map_err(|e| format!("Error reading download data: {}", e))?;
        if bytes_read == 0 {
            break;
        }
        file.write_all(&buffer[..bytes_read])
            .map_err(|e| format!("Error writing staging file: {}", e))?;

        // 0-90% for download, the rest for verify + replace
        downloaded += bytes_read as u64;
        if total_size > 0 {
            let percent = ((downloaded * 90) / total_size) as u8;
            progress_callback(percent.min(90));
        }
    }

    file.flush()
        .map_err(|e| format!("Error flushing staging file: {}", e))?;
    drop(file); // Close the handle before verifying/replacing

    // Integrity gate: a tampered or truncated download never replaces us.
    if !check.expected_sha256.is_empty() {
        if let Err(e) = verify_file_hash(&staging_path, &check.expected_sha256) {
            let _ = std::fs::remove_file(&staging_path);
            return Err(format!("Update rejected: {}", e));
        }
        println!("[Updater] digest verified");
    } else {
        println!("[Updater] manifest carries no digest — skipping verification");
    }
    progress_callback(95);

    // Swap the running EXE with the staged one. This handles the
    // Windows EXE-locking dance: move the running EXE to a temp name,
    // copy the new file into the original name, schedule cleanup.
    self_replace::self_replace(&staging_path).map_err(|e| {
        format!(
            "Failed to replace EXE: {}. Close other winforge instances and retry.",
            e
        )
    })?;

    // self_replace copies the staging file, so it can go now
    let _ = std::fs::remove_file(&staging_path);

    progress_callback(100);
    println!("[Updater] self-replace successful");

    Ok(format!(
        "Updated to v{}. Restart winforge to use the new version.",
        check.latest_version
    ))
}

// ============================================
// TESTS
// ============================================
