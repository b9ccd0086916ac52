// ============================================
// tools.rs - Manages bundled third-party tools
// ============================================
// This module handles:
//   - Locating the app and tools directories (portable layout)
//   - Downloading files with progress callbacks
//   - Fetching and integrity-checking aria2c (the payload downloader)
//   - Fetching the UUP-to-ISO converter script
//
// PORTABLE DESIGN:
// Tools are stored in a folder NEXT TO the winforge executable:
//
//   USB Drive/
//   ├── winforge.exe
//   ├── winforge.toml           # optional config overrides
//   └── tools/
//       ├── aria2c.exe          # payload downloader
//       └── convert.sh          # UUP-to-ISO converter
// ============================================

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::ForgeConfig;
use crate::error::{ProvisionError, ProvisionResult};
use crate::retry::{file_hash_matches, verify_file_hash};

/// Downloader binary extracted from the aria2 release ZIP.
const ARIA2_EXE_NAME: &str = "aria2c.exe";

/// Cached converter script filename.
const CONVERTER_NAME: &str = "convert.sh";

// ============================================
// PATH HELPERS
// ============================================

/// Get the directory where the winforge executable is located.
///
/// Uses std::env::current_exe() so tools land NEXT TO the EXE even when
/// the working directory is somewhere else (shortcut, different drive).
pub fn app_directory() -> PathBuf {
    if let Ok(exe_path) = std::env::current_exe() {
        // Canonicalize to resolve any symlinks/junctions, then get parent
        let resolved = exe_path.canonicalize().unwrap_or(exe_path);
        if let Some(parent) = resolved.parent() {
            // Strip \\?\ prefix that canonicalize adds on Windows
            let parent_str = parent.to_string_lossy();
            if let Some(stripped) = parent_str.strip_prefix(r"\\?\") {
                return PathBuf::from(stripped);
            }
            return parent.to_path_buf();
        }
    }
    // Last resort: use current directory (shouldn't normally happen)
    eprintln!("[Tools] could not determine EXE directory, using current directory");
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// The tools folder next to the EXE. Created on demand.
pub fn tools_directory() -> PathBuf {
    app_directory().join("tools")
}

// ============================================
// DOWNLOADING
// ============================================

/// Download a URL to a file, reporting 0-100 progress when the server
/// announces a content length. Returns the byte count written.
pub fn download_to_file(
    url: &str,
    dest: &Path,
    timeout: Duration,
    mut progress: impl FnMut(u8),
) -> ProvisionResult<u64> {
    let client = reqwest::blocking::Client::builder()
        .user_agent(concat!("WinForge/", env!("CARGO_PKG_VERSION")))
        .redirect(reqwest::redirect::Policy::limited(10))
        .timeout(timeout)
        .build()
        .map_err(|e| ProvisionError::DownloadFailed(format!("HTTP client: {}", e)))?;

    println!("[Tools] downloading {}", url);
    progress(0);

    let response = client
        .get(url)
        .send()
        .map_err(|e| ProvisionError::DownloadFailed(format!("connect: {}", e)))?;

    if !response.status().is_success() {
        return Err(ProvisionError::DownloadFailed(format!(
            "{} returned status {}",
            url,
            response.status()
        )));
    }

    let total_size = response.content_length().unwrap_or(0);
    let mut downloaded: u64 = 0;

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            ProvisionError::DownloadFailed(format!("create {}: {}", parent.display(), e))
        })?;
    }

    let mut file = File::create(dest)
        .map_err(|e| ProvisionError::DownloadFailed(format!("create {}: {}", dest.display(), e)))?;

    let mut reader = response;
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .map_err(|e| ProvisionError::DownloadFailed(format!("read: {}", e)))?;
        if bytes_read == 0 {
            break;
        }
        file.write_all(&buffer[..bytes_read])
            .map_err(|e| ProvisionError::DownloadFailed(format!("write: {}", e)))?;
        downloaded += bytes_read as u64;

        if total_size > 0 {
            let percent = ((downloaded * 100) / total_size).min(100) as u8;
            progress(percent);
        }
    }

    file.flush()
        .map_err(|e| ProvisionError::DownloadFailed(format!("flush: {}", e)))?;
    drop(file);

    progress(100);
    println!("[Tools] downloaded {} bytes to {}", downloaded, dest.display());
    Ok(downloaded)
}

// ============================================
// ZIP EXTRACTION
// ============================================

/// Extract a single named member from a ZIP archive into dest_dir.
/// The match is by file name (case-insensitive), so a member nested in
/// a release subfolder is still found.
pub fn extract_zip_member(
    zip_path: &Path,
    member_name: &str,
    dest_dir: &Path,
) -> ProvisionResult<PathBuf> {
    let file = File::open(zip_path).map_err(|e| {
        ProvisionError::DownloadFailed(format!("open {}: {}", zip_path.display(), e))
    })?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| ProvisionError::DownloadFailed(format!("bad archive: {}", e)))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| ProvisionError::DownloadFailed(format!("archive entry: {}", e)))?;
        if entry.is_dir() {
            continue;
        }

        let matches = Path::new(entry.name())
            .file_name()
            .map(|n| n.to_string_lossy().eq_ignore_ascii_case(member_name))
            .unwrap_or(false);
        if !matches {
            continue;
        }

        fs::create_dir_all(dest_dir).map_err(|e| {
            ProvisionError::DownloadFailed(format!("create {}: {}", dest_dir.display(), e))
        })?;
        let dest_file = dest_dir.join(member_name);

        // Remove old file if exists
        let _ = fs::remove_file(&dest_file);

        let mut outfile = File::create(&dest_file).map_err(|e| {
            ProvisionError::DownloadFailed(format!("create {}: {}", dest_file.display(), e))
        })?;
        io::copy(&mut entry, &mut outfile)
            .map_err(|e| ProvisionError::DownloadFailed(format!("extract: {}", e)))?;

        println!("[Tools] extracted {}", member_name);
        return Ok(dest_file);
    }

    Err(ProvisionError::DownloadFailed(format!(
        "{} not found in {}",
        member_name,
        zip_path.display()
    )))
}

// ============================================
// ARIA2C
// ============================================

/// Make sure a trustworthy aria2c.exe is present in the tools folder
/// and return its path.
///
/// Trust rules:
///   - binary present + no digest pinned          -> use as-is
///   - binary present + pinned digest matches     -> use as-is
///   - binary present + pinned digest mismatches  -> re-download
///   - binary missing                             -> download
/// A freshly downloaded binary that still fails the pinned digest is an
/// IntegrityMismatch, which the caller's retry wrapper may re-attempt.
pub fn ensure_aria2(config: &ForgeConfig) -> ProvisionResult<PathBuf> {
    let tools_dir = tools_directory();
    let aria2_path = tools_dir.join(ARIA2_EXE_NAME);

    if aria2_path.exists() {
        if config.aria2_sha256.is_empty() || file_hash_matches(&aria2_path, &config.aria2_sha256) {
            return Ok(aria2_path);
        }
        println!("[Tools] aria2c failed its integrity check — re-downloading");
        let _ = fs::remove_file(&aria2_path);
    }

    let zip_path = tools_dir.join("aria2.zip");
    download_to_file(&config.aria2_url, &zip_path, config.download_timeout(), |_| {})?;
    let extracted = extract_zip_member(&zip_path, ARIA2_EXE_NAME, &tools_dir);
    let _ = fs::remove_file(&zip_path);
    let aria2_path = extracted?;

    if !config.aria2_sha256.is_empty() {
        verify_file_hash(&aria2_path, &config.aria2_sha256)?;
    }

    Ok(aria2_path)
}

// ============================================
// CONVERTER SCRIPT
// ============================================

/// Make sure the UUP-to-ISO converter script is cached in the tools
/// folder and return its path. Fetched once; a cached copy is reused.
pub fn ensure_converter(config: &ForgeConfig) -> ProvisionResult<PathBuf> {
    let script_path = tools_directory().join(CONVERTER_NAME);
    if script_path.exists() {
        return Ok(script_path);
    }

    download_to_file(
        &config.converter_url,
        &script_path,
        config.download_timeout(),
        |_| {},
    )?;
    Ok(script_path)
}

// ============================================
// TESTS
// ============================================
