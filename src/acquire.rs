// ============================================
// acquire.rs - UUP payload acquisition
// ============================================
// Downloads the UUP file set for a resolved build:
//   1. Ask the catalog's getdownload.php for the file list
//   2. Write an aria2 input file (one URL per line)
//   3. Drive aria2c as a subprocess, scraping progress from its output
//
// aria2's console output is a text format, not a protocol. All of the
// scraping knowledge lives in parse_progress_line() so the rest of the
// pipeline never depends on exact log wording.
// ============================================

use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::builds::{BuildDescriptor, Edition};
use crate::config::ForgeConfig;
use crate::error::{ProvisionError, ProvisionResult};
use crate::pipeline::CancelToken;

/// aria2 input file written into the workspace.
const INPUT_FILE_NAME: &str = "files.txt";

// ============================================
// DOWNLOAD SET
// ============================================

/// One downloadable file in the UUP set.
#[derive(Debug, Clone, Deserialize)]
pub struct PayloadFile {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DownloadSetResponse {
    #[serde(default)]
    files: Vec<PayloadFile>,
}

/// Query getdownload.php for the file set of a build/edition pair.
pub fn fetch_download_set(
    config: &ForgeConfig,
    descriptor: &BuildDescriptor,
    edition: Edition,
) -> ProvisionResult<Vec<PayloadFile>> {
    let client = reqwest::blocking::Client::builder()
        .user_agent(concat!("WinForge/", env!("CARGO_PKG_VERSION")))
        .timeout(config.http_timeout())
        .build()
        .map_err(|e| ProvisionError::DownloadFailed(format!("HTTP client: {}", e)))?;

    let url = format!("{}/getdownload.php", config.api_base);
    let response = client
        .get(&url)
        .query(&[("build", descriptor.id.as_str()), ("edition", edition.as_str())])
        .send()
        .map_err(|e| ProvisionError::DownloadFailed(format!("download-set request: {}", e)))?;

    if !response.status().is_success() {
        return Err(ProvisionError::DownloadFailed(format!(
            "download-set lookup returned status {}",
            response.status()
        )));
    }

    let body = response
        .text()
        .map_err(|e| ProvisionError::DownloadFailed(format!("download-set body: {}", e)))?;
    let set: DownloadSetResponse = serde_json::from_str(&body)
        .map_err(|e| ProvisionError::DownloadFailed(format!("download-set JSON: {}", e)))?;

    if set.files.is_empty() {
        return Err(ProvisionError::DownloadFailed(format!(
            "catalog lists no files for build {}",
            descriptor.id
        )));
    }

    println!(
        "[Acquire] {} files listed for {} ({})",
        set.files.len(),
        descriptor.title,
        edition
    );
    Ok(set.files)
}

/// Write the aria2 input file into the workspace: one URL per line.
pub fn write_input_file(files: &[PayloadFile], workspace: &Path) -> ProvisionResult<PathBuf> {
    let input_path = workspace.join(INPUT_FILE_NAME);
    let mut file = File::create(&input_path).map_err(|e| {
        ProvisionError::DownloadFailed(format!("create {}: {}", input_path.display(), e))
    })?;

    for entry in files {
        writeln!(file, "{}", entry.url)
            .map_err(|e| ProvisionError::DownloadFailed(format!("write input file: {}", e)))?;
    }

    Ok(input_path)
}

// ============================================
// PROGRESS SCRAPING ADAPTER
// ============================================

/// Pull a 0-100 percentage out of one line of aria2 console output.
///
/// Typical lines:
///   [#2089b0 400KiB/33MiB(1%) CN:16 DL:115KiB ETA:4m51s]
///   [#2089b0 33MiB/33MiB(100%) CN:1 DL:2.1MiB]
/// The scrape takes the digits immediately before the last '%' on the
/// line. Lines without a percentage (notices, summaries) yield None.
pub fn parse_progress_line(line: &str) -> Option<u8> {
    let percent_pos = line.rfind('%')?;
    let digits: String = line[..percent_pos]
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();

    if digits.is_empty() {
        return None;
    }
    digits.parse::<u32>().ok().map(|p| p.min(100) as u8)
}

// ============================================
// ARIA2 SUBPROCESS
// ============================================

/// Run aria2c against the input file, streaming progress and honoring
/// cancellation between output lines. The child is killed on cancel.
pub fn run_downloader(
    aria2_path: &Path,
    input_file: &Path,
    workspace: &Path,
    cancel: &CancelToken,
    mut progress: impl FnMut(u8),
) -> ProvisionResult<()> {
    println!("[Acquire] starting {}", aria2_path.display());

    let mut child = Command::new(aria2_path)
        .arg("-i")
        .arg(input_file)
        .arg("-d")
        .arg(workspace)
        .arg("--max-connection-per-server=16")
        .arg("--split=16")
        .arg("--console-log-level=warn")
        .arg("--summary-interval=1")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| ProvisionError::DownloadFailed(format!("spawn aria2c: {}", e)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ProvisionError::DownloadFailed("aria2c stdout not captured".into()))?;

    for line in BufReader::new(stdout).lines() {
        if cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ProvisionError::Cancelled);
        }

        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        if let Some(percent) = parse_progress_line(&line) {
            progress(percent);
        }
    }

    let status = child
        .wait()
        .map_err(|e| ProvisionError::DownloadFailed(format!("wait for aria2c: {}", e)))?;

    // One last cancellation check: the child may have exited right as
    // the user hit cancel, before we saw another output line.
    if cancel.is_cancelled() {
        return Err(ProvisionError::Cancelled);
    }

    if !status.success() {
        return Err(ProvisionError::DownloadFailed(format!(
            "aria2c exited with {}",
            status
        )));
    }

    progress(100);
    println!("[Acquire] payload download complete");
    Ok(())
}

/// Full acquisition for one build: file set, input file, downloader run.
/// The caller wraps this in the retry helper — every failure in here is
/// classified transient.
pub fn acquire_payload(
    config: &ForgeConfig,
    descriptor: &BuildDescriptor,
    edition: Edition,
    workspace: &Path,
    cancel: &CancelToken,
    mut progress: impl FnMut(u8),
) -> ProvisionResult<()> {
    let aria2_path = crate::tools::ensure_aria2(config)?;
    let files = fetch_download_set(config, descriptor, edition)?;
    let input_file = write_input_file(&files, workspace)?;
    run_downloader(&aria2_path, &input_file, workspace, cancel, &mut progress)
}

// ============================================
// TESTS
// ============================================
