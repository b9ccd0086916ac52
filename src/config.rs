// ============================================
// config.rs - Tool configuration
// ============================================
// WinForge reads an optional winforge.toml from the folder next to the
// EXE. Every field has an embedded default, so the file is only needed
// to override endpoints, retry bounds, or to pin the aria2c digest.
//
// A missing file is normal (first run). A malformed file is NOT fatal:
// we warn and continue on defaults — a broken config should never stop
// a provisioning run from being possible at all.
// ============================================

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::retry::BackoffPolicy;

/// Filename looked up next to the EXE.
const CONFIG_FILE_NAME: &str = "winforge.toml";

// ============================================
// DEFAULT ENDPOINTS
// ============================================

fn default_api_base() -> String {
    "https://api.uupdump.net".to_string()
}

fn default_update_url() -> String {
    "https://winforge-project.github.io/latest_version.json".to_string()
}

fn default_converter_url() -> String {
    "https://github.com/uup-dump/converter/raw/master/convert.sh".to_string()
}

fn default_aria2_url() -> String {
    "https://github.com/aria2/aria2/releases/download/release-1.37.0/aria2-1.37.0-win-64bit-build1.zip"
        .to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    5
}

fn default_http_timeout_secs() -> u64 {
    15
}

fn default_download_timeout_secs() -> u64 {
    300
}

// ============================================
// CONFIG STRUCT
// ============================================

/// All tunables in one place. Deserialized from winforge.toml; every
/// field is optional in the file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    /// Base URL of the UUP catalog API (listid.php / getdownload.php).
    pub api_base: String,

    /// JSON manifest polled by the self-updater
    /// ({ "version", "download_url", "sha256" }).
    pub update_url: String,

    /// Upstream URL of the UUP-to-ISO converter script.
    pub converter_url: String,

    /// Release ZIP containing aria2c.exe.
    pub aria2_url: String,

    /// Expected SHA-256 of aria2c.exe. When set, the binary is verified
    /// before every use and re-downloaded on mismatch. Empty = unpinned.
    pub aria2_sha256: String,

    /// Retry bound for network-adjacent stages (attempts, not retries).
    pub max_attempts: u32,

    /// Base delay of the linear backoff, in seconds.
    pub retry_delay_secs: u64,

    /// Timeout for catalog/manifest API calls, in seconds.
    pub http_timeout_secs: u64,

    /// Timeout for large artifact downloads, in seconds.
    pub download_timeout_secs: u64,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        ForgeConfig {
            api_base: default_api_base(),
            update_url: default_update_url(),
            converter_url: default_converter_url(),
            aria2_url: default_aria2_url(),
            aria2_sha256: String::new(),
            max_attempts: default_max_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
            http_timeout_secs: default_http_timeout_secs(),
            download_timeout_secs: default_download_timeout_secs(),
        }
    }
}

impl ForgeConfig {
    /// Load winforge.toml from next to the EXE, falling back to the
    /// embedded defaults if the file is missing or malformed.
    pub fn load() -> ForgeConfig {
        Self::load_from(&crate::tools::app_directory().join(CONFIG_FILE_NAME))
    }

    /// Load from an explicit path (separated out for tests).
    pub fn load_from(path: &PathBuf) -> ForgeConfig {
        if !path.exists() {
            return ForgeConfig::default();
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str::<ForgeConfig>(&content) {
                Ok(config) => {
                    println!("[Config] loaded {}", path.display());
                    config
                }
                Err(e) => {
                    eprintln!(
                        "[Config] {} is malformed ({}) — using defaults",
                        path.display(),
                        e
                    );
                    ForgeConfig::default()
                }
            },
            Err(e) => {
                eprintln!(
                    "[Config] could not read {} ({}) — using defaults",
                    path.display(),
                    e
                );
                ForgeConfig::default()
            }
        }
    }

    /// Backoff policy for the retryable stages.
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.max_attempts, Duration::from_secs(self.retry_delay_secs))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

// ============================================
// TESTS
// ============================================
