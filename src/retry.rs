// ============================================
// retry.rs - Bounded retries and file integrity
// ============================================
// Two small building blocks the network-facing stages share:
//
// 1. with_retry() — runs an operation up to N times with a linear
//    backoff (attempt number × fixed delay) between attempts. Only
//    errors classified transient are retried; a fatal error or an
//    exhausted bound propagates the last error to the caller.
//
// 2. SHA-256 helpers — streaming file digest plus a case-insensitive
//    comparison against an expected hex string. Used to gate the
//    aria2c binary and self-update downloads before trusting them.
// ============================================

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::error::{ProvisionError, ProvisionResult};

// ============================================
// BACKOFF POLICY
// ============================================

/// How often and how patiently an operation is retried.
/// Backoff is linear: the wait before attempt k+1 is `k × delay`
/// (so the first retry waits one delay, the second two, ...).
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Total attempts, including the first one. Must be at least 1.
    pub max_attempts: u32,
    /// Base delay between attempts.
    pub delay: Duration,
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        BackoffPolicy {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Policy for unit tests and callers that want no waiting.
    pub fn immediate(max_attempts: u32) -> Self {
        BackoffPolicy::new(max_attempts, Duration::ZERO)
    }

    /// Sleep before the given retry (1-based attempt number that just
    /// failed). Linear: attempt 1 failing waits 1×delay, attempt 2
    /// failing waits 2×delay.
    fn wait_after(&self, failed_attempt: u32) {
        let pause = self.delay * failed_attempt;
        if !pause.is_zero() {
            std::thread::sleep(pause);
        }
    }
}

// ============================================
// RETRY WRAPPER
// ============================================

/// Run `operation` up to `policy.max_attempts` times.
///
/// The operation is re-run only when it fails with a transient error
/// (see ProvisionError::is_transient). Fatal errors and Cancelled
/// propagate immediately — retrying a cancellation would fight the user.
///
/// For an operation that fails exactly k times and then succeeds, with
/// a bound of N ≥ k+1, the operation runs exactly k+1 times and the
/// success value is returned. With N ≤ k, the last failure is returned
/// after exactly N runs.
pub fn with_retry<T, F>(label: &str, policy: BackoffPolicy, mut operation: F) -> ProvisionResult<T>
where
    F: FnMut() -> ProvisionResult<T>,
{
    let mut attempt = 1;
    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                println!(
                    "[Retry] {} failed (attempt {}/{}): {} — retrying",
                    label, attempt, policy.max_attempts, err
                );
                policy.wait_after(attempt);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

// ============================================
// FILE INTEGRITY
// ============================================

/// Compute the SHA-256 digest of a file as a lowercase hex string.
/// Streams in 8 KiB chunks so large downloads don't land in memory.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Check a file against an expected SHA-256 hex digest.
/// Comparison is case-insensitive; an unreadable file counts as a
/// mismatch (the caller treats both the same way: re-download).
pub fn file_hash_matches(path: &Path, expected: &str) -> bool {
    match sha256_file(path) {
        Ok(actual) => actual.eq_ignore_ascii_case(expected.trim()),
        Err(err) => {
            println!(
                "[Retry] could not hash {}: {} — treating as mismatch",
                path.display(),
                err
            );
            false
        }
    }
}

/// Like file_hash_matches, but produces the classified error the retry
/// wrapper understands, carrying both digests for the log.
pub fn verify_file_hash(path: &Path, expected: &str) -> ProvisionResult<()> {
    let actual = sha256_file(path)
        .map_err(|e| ProvisionError::DownloadFailed(format!("hashing {}: {}", path.display(), e)))?;

    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(ProvisionError::IntegrityMismatch {
            path: path.to_path_buf(),
            expected: expected.trim().to_lowercase(),
            actual,
        })
    }
}

// ============================================
// TESTS
// ============================================
