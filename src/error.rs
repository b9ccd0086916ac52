// ============================================
// error.rs - Pipeline error classification
// ============================================
// Every failure the pipeline can surface is one of the variants below.
// The observer gets a human-readable message (Display) plus a stable
// machine-readable tag (kind()), so the CLI can render "what happened"
// without string-matching error text.
//
// Classification drives the retry helper: is_transient() marks the
// kinds that are worth another attempt (network-adjacent failures),
// everything else stops the job on first occurrence.
// ============================================

use std::path::PathBuf;
use thiserror::Error;

/// All failure modes of a provisioning run.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Catalog API unreachable or returned garbage. The resolver converts
    /// this into a fallback descriptor, so it never reaches the pipeline —
    /// it exists so the warning log can carry a proper kind.
    #[error("build catalog unavailable: {0}")]
    MetadataUnavailable(String),

    /// Payload or tool download failed (connection, HTTP status,
    /// subprocess exit). Transient — retried up to the configured bound.
    #[error("download failed: {0}")]
    DownloadFailed(String),

    /// A downloaded artifact's SHA-256 does not match the expected digest.
    /// Treated as a download failure: the artifact is discarded and the
    /// download is eligible for retry.
    #[error("integrity check failed for {}: expected {expected}, got {actual}", path.display())]
    IntegrityMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// The external conversion tool exited non-zero or produced no image.
    /// Fatal for the job.
    #[error("image assembly failed: {0}")]
    AssemblyFailed(String),

    /// Mounting the assembled image yielded no drive letter. Fatal.
    #[error("image mount failed: {0}")]
    MountFailed(String),

    /// The upgrade trigger (Windows Update session or setup launch)
    /// reported non-success. Fatal, never retried.
    #[error("upgrade trigger failed: {0}")]
    UpgradeFailed(String),

    /// Workspace directory could not be created or accessed. Fatal.
    #[error("workspace error: {0}")]
    Workspace(String),

    /// The user cancelled the job. Not a failure — teardown still runs,
    /// and the job ends in the Cancelled state.
    #[error("cancelled by user")]
    Cancelled,

    /// Missing administrator rights. Checked once at startup, never
    /// retried.
    #[error("administrator rights required: {0}")]
    ElevationRequired(String),
}

impl ProvisionError {
    /// Stable machine-readable tag for the observer. Display text may
    /// change; these strings are part of the output contract.
    pub fn kind(&self) -> &'static str {
        match self {
            ProvisionError::MetadataUnavailable(_) => "MetadataUnavailable",
            ProvisionError::DownloadFailed(_) => "DownloadFailed",
            ProvisionError::IntegrityMismatch { .. } => "IntegrityMismatch",
            ProvisionError::AssemblyFailed(_) => "AssemblyFailed",
            ProvisionError::MountFailed(_) => "MountFailed",
            ProvisionError::UpgradeFailed(_) => "UpgradeFailed",
            ProvisionError::Workspace(_) => "Workspace",
            ProvisionError::Cancelled => "CancelledByUser",
            ProvisionError::ElevationRequired(_) => "ElevationRequired",
        }
    }

    /// Whether the retry helper may run the failing operation again.
    /// Only network-adjacent failures qualify; IntegrityMismatch counts
    /// because re-downloading can produce an intact artifact.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProvisionError::MetadataUnavailable(_)
                | ProvisionError::DownloadFailed(_)
                | ProvisionError::IntegrityMismatch { .. }
        )
    }
}

/// Convenience alias used throughout the pipeline modules.
pub type ProvisionResult<T> = Result<T, ProvisionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ProvisionError::DownloadFailed("timeout".into()).is_transient());
        assert!(ProvisionError::MetadataUnavailable("503".into()).is_transient());
        assert!(ProvisionError::IntegrityMismatch {
            path: PathBuf::from("aria2c.exe"),
            expected: "aa".into(),
            actual: "bb".into(),
        }
        .is_transient());

        assert!(!ProvisionError::AssemblyFailed("exit 1".into()).is_transient());
        assert!(!ProvisionError::MountFailed("no drive letter".into()).is_transient());
        assert!(!ProvisionError::UpgradeFailed("code 3".into()).is_transient());
        assert!(!ProvisionError::Cancelled.is_transient());
        assert!(!ProvisionError::ElevationRequired("not admin".into()).is_transient());
    }

    #[test]
    fn test_kind_tags_are_stable() {
        assert_eq!(ProvisionError::Cancelled.kind(), "CancelledByUser");
        assert_eq!(
            ProvisionError::MountFailed("x".into()).kind(),
            "MountFailed"
        );
        assert_eq!(
            ProvisionError::DownloadFailed("x".into()).kind(),
            "DownloadFailed"
        );
    }
}
