// ============================================
// tests/pipeline.rs - End-to-end pipeline runs
// ============================================
// Drives the full state machine with a mock Tooling backend: every
// external effect (catalog, downloader, converter, mount, upgrade) is
// simulated, everything else — stages, retries, cancellation,
// teardown, events — is the real code under test.
// ============================================

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc, Arc};

use winforge::image::MountedImage;
use winforge::pipeline::{self, ProgressEvent, ProgressSink, Tooling};
use winforge::{
    builds, BuildDescriptor, CancelToken, Channel, Edition, ForgeConfig, PipelineReport,
    ProvisionError, ProvisionResult, ProvisioningJob, Stage, UpgradeMethod, UpgradeOutcome,
};

// ============================================
// MOCK TOOLING
// ============================================

struct MockTooling {
    /// MountingImage yields no drive letter when set
    fail_mount: bool,
    /// What the upgrade trigger reports back
    upgrade_success: bool,
    /// Transient failures to inject before acquisition succeeds
    acquire_failures_remaining: AtomicU32,
    acquire_calls: AtomicU32,
    /// When set, the user "clicks cancel" in the middle of acquisition
    cancel_mid_acquire: Option<CancelToken>,
    upgrade_called: AtomicBool,
    dismounted: Arc<AtomicBool>,
}

impl Default for MockTooling {
    fn default() -> Self {
        MockTooling {
            fail_mount: false,
            upgrade_success: true,
            acquire_failures_remaining: AtomicU32::new(0),
            acquire_calls: AtomicU32::new(0),
            cancel_mid_acquire: None,
            upgrade_called: AtomicBool::new(false),
            dismounted: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Tooling for MockTooling {
    fn resolve_build(&self, channel: &Channel) -> BuildDescriptor {
        // The catalog answered with an empty build set: the resolver's
        // contract says that is a fallback, never an error.
        builds::fallback_descriptor(channel)
    }

    fn acquire_payload(
        &self,
        _descriptor: &BuildDescriptor,
        _edition: Edition,
        workspace: &Path,
        cancel: &CancelToken,
        progress: &mut dyn FnMut(u8),
    ) -> ProvisionResult<()> {
        self.acquire_calls.fetch_add(1, Ordering::SeqCst);
        progress(10);

        if let Some(token) = &self.cancel_mid_acquire {
            // Cancellation lands while the downloader is mid-transfer;
            // the per-line flag check picks it up.
            token.cancel();
            if cancel.is_cancelled() {
                return Err(ProvisionError::Cancelled);
            }
        }

        let remaining = self.acquire_failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.acquire_failures_remaining
                .store(remaining - 1, Ordering::SeqCst);
            return Err(ProvisionError::DownloadFailed("simulated outage".into()));
        }

        std::fs::write(workspace.join("payload.esd"), b"payload").unwrap();
        progress(100);
        Ok(())
    }

    fn assemble_image(
        &self,
        descriptor: &BuildDescriptor,
        edition: Edition,
        workspace: &Path,
    ) -> ProvisionResult<PathBuf> {
        let iso_path = workspace.join(format!("Windows_{}_{}.iso", descriptor.build, edition));
        std::fs::write(&iso_path, b"ISO STUB").unwrap();
        Ok(iso_path)
    }

    fn mount_image(&self, iso_path: &Path) -> ProvisionResult<MountedImage> {
        if self.fail_mount {
            return Err(ProvisionError::MountFailed(
                "image mounted but no drive letter assigned".into(),
            ));
        }
        let dismounted = self.dismounted.clone();
        Ok(MountedImage::new(
            "E:".into(),
            iso_path.to_path_buf(),
            Box::new(move |_: &Path| dismounted.store(true, Ordering::SeqCst)),
        ))
    }

    fn trigger_upgrade(
        &self,
        _mounted: &MountedImage,
        method: UpgradeMethod,
    ) -> ProvisionResult<UpgradeOutcome> {
        self.upgrade_called.store(true, Ordering::SeqCst);
        Ok(UpgradeOutcome {
            success: self.upgrade_success,
            result_code: if self.upgrade_success { 0 } else { 3 },
            detail: format!("mock upgrade via {}", method),
        })
    }
}

// ============================================
// HARNESS
// ============================================

fn test_config() -> ForgeConfig {
    ForgeConfig {
        max_attempts: 3,
        retry_delay_secs: 0,
        ..ForgeConfig::default()
    }
}

fn default_job() -> ProvisioningJob {
    ProvisioningJob {
        channel: builds::find_channel("24H2").unwrap(),
        edition: Edition::Professional,
        install: None,
    }
}

/// Run one job to its terminal state and hand back the report plus
/// every observed event.
fn run_job(
    tooling: &MockTooling,
    job: &ProvisioningJob,
    config: &ForgeConfig,
    cancel: &CancelToken,
    workspace_base: &Path,
) -> (PipelineReport, Vec<ProgressEvent>) {
    let (tx, rx) = mpsc::sync_channel(256);
    let mut sink = ProgressSink::new(tx);
    let report = pipeline::run_in(job, tooling, config, &mut sink, cancel, workspace_base);
    drop(sink);
    let events: Vec<ProgressEvent> = rx.iter().collect();
    (report, events)
}

/// The two event-stream invariants: stage order never goes backwards,
/// and percent never decreases within a stage.
fn assert_event_invariants(events: &[ProgressEvent]) {
    for pair in events.windows(2) {
        assert!(
            pair[0].stage.sequence_index() <= pair[1].stage.sequence_index(),
            "stage went backwards: {} after {}",
            pair[1].stage,
            pair[0].stage
        );
        if pair[0].stage == pair[1].stage {
            assert!(
                pair[0].percent <= pair[1].percent,
                "percent regressed within {}: {} -> {}",
                pair[0].stage,
                pair[0].percent,
                pair[1].percent
            );
        }
    }
}

/// No winforge workspace left behind under the base directory.
fn assert_no_workspace_left(base: &Path) {
    let leftovers: Vec<_> = std::fs::read_dir(base)
        .unwrap()
        .flatten()
        .map(|e| e.path())
        .collect();
    assert!(
        leftovers.is_empty(),
        "workspace leaked: {:?}",
        leftovers
    );
}

// ============================================
// SCENARIOS
// ============================================

#[test]
fn scenario_a_empty_catalog_falls_back_and_completes() {
    // Selection: "Windows 11 24H2 (Current Stable)" / Professional.
    // The catalog lists nothing, so the resolver falls back to the
    // deterministic 24H2 descriptor and the run still completes.
    let base = tempfile::tempdir().unwrap();
    let tooling = MockTooling::default();
    let cancel = CancelToken::new();

    let (report, events) = run_job(&tooling, &default_job(), &test_config(), &cancel, base.path());

    assert_eq!(report.final_stage, Stage::Completed);
    assert!(report.error.is_none());

    let descriptor = report.descriptor.as_ref().unwrap();
    assert_eq!(descriptor.id, "24H2_fallback");
    assert_eq!(descriptor.build, "26100.1");

    // Mount path non-empty, workspace retained (it backs the volume).
    assert_eq!(report.mounted_drive.as_deref(), Some("E:"));
    let workspace = report.workspace.as_ref().unwrap();
    assert!(workspace.exists());
    assert!(workspace.join("Windows_26100.1_Professional.iso").exists());

    // The image is still attached and Installing never ran.
    assert!(!tooling.dismounted.load(Ordering::SeqCst));
    assert!(!tooling.upgrade_called.load(Ordering::SeqCst));

    assert_event_invariants(&events);
    assert_eq!(events.last().unwrap().stage, Stage::Completed);
    assert!(events.iter().all(|e| e.stage != Stage::Installing));
}

#[test]
fn scenario_b_cancel_during_acquisition_cleans_up() {
    let base = tempfile::tempdir().unwrap();
    let cancel = CancelToken::new();
    let tooling = MockTooling {
        cancel_mid_acquire: Some(cancel.clone()),
        ..MockTooling::default()
    };

    let (report, events) = run_job(&tooling, &default_job(), &test_config(), &cancel, base.path());

    assert_eq!(report.final_stage, Stage::Cancelled);
    assert!(report.mounted_drive.is_none());
    assert!(report.workspace.is_none());
    assert_eq!(report.error.as_ref().unwrap().kind(), "CancelledByUser");

    // A cancelled attempt is never retried.
    assert_eq!(tooling.acquire_calls.load(Ordering::SeqCst), 1);

    // Workspace gone, nothing was ever mounted.
    assert_no_workspace_left(base.path());
    assert!(!tooling.dismounted.load(Ordering::SeqCst));

    assert_event_invariants(&events);
    assert_eq!(events.last().unwrap().stage, Stage::Cancelled);
}

#[test]
fn scenario_c_mount_failure_is_fatal_and_clean() {
    let base = tempfile::tempdir().unwrap();
    let cancel = CancelToken::new();
    let tooling = MockTooling {
        fail_mount: true,
        ..MockTooling::default()
    };
    // Install was requested — the job must still never reach it.
    let job = ProvisioningJob {
        install: Some(UpgradeMethod::Setup),
        ..default_job()
    };

    let (report, events) = run_job(&tooling, &job, &test_config(), &cancel, base.path());

    assert_eq!(report.final_stage, Stage::Failed);
    assert_eq!(report.error.as_ref().unwrap().kind(), "MountFailed");
    assert!(report.mounted_drive.is_none());

    assert!(!tooling.upgrade_called.load(Ordering::SeqCst));
    assert_no_workspace_left(base.path());

    assert_event_invariants(&events);
    assert_eq!(events.last().unwrap().stage, Stage::Failed);
    assert!(events.iter().all(|e| e.stage != Stage::Installing));
}

// ============================================
// RETRY BEHAVIOR
// ============================================

#[test]
fn transient_download_failures_are_retried_to_success() {
    let base = tempfile::tempdir().unwrap();
    let cancel = CancelToken::new();
    let tooling = MockTooling {
        acquire_failures_remaining: AtomicU32::new(2),
        ..MockTooling::default()
    };

    let (report, events) = run_job(&tooling, &default_job(), &test_config(), &cancel, base.path());

    assert_eq!(report.final_stage, Stage::Completed);
    // Two failures + one success within the 3-attempt bound.
    assert_eq!(tooling.acquire_calls.load(Ordering::SeqCst), 3);
    assert_event_invariants(&events);
}

#[test]
fn exhausted_retries_fail_the_job() {
    let base = tempfile::tempdir().unwrap();
    let cancel = CancelToken::new();
    let tooling = MockTooling {
        acquire_failures_remaining: AtomicU32::new(99),
        ..MockTooling::default()
    };
    let config = ForgeConfig {
        max_attempts: 2,
        retry_delay_secs: 0,
        ..ForgeConfig::default()
    };

    let (report, _events) = run_job(&tooling, &default_job(), &config, &cancel, base.path());

    assert_eq!(report.final_stage, Stage::Failed);
    assert_eq!(report.error.as_ref().unwrap().kind(), "DownloadFailed");
    assert_eq!(tooling.acquire_calls.load(Ordering::SeqCst), 2);
    assert_no_workspace_left(base.path());
}

// ============================================
// INSTALLING STAGE
// ============================================

#[test]
fn successful_install_keeps_the_image_mounted() {
    let base = tempfile::tempdir().unwrap();
    let cancel = CancelToken::new();
    let tooling = MockTooling::default();
    let job = ProvisioningJob {
        install: Some(UpgradeMethod::WindowsUpdate),
        ..default_job()
    };

    let (report, events) = run_job(&tooling, &job, &test_config(), &cancel, base.path());

    assert_eq!(report.final_stage, Stage::Completed);
    assert!(tooling.upgrade_called.load(Ordering::SeqCst));
    assert!(report.upgrade.as_ref().unwrap().success);

    // Setup/update still needs the volume — it must stay attached.
    assert!(!tooling.dismounted.load(Ordering::SeqCst));
    assert!(events.iter().any(|e| e.stage == Stage::Installing));
    assert_event_invariants(&events);
}

#[test]
fn failed_upgrade_dismounts_and_fails_the_job() {
    let base = tempfile::tempdir().unwrap();
    let cancel = CancelToken::new();
    let tooling = MockTooling {
        upgrade_success: false,
        ..MockTooling::default()
    };
    let job = ProvisioningJob {
        install: Some(UpgradeMethod::Setup),
        ..default_job()
    };

    let (report, _events) = run_job(&tooling, &job, &test_config(), &cancel, base.path());

    assert_eq!(report.final_stage, Stage::Failed);
    assert_eq!(report.error.as_ref().unwrap().kind(), "UpgradeFailed");

    // Teardown ran: volume detached, workspace removed.
    assert!(tooling.dismounted.load(Ordering::SeqCst));
    assert_no_workspace_left(base.path());
}

// ============================================
// CANCELLATION EDGES
// ============================================

#[test]
fn cancel_before_start_never_enters_a_stage() {
    let base = tempfile::tempdir().unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();
    let tooling = MockTooling::default();

    let (report, events) = run_job(&tooling, &default_job(), &test_config(), &cancel, base.path());

    assert_eq!(report.final_stage, Stage::Cancelled);
    assert_eq!(tooling.acquire_calls.load(Ordering::SeqCst), 0);
    assert!(events.iter().all(|e| e.stage == Stage::Cancelled));
    assert_no_workspace_left(base.path());
}

#[test]
fn cancellation_wins_over_pending_retries() {
    // The first acquisition attempt hits a transient failure AND the
    // user cancels; the retry wrapper must not run a second attempt.
    let base = tempfile::tempdir().unwrap();
    let cancel = CancelToken::new();
    let tooling = MockTooling {
        acquire_failures_remaining: AtomicU32::new(99),
        cancel_mid_acquire: Some(cancel.clone()),
        ..MockTooling::default()
    };

    let (report, _events) = run_job(&tooling, &default_job(), &test_config(), &cancel, base.path());

    assert_eq!(report.final_stage, Stage::Cancelled);
    assert_eq!(tooling.acquire_calls.load(Ordering::SeqCst), 1);
    assert_no_workspace_left(base.path());
}
