// ============================================
// pipeline.rs - The provisioning pipeline
// ============================================
// One job = one linear run through the stages:
//
//   Idle -> FetchingMetadata -> AcquiringPayload -> AssemblingImage
//        -> MountingImage -> (optional) Installing -> Completed
//
// with two absorbing states: Cancelled (cooperative, reachable from
// any non-terminal state) and Failed (carrying an error kind).
//
// The worker owns the run; the observer owns the receiving end of a
// bounded ProgressEvent channel and the CancelToken. The token is the
// only shared mutable state — written with release ordering, read with
// acquire ordering at every stage boundary and inside long downloads.
//
// Cleanup is guard-based: the workspace directory and the mounted
// image release themselves on drop, so every exit path — error,
// cancellation, panic — tears down without leaking a mounted volume
// or a temp directory. A completed run is the one exception: its
// image stays mounted (that is the product), so the backing workspace
// is persisted too.
// ============================================

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;

use uuid::Uuid;

use crate::builds::{BuildDescriptor, Channel, Edition};
use crate::config::ForgeConfig;
use crate::error::{ProvisionError, ProvisionResult};
use crate::image::MountedImage;
use crate::retry::with_retry;
use crate::upgrade::{UpgradeMethod, UpgradeOutcome};

// ============================================
// STAGES
// ============================================

/// Pipeline states. Forward stages advance strictly left to right;
/// Cancelled and Failed absorb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Idle,
    FetchingMetadata,
    AcquiringPayload,
    AssemblingImage,
    MountingImage,
    Installing,
    Completed,
    Cancelled,
    Failed,
}

impl Stage {
    /// Position in the fixed stage order. Progress events must never
    /// move backwards along this index.
    pub fn sequence_index(&self) -> u8 {
        match self {
            Stage::Idle => 0,
            Stage::FetchingMetadata => 1,
            Stage::AcquiringPayload => 2,
            Stage::AssemblingImage => 3,
            Stage::MountingImage => 4,
            Stage::Installing => 5,
            Stage::Completed => 6,
            Stage::Cancelled => 7,
            Stage::Failed => 8,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Cancelled | Stage::Failed)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Idle => "Idle",
            Stage::FetchingMetadata => "FetchingMetadata",
            Stage::AcquiringPayload => "AcquiringPayload",
            Stage::AssemblingImage => "AssemblingImage",
            Stage::MountingImage => "MountingImage",
            Stage::Installing => "Installing",
            Stage::Completed => "Completed",
            Stage::Cancelled => "Cancelled",
            Stage::Failed => "Failed",
        };
        f.write_str(name)
    }
}

// ============================================
// PROGRESS EVENTS
// ============================================

/// The one message type flowing from the worker to the observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub stage: Stage,
    /// 0-100, non-decreasing within a stage
    pub percent: u8,
    pub message: String,
}

/// Worker-side handle on the event channel. Enforces the event
/// invariants at the source: percent is clamped non-decreasing within
/// the current stage and resets only on a stage transition.
///
/// A gone observer (dropped receiver) is not an error — the run keeps
/// going and events fall on the floor.
pub struct ProgressSink {
    sender: Option<SyncSender<ProgressEvent>>,
    stage: Stage,
    last_percent: u8,
}

impl ProgressSink {
    pub fn new(sender: SyncSender<ProgressEvent>) -> Self {
        ProgressSink {
            sender: Some(sender),
            stage: Stage::Idle,
            last_percent: 0,
        }
    }

    /// A sink that reports to nobody (assemble-and-forget callers).
    pub fn discard() -> Self {
        ProgressSink {
            sender: None,
            stage: Stage::Idle,
            last_percent: 0,
        }
    }

    /// Enter a stage: percent restarts at 0.
    pub fn begin(&mut self, stage: Stage, message: impl Into<String>) {
        self.stage = stage;
        self.last_percent = 0;
        self.send(0, message.into());
    }

    /// Report progress within the current stage.
    pub fn progress(&mut self, percent: u8, message: impl Into<String>) {
        let clamped = percent.min(100).max(self.last_percent);
        self.last_percent = clamped;
        self.send(clamped, message.into());
    }

    pub fn current_stage(&self) -> Stage {
        self.stage
    }

    fn send(&mut self, percent: u8, message: String) {
        if let Some(sender) = &self.sender {
            let event = ProgressEvent {
                stage: self.stage,
                percent,
                message,
            };
            if sender.send(event).is_err() {
                // Observer went away; stop trying.
                self.sender = None;
            }
        }
    }
}

// ============================================
// CANCELLATION
// ============================================

/// Cooperative cancellation flag shared between observer and worker.
/// The observer calls cancel(); the worker polls at stage boundaries
/// and inside long-running operations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Stage-boundary check: errors with Cancelled when the flag is up.
    pub fn checkpoint(&self) -> ProvisionResult<()> {
        if self.is_cancelled() {
            Err(ProvisionError::Cancelled)
        } else {
            Ok(())
        }
    }
}

// ============================================
// WORKSPACE
// ============================================

/// Scratch directory exclusively owned by one job. The UUID suffix
/// guarantees no two jobs ever share one. Removed on drop unless the
/// job completed with its image still mounted (the ISO inside backs
/// the mounted volume).
pub struct Workspace {
    root: PathBuf,
    keep: bool,
}

impl Workspace {
    /// Create a fresh workspace under the system temp directory.
    pub fn create() -> ProvisionResult<Self> {
        Self::create_in(&std::env::temp_dir())
    }

    /// Create a fresh workspace under an explicit base directory.
    pub fn create_in(base: &Path) -> ProvisionResult<Self> {
        let root = base.join(format!("winforge-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&root)
            .map_err(|e| ProvisionError::Workspace(format!("create {}: {}", root.display(), e)))?;
        println!("[Pipeline] workspace {}", root.display());
        Ok(Workspace { root, keep: false })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Keep the directory on disk and return its path.
    pub fn persist(mut self) -> PathBuf {
        self.keep = true;
        self.root.clone()
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.keep {
            if let Err(e) = std::fs::remove_dir_all(&self.root) {
                if self.root.exists() {
                    eprintln!(
                        "[Pipeline] could not remove workspace {}: {}",
                        self.root.display(),
                        e
                    );
                }
            }
        }
    }
}

// ============================================
// TOOLING SEAM
// ============================================

/// Every external effect the pipeline performs, behind one seam.
/// Production uses SystemTooling (catalog API, aria2c, converter,
/// PowerShell); tests substitute a mock and drive the pure state
/// machine.
pub trait Tooling {
    /// Resolve a channel to a build. Infallible by contract: transport
    /// failure yields the fallback descriptor.
    fn resolve_build(&self, channel: &Channel) -> BuildDescriptor;

    /// Download the payload file set into the workspace.
    fn acquire_payload(
        &self,
        descriptor: &BuildDescriptor,
        edition: Edition,
        workspace: &Path,
        cancel: &CancelToken,
        progress: &mut dyn FnMut(u8),
    ) -> ProvisionResult<()>;

    /// Convert the payload into exactly one image file.
    fn assemble_image(
        &self,
        descriptor: &BuildDescriptor,
        edition: Edition,
        workspace: &Path,
    ) -> ProvisionResult<PathBuf>;

    /// Mount the image, yielding the self-dismounting guard.
    fn mount_image(&self, iso_path: &Path) -> ProvisionResult<MountedImage>;

    /// Hand the mounted image to the upgrade mechanism.
    fn trigger_upgrade(
        &self,
        mounted: &MountedImage,
        method: UpgradeMethod,
    ) -> ProvisionResult<UpgradeOutcome>;
}

/// The production tooling: real catalog, real subprocesses.
pub struct SystemTooling<'a> {
    config: &'a ForgeConfig,
}

impl<'a> SystemTooling<'a> {
    pub fn new(config: &'a ForgeConfig) -> Self {
        SystemTooling { config }
    }
}

impl Tooling for SystemTooling<'_> {
    fn resolve_build(&self, channel: &Channel) -> BuildDescriptor {
        match crate::builds::BuildResolver::new(self.config) {
            Ok(resolver) => resolver.resolve(channel),
            Err(err) => {
                eprintln!("[Resolver] warning: {} — using fallback", err);
                crate::builds::fallback_descriptor(channel)
            }
        }
    }

    fn acquire_payload(
        &self,
        descriptor: &BuildDescriptor,
        edition: Edition,
        workspace: &Path,
        cancel: &CancelToken,
        progress: &mut dyn FnMut(u8),
    ) -> ProvisionResult<()> {
        crate::acquire::acquire_payload(self.config, descriptor, edition, workspace, cancel, progress)
    }

    fn assemble_image(
        &self,
        descriptor: &BuildDescriptor,
        edition: Edition,
        workspace: &Path,
    ) -> ProvisionResult<PathBuf> {
        crate::image::assemble_image(self.config, workspace, descriptor, edition)
    }

    fn mount_image(&self, iso_path: &Path) -> ProvisionResult<MountedImage> {
        crate::image::mount_image(iso_path)
    }

    fn trigger_upgrade(
        &self,
        mounted: &MountedImage,
        method: UpgradeMethod,
    ) -> ProvisionResult<UpgradeOutcome> {
        crate::upgrade::trigger_upgrade(mounted, method)
    }
}

// ============================================
// JOB AND REPORT
// ============================================

/// One user-initiated provisioning run.
#[derive(Debug, Clone)]
pub struct ProvisioningJob {
    pub channel: &'static Channel,
    pub edition: Edition,
    /// When set, the Installing stage runs with this method.
    pub install: Option<UpgradeMethod>,
}

/// Where the run ended and what it left behind.
#[derive(Debug)]
pub struct PipelineReport {
    /// Completed, Cancelled, or Failed
    pub final_stage: Stage,
    pub descriptor: Option<BuildDescriptor>,
    /// Drive designator of the still-mounted image (Completed only)
    pub mounted_drive: Option<String>,
    /// Retained workspace backing the mounted image (Completed only)
    pub workspace: Option<PathBuf>,
    /// Upgrade trigger result, when the Installing stage ran
    pub upgrade: Option<UpgradeOutcome>,
    pub error: Option<ProvisionError>,
}

// ============================================
// THE RUN
// ============================================

/// Execute one job start to finish on the calling thread. The caller
/// decides where that thread lives (the CLI spawns a worker and keeps
/// the receiving end of `events`).
pub fn run(
    job: &ProvisioningJob,
    tooling: &dyn Tooling,
    config: &ForgeConfig,
    mut events: ProgressSink,
    cancel: &CancelToken,
) -> PipelineReport {
    run_in(job, tooling, config, &mut events, cancel, &std::env::temp_dir())
}

/// Like run(), with an explicit workspace base directory. Split out so
/// tests can place workspaces somewhere observable.
pub fn run_in(
    job: &ProvisioningJob,
    tooling: &dyn Tooling,
    config: &ForgeConfig,
    events: &mut ProgressSink,
    cancel: &CancelToken,
    workspace_base: &Path,
) -> PipelineReport {
    match advance(job, tooling, config, events, cancel, workspace_base) {
        Ok(success) => {
            events.begin(
                Stage::Completed,
                format!("image ready at {}", success.mounted_drive),
            );
            events.progress(100, "done");
            PipelineReport {
                final_stage: Stage::Completed,
                descriptor: Some(success.descriptor),
                mounted_drive: Some(success.mounted_drive),
                workspace: Some(success.workspace),
                upgrade: success.upgrade,
                error: None,
            }
        }
        Err(ProvisionError::Cancelled) => {
            events.begin(Stage::Cancelled, "cancelled by user — cleaned up");
            PipelineReport {
                final_stage: Stage::Cancelled,
                descriptor: None,
                mounted_drive: None,
                workspace: None,
                upgrade: None,
                error: Some(ProvisionError::Cancelled),
            }
        }
        Err(err) => {
            events.begin(Stage::Failed, format!("{}: {}", err.kind(), err));
            PipelineReport {
                final_stage: Stage::Failed,
                descriptor: None,
                mounted_drive: None,
                workspace: None,
                upgrade: None,
                error: Some(err),
            }
        }
    }
}

/// What a completed run hands back to the report.
struct RunSuccess {
    descriptor: BuildDescriptor,
    mounted_drive: String,
    workspace: PathBuf,
    upgrade: Option<UpgradeOutcome>,
}

/// The forward path. Any Err unwinds through the guards: a mounted
/// image dismounts, the workspace is deleted. Declaration order
/// matters — `mounted` is declared after `workspace`, so it drops
/// (dismounts) first.
fn advance(
    job: &ProvisioningJob,
    tooling: &dyn Tooling,
    config: &ForgeConfig,
    events: &mut ProgressSink,
    cancel: &CancelToken,
    workspace_base: &Path,
) -> ProvisionResult<RunSuccess> {
    // --- FetchingMetadata ---
    cancel.checkpoint()?;
    events.begin(
        Stage::FetchingMetadata,
        format!("resolving {} / {}", job.channel.label, job.edition),
    );
    let descriptor = tooling.resolve_build(job.channel);
    events.progress(
        100,
        format!("build {} ({})", descriptor.title, descriptor.build),
    );

    // --- AcquiringPayload ---
    cancel.checkpoint()?;
    let workspace = Workspace::create_in(workspace_base)?;
    events.begin(Stage::AcquiringPayload, "downloading payload");
    with_retry("payload acquisition", config.backoff(), || {
        cancel.checkpoint()?;
        tooling.acquire_payload(
            &descriptor,
            job.edition,
            workspace.path(),
            cancel,
            &mut |percent| events.progress(percent, "downloading payload"),
        )
    })?;
    events.progress(100, "payload complete");

    // --- AssemblingImage ---
    cancel.checkpoint()?;
    events.begin(Stage::AssemblingImage, "converting payload to image");
    let iso_path = with_retry("image assembly", config.backoff(), || {
        cancel.checkpoint()?;
        tooling.assemble_image(&descriptor, job.edition, workspace.path())
    })?;
    events.progress(100, format!("image at {}", iso_path.display()));

    // --- MountingImage --- (never retried)
    cancel.checkpoint()?;
    events.begin(Stage::MountingImage, "mounting image");
    let mounted = tooling.mount_image(&iso_path)?;
    events.progress(100, format!("mounted at {}", mounted.drive()));

    // --- Installing --- (optional, never retried)
    let upgrade = match job.install {
        Some(method) => {
            cancel.checkpoint()?;
            events.begin(Stage::Installing, format!("upgrade via {}", method));
            let outcome = tooling.trigger_upgrade(&mounted, method)?;
            if !outcome.success {
                return Err(ProvisionError::UpgradeFailed(outcome.detail));
            }
            events.progress(100, outcome.detail.clone());
            Some(outcome)
        }
        None => None,
    };

    // Success: the mounted volume is the deliverable. Leave it attached
    // and keep the workspace that backs it.
    let mounted_drive = mounted.detach();
    let workspace = workspace.persist();

    Ok(RunSuccess {
        descriptor,
        mounted_drive,
        workspace,
        upgrade,
    })
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_cancel_token_flag_and_checkpoint() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.checkpoint().is_ok());

        let observer_side = token.clone();
        observer_side.cancel();

        assert!(token.is_cancelled());
        assert_eq!(token.checkpoint().unwrap_err().kind(), "CancelledByUser");
    }

    #[test]
    fn test_workspace_removed_on_drop() {
        let base = tempfile::tempdir().unwrap();
        let path;
        {
            let workspace = Workspace::create_in(base.path()).unwrap();
            path = workspace.path().to_path_buf();
            assert!(path.exists());
            std::fs::write(path.join("partial.esd"), "data").unwrap();
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_workspace_persist_survives_drop() {
        let base = tempfile::tempdir().unwrap();
        let workspace = Workspace::create_in(base.path()).unwrap();
        let path = workspace.persist();
        assert!(path.exists());
    }

    #[test]
    fn test_workspaces_never_collide() {
        let base = tempfile::tempdir().unwrap();
        let a = Workspace::create_in(base.path()).unwrap();
        let b = Workspace::create_in(base.path()).unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn test_progress_sink_clamps_within_stage() {
        let (tx, rx) = mpsc::sync_channel(16);
        let mut sink = ProgressSink::new(tx);

        sink.begin(Stage::AcquiringPayload, "start");
        sink.progress(40, "a");
        sink.progress(30, "regression is clamped");
        sink.progress(90, "b");
        sink.progress(200, "overflow is clamped");
        drop(sink);

        let percents: Vec<u8> = rx.iter().map(|e| e.percent).collect();
        assert_eq!(percents, vec![0, 40, 40, 90, 100]);
    }

    #[test]
    fn test_progress_sink_resets_on_stage_change() {
        let (tx, rx) = mpsc::sync_channel(16);
        let mut sink = ProgressSink::new(tx);

        sink.begin(Stage::AcquiringPayload, "start");
        sink.progress(80, "");
        sink.begin(Stage::AssemblingImage, "next stage");
        sink.progress(10, "");
        drop(sink);

        let events: Vec<ProgressEvent> = rx.iter().collect();
        assert_eq!(events[2].stage, Stage::AssemblingImage);
        assert_eq!(events[2].percent, 0);
        assert_eq!(events[3].percent, 10);
    }

    #[test]
    fn test_progress_sink_survives_gone_observer() {
        let (tx, rx) = mpsc::sync_channel(1);
        drop(rx);
        let mut sink = ProgressSink::new(tx);
        // Must not panic or block.
        sink.begin(Stage::FetchingMetadata, "observer already gone");
        sink.progress(50, "still fine");
    }

    #[test]
    fn test_stage_order_is_fixed() {
        let forward = [
            Stage::Idle,
            Stage::FetchingMetadata,
            Stage::AcquiringPayload,
            Stage::AssemblingImage,
            Stage::MountingImage,
            Stage::Installing,
            Stage::Completed,
        ];
        for pair in forward.windows(2) {
            assert!(pair[0].sequence_index() < pair[1].sequence_index());
        }
        assert!(Stage::Completed.is_terminal());
        assert!(Stage::Cancelled.is_terminal());
        assert!(Stage::Failed.is_terminal());
        assert!(!Stage::MountingImage.is_terminal());
    }
}
