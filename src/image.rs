// ============================================
// image.rs - Image assembly and mounting
// ============================================
// This module handles:
//   1. Driving the external UUP-to-ISO converter over the workspace
//   2. Locating the produced image file
//   3. Mounting the image via PowerShell (built into Windows 8+)
//   4. Dismounting, wrapped in a guard so no exit path leaks a volume
//
// The converter and the mount utility are external collaborators; all
// we own is argument construction and output parsing.
// ============================================

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::builds::{BuildDescriptor, Edition};
use crate::config::ForgeConfig;
use crate::error::{ProvisionError, ProvisionResult};

// ============================================
// ASSEMBLY
// ============================================

/// Run the converter script over a downloaded payload directory.
/// Produces exactly one .iso in the workspace and returns its path.
///
/// Fetching the converter is a transient (retryable) failure; a
/// non-zero converter exit or a missing output image is fatal.
pub fn assemble_image(
    config: &ForgeConfig,
    workspace: &Path,
    descriptor: &BuildDescriptor,
    edition: Edition,
) -> ProvisionResult<PathBuf> {
    let script = crate::tools::ensure_converter(config)?;

    println!(
        "[Image] assembling {} {} from {}",
        descriptor.build,
        edition,
        workspace.display()
    );

    let output = Command::new("bash")
        .arg(&script)
        .arg("-i")
        .arg(workspace)
        .arg("-o")
        .arg(workspace)
        .arg("-e")
        .arg(edition.as_str())
        .output()
        .map_err(|e| ProvisionError::AssemblyFailed(format!("launch converter: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProvisionError::AssemblyFailed(format!(
            "converter exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let iso = find_image(workspace)?;
    println!("[Image] assembled {}", iso.display());
    Ok(iso)
}

/// Find the image file the converter produced. The converter contract
/// is one image per run; if several are present the first in directory
/// order is taken.
pub fn find_image(dir: &Path) -> ProvisionResult<PathBuf> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| ProvisionError::AssemblyFailed(format!("read {}: {}", dir.display(), e)))?;

    for entry in entries.flatten() {
        let path = entry.path();
        let is_iso = path
            .extension()
            .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("iso"))
            .unwrap_or(false);
        if is_iso {
            return Ok(path);
        }
    }

    Err(ProvisionError::AssemblyFailed(format!(
        "converter produced no image in {}",
        dir.display()
    )))
}

// ============================================
// MOUNTED IMAGE GUARD
// ============================================

/// A mounted image volume. Dismounts itself when dropped unless
/// explicitly detached — a failed or cancelled job can never leave the
/// volume attached by accident.
pub struct MountedImage {
    drive: String,
    iso_path: PathBuf,
    dismounter: Option<Box<dyn FnOnce(&Path) + Send>>,
}

impl MountedImage {
    /// Wrap a freshly mounted volume. `dismounter` receives the image
    /// path and performs the actual dismount.
    pub fn new(
        drive: String,
        iso_path: PathBuf,
        dismounter: Box<dyn FnOnce(&Path) + Send>,
    ) -> Self {
        MountedImage {
            drive,
            iso_path,
            dismounter: Some(dismounter),
        }
    }

    /// Drive designator, e.g. "E:".
    pub fn drive(&self) -> &str {
        &self.drive
    }

    /// Root path of the mounted volume, e.g. "E:\".
    pub fn drive_root(&self) -> PathBuf {
        PathBuf::from(format!("{}\\", self.drive))
    }

    pub fn iso_path(&self) -> &Path {
        &self.iso_path
    }

    /// Leave the volume mounted (completed runs hand the drive to the
    /// user or to a running setup). Returns the drive designator.
    pub fn detach(mut self) -> String {
        self.dismounter = None;
        self.drive.clone()
    }

    /// Dismount now. Dropping has the same effect; this form exists for
    /// the explicit teardown path.
    pub fn dismount(mut self) {
        if let Some(dismounter) = self.dismounter.take() {
            dismounter(&self.iso_path);
        }
    }
}

impl Drop for MountedImage {
    fn drop(&mut self) {
        if let Some(dismounter) = self.dismounter.take() {
            println!("[Image] dismounting {}", self.iso_path.display());
            dismounter(&self.iso_path);
        }
    }
}

impl std::fmt::Debug for MountedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountedImage")
            .field("drive", &self.drive)
            .field("iso_path", &self.iso_path)
            .field("attached", &self.dismounter.is_some())
            .finish()
    }
}

// ============================================
// MOUNT / DISMOUNT
// ============================================

/// Parse the drive letter out of the mount command's output.
/// PowerShell prints the bare letter (possibly with blank lines around
/// it); anything without a letter means the mount gave us no volume.
pub fn parse_drive_letter(output: &str) -> Option<char> {
    output
        .chars()
        .find(|c| c.is_ascii_alphabetic())
        .map(|c| c.to_ascii_uppercase())
}

/// Mount an image file and return the guard holding its drive letter.
#[cfg(windows)]
pub fn mount_image(iso_path: &Path) -> ProvisionResult<MountedImage> {
    println!("[Image] mounting {}", iso_path.display());

    let output = Command::new("powershell")
        .arg("-NoProfile")
        .arg("-Command")
        .arg(format!(
            "(Mount-DiskImage -ImagePath '{}' -PassThru | Get-Volume).DriveLetter",
            iso_path.display()
        ))
        .output()
        .map_err(|e| ProvisionError::MountFailed(format!("launch powershell: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProvisionError::MountFailed(stderr.trim().to_string()));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let letter = parse_drive_letter(&stdout).ok_or_else(|| {
        ProvisionError::MountFailed("image mounted but no drive letter assigned".into())
    })?;

    let drive = format!("{}:", letter);
    println!("[Image] mounted at {}", drive);

    Ok(MountedImage::new(
        drive,
        iso_path.to_path_buf(),
        Box::new(|iso: &Path| dismount_image(iso)),
    ))
}

#[cfg(not(windows))]
pub fn mount_image(_iso_path: &Path) -> ProvisionResult<MountedImage> {
    Err(ProvisionError::MountFailed(
        "image mounting requires Windows".into(),
    ))
}

/// Dismount a previously mounted image. Best-effort: teardown paths
/// must not fail because the volume was already gone.
pub fn dismount_image(iso_path: &Path) {
    #[cfg(windows)]
    {
        let result = Command::new("powershell")
            .arg("-NoProfile")
            .arg("-Command")
            .arg(format!(
                "Dismount-DiskImage -ImagePath '{}'",
                iso_path.display()
            ))
            .output();

        match result {
            Ok(output) if output.status.success() => {
                println!("[Image] dismounted {}", iso_path.display());
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                eprintln!(
                    "[Image] dismount of {} failed: {}",
                    iso_path.display(),
                    stderr.trim()
                );
            }
            Err(e) => {
                eprintln!("[Image] dismount of {} failed: {}", iso_path.display(), e);
            }
        }
    }

    #[cfg(not(windows))]
    {
        eprintln!(
            "[Image] dismount of {} skipped: not on Windows",
            iso_path.display()
        );
    }
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_parse_drive_letter() {
        assert_eq!(parse_drive_letter("E"), Some('E'));
        assert_eq!(parse_drive_letter("\r\ne\r\n"), Some('E'));
        assert_eq!(parse_drive_letter("  F  "), Some('F'));
        assert_eq!(parse_drive_letter(""), None);
        assert_eq!(parse_drive_letter("\r\n\r\n"), None);
        assert_eq!(parse_drive_letter("42"), None);
    }

    #[test]
    fn test_find_image_picks_iso() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("files.txt"), "x").unwrap();
        std::fs::write(dir.path().join("Windows_26100.1_Professional.iso"), "stub").unwrap();

        let iso = find_image(dir.path()).unwrap();
        assert_eq!(
            iso.file_name().unwrap().to_string_lossy(),
            "Windows_26100.1_Professional.iso"
        );
    }

    #[test]
    fn test_find_image_case_insensitive_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("IMAGE.ISO"), "stub").unwrap();
        assert!(find_image(dir.path()).is_ok());
    }

    #[test]
    fn test_find_image_empty_dir_is_assembly_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = find_image(dir.path()).unwrap_err();
        assert_eq!(err.kind(), "AssemblyFailed");
        assert!(!err.is_transient());
    }

    #[test]
    fn test_mounted_image_dismounts_on_drop() {
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();

        let mounted = MountedImage::new(
            "E:".into(),
            PathBuf::from("test.iso"),
            Box::new(move |_: &Path| flag.store(true, Ordering::SeqCst)),
        );
        assert_eq!(mounted.drive(), "E:");
        drop(mounted);

        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn test_mounted_image_detach_skips_dismount() {
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();

        let mounted = MountedImage::new(
            "E:".into(),
            PathBuf::from("test.iso"),
            Box::new(move |_: &Path| flag.store(true, Ordering::SeqCst)),
        );
        let drive = mounted.detach();

        assert_eq!(drive, "E:");
        assert!(!called.load(Ordering::SeqCst));
    }

    #[test]
    fn test_mounted_image_explicit_dismount_runs_once() {
        let count = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = count.clone();

        let mounted = MountedImage::new(
            "E:".into(),
            PathBuf::from("test.iso"),
            Box::new(move |_: &Path| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        mounted.dismount();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drive_root_format() {
        let mounted = MountedImage::new("E:".into(), PathBuf::from("x.iso"), Box::new(|_: &Path| {}));
        assert_eq!(mounted.drive_root(), PathBuf::from("E:\\"));
        let _ = mounted.detach();
    }
}
