// ============================================
// upgrade.rs - In-place upgrade trigger
// ============================================
// The pipeline's last stage hands a still-mounted image to one of two
// external upgrade mechanisms:
//
//   Setup        — launch <drive>:\setup.exe /auto upgrade and let
//                  Windows Setup take over (it keeps running after we
//                  exit, which is why the image stays mounted).
//   WindowsUpdate — drive the Microsoft.Update.Session COM interface
//                  through a PowerShell one-shot: search, download,
//                  install.
//
// Contract with the pipeline: valid mounted path in, status code out.
// We do not interpret upgrade result codes beyond success/non-success.
// ============================================

use std::path::Path;
#[cfg(windows)]
use std::process::Command;
use std::str::FromStr;

use crate::error::{ProvisionError, ProvisionResult};
use crate::image::MountedImage;

// ============================================
// METHOD SELECTION
// ============================================

/// Which mechanism performs the in-place upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeMethod {
    /// Launch the image's setup.exe with unattended-upgrade flags
    Setup,
    /// Windows Update orchestration via the COM session
    WindowsUpdate,
}

impl UpgradeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpgradeMethod::Setup => "setup",
            UpgradeMethod::WindowsUpdate => "windows-update",
        }
    }
}

impl std::fmt::Display for UpgradeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpgradeMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "setup" => Ok(UpgradeMethod::Setup),
            "windows-update" | "windowsupdate" | "wu" => Ok(UpgradeMethod::WindowsUpdate),
            other => Err(format!(
                "unknown upgrade method '{}' (expected 'setup' or 'windows-update')",
                other
            )),
        }
    }
}

// ============================================
// OUTCOME
// ============================================

/// What the external upgrade mechanism reported back. The code is
/// surfaced verbatim for display; only `success` is interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeOutcome {
    pub success: bool,
    pub result_code: i32,
    pub detail: String,
}

// ============================================
// TRIGGER
// ============================================

/// Run the selected upgrade mechanism against a mounted image.
pub fn trigger_upgrade(
    mounted: &MountedImage,
    method: UpgradeMethod,
) -> ProvisionResult<UpgradeOutcome> {
    match method {
        UpgradeMethod::Setup => launch_setup(&mounted.drive_root()),
        UpgradeMethod::WindowsUpdate => run_windows_update(&mounted.drive_root()),
    }
}

/// Launch setup.exe from the mounted image for an unattended upgrade.
/// Setup runs on long after we return, so this only reports whether
/// the launch itself worked.
#[cfg(windows)]
pub fn launch_setup(mount_root: &Path) -> ProvisionResult<UpgradeOutcome> {
    let setup_exe = mount_root.join("setup.exe");
    if !setup_exe.exists() {
        return Err(ProvisionError::UpgradeFailed(format!(
            "no setup.exe at {}",
            mount_root.display()
        )));
    }

    println!("[Upgrade] launching {} /auto upgrade", setup_exe.display());

    Command::new(&setup_exe)
        .arg("/auto")
        .arg("upgrade")
        .current_dir(mount_root)
        .spawn()
        .map_err(|e| ProvisionError::UpgradeFailed(format!("launch setup.exe: {}", e)))?;

    Ok(UpgradeOutcome {
        success: true,
        result_code: 0,
        detail: format!("setup started from {}", mount_root.display()),
    })
}

#[cfg(not(windows))]
pub fn launch_setup(_mount_root: &Path) -> ProvisionResult<UpgradeOutcome> {
    Err(ProvisionError::UpgradeFailed(
        "setup launch requires Windows".into(),
    ))
}

/// PowerShell one-shot over the Windows Update COM session. Exits 0 on
/// a clean install result, the raw ResultCode otherwise.
#[cfg(windows)]
const WINDOWS_UPDATE_SCRIPT: &str = r#"
$session = New-Object -ComObject Microsoft.Update.Session
$searcher = $session.CreateUpdateSearcher()
$results = $searcher.Search("IsInstalled=0 and Type='Software'")
if ($results.Updates.Count -eq 0) { exit 0 }
$collection = New-Object -ComObject Microsoft.Update.UpdateColl
foreach ($update in $results.Updates) { [void]$collection.Add($update) }
$downloader = $session.CreateUpdateDownloader()
$downloader.Updates = $collection
[void]$downloader.Download()
$installer = $session.CreateUpdateInstaller()
$installer.Updates = $collection
$result = $installer.Install()
if ($result.ResultCode -eq 2) { exit 0 } else { exit $result.ResultCode }
"#;

/// Run the Windows Update session scoped at the mounted image. Blocks
/// until the install pass finishes — this can take a long while.
#[cfg(windows)]
pub fn run_windows_update(mount_root: &Path) -> ProvisionResult<UpgradeOutcome> {
    println!(
        "[Upgrade] starting Windows Update session for {}",
        mount_root.display()
    );

    let output = Command::new("powershell")
        .arg("-NoProfile")
        .arg("-Command")
        .arg(WINDOWS_UPDATE_SCRIPT)
        .current_dir(mount_root)
        .output()
        .map_err(|e| ProvisionError::UpgradeFailed(format!("launch powershell: {}", e)))?;

    let code = output.status.code().unwrap_or(-1);
    let outcome = UpgradeOutcome {
        success: output.status.success(),
        result_code: code,
        detail: format!("Windows Update session finished with result code {}", code),
    };
    println!("[Upgrade] {}", outcome.detail);
    Ok(outcome)
}

#[cfg(not(windows))]
pub fn run_windows_update(_mount_root: &Path) -> ProvisionResult<UpgradeOutcome> {
    Err(ProvisionError::UpgradeFailed(
        "Windows Update orchestration requires Windows".into(),
    ))
}

// ============================================
// TESTS
// ============================================
