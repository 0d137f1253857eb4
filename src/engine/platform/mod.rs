//! Platform Detection and Support Module
//!
//! OS version lookup, write-access probing and the macOS post-install hooks

use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

/// Extended attribute macOS attaches to downloaded files.
pub const QUARANTINE_ATTRIBUTE: &str = "com.apple.quarantine";

/// Supported platforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    MacOS,
    Linux,
    Windows,
    Unknown,
}

impl Platform {
    /// Detect current platform
    pub fn current() -> Self {
        #[cfg(target_os = "macos")]
        return Platform::MacOS;

        #[cfg(target_os = "linux")]
        return Platform::Linux;

        #[cfg(target_os = "windows")]
        return Platform::Windows;

        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        return Platform::Unknown;
    }

    pub fn is_macos(&self) -> bool {
        matches!(self, Platform::MacOS)
    }

    /// Get platform-specific data directory for updater state
    pub fn data_dir(&self) -> Option<PathBuf> {
        match self {
            Platform::MacOS | Platform::Windows => {
                dirs::data_local_dir().map(|d| d.join("BundleUpdater"))
            }
            Platform::Linux => dirs::data_local_dir().map(|d| d.join("bundle-updater")),
            Platform::Unknown => None,
        }
    }
}

/// Version of the running operating system, e.g. "14.2.1" on macOS or the
/// kernel release on Linux. Falls back to "0" when it cannot be determined.
pub fn os_version() -> String {
    #[cfg(target_os = "macos")]
    {
        let output = std::process::Command::new("sw_vers")
            .arg("-productVersion")
            .output();
        if let Ok(output) = output {
            if output.status.success() {
                return String::from_utf8_lossy(&output.stdout).trim().to_string();
            }
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(release) = fs::read_to_string("/proc/sys/kernel/osrelease") {
            let release = release.trim();
            // "6.8.0-45-generic" -> "6.8.0"
            let numeric = release.split('-').next().unwrap_or(release);
            return numeric.to_string();
        }
    }

    "0".to_string()
}

/// Whether the current process can create entries in `dir`.
pub fn is_writable(dir: &Path) -> bool {
    let check = dir.join(format!(".bundle-updater-write-check-{}", std::process::id()));
    match OpenOptions::new().write(true).create_new(true).open(&check) {
        Ok(_) => {
            let _ = fs::remove_file(&check);
            true
        }
        Err(_) => false,
    }
}

/// macOS-specific utilities
pub mod macos {
    use std::io;
    use std::path::Path;

    use tokio::process::Command;

    /// Remove the quarantine attribute from a bundle, recursively.
    pub async fn clear_quarantine(bundle: &Path) -> io::Result<()> {
        if !cfg!(target_os = "macos") {
            return Ok(());
        }
        let status = Command::new("xattr")
            .args(["-dr", super::QUARANTINE_ATTRIBUTE])
            .arg(bundle)
            .status()
            .await?;
        check_status("xattr", status)
    }

    /// Ask Spotlight / Launch Services to re-index the bundle.
    pub async fn refresh_index(bundle: &Path) -> io::Result<()> {
        if !cfg!(target_os = "macos") {
            return Ok(());
        }
        let status = Command::new("mdimport").arg(bundle).status().await?;
        check_status("mdimport", status)
    }

    fn check_status(tool: &str, status: std::process::ExitStatus) -> io::Result<()> {
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} exited with {}", tool, status),
            ))
        }
    }
}
