//! Platform service - OS-specific queries behind a narrow contract
//!
//! Everything the core needs to know about the host lives here: OS/arch
//! tags used in download URLs, executable extensions, PID liveness,
//! signal-escalated termination, tool discovery, and best-effort clipboard
//! access. All methods return explicit results; expected conditions
//! (missing tool, already-gone process) are never surfaced as errors.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::domain::errors::{SpinError, SpinResult};

/// Operating system tag as used in archive URLs and install directory names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsTag {
    Darwin,
    Linux,
    Win32,
}

impl OsTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Darwin => "darwin",
            Self::Linux => "linux",
            Self::Win32 => "win32",
        }
    }
}

/// CPU architecture tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchTag {
    Arm64,
    X64,
}

impl ArchTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Arm64 => "arm64",
            Self::X64 => "x64",
        }
    }
}

/// Detected host platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub os: OsTag,
    pub arch: ArchTag,
}

/// Outcome of a termination request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// Process no longer exists (includes "was already gone")
    Gone,
    /// Signal delivered; process may still be shutting down
    Pending,
}

/// Host platform queries and process plumbing
#[derive(Debug, Clone)]
pub struct PlatformService {
    info: PlatformInfo,
    /// Extra directories searched by `find_tool` before PATH
    tool_dirs: Vec<PathBuf>,
}

impl Default for PlatformService {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformService {
    pub fn new() -> Self {
        Self { info: detect_platform(), tool_dirs: default_tool_dirs() }
    }

    /// Platform with extra tool search directories (bundled binary dirs)
    pub fn with_tool_dirs(tool_dirs: Vec<PathBuf>) -> Self {
        let mut dirs = tool_dirs;
        dirs.extend(default_tool_dirs());
        Self { info: detect_platform(), tool_dirs: dirs }
    }

    pub fn info(&self) -> PlatformInfo {
        self.info
    }

    /// Executable suffix: empty on POSIX, `.exe` on Windows
    pub fn exec_ext(&self) -> &'static str {
        if self.info.os == OsTag::Win32 { ".exe" } else { "" }
    }

    /// Whether a PID refers to a live process. Signal-0 on POSIX, process
    /// enumeration on Windows.
    pub async fn is_process_alive(&self, pid: u32) -> bool {
        if self.info.os == OsTag::Win32 {
            let output = Command::new("tasklist")
                .args(["/FI", &format!("PID eq {pid}"), "/NH", "/FO", "CSV"])
                .output()
                .await;
            match output {
                Ok(out) => String::from_utf8_lossy(&out.stdout).contains(&format!("\"{pid}\"")),
                Err(_) => false,
            }
        } else {
            matches!(
                Command::new("kill").args(["-0", &pid.to_string()]).output().await,
                Ok(out) if out.status.success()
            )
        }
    }

    /// Terminate a process with signal escalation.
    ///
    /// POSIX: SIGTERM, then after `grace` SIGKILL. Windows: graceful
    /// `taskkill`, then `taskkill /F`. A PID that is already gone (ESRCH /
    /// "not found") is success.
    pub async fn terminate_process(
        &self,
        pid: u32,
        force: bool,
        grace: Duration,
    ) -> SpinResult<TerminateOutcome> {
        if !self.is_process_alive(pid).await {
            return Ok(TerminateOutcome::Gone);
        }

        if self.info.os == OsTag::Win32 {
            let mut args = vec!["/PID".to_string(), pid.to_string(), "/T".to_string()];
            if force {
                args.push("/F".to_string());
            }
            let out = Command::new("taskkill")
                .args(&args)
                .output()
                .await
                .map_err(|e| SpinError::io(format!("taskkill for pid {pid}"), e))?;
            if !out.status.success() {
                let stderr = String::from_utf8_lossy(&out.stderr);
                if stderr.contains("not found") || stderr.contains("not be found") {
                    return Ok(TerminateOutcome::Gone);
                }
                return Err(SpinError::precondition(format!(
                    "taskkill failed for pid {pid}: {}",
                    stderr.trim()
                )));
            }
        } else {
            let signal = if force { "-KILL" } else { "-TERM" };
            let out = Command::new("kill")
                .args([signal, &pid.to_string()])
                .output()
                .await
                .map_err(|e| SpinError::io(format!("kill for pid {pid}"), e))?;
            if !out.status.success() {
                let stderr = String::from_utf8_lossy(&out.stderr);
                // kill(1) reports ESRCH as "No such process"
                if stderr.contains("No such process") {
                    return Ok(TerminateOutcome::Gone);
                }
                return Err(SpinError::precondition(format!(
                    "kill {signal} failed for pid {pid}: {}",
                    stderr.trim()
                )));
            }
        }

        // Give the process its grace period, then report what we observed
        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if !self.is_process_alive(pid).await {
                return Ok(TerminateOutcome::Gone);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if self.is_process_alive(pid).await {
            Ok(TerminateOutcome::Pending)
        } else {
            Ok(TerminateOutcome::Gone)
        }
    }

    /// Locate an external tool by name: configured directories first, then
    /// every entry of PATH. Returns `None` when nothing is found - callers
    /// decide whether that is an error.
    pub fn find_tool(&self, name: &str) -> Option<PathBuf> {
        let file_name = format!("{name}{}", self.exec_ext());
        for dir in &self.tool_dirs {
            let candidate = dir.join(&file_name);
            if candidate.is_file() {
                debug!("🔎 Found tool '{}' at {}", name, candidate.display());
                return Some(candidate);
            }
        }
        let path_var = std::env::var_os("PATH")?;
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(&file_name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }

    /// Best-effort clipboard copy. Never fails the caller: a missing
    /// clipboard tool simply returns false.
    pub async fn copy_to_clipboard(&self, text: &str) -> bool {
        let candidates: &[&[&str]] = match self.info.os {
            OsTag::Darwin => &[&["pbcopy"]],
            OsTag::Linux => &[&["wl-copy"], &["xclip", "-selection", "clipboard"]],
            OsTag::Win32 => &[&["clip"]],
        };
        for argv in candidates {
            match pipe_to_command(argv, text).await {
                Ok(true) => return true,
                Ok(false) | Err(_) => continue,
            }
        }
        warn!("📋 No clipboard tool available - copy skipped");
        false
    }
}

async fn pipe_to_command(argv: &[&str], input: &str) -> SpinResult<bool> {
    use tokio::io::AsyncWriteExt;

    let mut cmd = Command::new(argv[0]);
    cmd.args(&argv[1..])
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(_) => return Ok(false),
    };
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input.as_bytes())
            .await
            .map_err(|e| SpinError::io("clipboard stdin", e))?;
        drop(stdin);
    }
    let status = child.wait().await.map_err(|e| SpinError::io("clipboard wait", e))?;
    Ok(status.success())
}

fn detect_platform() -> PlatformInfo {
    let os = if cfg!(target_os = "macos") {
        OsTag::Darwin
    } else if cfg!(target_os = "windows") {
        OsTag::Win32
    } else {
        OsTag::Linux
    };
    let arch = if cfg!(target_arch = "aarch64") { ArchTag::Arm64 } else { ArchTag::X64 };
    PlatformInfo { os, arch }
}

fn default_tool_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if cfg!(unix) {
        for d in ["/usr/local/bin", "/opt/homebrew/bin", "/usr/bin"] {
            let p = PathBuf::from(d);
            if p.is_dir() {
                dirs.push(p);
            }
        }
    }
    dirs
}

/// Make a file executable (0755). No-op on Windows.
pub async fn make_executable(path: &Path) -> SpinResult<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o755);
        tokio::fs::set_permissions(path, perms)
            .await
            .map_err(|e| SpinError::io(format!("chmod 0755 {}", path.display()), e))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
