//! Process manager - start engines detached, track liveness, stop cleanly
//!
//! Engines run as detached child processes with stdout/stderr redirected
//! into the container's log file and their PID recorded next to it.
//! Readiness is polled through an engine-specific probe; shutdown walks an
//! escalation ladder from the engine's own admin tool down to SIGKILL.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::domain::engine::Engine;
use crate::domain::errors::{SpinError, SpinResult};
use crate::infrastructure::platform::PlatformService;

/// Cadence of readiness probes
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Default readiness budget (60 attempts x 500 ms)
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);
/// Graceful-exit wait before force kill
pub const STOP_GRACE: Duration = Duration::from_secs(10);
/// Post-SIGKILL wait before giving up
pub const KILL_GRACE: Duration = Duration::from_secs(1);

/// Engine-specific readiness / liveness probe
#[derive(Debug, Clone)]
pub enum ReadyProbe {
    /// Run a tool; exit 0 means ready (`pg_isready`, `mysqladmin ping`)
    Command { program: PathBuf, args: Vec<String>, env: Vec<(String, String)> },
    /// TCP connect succeeds
    Tcp { port: u16 },
    /// HTTP GET returns success (`/ping` endpoints)
    Http { url: String },
    /// File exists at the path (file-based engines)
    FileExists { path: PathBuf },
}

impl ReadyProbe {
    pub async fn is_ready(&self) -> bool {
        match self {
            Self::Command { program, args, env } => {
                let mut cmd = Command::new(program);
                cmd.args(args).stdout(Stdio::null()).stderr(Stdio::null());
                for (key, value) in env {
                    cmd.env(key, value);
                }
                matches!(cmd.status().await, Ok(status) if status.success())
            }
            Self::Tcp { port } => {
                tokio::net::TcpStream::connect(("127.0.0.1", *port)).await.is_ok()
            }
            Self::Http { url } => match reqwest::get(url).await {
                Ok(response) => response.status().is_success(),
                Err(_) => false,
            },
            Self::FileExists { path } => path.is_file(),
        }
    }
}

/// Everything needed to launch one engine process
#[derive(Debug, Clone)]
pub struct StartSpec {
    pub engine: Engine,
    pub container: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub log_file: PathBuf,
    pub pid_file: PathBuf,
    pub ready: ReadyProbe,
    pub ready_timeout: Duration,
}

/// Graceful shutdown command provided by the engine adapter
/// (`pg_ctl stop -m fast`, `mysqladmin shutdown`, `redis-cli SHUTDOWN`)
#[derive(Debug, Clone)]
pub struct GracefulShutdown {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Everything needed to stop one engine process
#[derive(Debug, Clone)]
pub struct StopSpec {
    pub engine: Engine,
    pub container: String,
    pub pid_file: PathBuf,
    pub graceful: Option<GracefulShutdown>,
    /// Liveness probe used when the PID file is missing or malformed
    pub ping: Option<ReadyProbe>,
}

/// Supervisor for detached engine processes
#[derive(Debug, Clone)]
pub struct ProcessManager {
    platform: PlatformService,
}

impl ProcessManager {
    pub fn new(platform: PlatformService) -> Self {
        Self { platform }
    }

    /// Spawn the engine detached and wait until its readiness probe
    /// answers. Returns the child PID. On timeout the child is killed,
    /// the PID file removed, and the error carries the log path.
    pub async fn start(&self, spec: &StartSpec) -> SpinResult<u32> {
        for parent in [spec.log_file.parent(), spec.pid_file.parent()].into_iter().flatten() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SpinError::io(format!("create {}", parent.display()), e))?;
        }

        // Stale PID file from a crashed run: clean before spawning
        if let Some(stale) = read_pid(&spec.pid_file).await {
            if self.platform.is_process_alive(stale).await {
                return Err(SpinError::precondition(format!(
                    "{} '{}' already appears to be running (pid {stale})",
                    spec.engine.display_name(),
                    spec.container
                )));
            }
            warn!("🧹 Clearing stale PID file for '{}' (pid {})", spec.container, stale);
            remove_pid_file(&spec.pid_file).await?;
        }

        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_file)
            .map_err(|e| SpinError::io(format!("open {}", spec.log_file.display()), e))?;
        let log_err = log
            .try_clone()
            .map_err(|e| SpinError::io("clone log handle", e))?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(false);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd
            .spawn()
            .map_err(|e| SpinError::io(format!("spawn {}", spec.program.display()), e))?;
        let pid = child.id().ok_or_else(|| {
            SpinError::precondition(format!("{} exited before a PID was observed", spec.container))
        })?;
        tokio::fs::write(&spec.pid_file, format!("{pid}\n"))
            .await
            .map_err(|e| SpinError::io(format!("write {}", spec.pid_file.display()), e))?;
        info!(
            "🚀 Started {} '{}' (pid {}, log {})",
            spec.engine.display_name(),
            spec.container,
            pid,
            spec.log_file.display()
        );

        // Reap the child when it exits so liveness probes see a real
        // death instead of a zombie; the engine itself keeps running
        // in its own process group
        let mut child = child;
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        let attempts = (spec.ready_timeout.as_millis() / READY_POLL_INTERVAL.as_millis()).max(1);
        for attempt in 0..attempts {
            if spec.ready.is_ready().await {
                debug!("✅ '{}' ready after {} probe(s)", spec.container, attempt + 1);
                return Ok(pid);
            }
            if !self.platform.is_process_alive(pid).await {
                remove_pid_file(&spec.pid_file).await?;
                return Err(SpinError::ProcessInitTimeout {
                    engine: spec.engine.display_name().to_string(),
                    timeout_secs: spec.ready_timeout.as_secs(),
                    log_path: spec.log_file.display().to_string(),
                });
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }

        // Timed out: do not leave an orphan server behind
        let _ = self.platform.terminate_process(pid, true, KILL_GRACE).await;
        remove_pid_file(&spec.pid_file).await?;
        Err(SpinError::ProcessReadyTimeout {
            engine: spec.engine.display_name().to_string(),
            timeout_secs: spec.ready_timeout.as_secs(),
            log_path: spec.log_file.display().to_string(),
        })
    }

    /// Stop a supervised engine through the escalation ladder.
    pub async fn stop(&self, spec: &StopSpec) -> SpinResult<()> {
        let pid = match read_pid(&spec.pid_file).await {
            Some(pid) => pid,
            None => {
                // No usable PID file: probe the engine itself, and if it
                // answers, ask it to shut down gracefully
                let alive = match &spec.ping {
                    Some(probe) => probe.is_ready().await,
                    None => false,
                };
                if alive {
                    if let Some(graceful) = &spec.graceful {
                        debug!("🛑 No PID file for '{}', using admin shutdown", spec.container);
                        let _ = run_graceful(graceful).await;
                    }
                }
                remove_pid_file(&spec.pid_file).await?;
                return Ok(());
            }
        };

        if !self.platform.is_process_alive(pid).await {
            debug!("🧹 PID {} for '{}' already gone, clearing PID file", pid, spec.container);
            remove_pid_file(&spec.pid_file).await?;
            return Ok(());
        }

        // 1. Engine-graceful shutdown via its own admin tool
        let mut graceful_ok = false;
        if let Some(graceful) = &spec.graceful {
            graceful_ok = run_graceful(graceful).await;
            if !graceful_ok {
                warn!("⚠️ Admin shutdown failed for '{}', falling back to signals", spec.container);
            }
        }

        // 2. SIGTERM when the admin tool did not take
        if !graceful_ok {
            let _ = self.platform.terminate_process(pid, false, Duration::from_millis(200)).await;
        }

        // 3. Poll for exit up to the grace budget
        if self.wait_for_exit(pid, STOP_GRACE).await {
            remove_pid_file(&spec.pid_file).await?;
            info!("🛑 Stopped {} '{}' (pid {})", spec.engine.display_name(), spec.container, pid);
            return Ok(());
        }

        // 4. SIGKILL, then one final short wait
        warn!("💀 Force-killing '{}' (pid {})", spec.container, pid);
        let _ = self.platform.terminate_process(pid, true, KILL_GRACE).await;
        if self.wait_for_exit(pid, KILL_GRACE).await {
            remove_pid_file(&spec.pid_file).await?;
            return Ok(());
        }
        Err(SpinError::ProcessStopTimeout { pid })
    }

    /// PID file present and its process alive
    pub async fn is_running(&self, pid_file: &Path) -> bool {
        match read_pid(pid_file).await {
            Some(pid) => self.platform.is_process_alive(pid).await,
            None => false,
        }
    }

    async fn wait_for_exit(&self, pid: u32, budget: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + budget;
        while tokio::time::Instant::now() < deadline {
            if !self.platform.is_process_alive(pid).await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        !self.platform.is_process_alive(pid).await
    }
}

async fn run_graceful(shutdown: &GracefulShutdown) -> bool {
    let mut cmd = Command::new(&shutdown.program);
    cmd.args(&shutdown.args).stdout(Stdio::null()).stderr(Stdio::null());
    for (key, value) in &shutdown.env {
        cmd.env(key, value);
    }
    matches!(cmd.status().await, Ok(status) if status.success())
}

/// Parse the PID file; `None` for missing or malformed content
async fn read_pid(pid_file: &Path) -> Option<u32> {
    let content = tokio::fs::read_to_string(pid_file).await.ok()?;
    content.trim().parse::<u32>().ok()
}

async fn remove_pid_file(pid_file: &Path) -> SpinResult<()> {
    match tokio::fs::remove_file(pid_file).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SpinError::io(format!("remove {}", pid_file.display()), e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ProcessManager {
        ProcessManager::new(PlatformService::new())
    }

    #[tokio::test]
    async fn test_stop_with_missing_pid_file_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = StopSpec {
            engine: Engine::Redis,
            container: "cache".to_string(),
            pid_file: tmp.path().join("cache.pid"),
            graceful: None,
            ping: None,
        };
        manager().stop(&spec).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_clears_stale_pid_file() {
        let tmp = tempfile::tempdir().unwrap();
        let pid_file = tmp.path().join("stale.pid");
        tokio::fs::write(&pid_file, "3999999\n").await.unwrap();

        let spec = StopSpec {
            engine: Engine::Redis,
            container: "stale".to_string(),
            pid_file: pid_file.clone(),
            graceful: None,
            ping: None,
        };
        manager().stop(&spec).await.unwrap();
        assert!(!pid_file.exists());
    }

    #[tokio::test]
    async fn test_malformed_pid_file_is_not_running() {
        let tmp = tempfile::tempdir().unwrap();
        let pid_file = tmp.path().join("bad.pid");
        tokio::fs::write(&pid_file, "not-a-pid\n").await.unwrap();
        assert!(!manager().is_running(&pid_file).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_and_stop_fake_engine() {
        let tmp = tempfile::tempdir().unwrap();
        let ready_marker = tmp.path().join("ready");
        // A fake engine: touches its ready marker then sleeps
        let script = tmp.path().join("engine.sh");
        tokio::fs::write(
            &script,
            format!("#!/bin/sh\ntouch {}\nexec sleep 60\n", ready_marker.display()),
        )
        .await
        .unwrap();
        crate::infrastructure::platform::make_executable(&script).await.unwrap();

        let start = StartSpec {
            engine: Engine::Redis,
            container: "fake".to_string(),
            program: script,
            args: vec![],
            env: vec![],
            log_file: tmp.path().join("fake.log"),
            pid_file: tmp.path().join("fake.pid"),
            ready: ReadyProbe::FileExists { path: ready_marker },
            ready_timeout: Duration::from_secs(5),
        };
        let pid = manager().start(&start).await.unwrap();
        assert!(manager().is_running(&start.pid_file).await);

        let stop = StopSpec {
            engine: Engine::Redis,
            container: "fake".to_string(),
            pid_file: start.pid_file.clone(),
            graceful: None,
            ping: None,
        };
        manager().stop(&stop).await.unwrap();
        assert!(!start.pid_file.exists());
        assert!(!PlatformService::new().is_process_alive(pid).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_timeout_includes_log_path() {
        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("slow.sh");
        tokio::fs::write(&script, "#!/bin/sh\nexec sleep 60\n").await.unwrap();
        crate::infrastructure::platform::make_executable(&script).await.unwrap();

        let start = StartSpec {
            engine: Engine::Redis,
            container: "slow".to_string(),
            program: script,
            args: vec![],
            env: vec![],
            log_file: tmp.path().join("slow.log"),
            pid_file: tmp.path().join("slow.pid"),
            ready: ReadyProbe::FileExists { path: tmp.path().join("never") },
            ready_timeout: Duration::from_secs(1),
        };
        let err = manager().start(&start).await.unwrap_err();
        match err {
            SpinError::ProcessReadyTimeout { log_path, .. } => {
                assert!(log_path.contains("slow.log"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!start.pid_file.exists());
    }
}
