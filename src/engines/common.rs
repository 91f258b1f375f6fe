//! Shared adapter plumbing
//!
//! Child-process invocation with captured output and optional stdin
//! streaming, in-process gzip streams for backups, TSV parsing into
//! structured query results, and connection-string validation. Adapters
//! never go through a shell: SQL travels as a single argv element or
//! over a stdin pipe, so no platform quoting layer exists here.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;
use url::Url;

use crate::domain::engine::Engine;
use crate::domain::errors::{SpinError, SpinResult};
use crate::engines::adapter::{QueryResult, ScriptOutcome};

/// What to feed a child's stdin
pub enum StdinSource {
    None,
    /// Stream a file to stdin
    File(PathBuf),
    /// Write a buffer to stdin (passwords, inline scripts)
    Bytes(Vec<u8>),
}

/// One tool invocation
pub struct ToolInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: StdinSource,
    pub timeout: Option<Duration>,
}

impl ToolInvocation {
    pub fn new(program: PathBuf) -> Self {
        Self { program, args: Vec::new(), env: Vec::new(), stdin: StdinSource::None, timeout: None }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I: IntoIterator<Item = S>, S: Into<String>>(mut self, args: I) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, stdin: StdinSource) -> Self {
        self.stdin = stdin;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Run a tool to completion, capturing stdout/stderr fully (no dangling
/// pipes). A timeout kills the child and fails.
pub async fn run_tool(invocation: ToolInvocation) -> SpinResult<ScriptOutcome> {
    debug!("🛠️ {} {:?}", invocation.program.display(), invocation.args);
    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &invocation.env {
        cmd.env(key, value);
    }
    match &invocation.stdin {
        StdinSource::None => {
            cmd.stdin(Stdio::null());
        }
        StdinSource::File(_) | StdinSource::Bytes(_) => {
            cmd.stdin(Stdio::piped());
        }
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| SpinError::io(format!("spawn {}", invocation.program.display()), e))?;

    if let Some(mut stdin) = child.stdin.take() {
        match invocation.stdin {
            StdinSource::File(path) => {
                let mut file = tokio::fs::File::open(&path)
                    .await
                    .map_err(|e| SpinError::io(format!("open {}", path.display()), e))?;
                tokio::io::copy(&mut file, &mut stdin)
                    .await
                    .map_err(|e| SpinError::io("stream file to stdin", e))?;
            }
            StdinSource::Bytes(bytes) => {
                stdin
                    .write_all(&bytes)
                    .await
                    .map_err(|e| SpinError::io("write stdin", e))?;
            }
            StdinSource::None => {}
        }
        drop(stdin);
    }

    let wait = child.wait_with_output();
    let output = match invocation.timeout {
        Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
            SpinError::precondition(format!(
                "{} did not finish within {}s",
                invocation.program.display(),
                limit.as_secs()
            ))
        })?,
        None => wait.await,
    }
    .map_err(|e| SpinError::io(format!("wait for {}", invocation.program.display()), e))?;

    Ok(ScriptOutcome {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        code: output.status.code().unwrap_or(-1),
    })
}

/// Escape a string literal for embedding in single-quoted SQL
pub fn escape_sql_literal(raw: &str, backslash_escapes: bool) -> String {
    if backslash_escapes {
        raw.replace('\\', "\\\\").replace('\'', "\\'")
    } else {
        raw.replace('\'', "''")
    }
}

/// Compress `src` into `dest` as a gzip stream, in-process
pub async fn gzip_compress_file(src: &Path, dest: &Path) -> SpinResult<u64> {
    let src = src.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || -> SpinResult<u64> {
        use flate2::Compression;
        use flate2::write::GzEncoder;
        use std::io::{BufReader, BufWriter, Write, copy};

        let input = std::fs::File::open(&src)
            .map_err(|e| SpinError::io(format!("open {}", src.display()), e))?;
        let output = std::fs::File::create(&dest)
            .map_err(|e| SpinError::io(format!("create {}", dest.display()), e))?;
        let mut encoder = GzEncoder::new(BufWriter::new(output), Compression::default());
        copy(&mut BufReader::new(input), &mut encoder)
            .map_err(|e| SpinError::io("gzip stream", e))?;
        let mut writer = encoder.finish().map_err(|e| SpinError::io("finish gzip stream", e))?;
        writer.flush().map_err(|e| SpinError::io("flush gzip stream", e))?;
        let size = std::fs::metadata(&dest)
            .map_err(|e| SpinError::io(format!("stat {}", dest.display()), e))?
            .len();
        Ok(size)
    })
    .await
    .map_err(|e| SpinError::precondition(format!("gzip task failed: {e}")))?
}

/// Decompress a gzip stream `src` into `dest`, in-process
pub async fn gzip_decompress_file(src: &Path, dest: &Path) -> SpinResult<u64> {
    let src = src.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || -> SpinResult<u64> {
        use flate2::read::GzDecoder;
        use std::io::{BufReader, BufWriter, Write, copy};

        let input = std::fs::File::open(&src)
            .map_err(|e| SpinError::io(format!("open {}", src.display()), e))?;
        let output = std::fs::File::create(&dest)
            .map_err(|e| SpinError::io(format!("create {}", dest.display()), e))?;
        let mut decoder = GzDecoder::new(BufReader::new(input));
        let mut writer = BufWriter::new(output);
        let bytes = copy(&mut decoder, &mut writer)
            .map_err(|e| SpinError::io("gunzip stream", e))?;
        writer.flush().map_err(|e| SpinError::io("flush gunzip stream", e))?;
        Ok(bytes)
    })
    .await
    .map_err(|e| SpinError::precondition(format!("gunzip task failed: {e}")))?
}

/// Parse tab-separated client output into a structured result. The first
/// line is the header row; empty trailing lines are dropped.
pub fn parse_tsv(text: &str) -> QueryResult {
    let mut lines = text.lines().filter(|line| !line.is_empty());
    let columns = match lines.next() {
        Some(header) => header.split('\t').map(str::to_string).collect(),
        None => Vec::new(),
    };
    let rows = lines.map(|line| line.split('\t').map(str::to_string).collect()).collect();
    QueryResult { columns, rows }
}

/// Parse and validate a remote connection string against the schemes an
/// adapter accepts
pub fn parse_remote_url(raw: &str, engine: Engine, schemes: &[&str]) -> SpinResult<Url> {
    let url = Url::parse(raw)
        .map_err(|e| SpinError::precondition(format!("invalid connection string: {e}")))?;
    if !schemes.contains(&url.scheme()) {
        return Err(SpinError::precondition(format!(
            "connection string scheme '{}' does not match {} (expected one of {})",
            url.scheme(),
            engine.display_name(),
            schemes.join(", ")
        )));
    }
    Ok(url)
}

/// Timestamped name for the safety-copy database made before a pull
pub fn backup_database_name(db: &str) -> String {
    format!("{db}_backup_{}", chrono::Utc::now().format("%Y%m%d%H%M%S"))
}

/// Random password for `create_user`
pub fn generate_password() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_literal_escaping_modes() {
        // Standard mode doubles quotes
        assert_eq!(escape_sql_literal("O'Brien", false), "O''Brien");
        // Backslash mode (MySQL default sql_mode)
        assert_eq!(escape_sql_literal("O'Brien\\x", true), "O\\'Brien\\\\x");
    }

    #[test]
    fn test_parse_tsv() {
        let result = parse_tsv("name\towner\napp\tpostgres\nanalytics\tpostgres\n");
        assert_eq!(result.columns, vec!["name", "owner"]);
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.rows[0], vec!["app", "postgres"]);
    }

    #[test]
    fn test_parse_tsv_empty() {
        let result = parse_tsv("");
        assert!(result.columns.is_empty());
        assert!(result.rows.is_empty());
    }

    #[tokio::test]
    async fn test_gzip_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let plain = tmp.path().join("dump.sql");
        let packed = tmp.path().join("dump.sql.gz");
        let restored = tmp.path().join("restored.sql");
        let content = b"CREATE TABLE t (id int);\n".repeat(500);
        tokio::fs::write(&plain, &content).await.unwrap();

        let packed_size = gzip_compress_file(&plain, &packed).await.unwrap();
        assert!(packed_size > 0 && packed_size < content.len() as u64);
        // gzip magic present
        let head = tokio::fs::read(&packed).await.unwrap();
        assert_eq!(&head[..2], &[0x1f, 0x8b]);

        let bytes = gzip_decompress_file(&packed, &restored).await.unwrap();
        assert_eq!(bytes, content.len() as u64);
        assert_eq!(tokio::fs::read(&restored).await.unwrap(), content);
    }

    #[test]
    fn test_parse_remote_url_scheme_check() {
        assert!(parse_remote_url("postgres://u:p@host:5432/db", Engine::Postgresql, &["postgres", "postgresql"]).is_ok());
        assert!(parse_remote_url("mysql://u@host/db", Engine::Postgresql, &["postgres", "postgresql"]).is_err());
        assert!(parse_remote_url("not a url", Engine::Postgresql, &["postgres"]).is_err());
    }

    #[test]
    fn test_backup_database_name_is_sanitized() {
        let name = backup_database_name("app");
        assert!(name.starts_with("app_backup_"));
        assert!(crate::domain::container::validate_database_name(&name).is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_tool_captures_output_and_stdin() {
        let outcome = run_tool(
            ToolInvocation::new(PathBuf::from("cat"))
                .stdin(StdinSource::Bytes(b"hello".to_vec())),
        )
        .await
        .unwrap();
        assert_eq!(outcome.code, 0);
        assert_eq!(outcome.stdout, "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_tool_timeout_kills_child() {
        let err = run_tool(
            ToolInvocation::new(PathBuf::from("sleep"))
                .arg("30")
                .timeout(Duration::from_millis(200)),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("did not finish"));
    }
}
