//! Dump/restore tools invoked by the backup engine.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DumpError {
    #[error("failed to spawn {program}: {message}")]
    Spawn { program: String, message: String },

    /// Process ran and exited non-zero; `stderr` is the diagnostic.
    #[error("{program} exited with {code:?}: {stderr}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("archive i/o error: {0}")]
    Io(String),
}

/// Produces and consumes database archives.
#[async_trait]
pub trait DumpTool: Send + Sync {
    /// Write a full dump of `db_name` to `archive`.
    async fn dump(&self, db_name: &str, archive: &Path) -> Result<(), DumpError>;

    /// Load `archive` into the (already created, empty) database `db_name`.
    async fn restore(&self, db_name: &str, archive: &Path) -> Result<(), DumpError>;
}

#[async_trait]
impl<T> DumpTool for Arc<T>
where
    T: DumpTool + ?Sized,
{
    async fn dump(&self, db_name: &str, archive: &Path) -> Result<(), DumpError> {
        (**self).dump(db_name, archive).await
    }

    async fn restore(&self, db_name: &str, archive: &Path) -> Result<(), DumpError> {
        (**self).restore(db_name, archive).await
    }
}

/// `pg_dump -F c` / `pg_restore --no-owner` via child processes.
///
/// Children are killed if the returned future is dropped, so an outer
/// timeout really stops the dump.
#[derive(Clone)]
pub struct PgDumpTool {
    host: String,
    port: u16,
    user: String,
    password: String,
    pg_dump: PathBuf,
    pg_restore: PathBuf,
}

impl std::fmt::Debug for PgDumpTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgDumpTool")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("pg_dump", &self.pg_dump)
            .field("pg_restore", &self.pg_restore)
            .finish_non_exhaustive()
    }
}

impl PgDumpTool {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            password: password.into(),
            pg_dump: PathBuf::from("pg_dump"),
            pg_restore: PathBuf::from("pg_restore"),
        }
    }

    /// Override the binaries (e.g. a versioned install path).
    pub fn with_binaries(mut self, pg_dump: impl Into<PathBuf>, pg_restore: impl Into<PathBuf>) -> Self {
        self.pg_dump = pg_dump.into();
        self.pg_restore = pg_restore.into();
        self
    }

    fn command(&self, program: &Path) -> Command {
        let mut cmd = Command::new(program);
        cmd.arg("-h")
            .arg(&self.host)
            .arg("-p")
            .arg(self.port.to_string())
            .arg("-U")
            .arg(&self.user)
            .env("PGPASSWORD", &self.password)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, program: &Path, mut cmd: Command) -> Result<(), DumpError> {
        let name = program.display().to_string();
        let child = cmd.spawn().map_err(|e| DumpError::Spawn {
            program: name.clone(),
            message: e.to_string(),
        })?;

        let output = child.wait_with_output().await.map_err(|e| DumpError::Spawn {
            program: name.clone(),
            message: e.to_string(),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(DumpError::Failed {
                program: name,
                code: output.status.code(),
                stderr,
            });
        }

        debug!(program = %name, "process finished");
        Ok(())
    }
}

#[async_trait]
impl DumpTool for PgDumpTool {
    #[instrument(skip(self, archive), fields(archive = %archive.display()), err)]
    async fn dump(&self, db_name: &str, archive: &Path) -> Result<(), DumpError> {
        let mut cmd = self.command(&self.pg_dump);
        cmd.arg("-F").arg("c").arg("-f").arg(archive).arg(db_name);
        self.run(&self.pg_dump, cmd).await
    }

    #[instrument(skip(self, archive), fields(archive = %archive.display()), err)]
    async fn restore(&self, db_name: &str, archive: &Path) -> Result<(), DumpError> {
        let mut cmd = self.command(&self.pg_restore);
        cmd.arg("--no-owner").arg("-d").arg(db_name).arg(archive);
        self.run(&self.pg_restore, cmd).await
    }
}

/// Dump tool for tests/dev: database "contents" live in memory and archives
/// are real files, so checksums and sizes behave like the real thing.
#[derive(Debug, Default)]
pub struct InMemoryDumpTool {
    databases: Mutex<HashMap<String, Vec<u8>>>,
    dump_failures: Mutex<VecDeque<DumpError>>,
    restore_failures: Mutex<VecDeque<DumpError>>,
}

impl InMemoryDumpTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_contents(&self, db_name: &str, contents: impl Into<Vec<u8>>) {
        self.databases
            .lock()
            .await
            .insert(db_name.to_string(), contents.into());
    }

    pub async fn contents(&self, db_name: &str) -> Option<Vec<u8>> {
        self.databases.lock().await.get(db_name).cloned()
    }

    pub async fn fail_next_dump(&self, err: DumpError) {
        self.dump_failures.lock().await.push_back(err);
    }

    pub async fn fail_next_restore(&self, err: DumpError) {
        self.restore_failures.lock().await.push_back(err);
    }
}

#[async_trait]
impl DumpTool for InMemoryDumpTool {
    async fn dump(&self, db_name: &str, archive: &Path) -> Result<(), DumpError> {
        if let Some(err) = self.dump_failures.lock().await.pop_front() {
            return Err(err);
        }

        let contents = self
            .databases
            .lock()
            .await
            .get(db_name)
            .cloned()
            .unwrap_or_else(|| format!("-- empty database {db_name}\n").into_bytes());

        tokio::fs::write(archive, contents)
            .await
            .map_err(|e| DumpError::Io(e.to_string()))
    }

    async fn restore(&self, db_name: &str, archive: &Path) -> Result<(), DumpError> {
        if let Some(err) = self.restore_failures.lock().await.pop_front() {
            return Err(err);
        }

        let contents = tokio::fs::read(archive)
            .await
            .map_err(|e| DumpError::Io(e.to_string()))?;
        self.databases
            .lock()
            .await
            .insert(db_name.to_string(), contents);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_round_trip_through_a_real_file() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("odoo_acme.dump");
        let tool = InMemoryDumpTool::new();
        tool.set_contents("odoo_acme", b"rows".to_vec()).await;

        tool.dump("odoo_acme", &archive).await.unwrap();
        tool.set_contents("odoo_acme", b"corrupted".to_vec()).await;
        tool.restore("odoo_acme", &archive).await.unwrap();

        assert_eq!(tool.contents("odoo_acme").await.unwrap(), b"rows".to_vec());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let tool = PgDumpTool::new("localhost", 5432, "odoo", "secret")
            .with_binaries("/bin/false", "/bin/false");

        let err = tool
            .dump("odoo_acme", &dir.path().join("x.dump"))
            .await
            .unwrap_err();
        assert!(matches!(err, DumpError::Failed { code: Some(1), .. }), "{err:?}");
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let tool = PgDumpTool::new("localhost", 5432, "odoo", "secret")
            .with_binaries("/nonexistent/pg_dump", "/nonexistent/pg_restore");

        let err = tool
            .restore("odoo_acme", &dir.path().join("x.dump"))
            .await
            .unwrap_err();
        assert!(matches!(err, DumpError::Spawn { .. }));
    }

    #[test]
    fn debug_hides_password() {
        let tool = PgDumpTool::new("localhost", 5432, "odoo", "hunter2");
        assert!(!format!("{tool:?}").contains("hunter2"));
    }
}
