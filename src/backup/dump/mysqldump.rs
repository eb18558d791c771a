use crate::backup::config::{BackupTarget, DatabaseSelector, DumpConfig, SnapshotMode, TargetId};
use crate::backup::dump::{DumpExecutor, DumpStream};
use crate::backup::orchestrator::cancel::CancelToken;
use crate::backup::result_error::class::ErrorClass;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use itertools::Itertools;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

const STDERR_TAIL_LINES: usize = 20;
const POLL_INTERVAL: Duration = Duration::from_millis(20);

// MySQL client/server error codes that retrying cannot fix
const PERMANENT_CONFIG_CODES: [&str; 4] = ["1044", "1045", "1049", "1227"];
const PERMANENT_CONFIG_TEXT: [&str; 2] = ["Access denied", "Unknown database"];
// connection problems and lock contention
const TRANSIENT_CODES: [&str; 7] = ["2002", "2003", "2005", "2006", "2013", "1205", "1213"];
const TRANSIENT_TEXT: [&str; 3] = ["Lost connection", "Can't connect", "server has gone away"];

/// Runs `mysqldump` (or a compatible tool) and streams its stdout.
///
/// The password is handed over in `MYSQL_PWD` so it never shows up in the
/// process list.
#[derive(Debug, Clone)]
pub struct MysqldumpExecutor {
    binary: PathBuf,
    extra_args: Vec<String>,
}

impl MysqldumpExecutor {
    pub fn new(config: &DumpConfig) -> Self {
        Self {
            binary: config.binary().clone(),
            extra_args: config.extra_args().clone(),
        }
    }

    pub fn args(&self, target: &BackupTarget) -> Vec<String> {
        let db = target.database();
        let mut args = vec![
            format!("--host={}", db.host()),
            format!("--port={}", db.port()),
            format!("--user={}", db.user()),
        ];
        args.push(
            match target.snapshot() {
                SnapshotMode::SingleTransaction => "--single-transaction",
                SnapshotMode::LockTables => "--lock-tables",
                SnapshotMode::None => "--skip-lock-tables",
            }
            .to_string(),
        );
        // row-by-row output instead of buffering whole tables in the client
        args.push("--quick".to_string());
        args.extend(self.extra_args.iter().cloned());
        match db.select() {
            DatabaseSelector::All => args.push("--all-databases".to_string()),
            DatabaseSelector::Databases(names) => {
                args.push("--databases".to_string());
                args.extend(names.iter().cloned());
            }
        }
        args
    }
}

fn spawn_error(target: &TargetId, binary: &Path, e: std::io::Error) -> Error {
    let class = match e.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied => ErrorClass::PermanentConfig,
        _ => ErrorClass::Transient,
    };
    Error::DumpFailed {
        target: target.to_string(),
        class,
        diagnostic: format!("cannot start {binary:?}: {e}"),
    }
}

impl DumpExecutor for MysqldumpExecutor {
    fn start(&self, target: &BackupTarget, cancel: &CancelToken) -> Result<Box<dyn DumpStream>> {
        let password = target.database().password().resolve()?;
        let mut child = Command::new(&self.binary)
            .args(self.args(target))
            .env("MYSQL_PWD", password.inner())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(target.id(), &self.binary, e))?;
        debug!("Started {:?} for {} (pid {})", self.binary, target.id(), child.id());

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let child = Arc::new(Mutex::new(child));
        let done = CancelToken::new();

        let watchdog = {
            let child = child.clone();
            let cancel = cancel.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                while !done.is_cancelled() {
                    if cancel.wait_timeout(POLL_INTERVAL * 5) {
                        if let Err(e) = lock(&child).kill() {
                            debug!("Kill after cancellation failed: {}", e);
                        }
                        return;
                    }
                }
            })
        };

        Ok(Box::new(MysqldumpStream {
            target: target.id().clone(),
            stdout,
            stderr_tail: stderr.map(spawn_stderr_reader),
            child,
            cancel: cancel.clone(),
            done,
            watchdog: Some(watchdog),
            reaped: false,
        }))
    }
}

fn lock(child: &Mutex<Child>) -> MutexGuard<'_, Child> {
    child.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keeps the last lines of stderr; the whole stream is consumed so the
/// child never blocks on a full stderr pipe.
fn spawn_stderr_reader(stderr: ChildStderr) -> JoinHandle<String> {
    std::thread::spawn(move || {
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        for line in BufReader::new(stderr).lines() {
            let Ok(line) = line else { break };
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tail.into_iter().join("\n")
    })
}

/// Maps how the dump ended to a failure class; `None` means success.
pub fn classify(status: ExitStatus, diagnostic: &str, cancelled: bool) -> Option<ErrorClass> {
    if status.success() {
        return None;
    }
    if cancelled {
        return Some(ErrorClass::Cancelled);
    }
    // killed by a signal from outside, e.g. OOM killer or server restart
    if status.code().is_none() {
        return Some(ErrorClass::Transient);
    }
    Some(classify_diagnostic(diagnostic))
}

fn classify_diagnostic(diagnostic: &str) -> ErrorClass {
    let codes: Vec<&str> = diagnostic
        .lines()
        .filter(|line| line.contains("rror"))
        .flat_map(|line| line.split(|c: char| !c.is_ascii_digit()))
        .filter(|token| !token.is_empty())
        .collect();
    let has_code = |list: &[&str]| codes.iter().any(|c| list.contains(c));
    let has_text = |list: &[&str]| list.iter().any(|t| diagnostic.contains(t));

    if has_code(&PERMANENT_CONFIG_CODES[..]) || has_text(&PERMANENT_CONFIG_TEXT[..]) {
        ErrorClass::PermanentConfig
    } else if has_code(&TRANSIENT_CODES[..]) || has_text(&TRANSIENT_TEXT[..]) {
        ErrorClass::Transient
    } else {
        ErrorClass::PermanentData
    }
}

struct MysqldumpStream {
    target: TargetId,
    stdout: Option<ChildStdout>,
    stderr_tail: Option<JoinHandle<String>>,
    child: Arc<Mutex<Child>>,
    cancel: CancelToken,
    done: CancelToken,
    watchdog: Option<JoinHandle<()>>,
    reaped: bool,
}

impl MysqldumpStream {
    fn wait(&self) -> std::io::Result<ExitStatus> {
        // poll, so the watchdog can still take the lock to kill the child
        loop {
            if let Some(status) = lock(&self.child).try_wait()? {
                return Ok(status);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn stop_watchdog(&mut self) {
        self.done.cancel();
        if let Some(watchdog) = self.watchdog.take() {
            let _ = watchdog.join();
        }
    }
}

impl Read for MysqldumpStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.stdout.as_mut() {
            Some(stdout) => stdout.read(buf),
            None => Ok(0),
        }
    }
}

impl DumpStream for MysqldumpStream {
    fn finish(mut self: Box<Self>) -> Result<()> {
        // unread output makes the tool fail on a closed pipe, never succeed
        drop(self.stdout.take());
        let status = self.wait()?;
        self.reaped = true;
        self.stop_watchdog();
        let diagnostic = self
            .stderr_tail
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default();

        match classify(status, &diagnostic, self.cancel.is_cancelled()) {
            None => {
                debug!("Dump of {} finished", self.target);
                Ok(())
            }
            Some(ErrorClass::Cancelled) => Err(Error::Cancelled),
            Some(class) => Err(Error::DumpFailed {
                target: self.target.to_string(),
                class,
                diagnostic: format!("{status}: {diagnostic}"),
            }),
        }
    }
}

impl Drop for MysqldumpStream {
    fn drop(&mut self) {
        if !self.reaped {
            let mut child = lock(&self.child);
            if let Err(e) = child.kill() {
                warn!("Failed to kill abandoned dump of {}: {}", self.target, e);
            }
            let _ = child.wait();
        }
        self.stop_watchdog();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::backup::config::DatabaseConfig;
    use crate::backup::secret::SecretRef;
    use crate::backup::testing;
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::process::ExitStatusExt;
    use std::path::Path;
    use std::time::Instant;

    fn script(dir: &Path, body: &str) -> MysqldumpExecutor {
        let path = dir.join("fake-mysqldump");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        MysqldumpExecutor::new(&DumpConfig::builder().binary(path).build())
    }

    fn run(executor: &MysqldumpExecutor, target: &BackupTarget) -> (String, Result<()>) {
        let mut stream = executor.start(target, &CancelToken::new()).unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).unwrap();
        (out, stream.finish())
    }

    fn class_of(result: Result<()>) -> ErrorClass {
        result.unwrap_err().class()
    }

    #[test]
    fn test_args() {
        let dir = tempfile::tempdir().unwrap();
        let executor = MysqldumpExecutor::new(
            &DumpConfig::builder()
                .extra_args(vec!["--routines".to_string()])
                .build(),
        );
        let mut target = testing::target("shop", dir.path());
        assert_eq!(
            executor.args(&target),
            vec![
                "--host=db.internal",
                "--port=3306",
                "--user=backup",
                "--single-transaction",
                "--quick",
                "--routines",
                "--all-databases",
            ]
        );

        target = BackupTarget::builder()
            .id("shop")
            .schedule("0 3 * * *")
            .database(
                DatabaseConfig::builder()
                    .host("h")
                    .port(3307)
                    .user("u")
                    .password(SecretRef::Value("p".into()))
                    .select(DatabaseSelector::Databases(vec!["a".into(), "b".into()]))
                    .build(),
            )
            .snapshot(SnapshotMode::None)
            .retention(target.retention().clone())
            .storage(target.storage().clone())
            .build();
        let args = executor.args(&target);
        assert!(args.contains(&"--skip-lock-tables".to_string()));
        assert!(args.ends_with(&["--databases".to_string(), "a".into(), "b".into()]));
    }

    #[test]
    fn test_streams_stdout_and_passes_password_in_env() {
        let dir = tempfile::tempdir().unwrap();
        let executor = script(
            dir.path(),
            r#"[ "$MYSQL_PWD" = "s3cret" ] || exit 9
case "$*" in *s3cret*) exit 8;; esac
echo "CREATE TABLE t (id INT);""#,
        );
        let (out, result) = run(&executor, &testing::target("shop", dir.path()));
        result.unwrap();
        assert_eq!(out, "CREATE TABLE t (id INT);\n");
    }

    #[test]
    fn test_auth_failure_is_permanent_config() {
        let dir = tempfile::tempdir().unwrap();
        let executor = script(
            dir.path(),
            r#"echo "mysqldump: Got error: 1045: Access denied for user 'backup'@'10.0.0.2' (using password: YES) when trying to connect" >&2
exit 2"#,
        );
        let (_, result) = run(&executor, &testing::target("shop", dir.path()));
        let err = result.unwrap_err();
        assert_eq!(err.class(), ErrorClass::PermanentConfig);
        assert!(err.to_string().contains("Access denied"));
    }

    #[test]
    fn test_connection_failure_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let executor = script(
            dir.path(),
            r#"echo "mysqldump: Got error: 2003: Can't connect to MySQL server on 'db.internal:3306' (111) when trying to connect" >&2
exit 2"#,
        );
        let (_, result) = run(&executor, &testing::target("shop", dir.path()));
        assert_eq!(class_of(result), ErrorClass::Transient);
    }

    #[test]
    fn test_partial_output_then_failure() {
        let dir = tempfile::tempdir().unwrap();
        let executor = script(
            dir.path(),
            r#"echo "INSERT INTO t VALUES (1);"
echo "mysqldump: Error 1146: Table 'shop.t2' doesn't exist" >&2
exit 3"#,
        );
        let (out, result) = run(&executor, &testing::target("shop", dir.path()));
        assert!(!out.is_empty());
        assert_eq!(class_of(result), ErrorClass::PermanentData);
    }

    #[test]
    fn test_killed_by_signal_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let executor = script(dir.path(), "echo partial\nkill -9 $$");
        let (_, result) = run(&executor, &testing::target("shop", dir.path()));
        assert_eq!(class_of(result), ErrorClass::Transient);
    }

    #[test]
    fn test_cancel_terminates_dump() {
        let dir = tempfile::tempdir().unwrap();
        let executor = script(dir.path(), "printf x\nexec sleep 30");
        let cancel = CancelToken::new();
        let mut stream = executor.start(&testing::target("shop", dir.path()), &cancel).unwrap();
        let mut first = [0u8; 1];
        stream.read_exact(&mut first).unwrap();

        let started = Instant::now();
        cancel.cancel();
        let mut rest = vec![];
        stream.read_to_end(&mut rest).unwrap();
        assert!(matches!(stream.finish(), Err(Error::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_missing_binary_is_permanent_config() {
        let dir = tempfile::tempdir().unwrap();
        let executor = MysqldumpExecutor::new(
            &DumpConfig::builder()
                .binary(dir.path().join("does-not-exist"))
                .build(),
        );
        let err = executor
            .start(&testing::target("shop", dir.path()), &CancelToken::new())
            .err()
            .unwrap();
        assert_eq!(err.class(), ErrorClass::PermanentConfig);
    }

    #[test]
    fn test_classify() {
        let exited = |code: i32| ExitStatus::from_raw(code << 8);
        assert_eq!(classify(exited(0), "", false), None);
        assert_eq!(classify(exited(0), "", true), None);
        assert_eq!(classify(exited(2), "", true), Some(ErrorClass::Cancelled));
        assert_eq!(classify(ExitStatus::from_raw(9), "", false), Some(ErrorClass::Transient));
        assert_eq!(
            classify(exited(2), "mysqldump: Got error: 1049: Unknown database 'x'", false),
            Some(ErrorClass::PermanentConfig)
        );
        assert_eq!(
            classify(exited(2), "mysqldump: Error 2013: Lost connection to server during query", false),
            Some(ErrorClass::Transient)
        );
        assert_eq!(
            classify(exited(2), "mysqldump: Couldn't execute 'SHOW TABLES': disk full", false),
            Some(ErrorClass::PermanentData)
        );
    }
}
