use std::fs;
use std::io::{self, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::config::CheckerConfig;
use crate::error::WorkerError;

/// Characters of stderr kept in error messages.
const STDERR_LIMIT: usize = 4096;

/// The external similarity checker.
pub trait Checker: Send + Sync {
    /// Compares `new_work` against `old_works` and returns the path of the
    /// result artifact. Fails with [`WorkerError::NoFilesToCompare`] when
    /// either side is missing.
    fn run(
        &self,
        new_work: Option<&Utf8Path>,
        old_works: &[Utf8PathBuf],
    ) -> Result<Utf8PathBuf, WorkerError>;
}

/// Runs the checker jar through a JVM.
#[derive(Debug, Clone)]
pub struct JarChecker {
    java: String,
    jar: Utf8PathBuf,
    language: String,
    result_path: Utf8PathBuf,
    timeout: Duration,
}

impl JarChecker {
    pub fn new(config: &CheckerConfig, result_path: Utf8PathBuf) -> Self {
        Self {
            java: config.java.clone(),
            jar: config.jar.clone(),
            language: config.language.clone(),
            result_path,
            timeout: config.timeout,
        }
    }

    fn args(&self, new_work: &Utf8Path, old_works: &[Utf8PathBuf]) -> Vec<String> {
        let old = old_works
            .iter()
            .map(|path| path.as_str())
            .collect::<Vec<_>>()
            .join(",");
        vec![
            "-jar".to_string(),
            self.jar.to_string(),
            new_work.to_string(),
            "-l".to_string(),
            self.language.clone(),
            "-r".to_string(),
            self.result_path.to_string(),
            "-old".to_string(),
            old,
        ]
    }

    fn remove_stale_result(&self) -> Result<(), WorkerError> {
        match fs::remove_file(self.result_path.as_std_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(WorkerError::Filesystem(format!(
                "remove stale result {}: {err}",
                self.result_path
            ))),
        }
    }
}

impl Checker for JarChecker {
    fn run(
        &self,
        new_work: Option<&Utf8Path>,
        old_works: &[Utf8PathBuf],
    ) -> Result<Utf8PathBuf, WorkerError> {
        let Some(new_work) = new_work.filter(|path| !path.as_str().is_empty()) else {
            return Err(WorkerError::NoFilesToCompare);
        };
        if old_works.is_empty() {
            return Err(WorkerError::NoFilesToCompare);
        }
        self.remove_stale_result()?;

        let args = self.args(new_work, old_works);
        debug!(java = %self.java, old = old_works.len(), "starting checker");
        let mut child = Command::new(&self.java)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| WorkerError::Checker(format!("spawn {}: {err}", self.java)))?;

        let stderr = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buf = String::new();
                let _ = pipe.read_to_string(&mut buf);
                buf
            })
        });

        let status = match wait_timeout(&mut child, self.timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(WorkerError::CheckerTimeout(self.timeout.as_secs()));
            }
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(WorkerError::Checker(format!("wait for checker: {err}")));
            }
        };
        let stderr = stderr
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        if !status.success() {
            let stderr = stderr.chars().take(STDERR_LIMIT).collect::<String>();
            let stderr = stderr.trim();
            let message = if stderr.is_empty() {
                format!("checker exited with {status}")
            } else {
                format!("checker exited with {status}: {stderr}")
            };
            return Err(WorkerError::Checker(message));
        }

        if !self.result_path.as_std_path().is_file() {
            return Err(WorkerError::Checker(format!(
                "checker produced no result at {}",
                self.result_path
            )));
        }
        Ok(self.result_path.clone())
    }
}

fn wait_timeout(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let start = Instant::now();
    let poll_interval = Duration::from_millis(50);
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if start.elapsed() >= timeout {
            return Ok(None);
        }
        thread::sleep(poll_interval);
    }
}
