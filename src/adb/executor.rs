use super::{AdbError, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::debug;

/// Captured output of a finished adb invocation
#[derive(Debug)]
pub struct AdbOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Wraps execution of the adb binary: discovery, timeouts, error mapping.
pub struct AdbExecutor {
    adb_path: PathBuf,
    timeout: Duration,
}

impl AdbExecutor {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Locate adb and build an executor with the default timeout
    pub fn new() -> Result<Self> {
        Ok(Self {
            adb_path: Self::find_adb()?,
            timeout: Self::DEFAULT_TIMEOUT,
        })
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self {
            adb_path: path,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    pub fn adb_path(&self) -> &Path {
        &self.adb_path
    }

    /// Locate the adb executable: `ADB` environment variable, then PATH,
    /// then well-known SDK install locations.
    fn find_adb() -> Result<PathBuf> {
        if let Ok(from_env) = std::env::var("ADB") {
            let candidate = PathBuf::from(&from_env);
            if candidate.is_file() {
                debug!("Using adb from environment: {}", from_env);
                return Ok(candidate);
            }
        }

        let binary = if cfg!(target_os = "windows") {
            "adb.exe"
        } else {
            "adb"
        };

        if let Some(paths) = std::env::var_os("PATH") {
            for dir in std::env::split_paths(&paths) {
                let candidate = dir.join(binary);
                if candidate.is_file() {
                    debug!("Using adb from PATH: {:?}", candidate);
                    return Ok(candidate);
                }
            }
        }

        let mut sdk_paths: Vec<PathBuf> = Vec::new();
        if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
            sdk_paths.push(home.join("Library/Android/sdk/platform-tools/adb"));
            sdk_paths.push(home.join("Android/Sdk/platform-tools/adb"));
        }
        sdk_paths.push(PathBuf::from("/usr/bin/adb"));
        sdk_paths.push(PathBuf::from("/usr/local/bin/adb"));
        if let Some(local) = std::env::var_os("LOCALAPPDATA").map(PathBuf::from) {
            sdk_paths.push(local.join("Android/Sdk/platform-tools/adb.exe"));
        }
        sdk_paths.push(PathBuf::from("C:\\Android\\sdk\\platform-tools\\adb.exe"));

        for candidate in sdk_paths {
            if candidate.is_file() {
                debug!("Using adb from SDK location: {:?}", candidate);
                return Ok(candidate);
            }
        }

        Err(AdbError::ExecutableNotFound)
    }

    fn describe(&self, args: &[&str]) -> String {
        format!("{} {}", self.adb_path.display(), args.join(" "))
    }

    /// Run adb with the given arguments and the executor's default timeout.
    /// A non-zero exit code becomes `AdbError::CommandFailed`.
    pub async fn run(&self, args: &[&str]) -> Result<AdbOutput> {
        self.run_with_timeout(args, self.timeout).await
    }

    /// Same as `run` with an explicit timeout
    pub async fn run_with_timeout(&self, args: &[&str], timeout: Duration) -> Result<AdbOutput> {
        let cmd = self.describe(args);
        debug!("Executing: {}", cmd);

        let output = tokio::time::timeout(
            timeout,
            Command::new(&self.adb_path)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| AdbError::Timeout {
            cmd: cmd.clone(),
            seconds: timeout.as_secs(),
        })?
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AdbError::ExecutableNotFound
            } else {
                AdbError::Io(e)
            }
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(AdbError::CommandFailed {
                cmd,
                code: output.status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(AdbOutput { stdout, stderr })
    }

    /// Spawn adb detached (used for background server launch). The returned
    /// child is kept by the caller and killed on teardown.
    pub fn spawn_background(&self, args: &[&str]) -> Result<Child> {
        debug!("Spawning (background): {}", self.describe(args));

        let mut command = Command::new(&self.adb_path);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        // Suppress the console window that would otherwise flash up
        #[cfg(target_os = "windows")]
        command.creation_flags(0x0800_0000); // CREATE_NO_WINDOW

        Ok(command.spawn()?)
    }
}
