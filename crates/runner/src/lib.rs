//! Subprocess supervision under resource bounds: bounded stream
//! capture, wall-clock timeouts with graceful-then-forced termination,
//! and cooperative cancellation. One runner call runs one command to
//! completion; retry policy lives above this crate.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arsenal_common::outcome::{StreamCapture, Termination};
use chrono::{DateTime, Utc};

mod process;

pub use process::ProcessRunner;

/// Cooperative cancellation flag shared between the dispatcher, the
/// worker and the runner poll loop. Cancelling twice is a no-op.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Everything a runner needs to execute one command.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
    /// Window between the graceful signal and the forced kill.
    pub grace: Duration,
    /// Per-stream capture cap; streams keep draining past it.
    pub capture_limit: usize,
}

/// What one run produced. Spawn failures are outcomes too, never
/// panics: `termination == SpawnError` with the OS error in stderr.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub termination: Termination,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: StreamCapture,
    pub stderr: StreamCapture,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub peak_rss_kb: Option<u64>,
}

/// Callback fed one trimmed stderr line at a time, from the drain
/// thread. Used for line-oriented progress markers.
pub type LineHook = Arc<dyn Fn(String) + Send + Sync>;

/// The execution seam. The subprocess variant is implemented here;
/// session-holding variants (e.g. a browser driver) can slot in behind
/// the same outcome contract.
pub trait Runner: Send + Sync {
    fn run(&self, spec: RunSpec, token: &CancelToken, stderr_hook: Option<LineHook>) -> RunOutcome;
}

/// Minimal safe environment for tool subprocesses: locale/terminal
/// pass-through, a fixed PATH and a HOME inside the workspace.
pub fn baseline_env(
    workspace_root: Option<&Path>,
    overlay: &HashMap<String, String>,
) -> io::Result<HashMap<String, String>> {
    let mut env = HashMap::new();

    for var in ["LANG", "LC_ALL", "LC_CTYPE", "TZ", "TERM", "COLORTERM"] {
        if let Ok(value) = std::env::var(var) {
            env.insert(var.to_string(), value);
        }
    }
    env.insert("PATH".into(), "/usr/bin:/bin".into());

    if let Some(root) = workspace_root {
        let home = root.join(".home");
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            std::fs::DirBuilder::new()
                .mode(0o700)
                .recursive(true)
                .create(&home)?;
        }
        #[cfg(not(unix))]
        std::fs::create_dir_all(&home)?;
        env.insert("HOME".into(), home.to_string_lossy().into_owned());
    }

    for (key, value) in overlay {
        env.insert(key.clone(), value.clone());
    }

    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_is_idempotent() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());

        let clone = token.clone();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn baseline_env_pins_path_and_applies_overlay() {
        let mut overlay = HashMap::new();
        overlay.insert("SCANNER_DEBUG".to_string(), "1".to_string());
        let env = baseline_env(None, &overlay).expect("env");
        assert_eq!(env.get("PATH").map(String::as_str), Some("/usr/bin:/bin"));
        assert_eq!(env.get("SCANNER_DEBUG").map(String::as_str), Some("1"));
        assert!(!env.contains_key("HOME"));
    }

    #[cfg(unix)]
    #[test]
    fn baseline_env_creates_workspace_home() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = baseline_env(Some(dir.path()), &HashMap::new()).expect("env");
        let home = dir.path().join(".home");
        assert!(home.is_dir());
        assert_eq!(
            env.get("HOME").map(String::as_str),
            Some(home.to_string_lossy().as_ref())
        );
    }
}
