use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use arsenal_common::outcome::{StreamCapture, Termination};
use chrono::Utc;
use tracing::{debug, warn};

use crate::{CancelToken, LineHook, RunOutcome, RunSpec, Runner};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopCause {
    Timeout,
    Cancelled,
}

/// Runs one command per call in its own process group. Streams are
/// drained concurrently so a chatty tool can never deadlock on a full
/// pipe.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl Runner for ProcessRunner {
    fn run(&self, spec: RunSpec, token: &CancelToken, stderr_hook: Option<LineHook>) -> RunOutcome {
        run_process(spec, token, stderr_hook)
    }
}

fn run_process(spec: RunSpec, token: &CancelToken, stderr_hook: Option<LineHook>) -> RunOutcome {
    let started_at = Utc::now();
    let start = Instant::now();

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .current_dir(&spec.working_dir)
        .env_clear()
        .envs(&spec.env)
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    unsafe {
        use std::os::unix::process::CommandExt;
        command.pre_exec(|| {
            // Own process group, so termination reaches descendants.
            if libc::setpgid(0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            warn!(program = %spec.program.display(), "failed to spawn subprocess: {}", err);
            return spawn_failure(started_at, &err);
        }
    };

    let pid = child.id();

    let stdin_thread = match spec.stdin {
        Some(ref payload) => {
            let payload = payload.clone();
            child.stdin.take().map(|mut stdin| {
                thread::spawn(move || {
                    let _ = stdin.write_all(&payload);
                })
            })
        }
        None => None,
    };

    let stdout_thread = child
        .stdout
        .take()
        .map(|stream| drain_bytes(stream, spec.capture_limit));
    let stderr_thread = child
        .stderr
        .take()
        .map(|stream| drain_lines(stream, spec.capture_limit, stderr_hook));

    let deadline = start + spec.timeout;
    let mut stop: Option<StopCause> = None;
    let mut escalated = false;
    let mut kill_at = Instant::now();
    let mut peak_rss_kb = None;

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {}
            Err(err) => {
                warn!(pid, "wait on subprocess failed: {}", err);
                terminate(&mut child, true);
                break child.wait().ok();
            }
        }

        if let Some(rss) = read_peak_rss(pid) {
            peak_rss_kb = Some(rss);
        }

        let now = Instant::now();
        match stop {
            None => {
                if token.is_cancelled() {
                    stop = Some(StopCause::Cancelled);
                    kill_at = now + spec.grace;
                    debug!(pid, "cancellation requested, sending graceful termination");
                    terminate(&mut child, false);
                } else if now >= deadline {
                    stop = Some(StopCause::Timeout);
                    kill_at = now + spec.grace;
                    debug!(
                        pid,
                        timeout_ms = spec.timeout.as_millis() as u64,
                        "wall-clock timeout, sending graceful termination"
                    );
                    terminate(&mut child, false);
                }
            }
            Some(cause) if !escalated && now >= kill_at => {
                escalated = true;
                warn!(pid, cause = ?cause, "grace period elapsed, forcing kill");
                terminate(&mut child, true);
            }
            Some(_) => {}
        }

        thread::sleep(POLL_INTERVAL);
    };

    if let Some(handle) = stdin_thread {
        let _ = handle.join();
    }
    let stdout = join_capture(stdout_thread);
    let stderr = join_capture(stderr_thread);

    let ended_at = Utc::now();
    let duration_ms = start.elapsed().as_millis() as u64;

    let exit_code = status.as_ref().and_then(|s| s.code());
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.as_ref().and_then(|s| s.signal())
    };
    #[cfg(not(unix))]
    let signal = None;

    let termination = match (stop, escalated) {
        (None, _) => Termination::Exited,
        (Some(StopCause::Cancelled), _) => Termination::Cancelled,
        (Some(StopCause::Timeout), false) => Termination::Timeout,
        (Some(StopCause::Timeout), true) => Termination::Killed,
    };

    debug!(
        pid,
        termination = termination.as_str(),
        exit_code = ?exit_code,
        duration_ms,
        stdout_len = stdout.len(),
        stderr_len = stderr.len(),
        "subprocess finished"
    );

    RunOutcome {
        termination,
        exit_code,
        signal,
        stdout,
        stderr,
        started_at,
        ended_at,
        duration_ms,
        peak_rss_kb,
    }
}

fn spawn_failure(started_at: chrono::DateTime<Utc>, err: &std::io::Error) -> RunOutcome {
    RunOutcome {
        termination: Termination::SpawnError,
        exit_code: None,
        signal: None,
        stdout: StreamCapture::default(),
        stderr: StreamCapture {
            bytes: err.to_string().into_bytes(),
            truncated: false,
        },
        started_at,
        ended_at: Utc::now(),
        duration_ms: 0,
        peak_rss_kb: None,
    }
}

fn terminate(child: &mut Child, force: bool) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        let signal = if force {
            Signal::SIGKILL
        } else {
            Signal::SIGTERM
        };
        let _ = killpg(Pid::from_raw(child.id() as i32), signal);
    }
    #[cfg(not(unix))]
    {
        let _ = force;
        let _ = child.kill();
    }
}

fn drain_bytes<R: Read + Send + 'static>(
    mut stream: R,
    cap: usize,
) -> thread::JoinHandle<StreamCapture> {
    thread::spawn(move || {
        let mut capture = StreamCapture::default();
        let mut buf = [0u8; 8192];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => append_capped(&mut capture, &buf[..n], cap),
                Err(_) => break,
            }
        }
        capture
    })
}

fn drain_lines<R: Read + Send + 'static>(
    stream: R,
    cap: usize,
    hook: Option<LineHook>,
) -> thread::JoinHandle<StreamCapture> {
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut capture = StreamCapture::default();
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {
                    append_capped(&mut capture, &line, cap);
                    if let Some(hook) = hook.as_ref() {
                        let text = String::from_utf8_lossy(&line);
                        let trimmed = text.trim_end_matches(['\n', '\r']);
                        if !trimmed.is_empty() {
                            hook(trimmed.to_string());
                        }
                    }
                }
                Err(_) => break,
            }
        }
        capture
    })
}

fn append_capped(capture: &mut StreamCapture, chunk: &[u8], cap: usize) {
    if capture.bytes.len() >= cap {
        capture.truncated = true;
        return;
    }
    let room = cap - capture.bytes.len();
    if chunk.len() > room {
        capture.bytes.extend_from_slice(&chunk[..room]);
        capture.truncated = true;
    } else {
        capture.bytes.extend_from_slice(chunk);
    }
}

fn join_capture(handle: Option<thread::JoinHandle<StreamCapture>>) -> StreamCapture {
    match handle {
        Some(handle) => handle.join().unwrap_or_default(),
        None => StreamCapture::default(),
    }
}

#[cfg(target_os = "linux")]
fn read_peak_rss(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmHWM:") {
            return rest.trim().trim_end_matches("kB").trim().parse().ok();
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn read_peak_rss(_pid: u32) -> Option<u64> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    use super::*;

    fn shell_spec(script: &str) -> RunSpec {
        RunSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), script.into()],
            working_dir: std::env::temp_dir(),
            env: HashMap::from([("PATH".to_string(), "/usr/bin:/bin".to_string())]),
            stdin: None,
            timeout: Duration::from_secs(10),
            grace: Duration::from_millis(500),
            capture_limit: 64 * 1024,
        }
    }

    fn run(spec: RunSpec) -> RunOutcome {
        ProcessRunner.run(spec, &CancelToken::new(), None)
    }

    #[test]
    fn captures_stdout_of_successful_command() {
        let outcome = run(shell_spec("echo hi"));
        assert_eq!(outcome.termination, Termination::Exited);
        assert_eq!(outcome.exit_code, Some(0));
        assert!(!outcome.stdout.truncated);
        assert_eq!(outcome.stdout.text_lossy(), "hi\n");
    }

    #[test]
    fn nonzero_exit_is_still_exited() {
        let outcome = run(shell_spec("exit 3"));
        assert_eq!(outcome.termination, Termination::Exited);
        assert_eq!(outcome.exit_code, Some(3));
    }

    #[test]
    fn capture_is_bounded_and_flagged() {
        let mut spec = shell_spec("dd if=/dev/zero bs=1024 count=64 2>/dev/null");
        spec.capture_limit = 1024;
        let outcome = run(spec);
        assert_eq!(outcome.termination, Termination::Exited);
        assert_eq!(outcome.stdout.len(), 1024);
        assert!(outcome.stdout.truncated);
    }

    #[test]
    fn timeout_terminates_within_grace() {
        let mut spec = shell_spec("sleep 5");
        spec.timeout = Duration::from_millis(200);
        spec.grace = Duration::from_millis(300);
        let start = Instant::now();
        let outcome = run(spec);
        assert!(
            matches!(
                outcome.termination,
                Termination::Timeout | Termination::Killed
            ),
            "unexpected termination {:?}",
            outcome.termination
        );
        assert!(start.elapsed() < Duration::from_millis(1_500));
        assert_eq!(outcome.exit_code, None);
        assert!(outcome.signal.is_some());
    }

    #[test]
    fn cancellation_stops_a_running_command() {
        let token = CancelToken::new();
        let trigger = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });

        let mut spec = shell_spec("sleep 5");
        spec.grace = Duration::from_millis(300);
        let start = Instant::now();
        let outcome = ProcessRunner.run(spec, &token, None);
        assert_eq!(outcome.termination, Termination::Cancelled);
        assert!(start.elapsed() < Duration::from_millis(1_500));
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let mut spec = shell_spec("true");
        spec.program = PathBuf::from("/nonexistent/tool");
        let outcome = run(spec);
        assert_eq!(outcome.termination, Termination::SpawnError);
        assert!(!outcome.stderr.is_empty());
    }

    #[test]
    fn stderr_lines_reach_the_hook() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::default();
        let sink = seen.clone();
        let hook: LineHook = Arc::new(move |line| sink.lock().expect("lock").push(line));

        let outcome = ProcessRunner.run(
            shell_spec("echo phase-one >&2; echo phase-two >&2"),
            &CancelToken::new(),
            Some(hook),
        );
        assert_eq!(outcome.termination, Termination::Exited);
        assert_eq!(
            *seen.lock().expect("lock"),
            vec!["phase-one".to_string(), "phase-two".to_string()]
        );
        assert_eq!(outcome.stderr.text_lossy(), "phase-one\nphase-two\n");
    }

    #[test]
    fn stdin_payload_is_piped() {
        let mut spec = shell_spec("cat");
        spec.stdin = Some(b"payload-bytes".to_vec());
        let outcome = run(spec);
        assert_eq!(outcome.termination, Termination::Exited);
        assert_eq!(outcome.stdout.text_lossy(), "payload-bytes");
    }
}
