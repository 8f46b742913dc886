//! Helpers for running child processes with timeouts and bounded output.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// How long the output pipes may stay open after the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Captured child process output.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    /// Lossily decoded stdout, with a notice when bytes were dropped.
    pub fn stdout_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        if self.stdout_truncated > 0 {
            text.push_str(&format!(
                "\n[stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        text
    }

    /// Lossily decoded stderr, with notices for dropped bytes and a timeout kill.
    pub fn stderr_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stderr).into_owned();
        if self.stderr_truncated > 0 {
            text.push_str(&format!(
                "\n[stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        if self.timed_out {
            text.push_str("\n[timed out; process killed]\n");
        }
        text
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
///
/// On unix the child leads its own process group. On timeout the whole group is killed, so
/// anything it started dies with it, and whatever was written so far is returned. If a
/// leftover process still holds the pipes after the child exits, the group is killed once
/// [`DRAIN_GRACE`] has passed and the output buffered up to then is kept.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<ProcessOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!(program = ?cmd.get_program(), "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };
    let pid = child.id();

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let input = input.to_vec();
        // Detached: a child that never reads stdin must not hold us up.
        thread::spawn(move || {
            if let Err(e) = child_stdin.write_all(&input) {
                debug!(err = %e, "stdin write ended early");
            }
        });
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let mut stdout_reader = StreamReader::spawn(stdout, output_limit_bytes);
    let mut stderr_reader = StreamReader::spawn(stderr, output_limit_bytes);

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            kill_tree(&mut child, pid);
            child.wait().context("wait command after kill")?
        }
    };

    if !drain_both(&mut stdout_reader, &mut stderr_reader) {
        warn!(pid, "output still held open after exit, killing process group");
        kill_group(pid);
        if !drain_both(&mut stdout_reader, &mut stderr_reader) {
            warn!(pid, "abandoning output readers");
        }
    }

    let (stdout, stdout_truncated) = stdout_reader.into_output().context("read stdout")?;
    let (stderr, stderr_truncated) = stderr_reader.into_output().context("read stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(ProcessOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// Give both streams up to [`DRAIN_GRACE`] to reach EOF.
fn drain_both(stdout: &mut StreamReader, stderr: &mut StreamReader) -> bool {
    let deadline = Instant::now() + DRAIN_GRACE;
    let stdout_done = stdout.finished_by(deadline);
    let stderr_done = stderr.finished_by(deadline);
    stdout_done && stderr_done
}

/// Kill the child and everything in its process group.
fn kill_tree(child: &mut Child, pid: u32) {
    kill_group(pid);
    if let Err(e) = child.kill() {
        debug!(err = %e, "direct kill after group kill failed");
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        warn!(pid, "pid out of range, cannot signal its group");
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        debug!(err = %e, pid, "process group kill failed");
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

#[derive(Debug, Default)]
struct Captured {
    buf: Vec<u8>,
    truncated: usize,
}

/// A pipe drained on its own thread into a shared buffer.
///
/// The buffer stays readable even when the thread never finishes, so partial output
/// survives a pipe that a stray process keeps open.
struct StreamReader {
    captured: Arc<Mutex<Captured>>,
    done: Receiver<Result<()>>,
    outcome: Option<Result<()>>,
}

impl StreamReader {
    fn spawn<R: Read + Send + 'static>(reader: R, limit: usize) -> Self {
        let captured = Arc::new(Mutex::new(Captured::default()));
        let (tx, done) = mpsc::channel();
        let shared = Arc::clone(&captured);
        thread::spawn(move || {
            // The receiver may already be gone if we gave up on this stream.
            let _ = tx.send(read_stream_limited(reader, limit, &shared));
        });
        Self {
            captured,
            done,
            outcome: None,
        }
    }

    /// Wait for the stream to hit EOF, until `deadline` at the latest.
    fn finished_by(&mut self, deadline: Instant) -> bool {
        if self.outcome.is_some() {
            return true;
        }
        let wait = deadline.saturating_duration_since(Instant::now());
        match self.done.recv_timeout(wait) {
            Ok(result) => {
                self.outcome = Some(result);
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
            Err(RecvTimeoutError::Disconnected) => {
                self.outcome = Some(Err(anyhow!("output reader thread panicked")));
                true
            }
        }
    }

    fn into_output(self) -> Result<(Vec<u8>, usize)> {
        if let Some(Err(e)) = self.outcome {
            return Err(e);
        }
        let captured = self
            .captured
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok((captured.buf.clone(), captured.truncated))
    }
}

fn read_stream_limited<R: Read>(
    mut reader: R,
    limit: usize,
    captured: &Mutex<Captured>,
) -> Result<()> {
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let mut captured = captured.lock().unwrap_or_else(PoisonError::into_inner);
        let remaining = limit.saturating_sub(captured.buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            captured.buf.extend_from_slice(&chunk[..keep]);
            captured.truncated += n.saturating_sub(keep);
        } else {
            captured.truncated += n;
        }
    }

    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_both_streams() {
        let out = run_with_timeout(
            sh("echo out; echo err >&2; exit 3"),
            None,
            Duration::from_secs(5),
            1024,
        )
        .expect("run");
        assert!(!out.success());
        assert_eq!(out.status.code(), Some(3));
        assert_eq!(out.stdout_text(), "out\n");
        assert_eq!(String::from_utf8_lossy(&out.stderr), "err\n");
    }

    #[test]
    fn feeds_stdin() {
        let out = run_with_timeout(
            Command::new("cat"),
            Some(b"hello"),
            Duration::from_secs(5),
            1024,
        )
        .expect("run");
        assert!(out.success());
        assert_eq!(out.stdout, b"hello");
    }

    #[test]
    fn timeout_keeps_partial_output() {
        let out = run_with_timeout(
            sh("echo partial; exec sleep 5"),
            None,
            Duration::from_millis(500),
            1024,
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(!out.success());
        assert!(out.stdout_text().contains("partial"));
        assert!(out.stderr_text().contains("timed out"));
    }

    #[test]
    fn timeout_kills_grandchildren_holding_the_pipes() {
        let started = Instant::now();
        let out = run_with_timeout(
            sh("echo partial; sleep 30; echo late"),
            None,
            Duration::from_secs(1),
            1024,
        )
        .expect("run");
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(out.timed_out);
        assert_eq!(out.stdout_text(), "partial\n");
    }

    #[test]
    fn background_process_cannot_pin_output_after_exit() {
        let started = Instant::now();
        let out = run_with_timeout(
            sh("echo done; sleep 30 &"),
            None,
            Duration::from_secs(20),
            1024,
        )
        .expect("run");
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(out.success());
        assert_eq!(out.stdout_text(), "done\n");
    }

    #[test]
    fn output_beyond_limit_is_counted_not_kept() {
        let out = run_with_timeout(
            sh("printf 'abcdefghij'"),
            None,
            Duration::from_secs(5),
            4,
        )
        .expect("run");
        assert_eq!(out.stdout, b"abcd");
        assert_eq!(out.stdout_truncated, 6);
        assert!(out.stdout_text().contains("[stdout truncated 6 bytes]"));
    }

    #[test]
    fn missing_program_is_an_error() {
        let err = run_with_timeout(
            Command::new("definitely-not-a-real-binary-xyz"),
            None,
            Duration::from_secs(1),
            16,
        )
        .unwrap_err();
        assert!(err.to_string().contains("spawn command"));
    }
}
