//! Child processes with timeouts, bounded output, and an optional live log.
//!
//! Every external collaborator (generator, validation command, the pipeline
//! subprocess) goes through [`run_command`]. Output is drained on reader
//! threads while the child runs so a chatty child can never deadlock on a
//! full pipe.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

type SharedLog = Arc<Mutex<BufWriter<File>>>;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Exit code, or `None` when the child was killed by a signal.
    pub fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }

    pub fn success(&self) -> bool {
        self.status.success() && !self.timed_out
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// stdout then stderr, with notices for truncation and timeout.
    pub fn combined(&self, label: &str) -> String {
        let mut out = String::from_utf8_lossy(&self.stdout).into_owned();
        if self.stdout_truncated > 0 {
            out.push_str(&format!("\n[{label} stdout truncated {} bytes]\n", self.stdout_truncated));
        }
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&String::from_utf8_lossy(&self.stderr));
        }
        if self.stderr_truncated > 0 {
            out.push_str(&format!("\n[{label} stderr truncated {} bytes]\n", self.stderr_truncated));
        }
        if self.timed_out {
            out.push_str(&format!("\n[{label} timed out]\n"));
        }
        out
    }
}

/// Run `cmd` to completion or until `timeout`, then kill it.
///
/// `output_limit_bytes` bounds what is kept in memory per stream; bytes past
/// the limit are still drained and counted as truncated. When `log_path` is
/// set, every line from both streams is appended to that file as it arrives.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes, logging = log_path.is_some()))]
pub fn run_command(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    log_path: Option<&Path>,
) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let log = match log_path {
        Some(path) => Some(open_log(path)?),
        None => None,
    };

    debug!(program = ?cmd.get_program(), "spawning child process");
    let mut child = cmd.spawn().map_err(|e| {
        error!(err = %e, "failed to spawn command");
        anyhow!(e).context(format!("spawn {:?}", cmd.get_program()))
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_log = log.clone();
    let stdout_handle = thread::spawn(move || drain(stdout, output_limit_bytes, stdout_log));
    let stderr_handle = thread::spawn(move || drain(stderr, output_limit_bytes, log));

    // Readers must be running before stdin is written.
    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        // A child that exits without reading stdin closes the pipe; that is
        // reported through its exit status, not as a write error here.
        if let Err(err) = child_stdin.write_all(input) {
            warn!(err = %err, "child closed stdin early");
        }
    }

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_reader(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_reader(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn open_log(path: &Path) -> Result<SharedLog> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("create log {}", path.display()))?;
    Ok(Arc::new(Mutex::new(BufWriter::new(file))))
}

fn join_reader(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Read `reader` line by line, keeping at most `limit` bytes.
fn drain<R: Read>(reader: R, limit: usize, log: Option<SharedLog>) -> Result<(Vec<u8>, usize)> {
    let mut reader = BufReader::new(reader);
    let mut kept = Vec::new();
    let mut truncated = 0usize;
    let mut line = Vec::new();

    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).context("read output")?;
        if n == 0 {
            break;
        }

        if let Some(log) = &log
            && let Ok(mut writer) = log.lock()
            && let Err(err) = writer.write_all(&line).and_then(|()| writer.flush())
        {
            warn!(err = %err, "failed to write process log");
        }

        let room = limit.saturating_sub(kept.len());
        let keep = n.min(room);
        kept.extend_from_slice(&line[..keep]);
        truncated += n - keep;
    }

    Ok((kept, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_both_streams_and_exit_code() {
        let out = run_command(
            sh("echo out; echo err >&2; exit 3"),
            None,
            Duration::from_secs(10),
            1024,
            None,
        )
        .expect("run");
        assert_eq!(out.exit_code(), Some(3));
        assert!(!out.success());
        assert_eq!(out.combined("test"), "out\nerr\n");
    }

    #[test]
    fn pipes_stdin_through() {
        let out = run_command(sh("cat"), Some(b"prompt text"), Duration::from_secs(10), 1024, None)
            .expect("run");
        assert_eq!(out.stdout_lossy(), "prompt text");
    }

    #[test]
    fn truncates_and_logs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("logs").join("step.log");
        let out = run_command(
            sh("printf 'abcdef\\nghij\\n'"),
            None,
            Duration::from_secs(10),
            4,
            Some(&log),
        )
        .expect("run");
        assert_eq!(out.stdout, b"abcd");
        assert_eq!(out.stdout_truncated, 8);
        assert_eq!(std::fs::read_to_string(&log).expect("log"), "abcdef\nghij\n");
    }

    #[test]
    fn kills_on_timeout() {
        let out = run_command(sh("exec sleep 5"), None, Duration::from_millis(200), 1024, None)
            .expect("run");
        assert!(out.timed_out);
        assert!(out.combined("slow").contains("[slow timed out]"));
    }
}
