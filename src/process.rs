//! The sole place this crate launches a child process (component B).
//!
//! Grounded on the teacher's direct `std::process::Command` call sites
//! (`GitRepo::git`, `direct_clone`, ...), generalized with idle/total
//! timeouts and process-tree kill. No async runtime: a watcher thread
//! samples progress, matching the "parallel threads, preemptive" scheduling
//! model of spec §5.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[cfg(unix)]
use std::os::unix::process::CommandExt;

use camino::Utf8Path;

use crate::cancellation::CancellationToken;
use crate::error::{ErrorKind, GitMirrorError, Result};

/// Why a command invocation failed, for the structured error translation
/// spec §4.B calls for (`commandLine`, last lines of stderr, category).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    Timeout,
    NonZeroExit,
    ProcessFailure,
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// A structured failure carrying everything the caller needs to log or
/// surface without re-parsing stderr.
#[derive(Debug)]
pub struct CommandError {
    pub command_line: String,
    pub category: FailureCategory,
    pub stderr_tail: String,
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "`{}` failed ({:?}): {}",
            self.command_line, self.category, self.stderr_tail
        )
    }
}
impl std::error::Error for CommandError {}

impl From<CommandError> for GitMirrorError {
    fn from(e: CommandError) -> Self {
        let kind = match e.category {
            FailureCategory::Timeout => ErrorKind::TransportRecoverable,
            FailureCategory::NonZeroExit => ErrorKind::Internal,
            FailureCategory::ProcessFailure => ErrorKind::Internal,
        };
        GitMirrorError::with_source(kind, e.to_string(), e)
    }
}

/// Idle and total timeouts, in seconds. `idle` fires if neither stdout nor
/// stderr has produced a byte for that long; `total` is a hard ceiling on
/// wall-clock duration regardless of progress.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub idle_seconds: u64,
    pub total_seconds: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            idle_seconds: 60,
            total_seconds: 600,
        }
    }
}

/// Launches `git` (or any other binary) with a working directory, argv,
/// environment, and idle/total timeouts. The only component that spawns a
/// child process.
pub struct ProcessRunner {
    timeouts: Timeouts,
}

impl ProcessRunner {
    pub fn new(timeouts: Timeouts) -> Self {
        Self { timeouts }
    }

    /// Runs `cmd` to completion, honoring this runner's timeouts and the
    /// given cancellation token. Returns the raw output; callers that want
    /// exit-code/timeout translated into a [`GitMirrorError`] should call
    /// [`ProcessRunner::run_checked`] instead.
    pub fn run(
        &self,
        mut cmd: Command,
        cwd: Option<&Utf8Path>,
        token: &CancellationToken,
    ) -> std::result::Result<ProcessOutput, CommandError> {
        let command_line = format_command(&cmd);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd.as_std_path());
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // Gives the child its own process group (pgid == pid) so `kill_tree`
        // can signal it and everything it forks (e.g. `git gc` spawning
        // `git pack-objects`) in one shot instead of just the immediate
        // child.
        #[cfg(unix)]
        cmd.process_group(0);

        let start = Instant::now();
        let mut child: Child = cmd.spawn().map_err(|e| CommandError {
            command_line: command_line.clone(),
            category: FailureCategory::ProcessFailure,
            stderr_tail: e.to_string(),
        })?;

        let stdout_pipe = child.stdout.take().expect("piped stdout");
        let stderr_pipe = child.stderr.take().expect("piped stderr");

        let last_progress_millis = Arc::new(AtomicU64::new(0));
        let stdout_buf = Arc::new(std::sync::Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(std::sync::Mutex::new(Vec::new()));
        let done = Arc::new(AtomicBool::new(false));

        let readers = [
            spawn_reader(stdout_pipe, stdout_buf.clone(), last_progress_millis.clone()),
            spawn_reader(stderr_pipe, stderr_buf.clone(), last_progress_millis.clone()),
        ];

        let category = loop {
            if done.load(Ordering::SeqCst) {
                break None;
            }
            match child.try_wait() {
                Ok(Some(_status)) => break None,
                Ok(None) => {}
                Err(e) => {
                    return Err(CommandError {
                        command_line,
                        category: FailureCategory::ProcessFailure,
                        stderr_tail: e.to_string(),
                    })
                }
            }

            if token.is_cancelled() {
                let _ = kill_tree(&mut child);
                break Some(FailureCategory::ProcessFailure);
            }

            let elapsed = start.elapsed().as_secs();
            if elapsed >= self.timeouts.total_seconds {
                let _ = kill_tree(&mut child);
                break Some(FailureCategory::Timeout);
            }
            let idle_ms = last_progress_millis.load(Ordering::SeqCst);
            let idle_secs = start.elapsed().as_millis().saturating_sub(idle_ms as u128) / 1000;
            if idle_ms > 0 && idle_secs >= self.timeouts.idle_seconds as u128 {
                let _ = kill_tree(&mut child);
                break Some(FailureCategory::Timeout);
            }

            thread::sleep(Duration::from_millis(50));
        };
        done.store(true, Ordering::SeqCst);

        for r in readers {
            let _ = r.join();
        }

        let status = child.wait().map_err(|e| CommandError {
            command_line: command_line.clone(),
            category: FailureCategory::ProcessFailure,
            stderr_tail: e.to_string(),
        })?;

        let stdout = stdout_buf.lock().unwrap().clone();
        let stderr = stderr_buf.lock().unwrap().clone();
        let duration = start.elapsed();

        if let Some(category) = category {
            return Err(CommandError {
                command_line,
                category,
                stderr_tail: tail_lines(&String::from_utf8_lossy(&stderr), 20),
            });
        }

        Ok(ProcessOutput {
            exit_code: status.code(),
            stdout,
            stderr,
            duration,
        })
    }

    /// Like [`ProcessRunner::run`], but a non-zero exit is also translated
    /// into a [`CommandError`] instead of being left for the caller to
    /// check on [`ProcessOutput::success`].
    pub fn run_checked(
        &self,
        cmd: Command,
        cwd: Option<&Utf8Path>,
        token: &CancellationToken,
    ) -> std::result::Result<ProcessOutput, CommandError> {
        let command_line = format_command_ref(&cmd);
        let output = self.run(cmd, cwd, token)?;
        if !output.success() {
            return Err(CommandError {
                command_line,
                category: FailureCategory::NonZeroExit,
                stderr_tail: tail_lines(&output.stderr_string(), 20),
            });
        }
        Ok(output)
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    mut pipe: R,
    buf: Arc<std::sync::Mutex<Vec<u8>>>,
    last_progress_millis: Arc<AtomicU64>,
) -> thread::JoinHandle<()> {
    let start = Instant::now();
    thread::spawn(move || {
        let mut chunk = [0u8; 4096];
        loop {
            match pipe.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    buf.lock().unwrap().extend_from_slice(&chunk[..n]);
                    last_progress_millis.store(start.elapsed().as_millis() as u64, Ordering::SeqCst);
                }
                Err(_) => break,
            }
        }
    })
}

/// Kills `child` and everything it forked. On Unix `run` places the child in
/// its own process group, so signaling `-pid` reaches the whole tree; on
/// Windows `taskkill /T` walks the process tree itself. Falls back to
/// killing just the immediate child if the tree-kill command can't run at
/// all (e.g. the binary isn't on `PATH`), so a best-effort kill still
/// happens either way.
fn kill_tree(child: &mut Child) -> std::io::Result<()> {
    let pid = child.id();

    #[cfg(unix)]
    let tree_killed = matches!(Command::new("kill").arg("-KILL").arg(format!("-{pid}")).status(), Ok(s) if s.success());

    #[cfg(windows)]
    let tree_killed = matches!(
        Command::new("taskkill").args(["/PID", &pid.to_string(), "/T", "/F"]).status(),
        Ok(s) if s.success()
    );

    if tree_killed {
        Ok(())
    } else {
        child.kill()
    }
}

fn format_command(cmd: &Command) -> String {
    format_command_ref(cmd)
}

fn format_command_ref(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(cmd.get_args().map(|a| a.to_string_lossy().into_owned()));
    parts.join(" ")
}

pub(crate) fn tail_lines(s: &str, n: usize) -> String {
    let lines: Vec<&str> = s.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// Windows argument-escaping for `cmd.exe`/`echo`-style helpers: quote
/// `& ^ < > | " %` by prefixing `^`; `%` is doubled (spec §6).
#[cfg(windows)]
pub fn windows_escape(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len());
    for c in arg.chars() {
        match c {
            '&' | '^' | '<' | '>' | '|' | '"' => {
                out.push('^');
                out.push(c);
            }
            '%' => out.push_str("%%"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(not(windows))]
pub fn windows_escape(arg: &str) -> String {
    arg.to_string()
}
