use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, info, warn};

use crate::model::{AbortReason, ProcessRunResult, RepeatedErrorSignature};
use crate::util::{file_len, tail_lines};

pub const FATAL_PATTERN: &str = r"(?i)(error|exception|traceback|fatal|failed|assert)";

/// Exit code reported for a process the supervisor had to kill.
pub const KILLED_EXIT_CODE: i32 = -9;

const WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardSettings {
    pub timeout: Duration,
    pub inactivity_timeout: Duration,
    /// Zero disables repeated-error detection.
    pub repeated_error_threshold: usize,
    pub poll_interval: Duration,
    pub kill_grace: Duration,
    pub tail_lines: usize,
    pub scan_lines: usize,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(90 * 60),
            inactivity_timeout: Duration::from_secs(20 * 60),
            repeated_error_threshold: 8,
            poll_interval: Duration::from_secs(5),
            kill_grace: Duration::from_secs(20),
            tail_lines: 80,
            scan_lines: 500,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("empty command")]
    EmptyCommand,
    #[error("program not found: {0}")]
    NotFound(String),
    #[error("permission denied launching {0}")]
    PermissionDenied(String),
    #[error("failed to spawn {program}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to open process log {path}")]
    Log {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to wait for {program}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid fatal log pattern")]
    Pattern(#[from] regex::Error),
}

/// Runs `command` to completion or until a guard trips.
///
/// Output goes straight to the two log files, which are truncated first.
/// Non-zero exits and aborts are reported in the result; only a command that
/// cannot be started is an error.
pub fn run_command(
    command: &[String],
    stdout_path: &Path,
    stderr_path: &Path,
    settings: &GuardSettings,
) -> Result<ProcessRunResult, LaunchError> {
    let (program, args) = command.split_first().ok_or(LaunchError::EmptyCommand)?;
    let fatal = Regex::new(FATAL_PATTERN)?;

    let stdout = create_log(stdout_path)?;
    let stderr = create_log(stderr_path)?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => LaunchError::NotFound(program.clone()),
        io::ErrorKind::PermissionDenied => LaunchError::PermissionDenied(program.clone()),
        _ => LaunchError::Spawn {
            program: program.clone(),
            source,
        },
    })?;
    info!(program = %program, pid = child.id(), "launched guarded process");

    let mut last_activity = started;
    let mut last_sizes = (0, 0);
    let mut abort_reason = AbortReason::None;
    let mut repeated_error = None;

    let exit_status = loop {
        if let Some(status) = wait_for_tick(&mut child, program, settings.poll_interval)? {
            break Some(status);
        }

        let sizes = (file_len(stdout_path), file_len(stderr_path));
        if sizes != last_sizes {
            last_sizes = sizes;
            last_activity = Instant::now();
        }

        if settings.repeated_error_threshold > 0 {
            let mut scanned = tail_lines(stdout_path, settings.scan_lines);
            scanned.extend(tail_lines(stderr_path, settings.scan_lines));
            if let Some(signature) = detect_repeated_error(&scanned, &fatal)
                && signature.count >= settings.repeated_error_threshold
            {
                warn!(
                    program = %program,
                    line = %signature.line,
                    count = signature.count,
                    "repeated error threshold reached"
                );
                abort_reason = AbortReason::RepeatedError;
                repeated_error = Some(signature);
                break None;
            }
        }

        if started.elapsed() > settings.timeout {
            warn!(program = %program, elapsed_sec = started.elapsed().as_secs(), "wall-clock timeout reached");
            abort_reason = AbortReason::Timeout;
            break None;
        }

        if last_activity.elapsed() > settings.inactivity_timeout {
            warn!(program = %program, idle_sec = last_activity.elapsed().as_secs(), "no output activity");
            abort_reason = AbortReason::NoActivity;
            break None;
        }
    };

    let exit_code = match exit_status {
        Some(status) => exit_code_of(status),
        None => {
            kill_process_tree(&mut child);
            if !reap(&mut child, settings.kill_grace) {
                warn!(program = %program, "process still alive after kill grace period");
            }
            KILLED_EXIT_CODE
        }
    };

    let result = ProcessRunResult {
        exit_code,
        duration_sec: started.elapsed().as_secs_f64(),
        abort_reason,
        repeated_error,
        stdout_path: stdout_path.display().to_string(),
        stderr_path: stderr_path.display().to_string(),
        stdout_tail: tail_lines(stdout_path, settings.tail_lines),
        stderr_tail: tail_lines(stderr_path, settings.tail_lines),
    };

    info!(
        program = %program,
        exit_code = result.exit_code,
        abort_reason = %result.abort_reason.as_str(),
        duration_sec = result.duration_sec,
        "guarded process finished"
    );

    Ok(result)
}

/// Most frequent fatal-looking line; ties go to the line seen first.
pub fn detect_repeated_error(lines: &[String], fatal: &Regex) -> Option<RepeatedErrorSignature> {
    let mut order: Vec<(&str, usize)> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() || !fatal.is_match(trimmed) {
            continue;
        }
        match index.get(trimmed) {
            Some(&slot) => order[slot].1 += 1,
            None => {
                index.insert(trimmed, order.len());
                order.push((trimmed, 1));
            }
        }
    }

    let mut best: Option<(&str, usize)> = None;
    for (line, count) in order {
        if best.is_none_or(|(_, top)| count > top) {
            best = Some((line, count));
        }
    }

    best.map(|(line, count)| RepeatedErrorSignature {
        line: line.to_string(),
        count,
    })
}

fn create_log(path: &Path) -> Result<File, LaunchError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| LaunchError::Log {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    File::create(path).map_err(|source| LaunchError::Log {
        path: path.to_path_buf(),
        source,
    })
}

/// Sleeps for one poll interval, returning early if the child exits.
fn wait_for_tick(
    child: &mut Child,
    program: &str,
    interval: Duration,
) -> Result<Option<ExitStatus>, LaunchError> {
    let deadline = Instant::now() + interval;
    loop {
        let status = child.try_wait().map_err(|source| LaunchError::Wait {
            program: program.to_string(),
            source,
        })?;
        if status.is_some() {
            return Ok(status);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        thread::sleep(WAIT_SLICE.min(deadline - now));
    }
}

fn reap(child: &mut Child, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) if Instant::now() < deadline => thread::sleep(WAIT_SLICE),
            Ok(None) | Err(_) => return false,
        }
    }
}

#[cfg(unix)]
fn exit_code_of(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| -signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// The child leads its own process group, so signalling the group reaches
/// every descendant that did not detach.
#[cfg(unix)]
fn kill_process_tree(child: &mut Child) {
    let group = format!("-{}", child.id());
    let signalled = Command::new("kill")
        .args(["-9", "--", &group])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    debug!(group = %group, ok = matches!(signalled, Ok(status) if status.success()), "signalled process group");
    let _ = child.kill();
}

#[cfg(windows)]
fn kill_process_tree(child: &mut Child) {
    let pid = child.id().to_string();
    let signalled = Command::new("taskkill")
        .args(["/PID", &pid, "/T", "/F"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    debug!(pid = %pid, ok = matches!(signalled, Ok(status) if status.success()), "taskkill issued");
    let _ = child.kill();
}

#[cfg(not(any(unix, windows)))]
fn kill_process_tree(child: &mut Child) {
    let _ = child.kill();
}
