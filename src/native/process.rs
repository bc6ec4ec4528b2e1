use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::time::timeout;

/// `setrlimit` values applied in the child between fork and exec.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub address_space_bytes: Option<u64>,
    pub cpu_seconds: Option<u64>,
    pub file_size_bytes: Option<u64>,
}

impl ResourceLimits {
    fn apply(&self) -> io::Result<()> {
        let limit = |value: u64| libc::rlimit {
            rlim_cur: value as libc::rlim_t,
            rlim_max: value as libc::rlim_t,
        };
        // SAFETY: setrlimit is async-signal-safe and only reads the struct.
        unsafe {
            if let Some(bytes) = self.address_space_bytes {
                if libc::setrlimit(libc::RLIMIT_AS, &limit(bytes)) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            if let Some(seconds) = self.cpu_seconds {
                if libc::setrlimit(libc::RLIMIT_CPU, &limit(seconds)) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            if let Some(bytes) = self.file_size_bytes {
                if libc::setrlimit(libc::RLIMIT_FSIZE, &limit(bytes)) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            if libc::setrlimit(libc::RLIMIT_CORE, &limit(0)) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ProcessSpec<'a> {
    pub program: &'a Path,
    pub args: Vec<OsString>,
    pub cwd: &'a Path,
    pub stdin: &'a [u8],
    pub time_limit: Option<Duration>,
    pub limits: ResourceLimits,
    pub stdout_limit: usize,
    pub stderr_limit: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

impl Captured {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).to_string()
    }
}

#[derive(Debug)]
pub struct ProcessOutput {
    /// `None` when the wall-clock limit expired and the group was killed.
    pub status: Option<ExitStatus>,
    pub stdout: Captured,
    pub stderr: Captured,
    pub elapsed: Duration,
}

/// Kills the child's whole process group, at the latest when dropped, so
/// helpers the program forked cannot outlive it. The group id is the
/// leader's pid, so the kill must happen before the leader is reaped.
#[derive(Debug)]
struct ProcessGroupGuard {
    pgid: Option<libc::pid_t>,
}

impl ProcessGroupGuard {
    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            // SAFETY: plain syscall; ESRCH for an already gone group is ignored.
            unsafe {
                libc::killpg(pgid, libc::SIGKILL);
            }
        }
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Spawns `spec.program` in a fresh process group with a cleared
/// environment, feeds stdin, and collects bounded stdout/stderr until the
/// process exits or the wall-clock limit expires.
pub async fn run_process(spec: ProcessSpec<'_>) -> io::Result<ProcessOutput> {
    let path = std::env::var_os("PATH").unwrap_or_else(|| "/usr/local/bin:/usr/bin:/bin".into());

    let mut command = Command::new(spec.program);
    command
        .args(&spec.args)
        .current_dir(spec.cwd)
        .env_clear()
        .env("PATH", path)
        .env("HOME", spec.cwd)
        .env("LANG", "C.UTF-8")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0);
    let limits = spec.limits;
    // SAFETY: the hook only calls setrlimit.
    unsafe {
        command.pre_exec(move || limits.apply());
    }

    let started = Instant::now();
    let mut child = command.spawn()?;
    let pid = child.id().map(|pid| pid as libc::pid_t);
    let mut group = ProcessGroupGuard { pgid: pid };

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let collect = async {
        let (_, stdout, stderr, exited) = tokio::join!(
            write_stdin(stdin, spec.stdin),
            read_bounded(stdout, spec.stdout_limit),
            read_bounded(stderr, spec.stderr_limit),
            wait_for_exit(pid),
        );
        exited?;
        // The leader is an unreaped zombie here, so the group id is still ours.
        group.kill();
        let status = child.wait().await?;
        Ok::<_, io::Error>((stdout?, stderr?, status))
    };

    let finished = match spec.time_limit {
        Some(limit) => timeout(limit, collect).await.ok(),
        None => Some(collect.await),
    };
    let elapsed = started.elapsed();

    match finished {
        Some(result) => {
            let (stdout, stderr, status) = result?;
            Ok(ProcessOutput {
                status: Some(status),
                stdout,
                stderr,
                elapsed,
            })
        }
        None => Ok(ProcessOutput {
            status: None,
            stdout: Captured::default(),
            stderr: Captured::default(),
            elapsed,
        }),
    }
}

/// Resolves once the child has exited, leaving it unreaped.
async fn wait_for_exit(pid: Option<libc::pid_t>) -> io::Result<()> {
    let Some(pid) = pid else {
        return Ok(());
    };
    tokio::task::spawn_blocking(move || {
        loop {
            // SAFETY: waitid only writes into `info`; WNOWAIT leaves the child
            // for `Child::wait` to reap.
            let rc = unsafe {
                let mut info: libc::siginfo_t = std::mem::zeroed();
                libc::waitid(
                    libc::P_PID,
                    pid as libc::id_t,
                    &mut info,
                    libc::WEXITED | libc::WNOWAIT,
                )
            };
            if rc == 0 {
                return Ok(());
            }
            let e = io::Error::last_os_error();
            if e.kind() != io::ErrorKind::Interrupted {
                return Err(e);
            }
        }
    })
    .await
    .map_err(io::Error::other)?
}

/// Writes all of `data` and closes the pipe. A program that exits without
/// reading its input is not an error.
async fn write_stdin(stdin: Option<ChildStdin>, data: &[u8]) {
    let Some(mut stdin) = stdin else {
        return;
    };
    if let Err(e) = stdin.write_all(data).await {
        if e.kind() != io::ErrorKind::BrokenPipe {
            tracing::debug!("Failed to write to stdin: {}", e);
        }
    }
}

/// Reads `reader` to EOF, keeping at most `limit` bytes. The excess is
/// drained so the child never blocks on a full pipe.
pub async fn read_bounded<R>(reader: Option<R>, limit: usize) -> io::Result<Captured>
where
    R: AsyncRead + Unpin,
{
    let mut captured = Captured::default();
    let Some(mut reader) = reader else {
        return Ok(captured);
    };
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(captured.bytes.len());
        if n > room {
            captured.truncated = true;
        }
        captured.bytes.extend_from_slice(&buf[..n.min(room)]);
    }
    Ok(captured)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec<'a>(program: &'a Path, args: &[&str], stdin: &'a [u8]) -> ProcessSpec<'a> {
        ProcessSpec {
            program,
            args: args.iter().map(OsString::from).collect(),
            cwd: Path::new("/tmp"),
            stdin,
            time_limit: Some(Duration::from_secs(5)),
            limits: ResourceLimits::default(),
            stdout_limit: 1024,
            stderr_limit: 1024,
        }
    }

    #[tokio::test]
    async fn test_read_bounded_truncates_and_drains() {
        let data = vec![b'x'; 10_000];
        let captured = read_bounded(Some(&data[..]), 100).await.unwrap();
        assert_eq!(captured.bytes.len(), 100);
        assert!(captured.truncated);

        let captured = read_bounded(Some(&b"short"[..]), 100).await.unwrap();
        assert_eq!(captured.text(), "short");
        assert!(!captured.truncated);

        let captured = read_bounded(None::<&[u8]>, 100).await.unwrap();
        assert_eq!(captured, Captured::default());
    }

    #[tokio::test]
    async fn test_run_process_pipes_stdin_to_stdout() {
        let output = run_process(spec(Path::new("cat"), &[], b"hello\nworld\n"))
            .await
            .unwrap();
        assert!(output.status.unwrap().success());
        assert_eq!(output.stdout.text(), "hello\nworld\n");
    }

    #[tokio::test]
    async fn test_run_process_environment_is_cleared() {
        let output = run_process(spec(Path::new("sh"), &["-c", "env"], b""))
            .await
            .unwrap();
        let env = output.stdout.text();
        assert!(env.contains("HOME=/tmp"));
        assert!(!env.contains("CARGO"));
    }

    #[tokio::test]
    async fn test_run_process_wall_clock_limit() {
        let mut spec = spec(Path::new("sleep"), &["10"], b"");
        spec.time_limit = Some(Duration::from_millis(200));

        let output = run_process(spec).await.unwrap();
        assert!(output.status.is_none());
        assert!(output.elapsed < Duration::from_secs(5));
    }

    fn running(argv: &[&str]) -> bool {
        let cmdline: Vec<u8> = argv
            .iter()
            .flat_map(|a| [a.as_bytes(), &b"\0"[..]].concat())
            .collect();
        std::fs::read_dir("/proc")
            .unwrap()
            .filter_map(Result::ok)
            .any(|entry| std::fs::read(entry.path().join("cmdline")).is_ok_and(|c| c == cmdline))
    }

    #[tokio::test]
    async fn test_dropping_the_run_kills_the_process_group() {
        let mut spec = spec(Path::new("sh"), &["-c", "sleep 3717 & sleep 3718"], b"");
        spec.time_limit = None;
        let mut run = Box::pin(run_process(spec));

        for _ in 0..250 {
            tokio::select! {
                result = &mut run => panic!("finished early: {:?}", result),
                _ = tokio::time::sleep(Duration::from_millis(20)) => {}
            }
            if running(&["sleep", "3717"]) && running(&["sleep", "3718"]) {
                break;
            }
        }
        assert!(running(&["sleep", "3717"]) && running(&["sleep", "3718"]));
        drop(run);

        for _ in 0..100 {
            if !running(&["sleep", "3717"]) && !running(&["sleep", "3718"]) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!running(&["sleep", "3717"]));
        assert!(!running(&["sleep", "3718"]));
    }

    #[tokio::test]
    async fn test_background_helper_is_killed_after_normal_exit() {
        // The helper closes its pipes, so the leader's exit ends the run.
        let output = run_process(spec(
            Path::new("sh"),
            &["-c", "sleep 3719 >/dev/null 2>&1 & echo started"],
            b"",
        ))
        .await
        .unwrap();
        assert!(output.status.unwrap().success());
        assert_eq!(output.stdout.text(), "started\n");

        for _ in 0..100 {
            if !running(&["sleep", "3719"]) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!running(&["sleep", "3719"]));
    }

    #[tokio::test]
    async fn test_run_process_missing_program() {
        let result = run_process(spec(Path::new("/nonexistent/diffrunner"), &[], b"")).await;
        assert!(result.is_err());
    }
}
