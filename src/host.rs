//! The two dynamic-dispatch seams the design calls for (see design note in
//! spec §9): a [`Clock`] for `__runner_datetime`, and a [`ProcessHost`] for
//! path resolution / process spawning / file reads. Production wires both to
//! the OS; tests wire them to deterministic fakes.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Local};

/// Supplies the current time. The only reason this isn't `chrono::Local::now()`
/// called directly is so tests can pin `__runner_datetime` to a fixed value.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Local>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Local> {
        self.0
    }
}

/// Exit status of a spawned child, as reported back to the execution
/// assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }

    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Exited(c) => *c,
            ExitStatus::Signaled(sig) => 128 + sig,
        }
    }
}

/// A spawn request: no shell is ever involved, `program` and `args` are
/// passed straight to `execve`-equivalent.
#[derive(Debug, Clone)]
pub struct SpawnRequest<'a> {
    pub program: &'a Path,
    pub args: &'a [String],
    pub workdir: &'a Path,
    pub env: &'a HashMap<String, String>,
}

/// Abstracts everything that talks to the real operating system: reading
/// files for verification, checking executability, spawning children,
/// signaling/reaping them, and environment lookups. The production
/// implementation is [`OsHost`]; tests use an in-memory fake.
pub trait ProcessHost: Send + Sync {
    fn read_system_env(&self) -> HashMap<String, String>;

    fn read_file(&self, path: &Path) -> std::io::Result<Vec<u8>>;

    fn is_executable_file(&self, path: &Path) -> bool;

    fn path_exists(&self, path: &Path) -> bool;

    fn is_directory(&self, path: &Path) -> bool;

    /// Absolute paths of every executable regular file directly within
    /// `dir`, for standard-paths verification (spec §4.2(d)). Empty if
    /// `dir` does not exist, isn't a directory, or can't be read.
    fn list_executables(&self, dir: &Path) -> Vec<std::path::PathBuf>;

    /// Whether `path`'s parent directory is safe to use as a working
    /// directory: not world-writable without the sticky bit set. Production
    /// checks the real permission bits; fakes default to `true`.
    fn is_safe_workdir(&self, path: &Path) -> bool;

    fn create_dir_all(&self, path: &Path) -> std::io::Result<()>;

    /// Create a directory (and its parents) with mode 0700, for per-group
    /// temp dirs that must not be readable by other local users.
    fn create_private_dir(&self, path: &Path) -> std::io::Result<()>;

    fn remove_dir_all(&self, path: &Path) -> std::io::Result<()>;

    /// Spawn the child and return its pid; does not wait.
    fn spawn(&self, req: &SpawnRequest<'_>) -> std::io::Result<u32>;

    /// Non-blocking check for whether `pid` has exited; `None` if still running.
    fn try_wait(&self, pid: u32) -> std::io::Result<Option<ExitStatus>>;

    /// Blocking wait with no timeout (used once the host has already decided
    /// the process has been signaled and reaping should not itself block
    /// indefinitely in practice).
    fn wait(&self, pid: u32) -> std::io::Result<ExitStatus>;

    /// Drain whatever stdout/stderr bytes are currently buffered for `pid`
    /// without blocking. Called once per poll tick so a chatty child's pipe
    /// never fills up and stalls it while the runner is busy sleeping
    /// between timeout checks. Returns `(stdout, stderr)`; either may be
    /// empty if nothing is ready.
    fn read_output(&self, pid: u32) -> std::io::Result<(Vec<u8>, Vec<u8>)>;

    /// Release whatever pipe handles are held for `pid`. Idempotent; called
    /// once the child has been reaped and its output fully drained.
    fn close_output(&self, pid: u32);

    /// Create `path` exclusively (`O_CREAT|O_EXCL`) with mode 0600, for
    /// `output_file` tees. Rejects an existing symlink rather than following
    /// it. Fails if the path already exists.
    fn create_exclusive_file(&self, path: &Path) -> std::io::Result<()>;

    /// Append `data` to an already-created `output_file`.
    fn append_file(&self, path: &Path, data: &[u8]) -> std::io::Result<()>;

    fn send_sigterm(&self, pid: u32) -> std::io::Result<()>;

    fn send_sigkill(&self, pid: u32) -> std::io::Result<()>;

    fn sleep(&self, dur: Duration);

    fn pid(&self) -> u32;
}

pub mod os {
    use super::*;
    use std::io::Read;
    use std::os::unix::io::AsRawFd;
    use std::process::{ChildStderr, ChildStdout, Command, Stdio};
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    pub struct OsHost {
        children: Mutex<HashMap<u32, (ChildStdout, ChildStderr)>>,
    }

    impl ProcessHost for OsHost {
        fn read_system_env(&self) -> HashMap<String, String> {
            std::env::vars().collect()
        }

        fn read_file(&self, path: &Path) -> std::io::Result<Vec<u8>> {
            let mut f = std::fs::File::open(path)?;
            let mut buf = Vec::new();
            f.read_to_end(&mut buf)?;
            Ok(buf)
        }

        fn is_executable_file(&self, path: &Path) -> bool {
            use std::os::unix::fs::PermissionsExt;
            match std::fs::metadata(path) {
                Ok(md) => md.is_file() && (md.permissions().mode() & 0o111) != 0,
                Err(_) => false,
            }
        }

        fn path_exists(&self, path: &Path) -> bool {
            path.exists()
        }

        fn is_directory(&self, path: &Path) -> bool {
            path.is_dir()
        }

        fn list_executables(&self, dir: &Path) -> Vec<std::path::PathBuf> {
            let Ok(entries) = std::fs::read_dir(dir) else { return Vec::new() };
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| self.is_executable_file(p))
                .collect()
        }

        fn is_safe_workdir(&self, path: &Path) -> bool {
            use std::os::unix::fs::PermissionsExt;
            let Some(parent) = path.parent() else { return true };
            match std::fs::metadata(parent) {
                Ok(md) => {
                    let mode = md.permissions().mode();
                    let world_writable = mode & 0o002 != 0;
                    let sticky = mode & 0o1000 != 0;
                    !world_writable || sticky
                }
                Err(_) => false,
            }
        }

        fn create_dir_all(&self, path: &Path) -> std::io::Result<()> {
            std::fs::create_dir_all(path)
        }

        fn create_private_dir(&self, path: &Path) -> std::io::Result<()> {
            use std::os::unix::fs::DirBuilderExt;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::DirBuilder::new().mode(0o700).create(path)
        }

        fn remove_dir_all(&self, path: &Path) -> std::io::Result<()> {
            std::fs::remove_dir_all(path)
        }

        fn spawn(&self, req: &SpawnRequest<'_>) -> std::io::Result<u32> {
            let mut child = Command::new(req.program)
                .args(req.args)
                .current_dir(req.workdir)
                .env_clear()
                .envs(req.env.iter())
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()?;
            let pid = child.id();
            let stdout = child.stdout.take().expect("piped stdout");
            let stderr = child.stderr.take().expect("piped stderr");
            set_nonblocking(stdout.as_raw_fd());
            set_nonblocking(stderr.as_raw_fd());
            self.children.lock().unwrap().insert(pid, (stdout, stderr));
            // The Child handle itself is no longer needed: reaping happens
            // through waitpid(2) directly against the pid, and both pipe
            // ends have already been taken out above.
            Ok(pid)
        }

        fn try_wait(&self, pid: u32) -> std::io::Result<Option<ExitStatus>> {
            let mut status: libc::c_int = 0;
            let ret = unsafe { libc::waitpid(pid as libc::pid_t, &mut status, libc::WNOHANG) };
            if ret == 0 {
                Ok(None)
            } else if ret == pid as libc::c_int {
                Ok(Some(decode_status(status)))
            } else {
                Err(std::io::Error::last_os_error())
            }
        }

        fn wait(&self, pid: u32) -> std::io::Result<ExitStatus> {
            let mut status: libc::c_int = 0;
            let ret = unsafe { libc::waitpid(pid as libc::pid_t, &mut status, 0) };
            if ret == pid as libc::c_int {
                Ok(decode_status(status))
            } else {
                Err(std::io::Error::last_os_error())
            }
        }

        fn read_output(&self, pid: u32) -> std::io::Result<(Vec<u8>, Vec<u8>)> {
            let mut children = self.children.lock().unwrap();
            match children.get_mut(&pid) {
                Some((stdout, stderr)) => Ok((read_available(stdout), read_available(stderr))),
                None => Ok((Vec::new(), Vec::new())),
            }
        }

        fn close_output(&self, pid: u32) {
            self.children.lock().unwrap().remove(&pid);
        }

        fn create_exclusive_file(&self, path: &Path) -> std::io::Result<()> {
            use std::os::unix::fs::OpenOptionsExt;
            if path.symlink_metadata().map(|m| m.file_type().is_symlink()).unwrap_or(false) {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "output_file path is an existing symlink",
                ));
            }
            std::fs::OpenOptions::new().write(true).create_new(true).mode(0o600).open(path)?;
            Ok(())
        }

        fn append_file(&self, path: &Path, data: &[u8]) -> std::io::Result<()> {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new().append(true).open(path)?;
            f.write_all(data)
        }

        fn send_sigterm(&self, pid: u32) -> std::io::Result<()> {
            send_signal(pid, libc::SIGTERM)
        }

        fn send_sigkill(&self, pid: u32) -> std::io::Result<()> {
            send_signal(pid, libc::SIGKILL)
        }

        fn sleep(&self, dur: Duration) {
            std::thread::sleep(dur);
        }

        fn pid(&self) -> u32 {
            std::process::id()
        }
    }

    fn decode_status(status: libc::c_int) -> ExitStatus {
        unsafe {
            if libc::WIFEXITED(status) {
                ExitStatus::Exited(libc::WEXITSTATUS(status))
            } else {
                ExitStatus::Signaled(libc::WTERMSIG(status))
            }
        }
    }

    fn send_signal(pid: u32, sig: libc::c_int) -> std::io::Result<()> {
        let ret = unsafe { libc::kill(pid as libc::pid_t, sig) };
        if ret == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    fn set_nonblocking(fd: std::os::unix::io::RawFd) {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL, 0);
            if flags >= 0 {
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
    }

    /// Read whatever is immediately available on `r` without blocking.
    /// `EWOULDBLOCK` just means "nothing ready this tick", not an error.
    fn read_available(r: &mut impl Read) -> Vec<u8> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            match r.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        out
    }
}
