//! Spawning the reference `git`.
//!
//! Children are run through the `turnip-git-wrapper` helper, which executes
//! `git` with the given arguments and, once it terminates, writes a JSON
//! resource-usage record on FD 3. The backend binds FD 3 to a pipe before
//! exec and collects the record after exit.
use std::ffi::OsString;
use std::io::{self, Read as _};
use std::os::fd::FromRawFd as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};

/// What the spawned `git` cost, as reported by the wrapper on FD 3.
/// Times are seconds; `max_rss` is in kilobytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub clock_time: f64,
    pub user_time: f64,
    pub system_time: f64,
    pub max_rss: i64,
}

/// A running wrapper child and the pipe its resource-usage record will
/// arrive on.
pub struct GitChild {
    pub child: Child,
    pub rusage: RusagePipe,
}

/// Read end of the FD 3 pipe.
pub struct RusagePipe(std::fs::File);

impl RusagePipe {
    /// Read the record. Call after the child has exited; a child that died
    /// before writing a complete record yields `None`.
    pub async fn read(self) -> Option<ResourceUsage> {
        let mut pipe = self.0;
        tokio::task::spawn_blocking(move || {
            let mut buffer = Vec::new();
            pipe.read_to_end(&mut buffer).ok()?;
            serde_json::from_slice(&buffer).ok()
        })
        .await
        .ok()
        .flatten()
    }
}

/// Locate the wrapper: next to the current executable unless configured.
pub fn wrapper_path(configured: Option<&Path>) -> PathBuf {
    if let Some(path) = configured {
        return path.to_path_buf();
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| Some(exe.parent()?.join("turnip-git-wrapper")))
        .unwrap_or_else(|| PathBuf::from("turnip-git-wrapper"))
}

/// Spawn `wrapper <args…>` with piped stdio and FD 3 bound to a fresh pipe.
pub fn spawn(
    wrapper: &Path,
    args: &[OsString],
    env: &[(&'static str, OsString)],
) -> io::Result<GitChild> {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } == -1 {
        return Err(io::Error::last_os_error());
    }
    let [read_fd, write_fd] = fds;

    let mut command = Command::new(wrapper);
    command
        .args(args)
        .env_clear()
        .envs(std::env::vars().filter(|(key, _)| key == "PATH"))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in env {
        command.env(key, value);
    }
    // The child sees the pipe's write end as FD 3; dup2 clears
    // close-on-exec on the duplicate, the original closes at exec.
    unsafe {
        command.pre_exec(move || {
            if write_fd == 3 {
                // dup2 onto itself would keep CLOEXEC set.
                let flags = libc::fcntl(3, libc::F_GETFD);
                if flags == -1
                    || libc::fcntl(3, libc::F_SETFD, flags & !libc::FD_CLOEXEC) == -1
                {
                    return Err(io::Error::last_os_error());
                }
            } else if libc::dup2(write_fd, 3) == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let spawned = command.spawn();
    unsafe {
        libc::close(write_fd);
    }
    let rusage = RusagePipe(unsafe { std::fs::File::from_raw_fd(read_fd) });
    let child = spawned?;
    Ok(GitChild { child, rusage })
}
