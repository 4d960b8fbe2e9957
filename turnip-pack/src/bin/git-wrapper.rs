//! Runs `git` on behalf of the backend and reports what it cost.
//!
//! The caller opens FD 3 before spawning us; we mark it close-on-exec so
//! the `git` child cannot touch it, run `git` with our arguments and
//! inherited stdio, then write a JSON resource-usage record to FD 3 and
//! exit with git's status.
use std::env;
use std::fs::File;
use std::os::fd::FromRawFd as _;
use std::os::unix::process::ExitStatusExt as _;
use std::process::{self, Command};
use std::time::Instant;

use turnip_pack::git::ResourceUsage;

fn seconds(tv: libc::timeval) -> f64 {
    tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0
}

fn main() {
    unsafe {
        let flags = libc::fcntl(3, libc::F_GETFD);
        if flags != -1 {
            libc::fcntl(3, libc::F_SETFD, flags | libc::FD_CLOEXEC);
        }
    }

    let start = Instant::now();
    let status = Command::new("git").args(env::args_os().skip(1)).status();
    let clock_time = start.elapsed().as_secs_f64();

    let code = match status {
        Ok(status) => status
            .code()
            .unwrap_or_else(|| 128 + status.signal().unwrap_or(0)),
        Err(e) => {
            eprintln!("turnip-git-wrapper: failed to run git: {e}");
            127
        }
    };

    let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
    unsafe {
        libc::getrusage(libc::RUSAGE_CHILDREN, &mut rusage);
    }
    let record = ResourceUsage {
        clock_time,
        user_time: seconds(rusage.ru_utime),
        system_time: seconds(rusage.ru_stime),
        max_rss: rusage.ru_maxrss,
    };
    let mut out = unsafe { File::from_raw_fd(3) };
    serde_json::to_writer(&mut out, &record).ok();

    process::exit(code);
}
