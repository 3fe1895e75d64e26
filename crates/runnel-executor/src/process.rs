//! Local process runner.
//!
//! Each stage runs as the leader of its own session. Before exec, the child
//! takes an exclusive `flock` on the stage lock file through a descriptor it
//! keeps open, so the lock lives exactly as long as the process group that
//! inherited it.

use fs2::FileExt;
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use runnel_core::executor::{ProcessRunner, SpawnSpec};
use runnel_core::{Error, Result};
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

/// Runs stage processes on the local machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalProcessRunner;

impl LocalProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessRunner for LocalProcessRunner {
    fn name(&self) -> &'static str {
        "local"
    }

    fn spawn(&self, spec: &SpawnSpec) -> Result<i32> {
        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| Error::InvalidInput("empty stage command".to_string()))?;

        if let Some(dir) = spec.log_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let log = File::create(&spec.log_path)?;
        let stderr = if spec.capture_stderr {
            Stdio::from(log.try_clone()?)
        } else {
            Stdio::null()
        };

        let lock_path = CString::new(spec.lock_path.as_os_str().as_bytes())
            .map_err(|e| Error::InvalidInput(format!("lock path: {}", e)))?;
        let cpu_limit = spec.cpu_limit.map(|d| d.as_secs() as libc::rlim_t);

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(stderr);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        // SAFETY: the hook only issues async-signal-safe libc calls on data
        // prepared before the fork.
        unsafe {
            cmd.pre_exec(move || {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                if let Some(limit) = cpu_limit {
                    limit_cpu(limit)?;
                }
                // Deliberately not O_CLOEXEC: the descriptor must survive exec.
                let fd = libc::open(
                    lock_path.as_ptr(),
                    libc::O_CREAT | libc::O_RDWR,
                    0o600 as libc::c_uint,
                );
                if fd < 0 {
                    return Err(io::Error::last_os_error());
                }
                if libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) != 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|source| Error::Spawn {
            command: spec.command.join(" "),
            source,
        })?;
        let pid = child.id() as i32;

        info!(
            pid,
            command = %spec.command.join(" "),
            log = %spec.log_path.display(),
            "Spawned stage process"
        );

        // The child is collected by `reap`, never waited on here.
        drop(child);
        Ok(pid)
    }

    fn is_locked(&self, lock_path: &Path) -> bool {
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)
        {
            Ok(file) => file,
            Err(e) => {
                warn!(lock = %lock_path.display(), error = %e, "Cannot open lock file");
                return false;
            }
        };

        // Dropping the file releases a lock we managed to take.
        FileExt::try_lock_exclusive(&file).is_err()
    }

    fn kill_group(&self, pid: i32) -> Result<()> {
        match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) => {
                debug!(pid, "Killed process group");
                Ok(())
            }
            Err(Errno::ESRCH) => {
                debug!(pid, "Process group already gone");
                Ok(())
            }
            Err(e) => Err(Error::Io(io::Error::from(e))),
        }
    }

    fn reap(&self) -> usize {
        let mut reaped = 0;
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => {
                    debug!(?status, "Reaped child");
                    reaped += 1;
                }
                Err(Errno::ECHILD) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!(error = %e, "waitpid failed");
                    break;
                }
            }
        }
        reaped
    }
}

/// Cap CPU time at what the process already used plus `limit` seconds.
fn limit_cpu(limit: libc::rlim_t) -> io::Result<()> {
    // SAFETY: plain syscalls on stack-allocated, zero-initialised structs.
    unsafe {
        let mut usage: libc::rusage = std::mem::zeroed();
        if libc::getrusage(libc::RUSAGE_SELF, &mut usage) != 0 {
            return Err(io::Error::last_os_error());
        }
        let used = (usage.ru_utime.tv_sec + usage.ru_stime.tv_sec) as libc::rlim_t;

        let mut rlim: libc::rlimit = std::mem::zeroed();
        if libc::getrlimit(libc::RLIMIT_CPU, &mut rlim) != 0 {
            return Err(io::Error::last_os_error());
        }
        let soft = used.saturating_add(limit);
        rlim.rlim_cur = if rlim.rlim_max == libc::RLIM_INFINITY {
            soft
        } else {
            soft.min(rlim.rlim_max)
        };
        if libc::setrlimit(libc::RLIMIT_CPU, &rlim) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
