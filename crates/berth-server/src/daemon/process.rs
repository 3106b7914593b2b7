//! OS services used by the lifecycle controller: signalling, liveness,
//! user lookup and spawning the detached daemon.

use std::ffi::CString;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::info;

use crate::error::LifecycleError;

/// Numeric identity of a system user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserIdentity {
    pub uid: u32,
    pub gid: u32,
}

/// How to launch the background server.
#[derive(Debug, Clone)]
pub struct DaemonSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Run as this user (and its primary group) instead of the caller.
    pub user: Option<String>,
    /// Where the daemon's stdout and stderr go.
    pub log_file: Option<PathBuf>,
    /// Extra environment, set on top of the inherited one.
    pub env: Vec<(&'static str, PathBuf)>,
}

pub trait ProcessControl: Send {
    /// Ask `pid` to shut down (SIGTERM). Does not wait for it to exit.
    fn terminate(&self, pid: i32) -> Result<(), LifecycleError>;

    fn is_alive(&self, pid: i32) -> bool;

    fn lookup_user(&self, name: &str) -> Option<UserIdentity>;

    fn effective_uid(&self) -> u32;

    /// Start a daemon in its own session and return its PID.
    fn spawn_detached(&self, spec: &DaemonSpec) -> Result<u32, LifecycleError>;
}

/// [`ProcessControl`] backed by the running system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcesses;

impl ProcessControl for SystemProcesses {
    fn terminate(&self, pid: i32) -> Result<(), LifecycleError> {
        // SAFETY: kill(2) has no memory-safety preconditions.
        if unsafe { libc::kill(pid, libc::SIGTERM) } == -1 {
            return Err(LifecycleError::Signal {
                pid,
                source: io::Error::last_os_error(),
            });
        }
        info!(pid, "sent SIGTERM");
        Ok(())
    }

    fn is_alive(&self, pid: i32) -> bool {
        // SAFETY: signal 0 only checks for existence and permission.
        if unsafe { libc::kill(pid, 0) } == 0 {
            return true;
        }
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    fn lookup_user(&self, name: &str) -> Option<UserIdentity> {
        let name = CString::new(name).ok()?;
        // SAFETY: passwd is plain old data; getpwnam_r fills it in.
        let mut entry: libc::passwd = unsafe { std::mem::zeroed() };
        let mut buf = vec![0 as libc::c_char; 16 * 1024];
        let mut found: *mut libc::passwd = std::ptr::null_mut();
        // SAFETY: every pointer refers to a live local of the advertised size.
        let rc = unsafe {
            libc::getpwnam_r(
                name.as_ptr(),
                &mut entry,
                buf.as_mut_ptr(),
                buf.len(),
                &mut found,
            )
        };
        if rc != 0 || found.is_null() {
            return None;
        }
        Some(UserIdentity {
            uid: entry.pw_uid,
            gid: entry.pw_gid,
        })
    }

    fn effective_uid(&self) -> u32 {
        // SAFETY: geteuid cannot fail.
        unsafe { libc::geteuid() }
    }

    fn spawn_detached(&self, spec: &DaemonSpec) -> Result<u32, LifecycleError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(name, value)| (*name, value)))
            .stdin(Stdio::null());

        match &spec.log_file {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                let log = OpenOptions::new().create(true).append(true).open(path)?;
                cmd.stdout(log.try_clone()?).stderr(log);
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        if let Some(name) = &spec.user {
            let user = self
                .lookup_user(name)
                .ok_or_else(|| LifecycleError::UnknownUser(name.clone()))?;
            cmd.uid(user.uid).gid(user.gid);
        }

        // SAFETY: setsid is async-signal-safe and touches no parent state.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(LifecycleError::Spawn)?;
        let pid = child.id();
        info!(pid, program = %spec.program.display(), user = ?spec.user, "spawned server daemon");
        Ok(pid)
    }
}
