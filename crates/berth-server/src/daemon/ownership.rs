//! Server state as seen by the unprivileged daemon user.
//!
//! The CLI usually runs as root and creates the key files, the token database
//! and the data directory with root ownership. The daemon drops to the
//! configured user before it touches any of them, so the check below judges
//! every path by that user's uid and gid, and [`hand_over`] transfers
//! ownership of what the daemon must read or write. Supplementary groups are
//! not considered.

use std::ffi::OsString;
use std::fs::Metadata;
use std::os::unix::fs::{chown, MetadataExt};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::process::{ProcessControl, UserIdentity};
use crate::error::LifecycleError;
use crate::server::{ServerConfig, ServerPaths};

const READ: u32 = 0o4;
const WRITE: u32 = 0o2;
const SEARCH: u32 = 0o1;

/// Whether the mode bits of `meta` grant `bits` to `user`.
fn grants(meta: &Metadata, user: UserIdentity, bits: u32) -> bool {
    if user.uid == 0 {
        return true;
    }
    let shift = if meta.uid() == user.uid {
        6
    } else if meta.gid() == user.gid {
        3
    } else {
        0
    };
    (meta.mode() >> shift) & bits == bits
}

/// SQLite's write-ahead log and shared-memory files next to `db`.
fn sidecars(db: &Path) -> [PathBuf; 2] {
    ["-wal", "-shm"].map(|suffix| {
        let mut name = OsString::from(db.as_os_str());
        name.push(suffix);
        PathBuf::from(name)
    })
}

/// The closest ancestor of `path` that exists.
fn nearest_existing_dir(path: &Path) -> Option<&Path> {
    path.ancestors()
        .skip(1)
        .map(|dir| if dir.as_os_str().is_empty() { Path::new(".") } else { dir })
        .find(|dir| dir.exists())
}

/// Every existing directory above `path` must be searchable by `user`.
fn check_reachable(label: &str, path: &Path, user: UserIdentity, problems: &mut Vec<String>) {
    for dir in path.ancestors().skip(1) {
        let Ok(meta) = std::fs::metadata(dir) else {
            continue;
        };
        if meta.is_dir() && !grants(&meta, user, SEARCH) {
            problems.push(format!(
                "{label} {}: directory {} is not accessible to uid {}",
                path.display(),
                dir.display(),
                user.uid
            ));
            return;
        }
    }
}

/// `user` must be able to create and remove files next to `path`.
fn check_dir_writable(label: &str, path: &Path, user: UserIdentity, problems: &mut Vec<String>) {
    let Some(dir) = nearest_existing_dir(path) else {
        return;
    };
    if let Ok(meta) = std::fs::metadata(dir) {
        if meta.is_dir() && !grants(&meta, user, WRITE | SEARCH) {
            problems.push(format!(
                "{label} {}: directory {} is not writable by uid {}",
                path.display(),
                dir.display(),
                user.uid
            ));
        }
    }
}

fn check_file(label: &str, path: &Path, user: UserIdentity, bits: u32, problems: &mut Vec<String>) {
    if let Ok(meta) = std::fs::metadata(path) {
        if !grants(&meta, user, bits) {
            let access = if bits & WRITE != 0 { "writable" } else { "readable" };
            problems.push(format!(
                "{label} {} is not {access} by uid {}",
                path.display(),
                user.uid
            ));
        }
    }
}

/// Every reason the daemon, running as `user`, could not use the state under
/// `paths`. Files that do not exist yet only need a writable directory.
pub fn access_problems(paths: &ServerPaths, user: UserIdentity) -> Vec<String> {
    let mut problems = Vec::new();

    for (label, path) in [
        ("public key", &paths.public_key),
        ("private key", &paths.private_key),
    ] {
        check_reachable(label, path, user, &mut problems);
        if path.exists() {
            check_file(label, path, user, READ, &mut problems);
        } else {
            check_dir_writable(label, path, user, &mut problems);
        }
    }

    let db = &paths.access_tokens_db;
    check_reachable("access token database", db, user, &mut problems);
    check_dir_writable("access token database", db, user, &mut problems);
    check_file("access token database", db, user, READ | WRITE, &mut problems);
    for sidecar in sidecars(db) {
        check_file("access token database", &sidecar, user, READ | WRITE, &mut problems);
    }

    // The daemon releases its own marker on shutdown.
    check_reachable("PID file", &paths.pid_file, user, &mut problems);
    check_dir_writable("PID file", &paths.pid_file, user, &mut problems);

    problems
}

/// Give `user` ownership of the state files the daemon opens, and of the
/// directories under the data directory that hold them. Directories outside
/// the data directory are never touched.
pub fn hand_over(paths: &ServerPaths, user: UserIdentity) -> Result<(), LifecycleError> {
    let mut targets = vec![
        paths.public_key.clone(),
        paths.private_key.clone(),
        paths.access_tokens_db.clone(),
    ];
    targets.extend(sidecars(&paths.access_tokens_db));
    for file in [
        &paths.public_key,
        &paths.private_key,
        &paths.access_tokens_db,
        &paths.pid_file,
    ] {
        targets.extend(
            file.ancestors()
                .skip(1)
                .take_while(|dir| dir.starts_with(&paths.data_dir))
                .map(Path::to_path_buf),
        );
    }
    targets.sort();
    targets.dedup();

    for path in targets.iter().filter(|p| p.exists()) {
        chown(path, Some(user.uid), Some(user.gid))?;
        debug!(path = %path.display(), uid = user.uid, "changed owner");
    }
    info!(uid = user.uid, gid = user.gid, "server state handed over to daemon user");
    Ok(())
}

/// Hand the state over to the configured daemon user when running as root.
/// Returns whether anything was done.
pub fn hand_over_to_daemon_user(
    cfg: &ServerConfig,
    paths: &ServerPaths,
    processes: &dyn ProcessControl,
) -> Result<bool, LifecycleError> {
    let Some(name) = &cfg.user else {
        return Ok(false);
    };
    if processes.effective_uid() != 0 {
        return Ok(false);
    }
    let user = processes
        .lookup_user(name)
        .ok_or_else(|| LifecycleError::UnknownUser(name.clone()))?;
    hand_over(paths, user)?;
    Ok(true)
}
