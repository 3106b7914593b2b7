use std::net::ToSocketAddrs;
use std::path::Path;

use tracing::debug;

use super::ownership::access_problems;
use super::process::ProcessControl;
use crate::identity::Identity;
use crate::server::{ServerConfig, ServerPaths};

/// Validate the server environment and return every problem found. An empty
/// list means the server may start.
///
/// `direct` skips the checks that only matter for a detached daemon running
/// as the configured user.
pub fn check_environment(
    cfg: &ServerConfig,
    paths: &ServerPaths,
    processes: &dyn ProcessControl,
    direct: bool,
) -> Vec<String> {
    let mut errors = Vec::new();

    if cfg.port == 0 {
        errors.push("listen port must not be 0".to_owned());
    }
    let resolves = (cfg.host.as_str(), cfg.port)
        .to_socket_addrs()
        .is_ok_and(|mut addrs| addrs.next().is_some());
    if !resolves {
        errors.push(format!("listen address {:?} does not resolve", cfg.host));
    }

    for (label, path) in [
        ("PID file", &paths.pid_file),
        ("access token database", &paths.access_tokens_db),
        ("public key", &paths.public_key),
        ("private key", &paths.private_key),
        ("log file", &paths.log_file),
    ] {
        if let Err(reason) = check_writable_parent(path) {
            errors.push(format!("{label} {}: {reason}", path.display()));
        }
    }

    if paths.private_key.exists() {
        if let Err(e) = Identity::load(&paths.public_key, &paths.private_key) {
            errors.push(format!("server identity is unusable: {e}"));
        }
    } else if paths.public_key.exists() {
        errors.push(format!(
            "public key {} exists without a private key",
            paths.public_key.display()
        ));
    }

    if !direct {
        if let Some(name) = &cfg.user {
            match processes.lookup_user(name) {
                None => errors.push(format!("daemon user {name:?} does not exist")),
                Some(user) => {
                    let euid = processes.effective_uid();
                    if euid != 0 && euid != user.uid {
                        errors.push(format!(
                            "running as uid {euid}, root privileges are needed to switch to user {name:?}"
                        ));
                    }
                    errors.extend(access_problems(paths, user));
                }
            }
        }
    }

    debug!(errors = errors.len(), "environment check finished");
    errors
}

/// The nearest existing ancestor of `path` must be a directory we can create
/// files in.
fn check_writable_parent(path: &Path) -> Result<(), String> {
    let mut dir = path.parent();
    while let Some(candidate) = dir {
        if candidate.as_os_str().is_empty() {
            dir = Some(Path::new("."));
            continue;
        }
        if candidate.exists() {
            if !candidate.is_dir() {
                return Err(format!("{} is not a directory", candidate.display()));
            }
            return tempfile::tempfile_in(candidate)
                .map(drop)
                .map_err(|e| format!("{} is not writable ({e})", candidate.display()));
        }
        dir = candidate.parent();
    }
    Err("no existing parent directory".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::process::{DaemonSpec, UserIdentity};
    use crate::error::LifecycleError;
    use std::os::unix::fs::{MetadataExt, PermissionsExt};
    use tempfile::tempdir;

    struct Users {
        euid: u32,
        /// Identity `lookup_user("berth")` resolves to.
        daemon: UserIdentity,
    }

    impl Users {
        /// The daemon user owns the test directories, as after a hand-over.
        fn owning(dir: &Path, euid: u32) -> Self {
            let meta = std::fs::metadata(dir).unwrap();
            Self {
                euid,
                daemon: UserIdentity {
                    uid: meta.uid(),
                    gid: meta.gid(),
                },
            }
        }
    }

    impl ProcessControl for Users {
        fn terminate(&self, _pid: i32) -> Result<(), LifecycleError> {
            Ok(())
        }
        fn is_alive(&self, _pid: i32) -> bool {
            false
        }
        fn lookup_user(&self, name: &str) -> Option<UserIdentity> {
            (name == "berth").then_some(self.daemon)
        }
        fn effective_uid(&self) -> u32 {
            self.euid
        }
        fn spawn_detached(&self, _spec: &DaemonSpec) -> Result<u32, LifecycleError> {
            Ok(1)
        }
    }

    fn config(dir: &Path) -> (ServerConfig, ServerPaths) {
        let cfg = ServerConfig {
            host: "127.0.0.1".into(),
            port: 6150,
            data_dir: Some(dir.to_path_buf()),
            ..ServerConfig::default()
        };
        let paths = cfg.paths().unwrap();
        (cfg, paths)
    }

    #[test]
    fn clean_environment_passes() {
        let dir = tempdir().unwrap();
        let (cfg, paths) = config(dir.path());
        assert!(check_environment(&cfg, &paths, &Users::owning(dir.path(), 0), false).is_empty());
    }

    #[test]
    fn every_problem_is_reported() {
        let dir = tempdir().unwrap();
        let (mut cfg, paths) = config(dir.path());
        cfg.port = 0;
        cfg.user = Some("nobody-here".into());
        std::fs::write(&paths.private_key, "not a key").unwrap();

        let errors = check_environment(&cfg, &paths, &Users::owning(dir.path(), 0), false);
        assert_eq!(errors.len(), 3, "{errors:?}");
    }

    #[test]
    fn privilege_drop_needs_root() {
        let dir = tempdir().unwrap();
        let (mut cfg, paths) = config(dir.path());
        cfg.user = Some("berth".into());
        let owner = Users::owning(dir.path(), 0).daemon.uid;
        let other = owner.wrapping_add(1).max(1);

        let as_root = Users::owning(dir.path(), 0);
        let as_daemon = Users::owning(dir.path(), owner);
        let as_other = Users::owning(dir.path(), other);
        assert!(check_environment(&cfg, &paths, &as_root, false).is_empty());
        assert!(check_environment(&cfg, &paths, &as_daemon, false).is_empty());
        assert_eq!(check_environment(&cfg, &paths, &as_other, false).len(), 1);
        assert!(check_environment(&cfg, &paths, &as_other, true).is_empty());
    }

    #[test]
    fn daemon_user_must_reach_the_state() {
        let dir = tempdir().unwrap();
        let (mut cfg, paths) = config(dir.path());
        cfg.user = Some("berth".into());
        std::fs::write(&paths.private_key, "").unwrap();
        std::fs::set_permissions(&paths.private_key, std::fs::Permissions::from_mode(0o600))
            .unwrap();
        let outsider = Users {
            euid: 0,
            daemon: UserIdentity {
                uid: 65534,
                gid: 65534,
            },
        };
        if Users::owning(dir.path(), 0).daemon.uid == outsider.daemon.uid {
            return;
        }

        let errors = check_environment(&cfg, &paths, &outsider, false);
        assert!(
            errors.iter().any(|e| e.starts_with("private key")),
            "{errors:?}"
        );
        assert!(errors.iter().any(|e| e.contains("not accessible")), "{errors:?}");
        // Direct mode runs as the invoking user and skips the daemon checks.
        assert!(check_environment(&cfg, &paths, &outsider, true)
            .iter()
            .all(|e| !e.contains("uid 65534")));
    }

    #[test]
    fn file_in_place_of_directory_is_reported() {
        let dir = tempdir().unwrap();
        let (cfg, mut paths) = config(dir.path());
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();
        paths.pid_file = blocker.join("berth.pid");

        let errors = check_environment(&cfg, &paths, &Users::owning(dir.path(), 0), false);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("PID file"));
    }
}
