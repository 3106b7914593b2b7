//! Daemon lifecycle: single-instance start, stop and restart of the server
//! process, guarded by the PID marker.
//!
//! The controller never binds the listen port itself. When it replaces a
//! running instance it signals the old process and then waits until the port
//! can be bound again before launching the new one, so two instances never
//! race for the socket.

pub mod environment;
pub mod ownership;
pub mod pid;
pub mod port;
pub mod process;

use std::fmt;
use std::time::Duration;

use tracing::{info, warn};

pub use environment::check_environment;
pub use ownership::{access_problems, hand_over, hand_over_to_daemon_user};
pub use pid::PidMarker;
pub use port::{is_port_bindable, wait_until_bindable};
pub use process::{DaemonSpec, ProcessControl, SystemProcesses, UserIdentity};

use crate::error::LifecycleError;
use crate::server::{ServerConfig, ServerPaths};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Hidden subcommand the detached daemon is launched with.
pub const SERVE_COMMAND: &str = "serve";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// What a lifecycle operation did. `AlreadyStopped` and `AlreadyRunning`
/// mean nothing changed; both are successes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    AlreadyStopped,
    AlreadyRunning { pid: i32 },
    /// The termination signal was sent; the process may still be exiting.
    Stopping { pid: i32 },
    Started { pid: u32 },
    Restarted { previous: i32, pid: u32 },
    /// Direct mode: the caller must now run the server in the foreground.
    Foreground,
}

impl Outcome {
    pub fn changed_state(&self) -> bool {
        !matches!(self, Outcome::AlreadyStopped | Outcome::AlreadyRunning { .. })
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::AlreadyStopped => write!(f, "Server is already stopped"),
            Outcome::AlreadyRunning { .. } => write!(f, "Server is already running"),
            Outcome::Stopping { .. } => write!(f, "Server is stopping"),
            Outcome::Started { .. } => write!(f, "Server is started"),
            Outcome::Restarted { .. } => write!(f, "Server is restarted"),
            Outcome::Foreground => write!(f, "Server is running in the foreground"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    /// Run attached to the terminal instead of detaching.
    pub direct: bool,
    pub skip_check: bool,
    /// Terminate an instance that is already running. The caller decides
    /// this, typically by asking the operator.
    pub replace_existing: bool,
}

pub struct Controller<P> {
    cfg: ServerConfig,
    paths: ServerPaths,
    marker: PidMarker,
    processes: P,
    poll_interval: Duration,
    state: LifecycleState,
}

impl<P: ProcessControl> Controller<P> {
    pub fn new(cfg: ServerConfig, paths: ServerPaths, processes: P) -> Self {
        let marker = PidMarker::new(paths.pid_file.clone());
        Self {
            cfg,
            paths,
            marker,
            processes,
            poll_interval: DEFAULT_POLL_INTERVAL,
            state: LifecycleState::Stopped,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn marker(&self) -> &PidMarker {
        &self.marker
    }

    pub fn check_environment(&self, direct: bool) -> Vec<String> {
        check_environment(&self.cfg, &self.paths, &self.processes, direct)
    }

    /// PID of the running server, if any. A marker left behind by a process
    /// that no longer exists is removed.
    pub fn running_pid(&mut self) -> Result<Option<i32>, LifecycleError> {
        let Some(pid) = self.marker.read()? else {
            self.state = LifecycleState::Stopped;
            return Ok(None);
        };
        if self.processes.is_alive(pid) {
            self.state = LifecycleState::Running;
            return Ok(Some(pid));
        }
        warn!(pid, path = %self.marker.path().display(), "removing stale PID marker");
        self.marker.remove()?;
        self.state = LifecycleState::Stopped;
        Ok(None)
    }

    pub fn start(&mut self, opts: StartOptions) -> Result<Outcome, LifecycleError> {
        if !opts.direct {
            self.hand_over_state()?;
        }
        if !opts.skip_check {
            let errors = self.check_environment(opts.direct);
            if !errors.is_empty() {
                return Err(LifecycleError::Environment(errors));
            }
        }

        if let Some(pid) = self.running_pid()? {
            if !opts.replace_existing {
                info!(pid, "server already running, leaving it in place");
                return Ok(Outcome::AlreadyRunning { pid });
            }
            self.terminate_and_wait(pid)?;
        }

        if opts.direct {
            self.state = LifecycleState::Running;
            return Ok(Outcome::Foreground);
        }
        let pid = self.launch()?;
        Ok(Outcome::Started { pid })
    }

    pub fn stop(&mut self) -> Result<Outcome, LifecycleError> {
        let Some(pid) = self.running_pid()? else {
            return Ok(Outcome::AlreadyStopped);
        };
        self.state = LifecycleState::Stopping;
        self.processes.terminate(pid)?;
        Ok(Outcome::Stopping { pid })
    }

    /// Replace the running server with a fresh daemon. Blocks until the old
    /// process has released the listen port.
    pub fn restart(&mut self) -> Result<Outcome, LifecycleError> {
        let Some(previous) = self.running_pid()? else {
            return Ok(Outcome::AlreadyStopped);
        };
        self.terminate_and_wait(previous)?;
        self.hand_over_state()?;
        let pid = self.launch()?;
        Ok(Outcome::Restarted { previous, pid })
    }

    fn terminate_and_wait(&mut self, pid: i32) -> Result<(), LifecycleError> {
        self.state = LifecycleState::Stopping;
        self.processes.terminate(pid)?;
        info!(pid, host = %self.cfg.host, port = self.cfg.port, "waiting for the listen port");
        wait_until_bindable(&self.cfg.host, self.cfg.port, self.poll_interval);
        self.state = LifecycleState::Stopped;
        Ok(())
    }

    /// Files created by a root-run CLI must belong to the daemon user before
    /// it drops privileges. An unknown user is left to the environment check.
    fn hand_over_state(&self) -> Result<(), LifecycleError> {
        match hand_over_to_daemon_user(&self.cfg, &self.paths, &self.processes) {
            Ok(_) | Err(LifecycleError::UnknownUser(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn launch(&mut self) -> Result<u32, LifecycleError> {
        self.state = LifecycleState::Starting;
        let spec = DaemonSpec {
            program: std::env::current_exe()?,
            args: vec![SERVE_COMMAND.to_owned()],
            user: self.cfg.user.clone(),
            log_file: Some(self.paths.log_file.clone()),
            env: self.paths.to_env(),
        };
        let pid = match self.processes.spawn_detached(&spec) {
            Ok(pid) => pid,
            Err(e) => {
                self.state = LifecycleState::Stopped;
                return Err(e);
            }
        };
        self.marker.write(pid)?;
        self.state = LifecycleState::Running;
        info!(pid, "server daemon started");
        Ok(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    #[derive(Default)]
    struct Calls {
        terminated: Vec<i32>,
        spawned: Vec<DaemonSpec>,
    }

    #[derive(Clone, Default)]
    struct FakeProcesses {
        calls: Arc<Mutex<Calls>>,
        dead: Vec<i32>,
        daemon_user: Option<UserIdentity>,
    }

    impl ProcessControl for FakeProcesses {
        fn terminate(&self, pid: i32) -> Result<(), LifecycleError> {
            self.calls.lock().unwrap().terminated.push(pid);
            Ok(())
        }
        fn is_alive(&self, pid: i32) -> bool {
            !self.dead.contains(&pid)
        }
        fn lookup_user(&self, _name: &str) -> Option<UserIdentity> {
            self.daemon_user
        }
        fn effective_uid(&self) -> u32 {
            0
        }
        fn spawn_detached(&self, spec: &DaemonSpec) -> Result<u32, LifecycleError> {
            self.calls.lock().unwrap().spawned.push(spec.clone());
            Ok(4242)
        }
    }

    fn controller(dir: &std::path::Path, port: u16, fake: FakeProcesses) -> Controller<FakeProcesses> {
        let cfg = ServerConfig {
            host: "127.0.0.1".into(),
            port,
            data_dir: Some(dir.to_path_buf()),
            user: None,
            ..ServerConfig::default()
        };
        let paths = cfg.paths().unwrap();
        Controller::new(cfg, paths, fake).with_poll_interval(Duration::from_millis(20))
    }

    fn free_port() -> u16 {
        TcpListener::bind(("127.0.0.1", 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn stop_without_marker_is_already_stopped() {
        let dir = tempdir().unwrap();
        let fake = FakeProcesses::default();
        let mut ctl = controller(dir.path(), free_port(), fake.clone());

        assert_eq!(ctl.stop().unwrap(), Outcome::AlreadyStopped);
        assert_eq!(ctl.restart().unwrap(), Outcome::AlreadyStopped);
        assert!(fake.calls.lock().unwrap().terminated.is_empty());
        assert_eq!(ctl.state(), LifecycleState::Stopped);
    }

    #[test]
    fn stop_signals_without_waiting() {
        let dir = tempdir().unwrap();
        let fake = FakeProcesses::default();
        let mut ctl = controller(dir.path(), free_port(), fake.clone());
        ctl.marker().write(1234).unwrap();

        assert_eq!(ctl.stop().unwrap(), Outcome::Stopping { pid: 1234 });
        assert_eq!(fake.calls.lock().unwrap().terminated, vec![1234]);
        assert_eq!(ctl.state(), LifecycleState::Stopping);
    }

    #[test]
    fn start_spawns_and_writes_marker() {
        let dir = tempdir().unwrap();
        let fake = FakeProcesses::default();
        let mut ctl = controller(dir.path(), free_port(), fake.clone());

        let outcome = ctl.start(StartOptions::default()).unwrap();
        assert_eq!(outcome, Outcome::Started { pid: 4242 });
        assert_eq!(ctl.marker().read().unwrap(), Some(4242));
        assert_eq!(ctl.state(), LifecycleState::Running);

        let calls = fake.calls.lock().unwrap();
        assert_eq!(calls.spawned.len(), 1);
        assert_eq!(calls.spawned[0].args, vec![SERVE_COMMAND.to_owned()]);
        assert!(calls.spawned[0]
            .env
            .contains(&("BERTH_PID_FILE", dir.path().join("berth.pid"))));
    }

    #[test]
    fn start_hands_state_to_the_daemon_user() {
        use std::os::unix::fs::{MetadataExt, PermissionsExt};

        let dir = tempdir().unwrap();
        let meta = std::fs::metadata(dir.path()).unwrap();
        let fake = FakeProcesses {
            daemon_user: Some(UserIdentity {
                uid: meta.uid(),
                gid: meta.gid(),
            }),
            ..FakeProcesses::default()
        };
        let mut ctl = controller(dir.path(), free_port(), fake.clone());
        ctl.cfg.user = Some("berth".into());
        crate::identity::Identity::generate(1024)
            .unwrap()
            .persist(&ctl.paths.public_key, &ctl.paths.private_key)
            .unwrap();
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o700)).unwrap();

        let outcome = ctl.start(StartOptions::default()).unwrap();
        assert_eq!(outcome, Outcome::Started { pid: 4242 });
        let calls = fake.calls.lock().unwrap();
        assert_eq!(calls.spawned[0].user.as_deref(), Some("berth"));
        assert_eq!(
            std::fs::metadata(&ctl.paths.private_key).unwrap().uid(),
            meta.uid()
        );
    }

    #[test]
    fn start_keeps_running_instance_unless_replacing() {
        let dir = tempdir().unwrap();
        let fake = FakeProcesses::default();
        let mut ctl = controller(dir.path(), free_port(), fake.clone());
        ctl.marker().write(77).unwrap();

        let outcome = ctl.start(StartOptions::default()).unwrap();
        assert_eq!(outcome, Outcome::AlreadyRunning { pid: 77 });
        assert!(!outcome.changed_state());
        assert!(fake.calls.lock().unwrap().spawned.is_empty());

        let outcome = ctl
            .start(StartOptions {
                replace_existing: true,
                ..StartOptions::default()
            })
            .unwrap();
        assert_eq!(outcome, Outcome::Started { pid: 4242 });
        assert_eq!(fake.calls.lock().unwrap().terminated, vec![77]);
    }

    #[test]
    fn stale_marker_is_cleared() {
        let dir = tempdir().unwrap();
        let fake = FakeProcesses {
            dead: vec![99],
            ..FakeProcesses::default()
        };
        let mut ctl = controller(dir.path(), free_port(), fake.clone());
        ctl.marker().write(99).unwrap();

        assert_eq!(ctl.running_pid().unwrap(), None);
        assert!(!ctl.marker().exists());
        assert_eq!(ctl.stop().unwrap(), Outcome::AlreadyStopped);
    }

    #[test]
    fn failed_environment_check_refuses_to_start() {
        let dir = tempdir().unwrap();
        let fake = FakeProcesses::default();
        let mut ctl = controller(dir.path(), 0, fake.clone());

        match ctl.start(StartOptions::default()) {
            Err(LifecycleError::Environment(errors)) => assert!(!errors.is_empty()),
            other => panic!("expected environment error, got {other:?}"),
        }
        assert!(fake.calls.lock().unwrap().spawned.is_empty());

        let outcome = ctl
            .start(StartOptions {
                skip_check: true,
                ..StartOptions::default()
            })
            .unwrap();
        assert_eq!(outcome, Outcome::Started { pid: 4242 });
    }

    #[test]
    fn direct_mode_does_not_spawn_or_write_marker() {
        let dir = tempdir().unwrap();
        let fake = FakeProcesses::default();
        let mut ctl = controller(dir.path(), free_port(), fake.clone());

        let outcome = ctl
            .start(StartOptions {
                direct: true,
                ..StartOptions::default()
            })
            .unwrap();
        assert_eq!(outcome, Outcome::Foreground);
        assert!(!ctl.marker().exists());
        assert!(fake.calls.lock().unwrap().spawned.is_empty());
    }

    #[test]
    fn restart_waits_for_port_release() {
        let dir = tempdir().unwrap();
        let old_server = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = old_server.local_addr().unwrap().port();

        let fake = FakeProcesses::default();
        let mut ctl = controller(dir.path(), port, fake.clone());
        ctl.marker().write(1234).unwrap();

        let restarting = std::thread::spawn(move || ctl.restart());

        std::thread::sleep(Duration::from_millis(300));
        assert!(!restarting.is_finished());
        {
            let calls = fake.calls.lock().unwrap();
            assert_eq!(calls.terminated, vec![1234]);
            assert!(calls.spawned.is_empty());
        }

        drop(old_server);
        let outcome = restarting.join().unwrap().unwrap();
        assert_eq!(
            outcome,
            Outcome::Restarted {
                previous: 1234,
                pid: 4242
            }
        );
        assert_eq!(fake.calls.lock().unwrap().spawned.len(), 1);
        assert_eq!(
            PidMarker::new(dir.path().join("berth.pid")).read().unwrap(),
            Some(4242)
        );
    }
}
