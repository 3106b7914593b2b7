mod output;

use std::process::ExitCode;

use anyhow::{Context, Result};
use berth_server::{
    daemon::{hand_over_to_daemon_user, Controller, Outcome, StartOptions, SystemProcesses},
    error::{LifecycleError, StoreError},
    identity::{Identity, DEFAULT_KEY_SIZE},
    store::{AccessTokenStore, EntryId},
    ServerConfig, ServerPaths,
};
use clap::{Args, Parser, Subcommand};
use dialoguer::{theme::ColorfulTheme, Confirm};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use output::{timestamp, Reporter};

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "berth",
    about = "berth: temporary, token-gated access to server-managed containers",
    version
)]
struct Cli {
    /// Log at debug level and print the full chain of causes on failure
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server daemon
    Start(StartArgs),
    /// Stop the server daemon
    Stop {
        #[arg(long)]
        json: bool,
    },
    /// Restart the server daemon, waiting for the old one to release its port
    Restart {
        #[arg(long)]
        json: bool,
    },
    /// Manage the access tokens clients use to request containers
    AccessToken {
        #[command(subcommand)]
        action: AccessTokenAction,
        /// Print a JSON object instead of human-readable output
        #[arg(long, global = true)]
        json: bool,
    },
    /// Generate a new server RSA identity, replacing the current key files
    RegenIdentity {
        /// RSA key size in bits
        #[arg(short = 'b', long, default_value_t = DEFAULT_KEY_SIZE)]
        key_size: usize,
        #[arg(long)]
        json: bool,
    },
    /// Run the server in this process (used by the daemon)
    #[command(hide = true)]
    Serve,
}

#[derive(Args)]
struct StartArgs {
    /// Only run the environment check
    #[arg(short = 'c', long)]
    check_only: bool,
    /// Run attached to this terminal as the invoking user
    #[arg(short, long)]
    direct: bool,
    /// Replace a running server without asking
    #[arg(short = 'y', long, conflicts_with = "assume_no")]
    assume_yes: bool,
    /// Keep a running server without asking
    #[arg(short = 'n', long)]
    assume_no: bool,
    /// Do not run the environment check
    #[arg(long)]
    skip_check: bool,
    /// Print a JSON object instead of human-readable output
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum AccessTokenAction {
    /// Create a token and print it once
    Add {
        /// Create the token disabled
        #[arg(long)]
        disabled: bool,
    },
    /// List tokens (never their values)
    List,
    /// Delete a token permanently
    Delete { entry_id: EntryId },
    /// Allow a token to authenticate
    Enable { entry_id: EntryId },
    /// Stop a token from authenticating
    Disable { entry_id: EntryId },
}

impl Commands {
    fn json(&self) -> bool {
        match self {
            Commands::Start(args) => args.json,
            Commands::Stop { json }
            | Commands::Restart { json }
            | Commands::AccessToken { json, .. }
            | Commands::RegenIdentity { json, .. } => *json,
            Commands::Serve => false,
        }
    }

    /// Commands that run the server in this process log at info by default.
    fn runs_server(&self) -> bool {
        match self {
            Commands::Serve => true,
            Commands::Start(args) => args.direct && !args.check_only,
            _ => false,
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        "debug"
    } else if cli.command.runs_server() {
        "info"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("BERTH_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let reporter = Reporter::new(cli.command.json());
    let verbose = cli.verbose;

    let result = match cli.command {
        Commands::Start(args) => cmd_start(args, &reporter).await,
        Commands::Stop { .. } => cmd_stop(&reporter),
        Commands::Restart { .. } => cmd_restart(&reporter),
        Commands::AccessToken { action, .. } => cmd_access_token(action, &reporter),
        Commands::RegenIdentity { key_size, .. } => cmd_regen_identity(key_size, &reporter).await,
        Commands::Serve => cmd_serve().await,
    };

    match result {
        Ok(code) => code,
        Err(e) if is_interrupted(&e) => {
            reporter.blank();
            ExitCode::SUCCESS
        }
        Err(e) if verbose => {
            let causes: Vec<String> = e.chain().skip(1).map(ToString::to_string).collect();
            reporter.failure(&format!("{e:?}"), json!({ "causes": causes }));
            ExitCode::FAILURE
        }
        Err(e) => {
            reporter.failure(&format!("{e:#}"), Value::Null);
            ExitCode::FAILURE
        }
    }
}

// ── Lifecycle ─────────────────────────────────────────────────────────────────

fn controller(cfg: &ServerConfig) -> Result<Controller<SystemProcesses>> {
    let paths = cfg.paths()?;
    Ok(Controller::new(cfg.clone(), paths, SystemProcesses))
}

async fn cmd_start(args: StartArgs, reporter: &Reporter) -> Result<ExitCode> {
    let cfg = ServerConfig::default();
    let mut controller = controller(&cfg)?;

    if args.check_only {
        let errors = controller.check_environment(args.direct);
        let (message, data) = check_report(&errors);
        reporter.success(&message, data);
        for (i, error) in errors.iter().enumerate() {
            reporter.detail(&format!("#{}", i + 1), error);
        }
        return Ok(ExitCode::SUCCESS);
    }

    let replace_existing = match controller.running_pid()? {
        Some(pid) => {
            reporter.warn(&format!(
                "A server is already running (PID {pid}, marker {})",
                controller.marker().path().display()
            ));
            confirm_replace(&args)?
        }
        None => false,
    };

    let opts = StartOptions {
        direct: args.direct,
        skip_check: args.skip_check,
        replace_existing,
    };
    match controller.start(opts) {
        Ok(Outcome::Foreground) => {
            reporter.warn("Direct execution mode enabled, use CTRL+C to stop the server");
            berth_server::run(cfg).await?;
            Ok(ExitCode::SUCCESS)
        }
        Ok(outcome) => {
            report_outcome(reporter, &outcome);
            Ok(ExitCode::SUCCESS)
        }
        Err(LifecycleError::Environment(errors)) => {
            report_environment(reporter, &errors);
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e.into()),
    }
}

fn confirm_replace(args: &StartArgs) -> Result<bool> {
    if args.assume_yes {
        return Ok(true);
    }
    if args.assume_no {
        return Ok(false);
    }
    Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Kill the running server and start a new one?")
        .default(false)
        .interact()
        .context("confirmation prompt")
}

fn cmd_stop(reporter: &Reporter) -> Result<ExitCode> {
    let outcome = controller(&ServerConfig::default())?.stop()?;
    report_outcome(reporter, &outcome);
    Ok(ExitCode::SUCCESS)
}

fn cmd_restart(reporter: &Reporter) -> Result<ExitCode> {
    let outcome = controller(&ServerConfig::default())?.restart()?;
    report_outcome(reporter, &outcome);
    Ok(ExitCode::SUCCESS)
}

async fn cmd_serve() -> Result<ExitCode> {
    berth_server::run(ServerConfig::default()).await?;
    Ok(ExitCode::SUCCESS)
}

fn report_outcome(reporter: &Reporter, outcome: &Outcome) {
    let data = match outcome {
        Outcome::AlreadyRunning { pid } | Outcome::Stopping { pid } => json!({ "pid": pid }),
        Outcome::Started { pid } => json!({ "pid": pid }),
        Outcome::Restarted { previous, pid } => json!({ "previous_pid": previous, "pid": pid }),
        Outcome::AlreadyStopped | Outcome::Foreground => Value::Null,
    };
    reporter.success(&outcome.to_string(), data);
}

/// A check-only run succeeds whatever it finds; the findings are its result.
fn check_report(errors: &[String]) -> (String, Value) {
    (
        format!("Check done, {} error(s) recorded", errors.len()),
        json!({"errors_recorded": errors.len(), "errors_list": errors}),
    )
}

fn report_environment(reporter: &Reporter, errors: &[String]) {
    let message = LifecycleError::Environment(errors.to_vec()).to_string();
    reporter.failure(
        &message,
        json!({"errors_recorded": errors.len(), "errors_list": errors}),
    );
    for (i, error) in errors.iter().enumerate() {
        reporter.detail(&format!("#{}", i + 1), error);
    }
}

// ── Access tokens ─────────────────────────────────────────────────────────────

fn cmd_access_token(action: AccessTokenAction, reporter: &Reporter) -> Result<ExitCode> {
    let cfg = ServerConfig::default();
    let paths = cfg.paths()?;
    let store =
        AccessTokenStore::open(&paths.access_tokens_db).context("open access token store")?;
    let result = run_access_token(&store, action, reporter);
    store.close().context("close access token store")?;
    hand_over_state(&cfg, &paths, reporter);

    match result {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(StoreError::NotFound { entry_id }) => {
            reporter.failure(
                &format!("Entry ID {entry_id} does not exist"),
                json!({ "entry_id": entry_id }),
            );
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e.into()),
    }
}

fn run_access_token(
    store: &AccessTokenStore,
    action: AccessTokenAction,
    reporter: &Reporter,
) -> Result<(), StoreError> {
    match action {
        AccessTokenAction::Add { disabled } => {
            let issued = store.add_entry(disabled)?;
            reporter.success(
                "New access token created",
                json!({
                    "entry_id": issued.entry_id,
                    "created_at": issued.created_at,
                    "enabled": !disabled,
                    "access_token": issued.secret.as_str(),
                }),
            );
            reporter.detail("Entry ID", issued.entry_id);
            reporter.detail("Token", issued.secret.as_str());
            if disabled {
                reporter.warn(&format!(
                    "The token is disabled, enable it with `berth access-token enable {}`",
                    issued.entry_id
                ));
            }
        }
        AccessTokenAction::List => {
            let entries = store.list_entries()?;
            reporter.success(
                &format!("{} access token(s)", entries.len()),
                json!({ "entry_list": entries }),
            );
            for entry in &entries {
                reporter.blank();
                reporter.detail("Entry ID", entry.entry_id);
                reporter.detail("Created", timestamp(entry.created_at));
                reporter.detail("Enabled", entry.enabled);
            }
        }
        AccessTokenAction::Delete { entry_id } => {
            store.delete_entry(entry_id)?;
            reporter.success(
                &format!("Entry ID {entry_id} deleted"),
                json!({ "entry_id": entry_id }),
            );
        }
        AccessTokenAction::Enable { entry_id } => {
            store.enable_entry(entry_id)?;
            reporter.success(
                &format!("Entry ID {entry_id} enabled"),
                json!({ "entry_id": entry_id, "enabled": true }),
            );
        }
        AccessTokenAction::Disable { entry_id } => {
            store.disable_entry(entry_id)?;
            reporter.success(
                &format!("Entry ID {entry_id} disabled"),
                json!({ "entry_id": entry_id, "enabled": false }),
            );
        }
    }
    Ok(())
}

// ── Identity ──────────────────────────────────────────────────────────────────

async fn cmd_regen_identity(key_size: usize, reporter: &Reporter) -> Result<ExitCode> {
    let cfg = ServerConfig::default();
    let paths = cfg.paths()?;
    let (public, private) = (paths.public_key.clone(), paths.private_key.clone());
    let identity = tokio::task::spawn_blocking(move || -> Result<Identity> {
        let identity = Identity::generate(key_size)?;
        identity.persist(&public, &private)?;
        Ok(identity)
    })
    .await
    .context("identity task")??;
    hand_over_state(&cfg, &paths, reporter);

    let fingerprint = identity.fingerprint();
    reporter.success(
        "Server identity regenerated",
        json!({ "fingerprint": fingerprint, "key_size": identity.key_size() }),
    );
    reporter.detail("Key size", identity.key_size());
    reporter.detail("Fingerprint", &fingerprint);
    reporter.warn("Restart the server to use the new identity");
    Ok(ExitCode::SUCCESS)
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Files written by a root-run command must stay usable by the daemon user.
fn hand_over_state(cfg: &ServerConfig, paths: &ServerPaths, reporter: &Reporter) {
    if let Err(e) = hand_over_to_daemon_user(cfg, paths, &SystemProcesses) {
        reporter.warn(&format!("Server state not handed over to the daemon user: {e}"));
    }
}

/// The operator interrupted a prompt.
fn is_interrupted(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(dialoguer::Error::IO(io)) = cause.downcast_ref::<dialoguer::Error>() {
            return io.kind() == std::io::ErrorKind::Interrupted;
        }
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| io.kind() == std::io::ErrorKind::Interrupted)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn start_flags_parse() {
        let cli = Cli::try_parse_from(["berth", "start", "-d", "-y", "--skip-check", "--json"]).unwrap();
        let Commands::Start(args) = cli.command else {
            panic!("expected start");
        };
        assert!(args.direct && args.assume_yes && args.skip_check && args.json);
        assert!(!args.check_only && !args.assume_no);

        assert!(Cli::try_parse_from(["berth", "start", "-y", "-n"]).is_err());
    }

    #[test]
    fn access_token_json_flag_is_global() {
        let cli = Cli::try_parse_from(["berth", "access-token", "enable", "3", "--json"]).unwrap();
        assert!(cli.command.json());
        match cli.command {
            Commands::AccessToken {
                action: AccessTokenAction::Enable { entry_id },
                ..
            } => assert_eq!(entry_id, 3),
            _ => panic!("expected access-token enable"),
        }
    }

    #[test]
    fn regen_identity_defaults_to_4096_bits() {
        let cli = Cli::try_parse_from(["berth", "regen-identity"]).unwrap();
        match cli.command {
            Commands::RegenIdentity { key_size, json } => {
                assert_eq!(key_size, 4096);
                assert!(!json);
            }
            _ => panic!("expected regen-identity"),
        }
    }

    #[test]
    fn interrupted_prompt_is_recognized() {
        let io = std::io::Error::new(std::io::ErrorKind::Interrupted, "read interrupted");
        let err = anyhow::Error::new(dialoguer::Error::IO(io)).context("confirmation prompt");
        assert!(is_interrupted(&err));
        assert!(!is_interrupted(&anyhow::anyhow!("boom")));
    }

    #[test]
    fn verbose_flag_is_global() {
        let cli = Cli::try_parse_from(["berth", "stop", "-v"]).unwrap();
        assert!(cli.verbose);
        let cli = Cli::try_parse_from(["berth", "--verbose", "access-token", "list"]).unwrap();
        assert!(cli.verbose);
        assert!(!Cli::try_parse_from(["berth", "stop"]).unwrap().verbose);
    }

    #[test]
    fn check_only_reports_findings_as_its_result() {
        let (message, data) = check_report(&[]);
        assert_eq!(message, "Check done, 0 error(s) recorded");
        assert_eq!(data["errors_recorded"], 0);

        let errors = vec!["listen port must not be 0".to_owned()];
        let (message, data) = check_report(&errors);
        assert_eq!(message, "Check done, 1 error(s) recorded");
        assert_eq!(data["errors_list"][0], "listen port must not be 0");
    }

    #[test]
    fn serve_is_hidden_and_quiet() {
        let cli = Cli::try_parse_from(["berth", "serve"]).unwrap();
        assert!(cli.command.runs_server());
        assert!(!cli.command.json());
    }
}
