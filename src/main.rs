mod config;
mod process_kill;
mod readiness;
mod shutdown;
mod signals;
mod supervisor;
#[cfg(test)]
mod test_support;

use clap::Parser;
use config::Settings;
use process_kill::ProcessNameKiller;
use readiness::{ReadinessGate, ReadinessOutcome};
use shutdown::ShutdownCascade;
use signals::SignalRelay;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use supervisor::{ChildSlot, RunOutcome, Supervisor, ABORT_EXIT_CODE};
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

/// Timeout for every HTTP call made to the sidecar.
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Start a process once its proxy sidecar is live, relay signals to it,
/// and stop the sidecar when it exits.
#[derive(Parser, Debug)]
#[command(name = "scuttle", version, about)]
pub struct Cli {
    /// Optional TOML settings file; environment variables override it
    #[arg(long, env = "SCUTTLE_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Command to run, followed by its arguments
    #[arg(
        value_name = "COMMAND",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    command: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_tracing(config::logging_enabled(|key| std::env::var(key).ok()));

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "scuttle starting"
    );
    tracing::debug!(?cli, "parsed CLI arguments");

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "scuttle failed");
            ABORT_EXIT_CODE
        }
    };
    std::process::exit(code);
}

fn init_tracing(enabled: bool) {
    let filter = if enabled {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("scuttle=info"))
    } else {
        EnvFilter::new("off")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

async fn run(cli: Cli) -> Result<i32, Box<dyn std::error::Error>> {
    let Some((command, args)) = cli.command.split_first() else {
        tracing::info!("no arguments received, exiting");
        return Ok(0);
    };

    let settings = Settings::load(cli.config.as_deref())?;
    tracing::debug!(?settings, "resolved settings");

    let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;

    // A signal before launch cancels the readiness wait.
    let gate = ReadinessGate::new(&settings, client.clone());
    let slot = Arc::new(ChildSlot::new());
    let (launched_tx, launched_rx) = oneshot::channel();
    let relay = SignalRelay::install(Arc::clone(&slot), gate.cancel_token(), launched_rx)?.spawn();

    let outcome = gate.wait().await;

    let code = if outcome.should_launch() {
        let mut supervisor = Supervisor::new(Arc::clone(&slot), launched_tx);
        match supervisor.run(command, args).await? {
            RunOutcome::Exited(code) => code,
            RunOutcome::AbortedBeforeLaunch => {
                tracing::info!("aborted before the child was launched");
                ABORT_EXIT_CODE
            }
        }
    } else {
        debug_assert_eq!(outcome, ReadinessOutcome::HardTimeoutAbort);
        tracing::error!("sidecar not live before the hard timeout, not starting the child");
        ABORT_EXIT_CODE
    };

    let killer = ProcessNameKiller::new(settings.sidecar_process_name.clone());
    ShutdownCascade::new(&settings, client, killer)
        .run(code)
        .await;

    relay.abort();
    tracing::info!(exit_code = code, "scuttle exiting");
    Ok(code)
}
