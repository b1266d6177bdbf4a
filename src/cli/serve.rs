use std::{
    panic::AssertUnwindSafe,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use clap::Args;
use futures::FutureExt;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::BackendConfig;
use crate::local_logger::suspend_progress_bar;
use crate::prelude::*;
use crate::process_tree::platform_terminator;
use crate::shutdown::{ShutdownFlag, graceful_shutdown, wait_for_termination_signal};
use crate::supervisor::{JsonLinesSink, LogSink, OutputRelay, Supervisor};

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Path to the backend executable, overriding `backend.path` from the configuration
    #[arg(long, env = "MIHARI_BACKEND")]
    pub backend: Option<PathBuf>,

    /// How long the backend may take to print its readiness banner, in milliseconds
    #[arg(long)]
    pub startup_timeout_ms: Option<u64>,

    /// How long the backend gets to exit on its own when stopped, in milliseconds
    #[arg(long)]
    pub grace_period_ms: Option<u64>,

    /// Print backend events as JSON lines on stdout instead of log lines
    #[arg(long)]
    pub json: bool,
}

/// Commands accepted on stdin, one per line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlCommand {
    Status,
    Restart,
    Stop,
    Start,
    Quit,
}

impl FromStr for ControlCommand {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "status" => Ok(ControlCommand::Status),
            "restart" => Ok(ControlCommand::Restart),
            "stop" => Ok(ControlCommand::Stop),
            "start" => Ok(ControlCommand::Start),
            "quit" | "exit" => Ok(ControlCommand::Quit),
            other => Err(format!(
                "Unknown command `{other}`, expected one of: status, restart, stop, start, quit"
            )),
        }
    }
}

pub async fn run(args: ServeArgs, mut config: BackendConfig) -> Result<()> {
    if let Some(startup_timeout_ms) = args.startup_timeout_ms {
        config.startup_timeout_ms = startup_timeout_ms;
    }
    if let Some(grace_period_ms) = args.grace_period_ms {
        config.grace_period_ms = grace_period_ms;
    }
    let executable = args
        .backend
        .or_else(|| config.path.clone())
        .context("No backend executable configured, pass --backend or set `backend.path`")?;

    let relay = Arc::new(OutputRelay::new());
    if args.json {
        relay.subscribe(Arc::new(JsonLinesSink));
    } else {
        relay.subscribe(Arc::new(LogSink));
    }
    let supervisor = Supervisor::new(config, relay, platform_terminator(), ShutdownFlag::new());

    if !supervisor.start(&executable).await {
        warn!("The backend failed to start, send `start` or `restart` to retry");
    }

    let outcome = tokio::select! {
        signal = wait_for_termination_signal() => {
            signal.map(|name| info!("Received {name}, shutting down"))
        }
        result = AssertUnwindSafe(control_loop(&supervisor, &executable)).catch_unwind() => {
            result.unwrap_or_else(|_| Err(anyhow!("The control loop panicked")))
        }
    };

    // Whatever ended the loop, the backend must not outlive us
    graceful_shutdown(&supervisor).await;
    outcome
}

async fn control_loop(supervisor: &Supervisor, executable: &Path) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .context("Failed to read control commands")?
    {
        if line.trim().is_empty() {
            continue;
        }
        let command = match line.parse::<ControlCommand>() {
            Ok(command) => command,
            Err(error) => {
                warn!("{error}");
                continue;
            }
        };

        debug!("Received control command {command:?}");
        match command {
            ControlCommand::Status => reply(&supervisor.status())?,
            ControlCommand::Restart => reply(&supervisor.restart(executable).await)?,
            ControlCommand::Start => {
                let success = supervisor.start(executable).await;
                reply(&serde_json::json!({ "success": success }))?
            }
            ControlCommand::Stop => supervisor.kill().await,
            ControlCommand::Quit => return Ok(()),
        }
    }

    info!("Standard input closed, shutting down");
    Ok(())
}

/// Answer a control command with a single JSON line.
fn reply(value: &impl Serialize) -> Result<()> {
    let line = serde_json::to_string(value)?;
    suspend_progress_bar(|| println!("{line}"));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("status", ControlCommand::Status)]
    #[case("  Restart\r", ControlCommand::Restart)]
    #[case("stop", ControlCommand::Stop)]
    #[case("start", ControlCommand::Start)]
    #[case("quit", ControlCommand::Quit)]
    #[case("exit", ControlCommand::Quit)]
    fn parses_control_commands(#[case] line: &str, #[case] expected: ControlCommand) {
        assert_eq!(line.parse::<ControlCommand>(), Ok(expected));
    }

    #[test]
    fn unknown_command_lists_the_valid_ones() {
        let err = "reload".parse::<ControlCommand>().unwrap_err();
        assert!(err.contains("`reload`"));
        assert!(err.contains("status"));
    }

    #[test_log::test(tokio::test)]
    async fn missing_backend_path_is_an_error() {
        let args = ServeArgs {
            backend: None,
            startup_timeout_ms: None,
            grace_period_ms: None,
            json: false,
        };
        let err = run(args, BackendConfig::default()).await.unwrap_err();
        assert!(err.to_string().contains("No backend executable configured"));
    }
}
