mod download;
mod formats;
mod kill_tree;
mod serve;

use crate::{
    VERSION,
    config::MihariConfig,
    local_logger::{MIHARI_U8_COLOR_CODE, init_local_logger},
    prelude::*,
};
use clap::{
    Parser, Subcommand,
    builder::{Styles, styling},
};

fn create_styles() -> Styles {
    styling::Styles::styled()
        .header(styling::AnsiColor::Green.on_default() | styling::Effects::BOLD)
        .usage(styling::AnsiColor::Green.on_default() | styling::Effects::BOLD)
        .literal(styling::Ansi256Color(MIHARI_U8_COLOR_CODE).on_default() | styling::Effects::BOLD)
        .placeholder(styling::AnsiColor::Cyan.on_default())
}

#[derive(Parser, Debug)]
#[command(version, about = "Supervisor of the Mihari backend", styles = create_styles())]
pub struct Cli {
    /// The configuration name to use
    /// If provided, the configuration will be loaded from ~/.config/mihari/{config-name}.yaml
    /// Otherwise, loads from ~/.config/mihari/config.yaml
    #[arg(long, env = "MIHARI_CONFIG_NAME", global = true)]
    pub config_name: Option<String>,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Start the backend and keep it alive, reading control commands from stdin
    Serve(serve::ServeArgs),
    /// Download a video with yt-dlp directly
    #[command(alias = "dl")]
    Download(Box<download::DownloadArgs>),
    /// List the formats yt-dlp offers for a video
    Formats(formats::FormatsArgs),
    /// Kill a process and all of its descendants
    KillTree(kill_tree::KillTreeArgs),
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_local_logger()?;
    debug!("mihari v{VERSION}");

    let config = MihariConfig::load(cli.config_name.as_deref())?;

    match cli.command {
        Commands::Serve(args) => serve::run(args, config.backend).await?,
        Commands::Download(args) => download::run(*args, &config.download).await?,
        Commands::Formats(args) => formats::run(args, &config.download).await?,
        Commands::KillTree(args) => kill_tree::run(args).await?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn config_name_is_global() {
        let cli = Cli::try_parse_from(["mihari", "kill-tree", "4242", "--config-name", "portable"])
            .unwrap();
        assert_eq!(cli.config_name.as_deref(), Some("portable"));
        assert!(matches!(cli.command, Commands::KillTree(_)));
    }
}
