use std::path::PathBuf;

use clap::Args;

use crate::config::DownloadConfig;
use crate::download::{Downloader, Format, resolve_yt_dlp};
use crate::prelude::*;

#[derive(Args, Debug)]
pub struct FormatsArgs {
    /// URL of the video to list the formats of
    pub url: String,

    /// Path to the yt-dlp executable, overriding `download.yt-dlp-path` from the configuration
    #[arg(long, env = "MIHARI_YT_DLP")]
    pub yt_dlp: Option<PathBuf>,

    /// Print the formats as a JSON array instead of a table
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: FormatsArgs, config: &DownloadConfig) -> Result<()> {
    let yt_dlp = resolve_yt_dlp(args.yt_dlp.as_deref().or(config.yt_dlp_path.as_deref()))
        .map_err(|e| anyhow!("[{}] {e}", e.code()))?;
    let downloader = Downloader::new(yt_dlp, config.output_path.clone());

    info!("Fetching formats of {}", args.url);
    let formats = downloader
        .formats(&args.url)
        .await
        .map_err(|e| anyhow!("[{}] {e}", e.code()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&formats)?);
        return Ok(());
    }
    if formats.is_empty() {
        warn!("yt-dlp listed no formats for {}", args.url);
    }
    for format in &formats {
        println!("{}", table_row(format));
    }
    Ok(())
}

fn table_row(format: &Format) -> String {
    format!(
        "{:<10} {:<11} {:<11} {:>9}  {}",
        format.format_id,
        format.kind.label(),
        format.resolution,
        format.filesize,
        format.codec.as_deref().unwrap_or("-")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use crate::download::parse_formats_json;
    use clap::Parser;

    #[test]
    fn parses_json_flag() {
        let cli = Cli::try_parse_from(["mihari", "formats", "https://example.com/v", "--json"])
            .unwrap();
        let Commands::Formats(args) = cli.command else {
            panic!("expected the formats command");
        };
        assert!(args.json);
        assert_eq!(args.url, "https://example.com/v");
    }

    #[test]
    fn rows_are_aligned() {
        let formats = parse_formats_json(
            br#"{"formats":[{"format_id":"137","resolution":"1920x1080","vcodec":"avc1","acodec":"none","filesize":1048576}]}"#,
        )
        .unwrap();
        assert_eq!(
            table_row(&formats[0]),
            "137        video       1920x1080       1.0MB  avc1"
        );
    }
}
