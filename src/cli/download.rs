use std::path::PathBuf;

use clap::Args;
use indicatif::ProgressBar;

use crate::config::DownloadConfig;
use crate::download::{
    DEFAULT_OUTPUT_TEMPLATE, DownloadOptions, Downloader, MediaKind, ProgressUpdate, Subtitles,
    resolve_yt_dlp,
};
use crate::local_logger::start_progress_bar;
use crate::prelude::*;
use crate::shutdown::wait_for_termination_signal;

#[derive(Args, Debug)]
pub struct DownloadArgs {
    /// URL of the video (or playlist) to download
    pub url: String,

    /// Path to the yt-dlp executable, overriding `download.yt-dlp-path` from the configuration
    #[arg(long, env = "MIHARI_YT_DLP")]
    pub yt_dlp: Option<PathBuf>,

    /// Directory to download into, overriding `download.output-path` from the configuration
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// yt-dlp output template of the downloaded file name
    #[arg(long, default_value = DEFAULT_OUTPUT_TEMPLATE)]
    pub output_template: String,

    /// Explicit yt-dlp format selector, taking precedence over the quality options
    #[arg(short, long)]
    pub format: Option<String>,

    #[arg(long, value_enum, default_value_t)]
    pub kind: MediaKind,

    /// Video quality: best, 2160p, 1440p, 1080p, 720p, 480p, 360p or worst
    #[arg(short, long)]
    pub quality: Option<String>,

    #[arg(long)]
    pub audio_format: Option<String>,

    #[arg(long)]
    pub audio_quality: Option<String>,

    /// Container the video and audio streams are merged into (defaults to mp4 for videos)
    #[arg(long)]
    pub merge_format: Option<String>,

    /// Subtitles to fetch: `all`, `auto` or a comma separated list of languages
    #[arg(long)]
    pub subtitles: Option<Subtitles>,

    /// Embed subtitles in the video instead of writing them next to it
    #[arg(long, requires = "subtitles")]
    pub embed_subs: bool,

    #[arg(long, requires = "subtitles")]
    pub sub_format: Option<String>,

    #[arg(long)]
    pub embed_metadata: bool,

    #[arg(long)]
    pub embed_thumbnail: bool,

    /// Download the whole playlist the URL points to
    #[arg(long)]
    pub playlist: bool,

    #[arg(long, requires = "playlist")]
    pub playlist_items: Option<String>,

    #[arg(long, requires = "playlist")]
    pub playlist_start: Option<u32>,

    #[arg(long, requires = "playlist")]
    pub playlist_end: Option<u32>,

    /// Netscape formatted cookies file, ignored when it does not exist
    #[arg(long)]
    pub cookies: Option<PathBuf>,

    #[arg(long)]
    pub proxy: Option<String>,

    /// Record downloaded videos in this file and skip the ones already listed
    #[arg(long)]
    pub download_archive: Option<PathBuf>,

    #[arg(long)]
    pub max_filesize: Option<String>,

    #[arg(long)]
    pub min_filesize: Option<String>,

    /// Maximum download rate, e.g. 2M
    #[arg(long)]
    pub limit_rate: Option<String>,
}

impl DownloadArgs {
    fn options(&self) -> DownloadOptions {
        DownloadOptions {
            output_template: Some(self.output_template.clone()),
            format: self.format.clone(),
            kind: self.kind,
            audio_format: self.audio_format.clone(),
            audio_quality: self.audio_quality.clone(),
            video_quality: self.quality.clone(),
            merge_format: self.merge_format.clone(),
            subtitles: self.subtitles.clone(),
            embed_subs: self.embed_subs,
            sub_format: self.sub_format.clone(),
            embed_metadata: self.embed_metadata,
            embed_thumbnail: self.embed_thumbnail,
            playlist: self.playlist,
            playlist_items: self.playlist_items.clone(),
            playlist_start: self.playlist_start,
            playlist_end: self.playlist_end,
            cookies_file: self.cookies.clone(),
            proxy: self.proxy.clone(),
            download_archive: self.download_archive.clone(),
            max_filesize: self.max_filesize.clone(),
            min_filesize: self.min_filesize.clone(),
            limit_rate: self.limit_rate.clone(),
        }
    }
}

pub async fn run(args: DownloadArgs, config: &DownloadConfig) -> Result<()> {
    let yt_dlp = resolve_yt_dlp(args.yt_dlp.as_deref().or(config.yt_dlp_path.as_deref()))
        .map_err(|e| anyhow!("[{}] {e}", e.code()))?;
    let output_dir = args
        .output
        .clone()
        .unwrap_or_else(|| config.output_path.clone());
    let downloader = Downloader::new(yt_dlp, output_dir);
    let options = args.options();

    info!(
        "Downloading {} into {}",
        args.url,
        downloader.output_dir().display()
    );
    let bar = start_progress_bar("Starting download...");
    let download = downloader.download(&args.url, &options, |update| {
        render_progress(bar.as_ref(), update)
    });
    tokio::pin!(download);

    let result = tokio::select! {
        result = &mut download => result,
        signal = wait_for_termination_signal() => {
            match signal {
                Ok(name) => info!("Received {name}, cancelling the download..."),
                Err(e) => warn!("Cancelling the download: {e:#}"),
            }
            downloader.cancel();
            download.await
        }
    };
    if let Some(bar) = &bar {
        bar.finish_and_clear();
    }

    let outcome = result.map_err(|e| anyhow!("[{}] {e}", e.code()))?;
    match (&outcome.path, outcome.file_size) {
        (Some(path), Some(size)) => info!("Saved {} ({size} bytes)", path.display()),
        (Some(path), None) => info!("Saved {}", path.display()),
        (None, _) => info!("Download complete"),
    }
    Ok(())
}

fn render_progress(bar: Option<&ProgressBar>, update: &ProgressUpdate) {
    let Some(bar) = bar else {
        debug!("{:.1}% {}", update.percent, update.output);
        return;
    };

    bar.set_position((update.percent * 10.0).round() as u64);
    let mut message = update.filename.clone().unwrap_or_default();
    if update.total_fragments > 0 {
        message.push_str(&format!(
            " (frag {}/{})",
            update.current_fragment, update.total_fragments
        ));
    }
    if let Some(speed) = &update.speed {
        message.push_str(&format!(" {speed}"));
    }
    if let Some(eta) = &update.eta {
        message.push_str(&format!(" ETA {eta}"));
    }
    bar.set_message(message.trim().to_string());
}
