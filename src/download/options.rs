use std::{path::Path, path::PathBuf, str::FromStr};

use url::Url;

use super::DownloadError;

pub const DEFAULT_OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";
const DEFAULT_VIDEO_MERGE_FORMAT: &str = "mp4";
/// Characters yt-dlp output templates must not carry, as they are invalid in Windows paths
const FORBIDDEN_TEMPLATE_CHARS: [char; 7] = ['<', '>', ':', '"', '|', '?', '*'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum MediaKind {
    #[default]
    Video,
    Audio,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subtitles {
    All,
    /// Automatically generated subtitles
    Auto,
    Languages(Vec<String>),
}

impl FromStr for Subtitles {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "all" => Ok(Subtitles::All),
            "auto" => Ok(Subtitles::Auto),
            "" => Err("expected `all`, `auto` or a comma separated list of languages".to_string()),
            languages => Ok(Subtitles::Languages(
                languages
                    .split(',')
                    .map(str::trim)
                    .filter(|language| !language.is_empty())
                    .map(str::to_string)
                    .collect(),
            )),
        }
    }
}

/// What to download and how, translated to yt-dlp flags by [`build_args`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadOptions {
    pub output_template: Option<String>,
    /// Explicit yt-dlp format selector, overriding `kind` and qualities
    pub format: Option<String>,
    pub kind: MediaKind,
    pub audio_format: Option<String>,
    pub audio_quality: Option<String>,
    /// One of `best`, `2160p`, `1440p`, `1080p`, `720p`, `480p`, `360p`, `worst`
    pub video_quality: Option<String>,
    pub merge_format: Option<String>,
    pub subtitles: Option<Subtitles>,
    pub embed_subs: bool,
    pub sub_format: Option<String>,
    pub embed_metadata: bool,
    pub embed_thumbnail: bool,
    pub playlist: bool,
    pub playlist_items: Option<String>,
    pub playlist_start: Option<u32>,
    pub playlist_end: Option<u32>,
    pub cookies_file: Option<PathBuf>,
    pub proxy: Option<String>,
    pub download_archive: Option<PathBuf>,
    pub max_filesize: Option<String>,
    pub min_filesize: Option<String>,
    pub limit_rate: Option<String>,
}

/// Accept only http(s) URLs.
pub fn validate_url(raw: &str) -> Result<Url, DownloadError> {
    let url = Url::parse(raw.trim()).map_err(|e| DownloadError::InvalidUrl(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(DownloadError::InvalidUrl(format!(
            "unsupported scheme `{scheme}`"
        ))),
    }
}

pub fn sanitize_template(template: &str) -> String {
    template
        .chars()
        .map(|c| {
            if FORBIDDEN_TEMPLATE_CHARS.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect()
}

/// Format selector for a video quality, unknown qualities falling back to `best`.
pub fn video_format(quality: Option<&str>) -> &'static str {
    match quality {
        Some("2160p") => "bestvideo[height<=2160]+bestaudio/best[height<=2160]",
        Some("1440p") => "bestvideo[height<=1440]+bestaudio/best[height<=1440]",
        Some("1080p") => "bestvideo[height<=1080]+bestaudio/best[height<=1080]",
        Some("720p") => "bestvideo[height<=720]+bestaudio/best[height<=720]",
        Some("480p") => "bestvideo[height<=480]+bestaudio/best[height<=480]",
        Some("360p") => "bestvideo[height<=360]+bestaudio/best[height<=360]",
        Some("worst") => "worstvideo+worstaudio/worst",
        _ => "bestvideo+bestaudio/best",
    }
}

/// Build the yt-dlp command line downloading `url` into `output_dir`. The URL is always last.
pub fn build_args(url: &str, output_dir: &Path, options: &DownloadOptions) -> Vec<String> {
    let mut args = Vec::new();

    let template = sanitize_template(
        options
            .output_template
            .as_deref()
            .unwrap_or(DEFAULT_OUTPUT_TEMPLATE),
    );
    push_option(&mut args, "-o", output_dir.join(template).to_string_lossy());

    if let Some(format) = &options.format {
        push_option(&mut args, "-f", format);
    } else {
        match options.kind {
            MediaKind::Audio => {
                push_flag(&mut args, "-x");
                if let Some(audio_format) = not_best(&options.audio_format) {
                    push_option(&mut args, "--audio-format", audio_format);
                }
                if let Some(audio_quality) = not_best(&options.audio_quality) {
                    push_option(&mut args, "--audio-quality", audio_quality);
                }
            }
            MediaKind::Video => push_option(
                &mut args,
                "-f",
                video_format(options.video_quality.as_deref()),
            ),
        }
    }

    match (&options.merge_format, options.kind) {
        (Some(merge_format), _) => push_option(&mut args, "--merge-output-format", merge_format),
        (None, MediaKind::Video) => {
            push_option(&mut args, "--merge-output-format", DEFAULT_VIDEO_MERGE_FORMAT)
        }
        (None, MediaKind::Audio) => {}
    }

    if let Some(subtitles) = &options.subtitles {
        match subtitles {
            Subtitles::All => push_flag(&mut args, "--all-subs"),
            Subtitles::Auto => push_flag(&mut args, "--write-auto-sub"),
            Subtitles::Languages(languages) => {
                push_option(&mut args, "--sub-langs", languages.join(","))
            }
        }
        if options.embed_subs {
            push_flag(&mut args, "--embed-subs");
        } else {
            push_flag(&mut args, "--write-sub");
        }
        if let Some(sub_format) = &options.sub_format {
            push_option(&mut args, "--sub-format", sub_format);
        }
    }

    if options.embed_metadata {
        push_flag(&mut args, "--embed-metadata");
    }
    if options.embed_thumbnail {
        push_flag(&mut args, "--embed-thumbnail");
    }

    if options.playlist {
        if let Some(items) = &options.playlist_items {
            push_option(&mut args, "--playlist-items", items);
        }
        if let Some(start) = options.playlist_start {
            push_option(&mut args, "--playlist-start", start.to_string());
        }
        if let Some(end) = options.playlist_end {
            push_option(&mut args, "--playlist-end", end.to_string());
        }
    } else {
        push_flag(&mut args, "--no-playlist");
    }

    // A missing cookies file would make yt-dlp fail outright
    if let Some(cookies) = options.cookies_file.as_deref().filter(|path| path.exists()) {
        push_option(&mut args, "--cookies", cookies.to_string_lossy());
    }
    if let Some(proxy) = &options.proxy {
        push_option(&mut args, "--proxy", proxy);
    }
    if let Some(archive) = &options.download_archive {
        push_option(&mut args, "--download-archive", archive.to_string_lossy());
    }
    if let Some(max) = &options.max_filesize {
        push_option(&mut args, "--max-filesize", max);
    }
    if let Some(min) = &options.min_filesize {
        push_option(&mut args, "--min-filesize", min);
    }
    if let Some(rate) = &options.limit_rate {
        push_option(&mut args, "--limit-rate", rate);
    }

    push_option(&mut args, "--retries", "3");
    push_option(&mut args, "--fragment-retries", "3");
    push_flag(&mut args, "--abort-on-unavailable-fragment");
    // Partial files left by a previous attempt tend to corrupt the merge
    push_flag(&mut args, "--no-continue");

    args.push(url.to_string());
    args
}

fn push_flag(args: &mut Vec<String>, flag: &str) {
    args.push(flag.to_string());
}

fn push_option(args: &mut Vec<String>, flag: &str, value: impl AsRef<str>) {
    args.push(flag.to_string());
    args.push(value.as_ref().to_string());
}

fn not_best(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|value| *value != "best")
}
