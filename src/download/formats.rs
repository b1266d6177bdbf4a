//! Listing of the formats yt-dlp offers for a URL.

use std::cmp::Reverse;

use lazy_static::lazy_static;
use regex::Regex;

use crate::prelude::*;

lazy_static! {
    static ref TABLE_ROW_RE: Regex = Regex::new(r"^\d+\s").unwrap();
    static ref DIMENSIONS_RE: Regex = Regex::new(r"(\d+)x(\d+)").unwrap();
    static ref TABLE_SIZE_RE: Regex = Regex::new(r"\d+(\.\d+)?(K|M|G)iB").unwrap();
    static ref TABLE_CODEC_RE: Regex = Regex::new(r"(?i)avc|mp4|vp9|opus|m4a|webm|h264").unwrap();
}

const UNKNOWN: &str = "unknown";

/// Resolutions named by yt-dlp format notes, highest first
const NAMED_RESOLUTIONS: [(&str, u32); 7] = [
    ("2160p", 2160),
    ("1440p", 1440),
    ("1080p", 1080),
    ("720p", 720),
    ("480p", 480),
    ("360p", 360),
    ("240p", 240),
];

/// yt-dlp stderr fragments worth another attempt
const RETRYABLE_ERRORS: [&str; 5] = [
    "network error",
    "timeout",
    "connection reset",
    "temporary failure",
    "service unavailable",
];

/// Streams a format carries. The declaration order is the listing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum FormatKind {
    #[serde(rename = "video+audio")]
    VideoAudio,
    #[serde(rename = "video")]
    Video,
    #[serde(rename = "audio")]
    Audio,
    #[serde(rename = "unknown")]
    Unknown,
}

impl FormatKind {
    pub fn label(&self) -> &'static str {
        match self {
            FormatKind::VideoAudio => "video+audio",
            FormatKind::Video => "video",
            FormatKind::Audio => "audio",
            FormatKind::Unknown => UNKNOWN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Format {
    pub format_id: String,
    pub ext: Option<String>,
    pub resolution: String,
    /// Human readable size, `unknown` when yt-dlp does not know it
    pub filesize: String,
    pub codec: Option<String>,
    pub fps: Option<f64>,
    pub quality: Option<f64>,
    pub note: Option<String>,
    pub url: Option<String>,
    #[serde(rename = "type")]
    pub kind: FormatKind,
    pub description: String,
}

/// The part of `yt-dlp -J` output describing the available formats.
#[derive(Debug, Deserialize)]
struct VideoInfo {
    #[serde(default)]
    formats: Vec<RawFormat>,
}

#[derive(Debug, Deserialize)]
struct RawFormat {
    format_id: String,
    ext: Option<String>,
    resolution: Option<String>,
    width: Option<u64>,
    height: Option<u64>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
    vcodec: Option<String>,
    acodec: Option<String>,
    fps: Option<f64>,
    quality: Option<f64>,
    format_note: Option<String>,
    url: Option<String>,
}

impl RawFormat {
    fn size(&self) -> Option<f64> {
        self.filesize
            .or(self.filesize_approx)
            .filter(|size| *size > 0.0)
    }

    fn kind(&self) -> FormatKind {
        let has_stream = |codec: &Option<String>| codec.as_deref().is_some_and(|c| c != "none");
        match (has_stream(&self.vcodec), has_stream(&self.acodec)) {
            (true, true) => FormatKind::VideoAudio,
            (true, false) => FormatKind::Video,
            (false, true) => FormatKind::Audio,
            (false, false) => FormatKind::Unknown,
        }
    }

    fn description(&self) -> String {
        let mut parts = vec![self.format_id.clone()];
        parts.extend(self.ext.clone());
        parts.extend(self.resolution.clone());
        if let Some(size) = self.size() {
            parts.push(format_filesize(Some(size)));
        }
        parts.extend(self.format_note.clone());
        parts.retain(|part| !part.is_empty());
        parts.join(" ")
    }

    fn into_format(self) -> Format {
        let resolution = match (&self.resolution, self.width, self.height) {
            (Some(resolution), _, _) if !resolution.is_empty() => resolution.clone(),
            (_, Some(width), Some(height)) => format!("{width}x{height}"),
            _ => UNKNOWN.to_string(),
        };
        let codec = match &self.vcodec {
            Some(vcodec) if vcodec != "none" => Some(vcodec.clone()),
            _ => self.acodec.clone(),
        };

        Format {
            resolution,
            codec,
            filesize: format_filesize(self.size()),
            kind: self.kind(),
            description: self.description(),
            format_id: self.format_id,
            ext: self.ext,
            fps: self.fps,
            quality: self.quality,
            note: self.format_note,
            url: self.url,
        }
    }
}

/// Parse the JSON printed by `yt-dlp -J`, sorted for display.
pub fn parse_formats_json(json: &[u8]) -> Result<Vec<Format>, serde_json::Error> {
    let info: VideoInfo = serde_json::from_slice(json)?;
    Ok(sort_formats(
        info.formats.into_iter().map(RawFormat::into_format).collect(),
    ))
}

/// Parse the table printed by `yt-dlp -F`, for when the JSON output is unusable.
pub fn parse_formats_table(output: &str) -> Vec<Format> {
    let formats = output
        .lines()
        .filter(|line| TABLE_ROW_RE.is_match(line) && !line.contains("[info]"))
        .filter_map(|line| {
            let line = line.trim();
            let format_id = line.split_whitespace().next()?.to_string();
            let audio_only = line.contains("audio only");
            let kind = if audio_only {
                FormatKind::Audio
            } else if line.contains("video only") {
                FormatKind::Video
            } else {
                FormatKind::VideoAudio
            };
            let resolution = match DIMENSIONS_RE.find(line) {
                Some(dimensions) => dimensions.as_str().to_string(),
                None if audio_only => "audio".to_string(),
                None => UNKNOWN.to_string(),
            };

            Some(Format {
                format_id,
                ext: None,
                resolution,
                filesize: TABLE_SIZE_RE
                    .find(line)
                    .map_or(UNKNOWN.to_string(), |size| size.as_str().to_string()),
                codec: TABLE_CODEC_RE
                    .find(line)
                    .map(|codec| codec.as_str().to_string()),
                fps: None,
                quality: None,
                note: None,
                url: None,
                kind,
                description: line.to_string(),
            })
        })
        .collect();
    sort_formats(formats)
}

/// Combined streams first, then video-only, then audio-only; highest resolution first within
/// each group.
pub fn sort_formats(mut formats: Vec<Format>) -> Vec<Format> {
    formats.sort_by_key(|format| (format.kind, Reverse(resolution_height(&format.resolution))));
    formats
}

/// Vertical resolution of `WxH` or `1080p` style strings, 0 when unknown.
pub fn resolution_height(resolution: &str) -> u32 {
    if let Some(height) = DIMENSIONS_RE
        .captures(resolution)
        .and_then(|captures| captures[2].parse().ok())
    {
        return height;
    }

    NAMED_RESOLUTIONS
        .iter()
        .find(|(name, _)| resolution.contains(name))
        .map_or(0, |(_, height)| *height)
}

pub fn format_filesize(bytes: Option<f64>) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];

    let Some(mut size) = bytes.filter(|bytes| *bytes > 0.0) else {
        return UNKNOWN.to_string();
    };
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.1}{}", UNITS[unit])
}

pub fn is_retryable_error(message: &str) -> bool {
    let message = message.to_lowercase();
    RETRYABLE_ERRORS
        .iter()
        .any(|retryable| message.contains(retryable))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const VIDEO_INFO: &str = r#"{
        "id": "dQw4w9WgXcQ",
        "title": "Never Gonna Give You Up",
        "formats": [
            {"format_id": "251", "ext": "webm", "resolution": "audio only", "vcodec": "none",
             "acodec": "opus", "filesize": 3495034, "format_note": "medium"},
            {"format_id": "137", "ext": "mp4", "width": 1920, "height": 1080, "vcodec": "avc1.640028",
             "acodec": "none", "fps": 25, "filesize_approx": 80530636.8, "format_note": "1080p"},
            {"format_id": "18", "ext": "mp4", "resolution": "640x360", "vcodec": "avc1.42001E",
             "acodec": "mp4a.40.2", "fps": 25, "url": "https://example.com/18"},
            {"format_id": "22", "ext": "mp4", "resolution": "1280x720", "vcodec": "avc1.64001F",
             "acodec": "mp4a.40.2", "quality": 3},
            {"format_id": "sb0", "ext": "mhtml", "vcodec": "none", "acodec": "none"}
        ]
    }"#;

    #[test]
    fn json_formats_are_typed_and_sorted() {
        let formats = parse_formats_json(VIDEO_INFO.as_bytes()).unwrap();
        let ids: Vec<_> = formats.iter().map(|f| f.format_id.as_str()).collect();
        assert_eq!(ids, ["22", "18", "137", "251", "sb0"]);

        let video = &formats[2];
        assert_eq!(video.kind, FormatKind::Video);
        assert_eq!(video.resolution, "1920x1080");
        assert_eq!(video.filesize, "76.8MB");
        assert_eq!(video.codec.as_deref(), Some("avc1.640028"));
        assert_eq!(video.description, "137 mp4 76.8MB 1080p");

        let audio = &formats[3];
        assert_eq!(audio.kind, FormatKind::Audio);
        assert_eq!(audio.codec.as_deref(), Some("opus"));
        assert_eq!(audio.description, "251 webm audio only 3.3MB medium");

        let storyboard = &formats[4];
        assert_eq!(storyboard.kind, FormatKind::Unknown);
        assert_eq!(storyboard.resolution, "unknown");
        assert_eq!(storyboard.filesize, "unknown");
    }

    #[test]
    fn playlist_without_formats_is_empty() {
        let formats = parse_formats_json(br#"{"_type": "playlist", "entries": []}"#).unwrap();
        assert!(formats.is_empty());
    }

    #[test]
    fn format_serializes_its_kind_as_type() {
        let formats = parse_formats_json(VIDEO_INFO.as_bytes()).unwrap();
        let value = serde_json::to_value(&formats[0]).unwrap();
        assert_eq!(value["type"], "video+audio");
        assert_eq!(value["formatId"], "22");
    }

    #[test]
    fn table_output_is_parsed() {
        let table = "\
[info] Available formats for dQw4w9WgXcQ:
ID  EXT   RESOLUTION FPS |   FILESIZE   TBR PROTO | VCODEC        ACODEC
---------------------------------------------------------------------------
251 webm  audio only     |    3.33MiB  129k https | audio only    opus
137 mp4   1920x1080   25 |   76.80MiB 4400k https | avc1.640028   video only
18  mp4   640x360     25 | ~ 11.20MiB  640k https | avc1.42001E   mp4a.40.2
";
        let formats = parse_formats_table(table);
        let ids: Vec<_> = formats.iter().map(|f| f.format_id.as_str()).collect();
        assert_eq!(ids, ["18", "137", "251"]);

        assert_eq!(formats[0].kind, FormatKind::VideoAudio);
        assert_eq!(formats[0].filesize, "11.20MiB");
        assert_eq!(formats[1].kind, FormatKind::Video);
        assert_eq!(formats[1].codec.as_deref(), Some("mp4"));
        assert_eq!(formats[2].resolution, "audio");
        assert_eq!(formats[2].codec.as_deref(), Some("webm"));
    }

    #[rstest]
    #[case(None, "unknown")]
    #[case(Some(0.0), "unknown")]
    #[case(Some(512.0), "512.0B")]
    #[case(Some(1536.0), "1.5KB")]
    #[case(Some(5.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0), "5120.0GB")]
    fn formats_filesizes(#[case] bytes: Option<f64>, #[case] expected: &str) {
        assert_eq!(format_filesize(bytes), expected);
    }

    #[rstest]
    #[case("1920x1080", 1080)]
    #[case("1080p60", 1080)]
    #[case("audio only", 0)]
    #[case("unknown", 0)]
    fn reads_resolution_height(#[case] resolution: &str, #[case] expected: u32) {
        assert_eq!(resolution_height(resolution), expected);
    }

    #[rstest]
    #[case("ERROR: Unable to download webpage: Network Error", true)]
    #[case("ERROR: HTTP Error 503: Service Unavailable", true)]
    #[case("ERROR: [youtube] dQw4w9WgXcQ: Video unavailable", false)]
    fn classifies_retryable_errors(#[case] message: &str, #[case] expected: bool) {
        assert_eq!(is_retryable_error(message), expected);
    }
}
