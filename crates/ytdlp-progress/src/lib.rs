//! Incremental parser for the progress output printed by yt-dlp.
//!
//! yt-dlp does not offer a structured progress stream, so the downloader feeds every chunk of
//! standard output through [`ProgressState::parse_line`] and reads back the accumulated state.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

lazy_static! {
    static ref DESTINATION_RE: Regex = Regex::new(r"\[download\]\s+Destination:\s+(.+)").unwrap();
    static ref MERGE_RE: Regex =
        Regex::new(r#"\[Merger\]\s+Merging formats into\s+"(.+)""#).unwrap();
    static ref FRAGMENT_RE: Regex = Regex::new(r"\(frag\s+(\d+)/(\d+)\)").unwrap();
    static ref PERCENT_RE: Regex = Regex::new(r"([\d.]+)%").unwrap();
    static ref SPEED_RE: Regex = Regex::new(r"([\d.]+)(K|M|G)?iB/s").unwrap();
    static ref ETA_RE: Regex = Regex::new(r"ETA\s+([\d:]+)").unwrap();
}

/// Accumulated progress of a single download.
///
/// Fields are only overwritten when a chunk carries evidence for them, so a chunk with no
/// recognizable token leaves the state untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressState {
    pub destination: Option<String>,
    pub current_fragment: u32,
    pub total_fragments: u32,
    /// Overall progress, always within `0.0..=100.0`
    pub percentage: f64,
    pub speed: Option<String>,
    pub eta: Option<String>,
}

impl ProgressState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one chunk of output, updating every field it carries a token for.
    ///
    /// When a chunk holds several progress updates (yt-dlp separates them with `\r`), the
    /// last occurrence of each token wins.
    ///
    /// Returns `true` when at least one field was updated.
    pub fn parse_line(&mut self, chunk: &str) -> bool {
        let mut updated = false;

        if let Some(path) = capture_first(&DESTINATION_RE, chunk) {
            self.destination = Some(path.trim().to_string());
            updated = true;
        }

        // The merged file replaces the temporary per-format destination
        if let Some(path) = capture_first(&MERGE_RE, chunk) {
            self.destination = Some(path.trim().to_string());
            updated = true;
        }

        if let Some(captures) = FRAGMENT_RE.captures_iter(chunk).last() {
            if let (Ok(current), Ok(total)) = (captures[1].parse(), captures[2].parse()) {
                self.current_fragment = current;
                self.total_fragments = total;
                updated = true;
            }
        }

        if let Some(raw) = PERCENT_RE
            .captures_iter(chunk)
            .filter_map(|captures| captures[1].parse::<f64>().ok())
            .last()
        {
            self.percentage =
                overall_percentage(raw, self.current_fragment, self.total_fragments);
            updated = true;
        }

        if let Some(speed) = SPEED_RE.find_iter(chunk).last() {
            self.speed = Some(speed.as_str().to_string());
            updated = true;
        }

        if let Some(captures) = ETA_RE.captures_iter(chunk).last() {
            self.eta = Some(captures[1].to_string());
            updated = true;
        }

        updated
    }

    /// Consume the state and return it with `chunk` applied.
    pub fn parsed(mut self, chunk: &str) -> Self {
        self.parse_line(chunk);
        self
    }

    /// Final path segment of the tracked destination.
    pub fn filename(&self) -> Option<&str> {
        self.destination
            .as_deref()
            .and_then(|path| path.rsplit(['/', '\\']).next())
            .filter(|name| !name.is_empty())
    }
}

fn capture_first<'a>(re: &Regex, chunk: &'a str) -> Option<&'a str> {
    re.captures(chunk)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str())
}

/// Convert a raw percentage into overall progress.
///
/// When the download is fragmented, yt-dlp reports the progress within the current fragment,
/// which is renormalized as `((current - 1 + raw / 100) / total) * 100`.
pub fn overall_percentage(raw: f64, current_fragment: u32, total_fragments: u32) -> f64 {
    let percent = if total_fragments > 0 {
        let fragment_progress = raw / 100.0;
        ((current_fragment as f64 - 1.0 + fragment_progress) / total_fragments as f64) * 100.0
    } else {
        raw
    };

    if percent.is_nan() {
        return 0.0;
    }
    percent.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn renormalizes_fragment_progress() {
        let state = ProgressState::new()
            .parsed("[download]  12.0% of ~ 80.00MiB at  1.20MiB/s ETA 00:51 (frag 3/10)");
        assert_eq!(state.current_fragment, 3);
        assert_eq!(state.total_fragments, 10);

        assert_eq!(overall_percentage(50.0, 3, 10), 25.0);
    }

    #[test]
    fn fragment_counter_applies_to_percentage_in_same_chunk() {
        let state = ProgressState::new().parsed("[download]  50.0% of ~ 10.00MiB (frag 3/10)");
        assert_eq!(state.percentage, 25.0);
    }

    #[test]
    fn uses_raw_percentage_without_fragments() {
        let state = ProgressState::new()
            .parsed("[download]  42.5% of   10.00MiB at    2.50MiB/s ETA 00:03");
        assert_eq!(state.percentage, 42.5);
        assert_eq!(state.speed.as_deref(), Some("2.50MiB/s"));
        assert_eq!(state.eta.as_deref(), Some("00:03"));
    }

    #[rstest]
    #[case("[download] 250.0% of 10.00MiB", 100.0)]
    #[case("[download] 100% of 10.00MiB", 100.0)]
    #[case("[download] 100.0% of ~ 10.00MiB (frag 12/10)", 100.0)]
    #[case("[download] 30.0% of ~ 10.00MiB (frag 0/10)", 0.0)]
    fn clamps_percentage(#[case] chunk: &str, #[case] expected: f64) {
        let state = ProgressState::new().parsed(chunk);
        assert_eq!(state.percentage, expected);
    }

    #[test]
    fn merge_destination_supersedes_download_destination() {
        let mut state = ProgressState::new();
        state.parse_line("[download] Destination: /videos/a.webm");
        assert_eq!(state.filename(), Some("a.webm"));

        state.parse_line("[download] 100% of 10.00MiB");
        state.parse_line("[Merger] Merging formats into \"/videos/a.mp4\"");
        assert_eq!(state.destination.as_deref(), Some("/videos/a.mp4"));
        assert_eq!(state.filename(), Some("a.mp4"));
    }

    #[test]
    fn filename_handles_windows_separators() {
        let state =
            ProgressState::new().parsed(r"[download] Destination: C:\Users\me\Videos\clip.f137.mp4");
        assert_eq!(state.filename(), Some("clip.f137.mp4"));
    }

    #[test]
    fn unmatched_chunk_keeps_previous_fields() {
        let mut state = ProgressState::new()
            .parsed("[download]  10.0% of 10.00MiB at 1.00KiB/s ETA 01:02:03");
        let before = state.clone();

        assert!(!state.parse_line("[youtube] abc: Downloading webpage"));
        assert_eq!(state, before);
    }

    #[test]
    fn speed_without_unit_prefix() {
        let state = ProgressState::new().parsed("[download]   1.0% at 512.00iB/s");
        assert_eq!(state.speed.as_deref(), Some("512.00iB/s"));
    }

    #[test]
    fn chunk_with_several_updates_keeps_latest() {
        let state = ProgressState::new().parsed(
            "[download]  10.0% of 10.00MiB at 1.00MiB/s ETA 00:09\r[download]  20.0% of 10.00MiB at 2.00MiB/s ETA 00:04",
        );
        assert_eq!(state.percentage, 20.0);
        assert_eq!(state.speed.as_deref(), Some("2.00MiB/s"));
        assert_eq!(state.eta.as_deref(), Some("00:04"));
    }

    #[test]
    fn malformed_percentage_is_ignored() {
        let mut state = ProgressState::new().parsed("[download]  33.0% of 10.00MiB");
        state.parse_line("progress ...% done");
        assert_eq!(state.percentage, 33.0);
    }
}
