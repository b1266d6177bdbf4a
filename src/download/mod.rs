//! Direct yt-dlp invocation, with progress parsed from its output.

mod formats;
mod options;

pub use formats::{Format, FormatKind, is_retryable_error, parse_formats_json, parse_formats_table};
pub use options::{
    DEFAULT_OUTPUT_TEMPLATE, DownloadOptions, MediaKind, Subtitles, build_args, validate_url,
};

use std::{
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Output, Stdio},
    sync::atomic::AtomicBool,
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    sync::{mpsc, watch},
    time::Instant,
};
use ytdlp_progress::ProgressState;

use crate::config::DownloadConfig;
use crate::helpers::flag_guard::AtomicFlagGuard;
use crate::helpers::line_buffer::LineBuffer;
use crate::prelude::*;

const YT_DLP_BINARY: &str = "yt-dlp";
/// How long yt-dlp gets to exit after a polite cancellation before it is killed
const CANCEL_KILL_TIMEOUT: Duration = Duration::from_secs(5);
/// How long to keep relaying progress once yt-dlp exited
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
/// How long a single format listing may take
const FORMATS_TIMEOUT: Duration = Duration::from_secs(30);
/// Attempts after the first one when listing formats fails with a transient error
const FORMATS_MAX_RETRIES: u32 = 3;
/// Delay before the first retry, growing linearly with every attempt
const FORMATS_RETRY_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("A download is already in progress")]
    InProgress,
    #[error("Download was cancelled")]
    Cancelled,
    #[error("Download failed with exit code {}", .code.map_or("unknown".to_string(), |code| code.to_string()))]
    Failed { code: Option<i32> },
    #[error("Process error: {0}")]
    Process(#[source] io::Error),
    #[error("yt-dlp executable not found: {0}")]
    NotFound(String),
    #[error("Timeout while fetching formats")]
    Timeout,
    #[error("Failed to fetch formats: {0}")]
    FormatFetchFailed(String),
    #[error("Failed to parse formats: {0}")]
    FormatParseFailed(String),
}

impl DownloadError {
    /// Stable machine readable code of the error
    pub fn code(&self) -> &'static str {
        match self {
            DownloadError::InvalidUrl(_) => "INVALID_URL",
            DownloadError::InProgress => "DOWNLOAD_IN_PROGRESS",
            DownloadError::Cancelled => "CANCELLED",
            DownloadError::Failed { .. } => "DOWNLOAD_FAILED",
            DownloadError::Process(_) => "PROCESS_ERROR",
            DownloadError::NotFound(_) => "NOT_FOUND",
            DownloadError::Timeout => "TIMEOUT",
            DownloadError::FormatFetchFailed(_) => "FORMAT_FETCH_FAILED",
            DownloadError::FormatParseFailed(_) => "FORMAT_PARSE_FAILED",
        }
    }
}

/// Progress reported after every line of yt-dlp output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub percent: f64,
    /// The raw output line the update was parsed from
    pub output: String,
    pub current_fragment: u32,
    pub total_fragments: u32,
    pub filename: Option<String>,
    pub destination: Option<String>,
    pub speed: Option<String>,
    pub eta: Option<String>,
}

impl ProgressUpdate {
    fn new(state: &ProgressState, output: String) -> Self {
        Self {
            percent: state.percentage,
            output,
            current_fragment: state.current_fragment,
            total_fragments: state.total_fragments,
            filename: state.filename().map(str::to_string),
            destination: state.destination.clone(),
            speed: state.speed.clone(),
            eta: state.eta.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadOutcome {
    pub filename: Option<String>,
    pub path: Option<PathBuf>,
    /// Size of the downloaded file, when it could be found on disk
    pub file_size: Option<u64>,
}

/// Runs one yt-dlp download at a time.
pub struct Downloader {
    yt_dlp: PathBuf,
    output_dir: PathBuf,
    downloading: AtomicBool,
    cancel: watch::Sender<bool>,
}

impl Downloader {
    pub fn new(yt_dlp: PathBuf, output_dir: PathBuf) -> Self {
        Self {
            yt_dlp,
            output_dir,
            downloading: AtomicBool::new(false),
            cancel: watch::Sender::new(false),
        }
    }

    pub fn from_config(config: &DownloadConfig) -> Result<Self, DownloadError> {
        let yt_dlp = resolve_yt_dlp(config.yt_dlp_path.as_deref())?;
        Ok(Self::new(yt_dlp, config.output_path.clone()))
    }

    pub fn yt_dlp(&self) -> &Path {
        &self.yt_dlp
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn is_downloading(&self) -> bool {
        self.downloading.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Download `url`, calling `on_progress` after every line of yt-dlp output.
    pub async fn download(
        &self,
        url: &str,
        options: &DownloadOptions,
        mut on_progress: impl FnMut(&ProgressUpdate),
    ) -> Result<DownloadOutcome, DownloadError> {
        let _downloading =
            AtomicFlagGuard::try_set(&self.downloading).ok_or(DownloadError::InProgress)?;
        let url = validate_url(url)?;
        self.cancel.send_replace(false);

        if let Err(e) = std::fs::create_dir_all(&self.output_dir) {
            warn!(
                "Failed to create output directory {}: {e}",
                self.output_dir.display()
            );
        }

        let args = build_args(url.as_str(), &self.output_dir, options);
        debug!("Executing yt-dlp with args: {args:?}");
        let mut child = Command::new(&self.yt_dlp)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(DownloadError::Process)?;

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(parse_progress(stdout, progress_tx));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_errors(stderr));
        }

        let mut last_update = None;
        let status = self
            .supervise(&mut child, &mut progress_rx, |update| {
                on_progress(&update);
                last_update = Some(update);
            })
            .await;

        // Output still buffered when the process exited
        while let Ok(Some(update)) =
            tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, progress_rx.recv()).await
        {
            on_progress(&update);
            last_update = Some(update);
        }

        if *self.cancel.borrow() {
            return Err(DownloadError::Cancelled);
        }
        let status = status.map_err(DownloadError::Process)?;
        if !status.success() {
            return Err(DownloadError::Failed {
                code: status.code(),
            });
        }

        let path = last_update
            .as_ref()
            .and_then(|update| update.destination.as_deref())
            .map(PathBuf::from);
        let file_size = path
            .as_deref()
            .and_then(|path| std::fs::metadata(path).ok())
            .map(|metadata| metadata.len());
        let outcome = DownloadOutcome {
            filename: last_update.and_then(|update| update.filename),
            path,
            file_size,
        };
        info!("Download complete: {outcome:?}");
        Ok(outcome)
    }

    /// Wait for yt-dlp to exit, relaying progress and handling cancellation meanwhile.
    async fn supervise(
        &self,
        child: &mut Child,
        progress: &mut mpsc::UnboundedReceiver<ProgressUpdate>,
        mut on_update: impl FnMut(ProgressUpdate),
    ) -> io::Result<ExitStatus> {
        let mut cancel = self.cancel.subscribe();
        let mut cancelling = false;
        let mut force_kill_at: Option<Instant> = None;

        loop {
            tokio::select! {
                status = child.wait() => return status,
                Some(update) = progress.recv() => on_update(update),
                _ = cancel.wait_for(|cancelled| *cancelled), if !cancelling => {
                    info!("Cancelling download...");
                    cancelling = true;
                    request_termination(child);
                    force_kill_at = Some(Instant::now() + CANCEL_KILL_TIMEOUT);
                }
                _ = sleep_until(force_kill_at) => {
                    warn!(
                        "yt-dlp still running {}s after cancellation, killing it",
                        CANCEL_KILL_TIMEOUT.as_secs()
                    );
                    force_kill_at = None;
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to kill yt-dlp: {e}");
                    }
                }
            }
        }
    }

    /// List the formats available for `url`, retrying transient failures with a linear backoff.
    pub async fn formats(&self, url: &str) -> Result<Vec<Format>, DownloadError> {
        let url = validate_url(url)?;
        let mut attempt = 0;

        loop {
            match self.fetch_formats(url.as_str()).await {
                Err(DownloadError::FormatFetchFailed(message))
                    if attempt < FORMATS_MAX_RETRIES && is_retryable_error(&message) =>
                {
                    attempt += 1;
                    let backoff = FORMATS_RETRY_BACKOFF * attempt;
                    warn!(
                        "Retrying format fetch ({attempt}/{FORMATS_MAX_RETRIES}) in {}s: {message}",
                        backoff.as_secs()
                    );
                    tokio::time::sleep(backoff).await;
                }
                result => return result,
            }
        }
    }

    async fn fetch_formats(&self, url: &str) -> Result<Vec<Format>, DownloadError> {
        let output = self.run_to_completion(&["-J", "--flat-playlist", url]).await?;
        if !output.status.success() {
            return Err(DownloadError::FormatFetchFailed(stderr_or(
                &output,
                "Failed to fetch formats",
            )));
        }

        match parse_formats_json(&output.stdout) {
            Ok(formats) => Ok(formats),
            Err(e) => {
                debug!("Unreadable yt-dlp JSON ({e}), falling back to the format table");
                let output = self.run_to_completion(&["-F", url]).await?;
                if !output.status.success() {
                    return Err(DownloadError::FormatParseFailed(stderr_or(
                        &output,
                        "Failed to get formats",
                    )));
                }
                Ok(parse_formats_table(&String::from_utf8_lossy(&output.stdout)))
            }
        }
    }

    async fn run_to_completion(&self, args: &[&str]) -> Result<Output, DownloadError> {
        debug!("Executing yt-dlp with args: {args:?}");
        let output = Command::new(&self.yt_dlp)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(FORMATS_TIMEOUT, output).await {
            Ok(output) => output.map_err(DownloadError::Process),
            Err(_) => Err(DownloadError::Timeout),
        }
    }

    /// Cancel the running download, if any. It then fails with [`DownloadError::Cancelled`].
    pub fn cancel(&self) {
        if self.is_downloading() {
            self.cancel.send_replace(true);
        }
    }
}

fn stderr_or(output: &Output, fallback: &str) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        fallback.to_string()
    } else {
        stderr
    }
}

/// Locate yt-dlp: the configured path when given, otherwise the one found on `PATH`.
pub fn resolve_yt_dlp(configured: Option<&Path>) -> Result<PathBuf, DownloadError> {
    match configured {
        Some(path) if path.exists() => Ok(path.to_path_buf()),
        Some(path) => Err(DownloadError::NotFound(path.display().to_string())),
        None => which::which(YT_DLP_BINARY)
            .map_err(|e| DownloadError::NotFound(format!("{YT_DLP_BINARY} is not on PATH ({e})"))),
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Ask yt-dlp to stop, letting it clean its partial files up.
fn request_termination(child: &mut Child) {
    #[cfg(unix)]
    {
        use crate::process_tree::{NixSignaller, SignalError, Signaller, TermSignal};

        if let Some(pid) = child.id() {
            match NixSignaller.signal(pid, TermSignal::Term) {
                Ok(()) | Err(SignalError::NoSuchProcess(_)) => {}
                Err(e) => warn!("Failed to terminate yt-dlp: {e}"),
            }
            return;
        }
    }

    // No polite termination available, kill it right away
    if let Err(e) = child.start_kill() {
        warn!("Failed to kill yt-dlp: {e}");
    }
}

async fn parse_progress<R: AsyncRead + Unpin>(
    mut stdout: R,
    updates: mpsc::UnboundedSender<ProgressUpdate>,
) {
    let mut state = ProgressState::new();
    let mut lines = LineBuffer::new();
    let mut buffer = [0u8; 4096];

    loop {
        let lines_read = match stdout.read(&mut buffer).await {
            Ok(0) => break,
            Ok(bytes_read) => lines.push(&buffer[..bytes_read]),
            Err(e) => {
                warn!("Failed to read yt-dlp output: {e}");
                break;
            }
        };
        for line in lines_read {
            trace!("yt-dlp: {line}");
            state.parse_line(&line);
            if updates.send(ProgressUpdate::new(&state, line)).is_err() {
                return;
            }
        }
    }

    if let Some(line) = lines.finish() {
        state.parse_line(&line);
        let _ = updates.send(ProgressUpdate::new(&state, line));
    }
}

async fn log_errors<R: AsyncRead + Unpin>(mut stderr: R) {
    let mut lines = LineBuffer::new();
    let mut buffer = [0u8; 4096];

    loop {
        let bytes_read = match stderr.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(bytes_read) => bytes_read,
        };
        for line in lines.push(&buffer[..bytes_read]) {
            log_stderr_line(&line);
        }
    }
    if let Some(line) = lines.finish() {
        log_stderr_line(&line);
    }
}

fn log_stderr_line(line: &str) {
    // yt-dlp prints recoverable issues as warnings on stderr
    if line.to_lowercase().contains("warning") {
        warn!("yt-dlp: {line}");
    } else {
        error!("yt-dlp: {line}");
    }
}

#[cfg(all(test, unix))]
pub(crate) mod testing;
