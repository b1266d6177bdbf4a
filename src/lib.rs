//! Mihari backend supervisor library

mod config;
mod download;
mod helpers;
mod local_logger;
mod prelude;
mod process_tree;
mod shutdown;
mod supervisor;

pub mod cli;

pub use config::{BackendConfig, DownloadConfig, MihariConfig};
pub use download::{
    DownloadError, DownloadOptions, DownloadOutcome, Downloader, Format, FormatKind, MediaKind,
    ProgressUpdate, Subtitles,
};
pub use local_logger::clean_logger;
pub use process_tree::{
    ChildLister, EnumeratingTerminator, ProcessTree, SignalError, Signaller, TermSignal,
    TreeTerminator, platform_terminator,
};
#[cfg(target_os = "linux")]
pub use process_tree::ProcfsChildLister;
#[cfg(target_os = "windows")]
pub use process_tree::TaskkillTerminator;
#[cfg(unix)]
pub use process_tree::{NixSignaller, PgrepChildLister};
pub use shutdown::{ShutdownFlag, graceful_shutdown};
pub use supervisor::{
    BackendEvent, Broadcast, ChannelSink, EventSink, OutputRelay, OutputStream, ProcessStatus,
    RestartOutcome, Supervisor,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
