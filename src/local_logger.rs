use std::{
    env,
    io::Write,
    sync::{Arc, Mutex, PoisonError},
};

use crate::prelude::*;
use crate::supervisor::BACKEND_TARGET;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use lazy_static::lazy_static;
use log::{Level, Log};
use simplelog::{CombinedLogger, SharedLogger};

pub const MIHARI_U8_COLOR_CODE: u8 = 211; // #FF87AF
pub const LOG_LEVEL_ENV: &str = "MIHARI_LOG";

lazy_static! {
    pub static ref PROGRESS_BAR: Arc<Mutex<Option<ProgressBar>>> = Arc::new(Mutex::new(None));
    pub static ref IS_TTY: bool = std::io::IsTerminal::is_terminal(&std::io::stdout());
}

/// Hide the progress bar temporarily, execute `f`, then redraw the progress bar.
///
/// If the output is not a TTY, `f` will be executed without hiding the progress bar.
pub fn suspend_progress_bar<F: FnOnce() -> R, R>(f: F) -> R {
    if *IS_TTY {
        if let Ok(mut bar) = PROGRESS_BAR.lock() {
            if let Some(bar) = bar.as_mut() {
                return bar.suspend(f);
            }
        }
    }

    f()
}

/// Install a download progress bar, replacing the previous one.
///
/// Returns `None` when stdout is not a terminal, in which case progress is only logged.
pub fn start_progress_bar(message: &str) -> Option<ProgressBar> {
    if !*IS_TTY {
        return None;
    }

    let bar = ProgressBar::new(1000);
    let template = format!(
        "  {{bar:40.{MIHARI_U8_COLOR_CODE}}} {{percent:>3}}% {{wide_msg:.{MIHARI_U8_COLOR_CODE}.bold}}"
    );
    if let Ok(progress_style) = ProgressStyle::with_template(&template) {
        bar.set_style(progress_style.progress_chars("━╸─"));
    }
    bar.set_message(message.to_string());

    let mut slot = PROGRESS_BAR.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(previous) = slot.replace(bar.clone()) {
        previous.finish_and_clear();
    }
    Some(bar)
}

pub struct LocalLogger {
    log_level: log::LevelFilter,
}

impl LocalLogger {
    pub fn new() -> Self {
        let log_level = env::var(LOG_LEVEL_ENV)
            .ok()
            .and_then(|log_level| log_level.parse::<log::LevelFilter>().ok())
            .unwrap_or(log::LevelFilter::Info);

        LocalLogger { log_level }
    }
}

impl Log for LocalLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.log_level
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let (console, line) = render_record(record);
        suspend_progress_bar(|| match console {
            Console::Stdout => println!("{line}"),
            Console::Stderr => eprintln!("{line}"),
        });
    }

    fn flush(&self) {
        let _ = std::io::stdout().flush();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Console {
    Stdout,
    Stderr,
}

/// Style a record and pick the stream it is printed on.
fn render_record(record: &log::Record) -> (Console, String) {
    let args = record.args();

    // Backend output keeps its own prefix to read apart from supervisor messages
    if record.target() == BACKEND_TARGET {
        let prefix = style("[backend]").color256(MIHARI_U8_COLOR_CODE);
        match record.level() {
            Level::Info => return (Console::Stdout, format!("{prefix} {args}")),
            Level::Warn => return (Console::Stderr, format!("{prefix} {}", style(args).yellow())),
            _ => {}
        }
    }

    match record.level() {
        Level::Error => (Console::Stderr, style(args).red().to_string()),
        Level::Warn => (Console::Stderr, style(args).yellow().to_string()),
        Level::Info => (Console::Stdout, args.to_string()),
        Level::Debug => (
            Console::Stdout,
            style(format!("[DEBUG::{}] {args}", record.target()))
                .blue()
                .dim()
                .to_string(),
        ),
        Level::Trace => (
            Console::Stdout,
            style(format!("[TRACE::{}] {args}", record.target()))
                .black()
                .dim()
                .to_string(),
        ),
    }
}

impl SharedLogger for LocalLogger {
    fn level(&self) -> log::LevelFilter {
        self.log_level
    }

    fn config(&self) -> Option<&simplelog::Config> {
        None
    }

    fn as_log(self: Box<Self>) -> Box<dyn Log> {
        Box::new(*self)
    }
}

pub fn get_local_logger() -> Box<dyn SharedLogger> {
    Box::new(LocalLogger::new())
}

pub fn init_local_logger() -> Result<()> {
    let logger = get_local_logger();
    CombinedLogger::init(vec![logger])?;
    Ok(())
}

pub fn clean_logger() {
    let mut bar = PROGRESS_BAR.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(bar) = bar.take() {
        bar.finish_and_clear();
    }
}
