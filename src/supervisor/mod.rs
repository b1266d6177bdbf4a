//! Lifecycle supervision of the long-lived backend process.
//!
//! The [`Supervisor`] owns a single backend slot. Starting while a backend is live stops it
//! first, readiness is detected from stdout, and every way a process can go away (explicit
//! stop, crash, spawn error, startup timeout) funnels into the same cleanup so the slot is
//! always left empty and ready for the next start.

mod events;
mod launcher;
mod readiness;
mod relay;

pub use events::{BackendEvent, OutputStream, ProcessStatus, RestartOutcome};
pub use launcher::LaunchError;
pub use readiness::ReadinessDetector;
pub use relay::{Broadcast, ChannelSink, EventSink, JsonLinesSink, LogSink, OutputRelay};

use std::{
    path::Path,
    process::ExitStatus,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{Child, ChildStdin},
    sync::{mpsc, watch},
    task::{AbortHandle, JoinHandle},
};

use crate::config::BackendConfig;
use crate::helpers::line_buffer::LineBuffer;
use crate::prelude::*;
use crate::process_tree::{TermSignal, TreeTerminator};
use crate::shutdown::ShutdownFlag;

/// Log target of the relayed backend output
pub const BACKEND_TARGET: &str = "backend";

/// Written to the backend stdin to ask for a cooperative exit
const QUIT_SENTINEL: &[u8] = b"quit\n";
/// How long to wait for the process to be reaped once its tree was force-killed
const FORCE_STOP_FOLLOWUP_WAIT: Duration = Duration::from_secs(1);
/// How long stdout/stderr may stay open after exit, e.g. held by an orphaned grandchild
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// The currently supervised process.
struct BackendProcess {
    generation: u64,
    pid: Option<u32>,
    ready: bool,
    /// Set once a stop was requested, so its exit is not reported as a crash
    stopping: bool,
    stdin: Option<ChildStdin>,
    startup_deadline: Option<AbortHandle>,
    handle: StopHandle,
}

/// What is needed to force a process down without holding the slot lock
#[derive(Clone)]
struct StopHandle {
    pid: Option<u32>,
    /// Asks the monitor task to kill the top-level process directly
    force_kill: mpsc::UnboundedSender<()>,
    exited: watch::Receiver<bool>,
}

impl StopHandle {
    fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Wait up to `timeout` for the process to exit, returning whether it did.
    async fn wait_for_exit(&self, timeout: Duration) -> bool {
        let mut exited = self.exited.clone();
        // A dropped monitor also ends the wait, so always read back the flag itself
        let _ = tokio::time::timeout(timeout, exited.wait_for(|exited| *exited)).await;
        self.has_exited()
    }

    fn force_kill(&self) {
        if self.force_kill.send(()).is_err() {
            debug!("Backend monitor already gone, nothing to force kill");
        }
    }
}

#[derive(Default)]
struct Slot {
    last_generation: u64,
    process: Option<BackendProcess>,
}

struct Inner {
    config: BackendConfig,
    broadcaster: Arc<dyn Broadcast>,
    terminator: Arc<dyn TreeTerminator>,
    shutdown: ShutdownFlag,
    slot: Mutex<Slot>,
    /// Serializes start and stop sequences, so a start issued during a stop grace period
    /// waits for that stop to finish
    lifecycle: tokio::sync::Mutex<()>,
}

/// Owns at most one backend process at a time.
///
/// Cheap to clone: clones share the same slot, so the same supervisor can be handed to signal
/// handlers and command handlers alike.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        config: BackendConfig,
        broadcaster: Arc<dyn Broadcast>,
        terminator: Arc<dyn TreeTerminator>,
        shutdown: ShutdownFlag,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                broadcaster,
                terminator,
                shutdown,
                slot: Mutex::new(Slot::default()),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn shutdown_flag(&self) -> &ShutdownFlag {
        &self.inner.shutdown
    }

    /// Start the backend, stopping the current one first if any.
    ///
    /// Returns `false` when the executable is missing or could not be spawned; in both cases
    /// no process state is left behind.
    pub async fn start(&self, executable: &Path) -> bool {
        match self.try_start(executable).await {
            Ok(()) => true,
            Err(error) => {
                error!("Failed to start backend process: {error}");
                false
            }
        }
    }

    async fn try_start(&self, executable: &Path) -> Result<(), LaunchError> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        if self.inner.lock_slot().process.is_some() {
            info!("Backend process already running, stopping it first...");
            self.inner.stop_current().await;
        }

        info!("Starting backend process: {}", executable.display());
        let child = match launcher::spawn_backend(executable, &self.inner.config) {
            Ok(child) => child,
            Err(error @ LaunchError::NotFound(_)) => return Err(error),
            Err(error) => {
                self.inner.broadcaster.broadcast(BackendEvent::Error {
                    error: error.to_string(),
                });
                return Err(error);
            }
        };

        self.inner.supervise(child);
        Ok(())
    }

    /// Stop the backend: ask it to quit, wait for the grace period, then kill its whole
    /// process tree. No-op when no backend is live.
    pub async fn kill(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.inner.stop_current().await;
    }

    /// Stop the current backend, if any, then start a new one.
    pub async fn restart(&self, executable: &Path) -> RestartOutcome {
        self.kill().await;
        match self.try_start(executable).await {
            Ok(()) => RestartOutcome {
                success: true,
                error: None,
            },
            Err(error) => {
                error!("Failed to restart backend process: {error}");
                RestartOutcome {
                    success: false,
                    error: Some(error.to_string()),
                }
            }
        }
    }

    pub fn is_process_running(&self) -> bool {
        self.inner
            .lock_slot()
            .process
            .as_ref()
            .is_some_and(|process| !process.handle.has_exited())
    }

    pub fn is_process_ready(&self) -> bool {
        self.inner
            .lock_slot()
            .process
            .as_ref()
            .is_some_and(|process| process.ready)
    }

    pub fn status(&self) -> ProcessStatus {
        ProcessStatus {
            running: self.is_process_running(),
            ready: self.is_process_ready(),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner
            .lock_slot()
            .process
            .as_ref()
            .and_then(|process| process.pid)
    }
}

impl Inner {
    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a freshly spawned child and attach its stream readers, monitor and startup
    /// deadline.
    fn supervise(self: &Arc<Self>, mut child: Child) {
        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (force_kill_tx, force_kill_rx) = mpsc::unbounded_channel();
        let (exited_tx, exited_rx) = watch::channel(false);

        let mut slot = self.lock_slot();
        slot.last_generation += 1;
        let generation = slot.last_generation;

        let mut readers = Vec::new();
        if let Some(stdout) = stdout {
            let detector = ReadinessDetector::new(self.config.ready_sentinels.clone());
            readers.push(tokio::spawn(self.clone().relay_output(
                generation,
                OutputStream::Stdout,
                stdout,
                Some(detector),
            )));
        }
        if let Some(stderr) = stderr {
            readers.push(tokio::spawn(self.clone().relay_output(
                generation,
                OutputStream::Stderr,
                stderr,
                None,
            )));
        }

        tokio::spawn(
            self.clone()
                .monitor(generation, child, readers, force_kill_rx, exited_tx),
        );

        let startup_timeout = self.config.startup_timeout();
        let deadline = {
            let inner = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(startup_timeout).await;
                inner.on_startup_timeout(generation).await;
            })
        };

        slot.process = Some(BackendProcess {
            generation,
            pid,
            ready: false,
            stopping: false,
            stdin,
            startup_deadline: Some(deadline.abort_handle()),
            handle: StopHandle {
                pid,
                force_kill: force_kill_tx,
                exited: exited_rx,
            },
        });
        debug!("Backend process spawned (pid={pid:?}, generation={generation})");
    }

    /// Reset the slot if it still holds `generation`, returning the released process.
    ///
    /// Every termination path ends here. The startup deadline is cancelled under the same lock
    /// that empties the slot, so a stale timer can never fire against a newer process.
    fn cleanup(&self, generation: u64) -> Option<BackendProcess> {
        let mut slot = self.lock_slot();
        if slot
            .process
            .as_ref()
            .is_none_or(|process| process.generation != generation)
        {
            return None;
        }

        let mut process = slot.process.take()?;
        if let Some(deadline) = process.startup_deadline.take() {
            deadline.abort();
        }
        Some(process)
    }

    /// Flip the readiness flag of `generation`, returning `true` on the first call only.
    fn mark_ready(&self, generation: u64) -> bool {
        let mut slot = self.lock_slot();
        let Some(process) = slot
            .process
            .as_mut()
            .filter(|process| process.generation == generation)
        else {
            return false;
        };
        if process.ready || process.stopping {
            return false;
        }

        process.ready = true;
        if let Some(deadline) = process.startup_deadline.take() {
            deadline.abort();
        }
        true
    }

    /// Mark the current process as stopping and hand out what is needed to stop it.
    fn begin_stop(&self) -> Option<(u64, StopHandle, Option<ChildStdin>)> {
        let mut slot = self.lock_slot();
        let process = slot.process.as_mut()?;
        process.stopping = true;
        if let Some(deadline) = process.startup_deadline.take() {
            deadline.abort();
        }
        Some((
            process.generation,
            process.handle.clone(),
            process.stdin.take(),
        ))
    }

    async fn stop_current(&self) {
        let Some((generation, handle, stdin)) = self.begin_stop() else {
            return;
        };

        info!("Stopping backend process (pid={:?})...", handle.pid);
        if let Err(error) = self.stop_gracefully(&handle, stdin).await {
            error!("Error stopping backend process: {error:#}");
            if !handle.has_exited() {
                warn!("Falling back to killing the backend process directly");
                handle.force_kill();
                handle.wait_for_exit(FORCE_STOP_FOLLOWUP_WAIT).await;
            }
        }

        self.cleanup(generation);
    }

    async fn stop_gracefully(&self, handle: &StopHandle, stdin: Option<ChildStdin>) -> Result<()> {
        // The quit request is only a hint; the tree kill below is what guarantees termination
        if let Some(stdin) = stdin {
            if let Err(error) = request_quit(stdin).await {
                debug!("Could not send quit request to backend: {error}");
            }
        }

        if handle.wait_for_exit(self.config.grace_period()).await {
            debug!("Backend process exited within the grace period");
            return Ok(());
        }

        let pid = handle
            .pid
            .context("Backend process id is unavailable, cannot kill its process tree")?;
        info!("Force killing backend process tree (pid={pid})...");
        self.terminator
            .terminate_tree(pid, TermSignal::Kill)
            .await
            .with_context(|| format!("Failed to kill backend process tree (pid={pid})"))?;

        if !handle.wait_for_exit(FORCE_STOP_FOLLOWUP_WAIT).await {
            warn!(
                "Backend process still not reaped {}ms after its tree was killed (pid={pid})",
                FORCE_STOP_FOLLOWUP_WAIT.as_millis()
            );
        }
        Ok(())
    }

    async fn on_startup_timeout(self: Arc<Self>, generation: u64) {
        let handle = {
            let mut slot = self.lock_slot();
            let Some(process) = slot
                .process
                .as_mut()
                .filter(|process| process.generation == generation)
            else {
                return;
            };
            if process.ready || process.stopping {
                return;
            }
            // This task is the deadline; forget it so cleanup does not abort us midway
            process.startup_deadline = None;
            process.stopping = true;
            process.handle.clone()
        };

        let timeout_ms = self.config.startup_timeout_ms;
        error!("Backend did not become ready within {timeout_ms}ms, terminating it");
        match handle.pid {
            Some(pid) => {
                if let Err(error) = self.terminator.terminate_tree(pid, TermSignal::Kill).await {
                    error!("Failed to kill backend process tree (pid={pid}): {error:#}");
                    handle.force_kill();
                }
            }
            None => handle.force_kill(),
        }
        handle.wait_for_exit(FORCE_STOP_FOLLOWUP_WAIT).await;

        if self.cleanup(generation).is_some() {
            self.broadcaster.broadcast(BackendEvent::Error {
                error: format!("Backend startup timed out after {timeout_ms}ms"),
            });
        }
    }

    async fn relay_output<R>(
        self: Arc<Self>,
        generation: u64,
        stream: OutputStream,
        mut reader: R,
        mut detector: Option<ReadinessDetector>,
    ) where
        R: AsyncRead + Unpin,
    {
        let mut buffer = [0u8; 1024];
        let mut lines = LineBuffer::new();

        loop {
            let bytes_read = match reader.read(&mut buffer).await {
                Ok(0) => break,
                Ok(bytes_read) => bytes_read,
                Err(error) => {
                    warn!("Failed to read backend {stream:?}: {error}");
                    break;
                }
            };
            for line in lines.push(&buffer[..bytes_read]) {
                self.on_output(generation, stream, line, detector.as_mut());
            }
        }

        if let Some(line) = lines.finish() {
            self.on_output(generation, stream, line, detector.as_mut());
        }
    }

    fn on_output(
        &self,
        generation: u64,
        stream: OutputStream,
        line: String,
        detector: Option<&mut ReadinessDetector>,
    ) {
        trace!(target: BACKEND_TARGET, "[{stream:?}] {line}");
        if let Some(detector) = detector {
            if detector.observe(&line) && self.mark_ready(generation) {
                info!("Backend process is ready!");
                self.broadcaster.broadcast(BackendEvent::Ready {});
            }
        }

        self.broadcaster
            .broadcast(BackendEvent::Output { stream, data: line });
    }

    /// Owns the child until it exits, then reports the exit once its output was relayed.
    async fn monitor(
        self: Arc<Self>,
        generation: u64,
        mut child: Child,
        readers: Vec<JoinHandle<()>>,
        mut force_kill: mpsc::UnboundedReceiver<()>,
        exited: watch::Sender<bool>,
    ) {
        let pid = child.id();
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                Some(()) = force_kill.recv() => {
                    debug!("Killing backend process directly (pid={pid:?})");
                    if let Err(error) = child.start_kill() {
                        warn!("Failed to kill backend process (pid={pid:?}): {error}");
                    }
                }
            }
        };
        exited.send_replace(true);

        let drained = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, futures::future::join_all(readers));
        if drained.await.is_err() {
            debug!("Backend output streams still open after exit (pid={pid:?})");
        }

        match status {
            Ok(status) => {
                self.on_exit(generation, &status);
                self.on_close(generation);
            }
            Err(error) => self.on_error(generation, error.to_string()),
        }
    }

    fn on_exit(&self, generation: u64, status: &ExitStatus) {
        let code = status.code();
        let signal = exit_signal(status);
        info!("Backend process exited with code {code:?}, signal {signal:?}");

        let Some(process) = self.cleanup(generation) else {
            return;
        };
        if !process.stopping && !self.shutdown.is_shutting_down() && code != Some(0) {
            self.broadcaster
                .broadcast(BackendEvent::Crashed { code, signal });
        }
    }

    fn on_close(&self, generation: u64) {
        if self.cleanup(generation).is_some() {
            debug!("Backend process streams closed (generation={generation})");
        }
    }

    fn on_error(&self, generation: u64, error: String) {
        error!("Backend process error: {error}");
        self.cleanup(generation);
        self.broadcaster.broadcast(BackendEvent::Error { error });
    }
}

async fn request_quit(mut stdin: ChildStdin) -> std::io::Result<()> {
    stdin.write_all(QUIT_SENTINEL).await?;
    stdin.flush().await?;
    stdin.shutdown().await
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;

    status.signal().map(|signal| {
        nix::sys::signal::Signal::try_from(signal)
            .map(|signal| signal.as_str().to_string())
            .unwrap_or_else(|_| signal.to_string())
    })
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<String> {
    None
}
