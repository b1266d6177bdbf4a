use std::process::Stdio;

use async_trait::async_trait;

use super::{TermSignal, TreeTerminator};
use crate::prelude::*;

const WINDOWS_CREATE_NO_WINDOW: u32 = 0x0800_0000;
/// Exit code of taskkill when the pid does not exist anymore
const TASKKILL_NOT_FOUND_EXIT_CODE: i32 = 128;

/// Delegates the whole tree kill to `taskkill /T /F`.
///
/// taskkill always terminates forcefully, whatever signal was requested.
pub struct TaskkillTerminator;

#[async_trait]
impl TreeTerminator for TaskkillTerminator {
    async fn terminate_tree(&self, root_pid: u32, signal: TermSignal) -> Result<()> {
        debug!("Running taskkill on the tree of {root_pid} (requested {signal:?})");
        let output = tokio::process::Command::new("taskkill")
            .args(["/pid", &root_pid.to_string(), "/T", "/F"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            // Avoid flashing a console window
            .creation_flags(WINDOWS_CREATE_NO_WINDOW)
            .output()
            .await
            .context("Failed to run taskkill")?;

        match output.status.code() {
            Some(0) => Ok(()),
            Some(TASKKILL_NOT_FOUND_EXIT_CODE) => {
                trace!("Process {root_pid} already exited");
                Ok(())
            }
            code => bail!(
                "taskkill exited with {code:?}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        }
    }
}
