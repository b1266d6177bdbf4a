use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use super::enumerate::{ChildLister, SignalError, Signaller};
use super::TermSignal;
use crate::prelude::*;

/// Lists children by scanning `/proc`.
#[cfg(target_os = "linux")]
pub struct ProcfsChildLister;

#[cfg(target_os = "linux")]
#[async_trait]
impl ChildLister for ProcfsChildLister {
    async fn list_children(&self, parent: u32) -> Result<Vec<u32>> {
        tokio::task::spawn_blocking(move || procfs_children(parent)).await?
    }
}

#[cfg(target_os = "linux")]
fn procfs_children(parent: u32) -> Result<Vec<u32>> {
    let parent = i32::try_from(parent).context("Invalid pid")?;
    let processes = procfs::process::all_processes().context("Failed to read /proc")?;

    let children = processes
        // Processes may exit while the table is being read
        .filter_map(|process| process.ok()?.stat().ok())
        .filter(|stat| stat.ppid == parent)
        .filter_map(|stat| u32::try_from(stat.pid).ok())
        .collect();
    Ok(children)
}

/// Lists children with `pgrep -P`.
pub struct PgrepChildLister;

#[async_trait]
impl ChildLister for PgrepChildLister {
    async fn list_children(&self, parent: u32) -> Result<Vec<u32>> {
        let output = tokio::process::Command::new("pgrep")
            .arg("-P")
            .arg(parent.to_string())
            .output()
            .await
            .context("Failed to run pgrep")?;

        // pgrep exits with 1 when no process matched
        match output.status.code() {
            Some(0) | Some(1) => Ok(parse_pids(&String::from_utf8_lossy(&output.stdout))),
            code => bail!(
                "pgrep exited with {code:?}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        }
    }
}

/// Extract every numeric pid of a child-listing output, ignoring anything else.
pub fn parse_pids(output: &str) -> Vec<u32> {
    output
        .split_whitespace()
        .filter_map(|token| token.parse().ok())
        .collect()
}

pub struct NixSignaller;

impl Signaller for NixSignaller {
    fn signal(&self, pid: u32, signal: TermSignal) -> Result<(), SignalError> {
        let raw_pid = i32::try_from(pid).map_err(|_| SignalError::Other {
            pid,
            reason: "pid out of range".to_string(),
        })?;
        let signal = match signal {
            TermSignal::Term => Signal::SIGTERM,
            TermSignal::Kill => Signal::SIGKILL,
        };

        match kill(Pid::from_raw(raw_pid), signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(SignalError::NoSuchProcess(pid)),
            Err(errno) => Err(SignalError::Other {
                pid,
                reason: errno.desc().to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_tree::{EnumeratingTerminator, TreeTerminator};
    use std::time::Duration;

    #[cfg(target_os = "linux")]
    fn system_lister() -> impl ChildLister {
        ProcfsChildLister
    }

    #[cfg(not(target_os = "linux"))]
    fn system_lister() -> impl ChildLister {
        PgrepChildLister
    }

    #[test]
    fn parse_pids_skips_noise() {
        assert_eq!(parse_pids("  123\n456\n\nnot-a-pid 789\n"), vec![123, 456, 789]);
        assert!(parse_pids("").is_empty());
    }

    #[test]
    fn signaling_a_reaped_process_is_no_such_process() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        assert_eq!(
            NixSignaller.signal(pid, TermSignal::Term),
            Err(SignalError::NoSuchProcess(pid))
        );
    }

    #[test_log::test(tokio::test)]
    async fn kills_a_shell_and_its_children() {
        let mut shell = tokio::process::Command::new("/bin/sh")
            .args(["-c", "sleep 30 & sleep 30 & wait"])
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = shell.id().unwrap();

        let terminator = crate::process_tree::platform_terminator();
        // Give the shell time to fork its children
        tokio::time::sleep(Duration::from_millis(300)).await;
        let children = system_lister().list_children(pid).await.unwrap();
        assert_eq!(children.len(), 2);

        terminator.terminate_tree(pid, TermSignal::Kill).await.unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), shell.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
        tokio::time::sleep(Duration::from_millis(100)).await;
        for child in children {
            // Orphans may linger as zombies until reaped by init, but never keep running
            let still_running = std::fs::read_to_string(format!("/proc/{child}/stat"))
                .map(|stat| !stat.contains(") Z "))
                .unwrap_or(false);
            assert!(!still_running, "child {child} survived");
        }
    }

    #[test_log::test(tokio::test)]
    async fn discovers_grandchildren() {
        let mut shell = tokio::process::Command::new("/bin/sh")
            .args(["-c", "/bin/sh -c 'sleep 30 & wait' & wait"])
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = shell.id().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let terminator = EnumeratingTerminator::new(system_lister(), NixSignaller);

        let tree = terminator.discover(pid).await;
        let order = tree.termination_order();
        assert_eq!(order.len(), 3, "unexpected tree {tree:?}");
        assert_eq!(order.last(), Some(&pid));

        terminator.terminate_tree(pid, TermSignal::Kill).await.unwrap();
        shell.wait().await.unwrap();
    }
}
