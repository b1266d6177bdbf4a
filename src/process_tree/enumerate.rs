use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};

use super::{ProcessTree, TermSignal, TreeTerminator};
use crate::prelude::*;

/// Lists the direct children of a process.
#[async_trait]
pub trait ChildLister: Send + Sync {
    async fn list_children(&self, parent: u32) -> Result<Vec<u32>>;
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SignalError {
    #[error("No such process: {0}")]
    NoSuchProcess(u32),
    #[error("Failed to signal process {pid}: {reason}")]
    Other { pid: u32, reason: String },
}

/// Sends a signal to a single process.
pub trait Signaller: Send + Sync {
    fn signal(&self, pid: u32, signal: TermSignal) -> Result<(), SignalError>;
}

/// Terminates a tree on platforms without a recursive kill utility.
///
/// The whole tree is discovered before anything is signaled: killing a parent while its
/// children are still being listed would reparent them and leak them.
pub struct EnumeratingTerminator<L, S> {
    lister: L,
    signaller: S,
}

impl<L: ChildLister, S: Signaller> EnumeratingTerminator<L, S> {
    pub fn new(lister: L, signaller: S) -> Self {
        Self { lister, signaller }
    }

    async fn list(&self, parent: u32) -> (u32, Vec<u32>) {
        match self.lister.list_children(parent).await {
            Ok(children) => (parent, children),
            Err(error) => {
                // Usually means the process exited meanwhile; treat it as a leaf
                debug!("Could not list children of {parent}: {error:#}");
                (parent, Vec::new())
            }
        }
    }

    /// Discover the tree rooted at `root`, listing siblings concurrently.
    pub async fn discover(&self, root: u32) -> ProcessTree {
        let mut tree = ProcessTree::new(root);
        let mut outstanding = FuturesUnordered::new();
        outstanding.push(self.list(root));

        while let Some((parent, children)) = outstanding.next().await {
            let mut new_children = Vec::with_capacity(children.len());
            for child in children {
                if child == 0 || tree.contains(child) || new_children.contains(&child) {
                    continue;
                }
                outstanding.push(self.list(child));
                new_children.push(child);
            }
            tree.add_children(parent, new_children);
        }

        tree
    }
}

#[async_trait]
impl<L: ChildLister, S: Signaller> TreeTerminator for EnumeratingTerminator<L, S> {
    async fn terminate_tree(&self, root_pid: u32, signal: TermSignal) -> Result<()> {
        // pid 0 would signal our own process group
        ensure!(root_pid != 0, "Refusing to terminate the tree of pid 0");

        let tree = self.discover(root_pid).await;
        let order = tree.termination_order();
        debug!("Terminating process tree of {root_pid} ({} processes)", order.len());

        let mut failures = Vec::new();
        for pid in order {
            match self.signaller.signal(pid, signal) {
                Ok(()) => trace!("Sent {signal:?} to {pid}"),
                Err(SignalError::NoSuchProcess(pid)) => trace!("Process {pid} already exited"),
                Err(error) => failures.push(error.to_string()),
            }
        }

        if !failures.is_empty() {
            bail!(
                "Failed to terminate the process tree of {root_pid}: {}",
                failures.join("; ")
            );
        }
        Ok(())
    }
}
