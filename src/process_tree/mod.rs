//! Termination of a process together with all of its descendants.

mod enumerate;
#[cfg(target_os = "windows")]
mod taskkill;
#[cfg(unix)]
mod unix;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use crate::prelude::*;

pub use enumerate::{ChildLister, EnumeratingTerminator, SignalError, Signaller};
#[cfg(target_os = "windows")]
pub use taskkill::TaskkillTerminator;
#[cfg(target_os = "linux")]
pub use unix::ProcfsChildLister;
#[cfg(unix)]
pub use unix::{NixSignaller, PgrepChildLister};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum TermSignal {
    /// Polite request to exit (SIGTERM)
    Term,
    /// Forceful kill (SIGKILL)
    #[default]
    Kill,
}

/// Kills a process and every process it (transitively) spawned.
#[async_trait]
pub trait TreeTerminator: Send + Sync {
    /// Resolves once every discovered process of the tree has been signaled.
    ///
    /// Processes that are already gone are not an error.
    async fn terminate_tree(&self, root_pid: u32, signal: TermSignal) -> Result<()>;
}

/// The terminator suited to the current platform.
pub fn platform_terminator() -> Arc<dyn TreeTerminator> {
    #[cfg(target_os = "windows")]
    {
        Arc::new(TaskkillTerminator)
    }
    #[cfg(target_os = "linux")]
    {
        Arc::new(EnumeratingTerminator::new(ProcfsChildLister, NixSignaller))
    }
    #[cfg(all(unix, not(target_os = "linux")))]
    {
        Arc::new(EnumeratingTerminator::new(PgrepChildLister, NixSignaller))
    }
}

/// Parent to children relationships discovered below a root process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessTree {
    root: u32,
    children: HashMap<u32, Vec<u32>>,
}

impl ProcessTree {
    pub fn new(root: u32) -> Self {
        Self {
            root,
            children: HashMap::new(),
        }
    }

    pub fn root(&self) -> u32 {
        self.root
    }

    /// Register the children listed for `parent`.
    pub fn add_children(&mut self, parent: u32, children: Vec<u32>) {
        self.children.entry(parent).or_default().extend(children);
    }

    pub fn contains(&self, pid: u32) -> bool {
        pid == self.root || self.children.values().flatten().any(|&child| child == pid)
    }

    pub fn children_of(&self, pid: u32) -> &[u32] {
        self.children.get(&pid).map(Vec::as_slice).unwrap_or_default()
    }

    /// Every pid of the tree, each child before its parent and the root last.
    ///
    /// A pid reachable through several parents (pid reuse during enumeration) is only listed
    /// once.
    pub fn termination_order(&self) -> Vec<u32> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        // (pid, children already pushed)
        let mut stack = vec![(self.root, false)];

        while let Some((pid, expanded)) = stack.pop() {
            if expanded {
                order.push(pid);
                continue;
            }
            if !visited.insert(pid) {
                continue;
            }
            stack.push((pid, true));
            for &child in self.children_of(pid).iter().rev() {
                if !visited.contains(&child) {
                    stack.push((child, false));
                }
            }
        }

        order
    }
}
