use clap::Args;

use crate::prelude::*;
use crate::process_tree::{TermSignal, platform_terminator};

#[derive(Args, Debug)]
pub struct KillTreeArgs {
    /// Pid of the root process
    pub pid: u32,

    #[arg(long, value_enum, default_value_t)]
    pub signal: TermSignal,
}

pub async fn run(args: KillTreeArgs) -> Result<()> {
    info!("Terminating process {} and its descendants", args.pid);
    platform_terminator()
        .terminate_tree(args.pid, args.signal)
        .await
        .with_context(|| format!("Failed to terminate the process tree of {}", args.pid))?;
    info!("Process tree of {} terminated", args.pid);
    Ok(())
}
