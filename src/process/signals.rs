use super::ChildRegistry;
use anyhow::{Context, Result};
use log::{info, trace, warn};
use nix::sys::signal::{SigSet, Signal};
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

fn reap_set() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGCHLD);
    set
}

fn shutdown_set() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGTERM);
    set.add(Signal::SIGINT);
    set
}

/*
 * Must run on the main thread before any other thread exists. Threads
 * inherit the mask, so the signals stay pending until one of the two
 * dedicated threads below sigwaits for them. Children get a clean mask
 * from std at exec.
 */
pub fn block_signals() -> Result<()> {
    let mut set = shutdown_set();
    set.add(Signal::SIGCHLD);
    set.thread_block().context("failed to block signals")
}

pub fn spawn_reaper(registry: Arc<ChildRegistry>) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("reaper".to_string())
        .spawn(move || {
            let set = reap_set();
            loop {
                match set.wait() {
                    Ok(_) => {
                        let reaped = registry.reap(None);
                        trace!(
                            "Reaped {} process(es), {} still registered",
                            reaped.len(),
                            registry.len()
                        );
                    }
                    Err(e) => warn!("sigwait failed: {}", e),
                }
            }
        })
        .context("failed to start reaper thread")
}

/// Calls `on_signal` for every SIGTERM/SIGINT delivered to us.
pub fn spawn_signal_watcher<F>(on_signal: F) -> Result<JoinHandle<()>>
where
    F: Fn(Signal) + Send + 'static,
{
    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            let set = shutdown_set();
            loop {
                match set.wait() {
                    Ok(signal) => {
                        info!("Received signal ({})", signal);
                        on_signal(signal);
                    }
                    Err(e) => warn!("sigwait failed: {}", e),
                }
            }
        })
        .context("failed to start signal watcher thread")
}
