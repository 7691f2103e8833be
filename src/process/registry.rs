use log::{debug, warn};
use nix::{
    errno::Errno,
    sys::wait::{WaitPidFlag, WaitStatus, waitpid},
    unistd::Pid,
};
use std::{
    collections::HashMap,
    io,
    process::{Child, Command},
    sync::{Mutex, MutexGuard, PoisonError},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildProcess {
    pub pid: Pid,
    pub label: String,
}

/*
 * Every live child we started, keyed by pid. Spawning and reaping both
 * happen with the lock held: a child cannot be reaped before it has been
 * recorded, and the reaper cannot steal the status std waits for when an
 * exec fails.
 */
#[derive(Debug, Default)]
pub struct ChildRegistry {
    children: Mutex<HashMap<Pid, ChildProcess>>,
}

impl ChildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Pid, ChildProcess>> {
        self.children.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns `command` and records it under `label`. Nothing is recorded
    /// when the spawn fails.
    pub fn spawn(
        &self,
        label: &str,
        command: &mut Command,
    ) -> io::Result<Child> {
        let mut children = self.lock();
        let child = command.spawn()?;
        let pid = Pid::from_raw(child.id() as i32);
        record(&mut children, pid, label);
        debug!("Started {} (pid {})", label, pid);
        Ok(child)
    }

    pub fn snapshot(&self) -> Vec<ChildProcess> {
        let mut children: Vec<ChildProcess> =
            self.lock().values().cloned().collect();
        children.sort_by_key(|child| child.pid.as_raw());
        children
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Collects every exited child (or just `target`) without blocking,
    /// dropping each from the registry. Processes we never registered,
    /// such as orphans reparented to us, are reaped all the same.
    pub fn reap(&self, target: Option<Pid>) -> Vec<(Pid, WaitStatus)> {
        let mut children = self.lock();
        let wait_for = target.unwrap_or(Pid::from_raw(-1));
        let mut reaped = Vec::new();

        loop {
            match waitpid(wait_for, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => {
                    let Some(pid) = status.pid() else {
                        break;
                    };
                    match children.remove(&pid) {
                        Some(child) => log_exit(&child, &status),
                        None => debug!("Reaped unregistered process {}", pid),
                    }
                    reaped.push((pid, status));
                    if target.is_some() {
                        break;
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break,
                Err(e) => {
                    warn!("waitpid failed: {}", e);
                    break;
                }
            }
        }

        reaped
    }

    /// Runs `f` with reaping held off, for callers that need to wait on a
    /// child of their own.
    pub fn suspend_reaping<T>(&self, f: impl FnOnce() -> T) -> T {
        let _children = self.lock();
        f()
    }
}

/// Returns the entry it displaced. A displaced entry means a reap was
/// missed, since the kernel only reuses pids that have been waited for.
fn record(
    children: &mut HashMap<Pid, ChildProcess>,
    pid: Pid,
    label: &str,
) -> Option<ChildProcess> {
    let previous = children.insert(
        pid,
        ChildProcess {
            pid,
            label: label.to_string(),
        },
    );
    if let Some(previous) = &previous {
        warn!(
            "Replaced stale registry entry for {} ({})",
            pid, previous.label
        );
    }
    previous
}

fn log_exit(child: &ChildProcess, status: &WaitStatus) {
    match status {
        WaitStatus::Exited(pid, code) => debug!(
            "Child process {} ({}) exited with status {}",
            pid, child.label, code
        ),
        WaitStatus::Signaled(pid, signal, _) => debug!(
            "Child process {} ({}) killed by {}",
            pid, child.label, signal
        ),
        _ => debug!(
            "Child process {} ({}) changed state",
            child.pid, child.label
        ),
    }
}
