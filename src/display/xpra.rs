use super::{Readiness, ReadinessBarrier};
use crate::config::SandboxDescriptor;
use crate::process::{ChildRegistry, for_each_line, with_credentials};
use crate::types::{CredentialContext, SpawnRole};
use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};
use nix::unistd::Pid;
use std::{
    io::Read,
    ops::ControlFlow,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::Arc,
    thread,
};

const READY_LINE: &str = "xpra is ready.";
const WORK_DIR: &str = ".Xsandbox";

/// Per-profile xpra socket and log directory under the user's home.
pub fn work_dir(home: &Path, profile: &str) -> PathBuf {
    home.join(WORK_DIR).join(profile)
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplaySettings {
    pub xpra_path: PathBuf,
    pub display: u32,
    pub work_dir: PathBuf,
    pub home: PathBuf,
    pub audio: bool,
    pub notifications: bool,
    pub clipboard: bool,
    pub log_output: bool,
}

impl DisplaySettings {
    pub fn from_descriptor(descriptor: &SandboxDescriptor) -> Self {
        let xserver = &descriptor.profile.xserver;
        Self {
            xpra_path: descriptor.config.xpra_path.clone(),
            display: descriptor.display,
            work_dir: work_dir(
                &descriptor.user.home_dir,
                &descriptor.profile.name,
            ),
            home: descriptor.user.home_dir.clone(),
            audio: descriptor.audio_enabled(),
            notifications: xserver.enable_notifications,
            clipboard: !xserver.disable_clipboard,
            log_output: descriptor.config.log_display,
        }
    }

    fn display_name(&self) -> String {
        format!(":{}", self.display)
    }

    pub fn start_args(&self) -> Vec<String> {
        vec![
            "start".to_string(),
            self.display_name(),
            "--no-daemon".to_string(),
            format!("--socket-dir={}", self.work_dir.display()),
            format!("--log-dir={}", self.work_dir.display()),
            "--mdns=no".to_string(),
            format!("--pulseaudio={}", yes_no(self.audio)),
            format!("--notifications={}", yes_no(self.notifications)),
            format!("--clipboard={}", yes_no(self.clipboard)),
        ]
    }

    pub fn stop_args(&self) -> Vec<String> {
        vec![
            "stop".to_string(),
            self.display_name(),
            format!("--socket-dir={}", self.work_dir.display()),
        ]
    }

    fn command(&self, args: Vec<String>) -> Command {
        let mut command = Command::new(&self.xpra_path);
        command
            .args(args)
            .env_clear()
            .env("HOME", &self.home)
            .stdin(Stdio::null());
        command
    }
}

/// Scans xpra's stderr for the ready line. Without `log_output` we stop
/// reading as soon as it shows up; with it every line is logged.
pub fn watch_output<R: Read>(
    reader: R,
    barrier: &ReadinessBarrier,
    log_output: bool,
) {
    let mut seen_ready = false;
    for_each_line(reader, |line| {
        if !seen_ready && line.contains(READY_LINE) {
            seen_ready = true;
            barrier.release(Readiness::Ready);
            if !log_output {
                return ControlFlow::Break(());
            }
        }
        if log_output {
            debug!("(xpra) {}", line);
        }
        ControlFlow::Continue(())
    });

    if !seen_ready {
        warn!("xpra output ended before it became ready");
        barrier.release(Readiness::Failed);
    }
}

pub struct DisplayServer {
    settings: DisplaySettings,
    pid: Option<Pid>,
    registry: Arc<ChildRegistry>,
    credentials: CredentialContext,
}

impl DisplayServer {
    /// Starts xpra. The barrier is always released eventually: Ready when
    /// xpra says so, Failed if it cannot start or its output ends first.
    pub fn start(
        settings: DisplaySettings,
        registry: Arc<ChildRegistry>,
        credentials: CredentialContext,
        barrier: Arc<ReadinessBarrier>,
    ) -> Self {
        info!("xpra work dir is {}", settings.work_dir.display());

        let mut command = settings.command(settings.start_args());
        command.stdout(Stdio::null()).stderr(Stdio::piped());
        with_credentials(
            &mut command,
            credentials.spawn_credentials(SpawnRole::Display {
                audio: settings.audio,
            }),
        );

        info!("Starting xpra server");
        // Not recorded in the registry: shutdown interrupts every recorded
        // child, and the server has to be alive for `xpra stop`. Reaping is
        // held off so the reaper cannot race std on a failed exec.
        let pid = match registry.suspend_reaping(|| command.spawn()) {
            Ok(mut child) => {
                let pid = Pid::from_raw(child.id() as i32);
                let log_output = settings.log_output;
                match child.stderr.take() {
                    Some(stderr) => {
                        watch_in_background(stderr, barrier, log_output)
                    }
                    None => {
                        barrier.release(Readiness::Failed);
                    }
                }
                Some(pid)
            }
            Err(e) => {
                warn!("Failed to start xpra server: {}", e);
                barrier.release(Readiness::Failed);
                None
            }
        };

        Self {
            settings,
            pid,
            registry,
            credentials,
        }
    }

    /// Asks the server to shut down with `xpra stop`, logging its output.
    pub fn stop(&self) -> Result<()> {
        if self.pid.is_none() {
            return Ok(());
        }

        let mut command = self.settings.command(self.settings.stop_args());
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        with_credentials(
            &mut command,
            self.credentials.spawn_credentials(SpawnRole::DisplayControl),
        );

        // The reaper would otherwise collect `xpra stop` before std can.
        let output = self
            .registry
            .suspend_reaping(|| command.output())
            .context("failed to run xpra stop")?;

        for stream in [&output.stdout, &output.stderr] {
            for line in String::from_utf8_lossy(stream).lines() {
                if !line.trim().is_empty() {
                    debug!("(xpra stop) {}", line);
                }
            }
        }

        if !output.status.success() {
            return Err(anyhow!("xpra stop exited with {}", output.status));
        }
        Ok(())
    }
}

fn watch_in_background<R>(
    reader: R,
    barrier: Arc<ReadinessBarrier>,
    log_output: bool,
) where
    R: Read + Send + 'static,
{
    let thread_barrier = barrier.clone();
    let spawned = thread::Builder::new()
        .name("xpra-output".to_string())
        .spawn(move || watch_output(reader, &thread_barrier, log_output));
    if let Err(e) = spawned {
        warn!("Failed to start xpra output reader: {}", e);
        barrier.release(Readiness::Failed);
    }
}
