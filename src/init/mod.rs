mod shutdown;

pub use shutdown::*;

use crate::config::{SandboxDescriptor, decode_descriptor, validate_identity};
use crate::control::{CommandHandlers, ControlServer};
use crate::display::{
    DisplayServer, DisplaySettings, Readiness, ReadinessBarrier,
};
use crate::logger::InitLogger;
use crate::net::{log_interfaces, setup_network};
use crate::process::{
    ChildRegistry, LaunchEnv, Launcher, spawn_reaper, spawn_signal_watcher,
};
use crate::rootfs::{AssemblyPlan, ChrootFilesystem, assemble};
use crate::types::CredentialContext;
use anyhow::{Context, Result, anyhow};
use log::{info, warn};
use nix::unistd::{getpid, geteuid, sethostname};
use std::{
    io,
    sync::{Arc, Mutex},
};

const DOMAIN_NAME: &str = "local";
const MARKER_PATH: &str = "/tmp/sandbox-profile";

/// Refuses to do anything unless we are root and PID 1 of our namespace.
fn check_context() -> Result<()> {
    if !geteuid().is_root() {
        return Err(anyhow!("sandbox-init must be run as root"));
    }
    let pid = getpid();
    if pid.as_raw() != 1 {
        return Err(anyhow!(
            "sandbox-init must be the first process of a new pid namespace \
             (running as pid {})",
            pid
        ));
    }
    Ok(())
}

pub fn run(logger: &'static InitLogger) -> Result<()> {
    check_context()?;
    let descriptor = decode_descriptor(io::stdin().lock())?;
    validate_identity(&descriptor)?;
    InitSupervisor::new(descriptor).run(logger)
}

/// Owns everything the init sets up and walks the bootstrap sequence.
pub struct InitSupervisor {
    descriptor: SandboxDescriptor,
    credentials: CredentialContext,
    env: LaunchEnv,
    registry: Arc<ChildRegistry>,
}

impl InitSupervisor {
    pub fn new(descriptor: SandboxDescriptor) -> Self {
        let display = descriptor
            .display_enabled()
            .then_some(descriptor.display);
        Self {
            credentials: CredentialContext::from_descriptor(&descriptor),
            env: LaunchEnv::build(&descriptor.launch_env, display),
            registry: Arc::new(ChildRegistry::new()),
            descriptor,
        }
    }

    pub fn run(mut self, logger: &'static InitLogger) -> Result<()> {
        info!(
            "Starting sandbox-init for profile: {}",
            self.descriptor.profile.name
        );

        let control = Arc::new(ControlServer::bind(&self.descriptor.sockaddr)?);
        let (uid, gid) = (self.credentials.uid, self.credentials.gid);
        if let Err(e) = control.chown(uid, gid) {
            warn!("Failed to chown control socket: {:#}", e);
        }

        let mut filesystem = ChrootFilesystem::new(
            self.descriptor.config.root_dir.clone(),
            self.descriptor.user.clone(),
        );
        assemble(
            &mut filesystem,
            &AssemblyPlan::from_descriptor(&self.descriptor, &[]),
        )
        .context("failed to set up filesystem")?;

        self.env.push_home(&self.descriptor.user.home_dir);

        if !self.descriptor.host_network() {
            setup_network(
                self.descriptor.profile.networking.nettype,
                &self.descriptor.network,
            )
            .context("unable to set up networking")?;
        }
        log_interfaces();

        self.set_hostname();

        spawn_reaper(self.registry.clone())?;

        let display = Arc::new(Mutex::new(self.start_display()));

        write_marker(&self.descriptor.profile.name);

        logger
            .handshake()
            .context("failed to report readiness")?;

        let shutdown =
            Shutdown::new(self.registry.clone(), display, control.clone());
        spawn_signal_watcher(move |_| shutdown.run())?;

        let launcher = Launcher::new(
            self.registry,
            self.credentials,
            self.env,
            self.descriptor.profile,
            self.descriptor.config,
        );
        let handlers = Arc::new(CommandHandlers::new(Arc::new(launcher)));
        if let Err(e) = control.serve(handlers) {
            warn!("Control channel stopped with error: {:#}", e);
        }

        info!("sandbox-init exiting...");
        Ok(())
    }

    fn set_hostname(&self) {
        let name = &self.descriptor.profile.name;
        if let Err(e) = sethostname(name) {
            warn!("Failed to set hostname to ({}): {}", name, e);
        }
        // SAFETY: the pointer and length describe a live byte slice.
        let ret = unsafe {
            libc::setdomainname(DOMAIN_NAME.as_ptr().cast(), DOMAIN_NAME.len())
        };
        if ret < 0 {
            warn!(
                "Failed to set domain name: {}",
                io::Error::last_os_error()
            );
        }
        info!("Hostname set to ({}.{})", name, DOMAIN_NAME);
    }

    /// Starts xpra when the profile wants X and blocks until it is ready
    /// or has failed. A failed display server does not stop the sandbox.
    fn start_display(&self) -> Option<DisplayServer> {
        if !self.descriptor.display_enabled() {
            return None;
        }

        let barrier = Arc::new(ReadinessBarrier::new());
        let server = DisplayServer::start(
            DisplaySettings::from_descriptor(&self.descriptor),
            self.registry.clone(),
            self.credentials.clone(),
            barrier.clone(),
        );
        match barrier.wait() {
            Readiness::Ready => info!("xpra started"),
            Readiness::Failed => warn!("xpra server did not become ready"),
        }
        Some(server)
    }
}

fn write_marker(profile: &str) {
    if let Err(e) = std::fs::write(MARKER_PATH, profile) {
        warn!("Failed to write {}: {}", MARKER_PATH, e);
    }
}
