use super::{ChildRegistry, LaunchEnv, spawn_line_logger};
use crate::config::{DaemonConfig, Profile, SeccompMode};
use crate::types::{
    CredentialContext, PeerCredentials, SpawnCredentials, SpawnRole,
};
use crate::util::drop_privileges;
use anyhow::{Context, Result, anyhow};
use log::{info, warn};
use nix::{
    fcntl::OFlag,
    pty::{grantpt, posix_openpt, ptsname_r, unlockpt},
    unistd::{Pid, setsid},
};
use std::{
    fs::OpenOptions,
    io,
    os::{
        fd::{FromRawFd, IntoRawFd, OwnedFd},
        unix::{fs::OpenOptionsExt, process::CommandExt},
    },
    path::PathBuf,
    process::{Command, Stdio},
    sync::Arc,
};

const SECCOMP_WRAPPER: &str = "bin/sandbox-seccomp";
const SECCOMP_PROFILE_VAR: &str = "SANDBOX_PROFILE";

/// What actually gets exec'd for a RunProgram request once the profile
/// defaults, divert suffix and seccomp wrapper are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub extra_env: Vec<(String, String)>,
}

pub fn resolve_invocation(
    profile: &Profile,
    config: &DaemonConfig,
    path: &str,
    args: &[String],
) -> Result<Invocation> {
    let mut program = if path.is_empty() {
        profile.path.clone()
    } else {
        path.to_string()
    };
    if program.is_empty() {
        return Err(anyhow!(
            "No program given and profile {} has no default path",
            profile.name
        ));
    }
    if !config.divert_suffix.is_empty() {
        program = format!("{}.{}", program, config.divert_suffix);
    }

    if profile.seccomp.mode == SeccompMode::Whitelist {
        info!("Enabling seccomp whitelist for: {}", program);
        let mut wrapped = vec!["-w".to_string(), program];
        wrapped.extend(args.iter().cloned());
        return Ok(Invocation {
            program: config.prefix_path.join(SECCOMP_WRAPPER),
            args: wrapped,
            extra_env: vec![(
                SECCOMP_PROFILE_VAR.to_string(),
                profile.name.clone(),
            )],
        });
    }

    Ok(Invocation {
        program: PathBuf::from(program),
        args: args.to_vec(),
        extra_env: Vec::new(),
    })
}

/// Allocates a pty pair. Both ends are close-on-exec from the moment they
/// exist: a spawn racing on another thread must not inherit either side.
fn open_pty() -> Result<(OwnedFd, OwnedFd)> {
    let master =
        posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC)
            .context("failed to open pty master")?;
    grantpt(&master).context("failed to grant pty")?;
    unlockpt(&master).context("failed to unlock pty")?;
    let slave_name = ptsname_r(&master).context("failed to name pty")?;

    // std opens files with O_CLOEXEC
    let slave = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY)
        .open(&slave_name)
        .context(format!("failed to open {}", slave_name))?;

    // SAFETY: into_raw_fd gives up the PtyMaster's ownership of the fd.
    let master = unsafe { OwnedFd::from_raw_fd(master.into_raw_fd()) };
    Ok((master, OwnedFd::from(slave)))
}

/// Drops to `creds` in the child between fork and exec.
pub fn with_credentials(command: &mut Command, creds: SpawnCredentials) {
    // SAFETY: drop_privileges only issues setgroups/setgid/setuid, which
    // are async-signal-safe.
    unsafe {
        command.pre_exec(move || {
            drop_privileges(&creds).map_err(io::Error::from)
        });
    }
}

/// Starts programs and shells inside the sandbox on behalf of the control
/// channel.
pub struct Launcher {
    registry: Arc<ChildRegistry>,
    credentials: CredentialContext,
    env: LaunchEnv,
    profile: Profile,
    config: DaemonConfig,
}

impl Launcher {
    pub fn new(
        registry: Arc<ChildRegistry>,
        credentials: CredentialContext,
        env: LaunchEnv,
        profile: Profile,
        config: DaemonConfig,
    ) -> Self {
        Self {
            registry,
            credentials,
            env,
            profile,
            config,
        }
    }

    pub fn launch(
        &self,
        path: &str,
        pwd: &str,
        args: &[String],
    ) -> Result<Pid> {
        let invocation =
            resolve_invocation(&self.profile, &self.config, path, args)?;

        let mut command = Command::new(&invocation.program);
        command.args(&invocation.args);
        self.env.apply(&mut command);
        command.envs(invocation.extra_env.iter().map(|(k, v)| (k, v)));

        let dir = if pwd.is_empty() {
            self.credentials.home.clone()
        } else {
            PathBuf::from(pwd)
        };
        if !dir.as_os_str().is_empty() && dir.exists() {
            command.current_dir(&dir);
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        with_credentials(
            &mut command,
            self.credentials.spawn_credentials(SpawnRole::Application),
        );

        let label = invocation.program.display().to_string();
        let mut child = self.registry.spawn(&label, &mut command).map_err(|e| {
            warn!("Failed to start application ({}): {}", label, e);
            anyhow!(e).context(format!("failed to start {}", label))
        })?;

        if let Some(stdout) = child.stdout.take() {
            spawn_line_logger(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_logger(stderr, "stderr");
        }

        Ok(Pid::from_raw(child.id() as i32))
    }

    /// Starts an interactive shell on a fresh pty as the requesting peer
    /// and hands back the master side.
    pub fn launch_shell(
        &self,
        term: &str,
        peer: &PeerCredentials,
    ) -> Result<OwnedFd> {
        let privileged = peer.is_root_equivalent();
        if privileged && !self.config.allow_root_shell {
            return Err(anyhow!(
                "Cannot open shell because allow_root_shell is disabled"
            ));
        }
        info!("Starting shell with uid = {}, gid = {}", peer.uid, peer.gid);

        let mut command = Command::new(&self.config.shell_path);
        command.arg("-i");
        self.env.apply(&mut command);
        if !term.is_empty() {
            command.env("TERM", term);
        }
        command.env("PS1", format!("[{}] $ ", self.profile.name));
        let home = &self.credentials.home;
        if !privileged && !home.as_os_str().is_empty() && home.exists() {
            command.current_dir(home);
        }

        let (master, slave) = open_pty()?;
        command
            .stdin(Stdio::from(slave.try_clone()?))
            .stdout(Stdio::from(slave.try_clone()?))
            .stderr(Stdio::from(slave));

        let creds = self.credentials.spawn_credentials(SpawnRole::Shell(peer));
        // SAFETY: setsid, ioctl and the set*id calls are async-signal-safe.
        unsafe {
            command.pre_exec(move || {
                setsid()?;
                if libc::ioctl(0, libc::TIOCSCTTY as _, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
                drop_privileges(&creds)?;
                Ok(())
            });
        }

        info!("Executing shell...");
        self.registry.spawn("shell", &mut command).context(format!(
            "failed to start {}",
            self.config.shell_path.display()
        ))?;
        // Our copies of the slave side live in the Command
        drop(command);

        Ok(master)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxDescriptor;
    use crate::config::decode::fixtures::descriptor;
    use nix::fcntl::{FcntlArg, FdFlag, fcntl};
    use nix::unistd::{Gid, Uid};
    use std::{
        os::fd::AsRawFd,
        path::Path,
        sync::atomic::{AtomicBool, Ordering},
        thread,
    };

    fn launcher() -> (Launcher, Arc<ChildRegistry>) {
        let descriptor = descriptor();
        let registry = Arc::new(ChildRegistry::new());
        let launcher = Launcher::new(
            registry.clone(),
            CredentialContext::from_descriptor(&descriptor),
            LaunchEnv::build(&descriptor.launch_env, None),
            descriptor.profile.clone(),
            descriptor.config.clone(),
        );
        (launcher, registry)
    }

    fn args(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    fn resolve(
        descriptor: &SandboxDescriptor,
        path: &str,
        args: &[String],
    ) -> Result<Invocation> {
        resolve_invocation(&descriptor.profile, &descriptor.config, path, args)
    }

    #[test]
    fn test_resolve_default_path() {
        let descriptor = descriptor();
        let invocation = resolve(&descriptor, "", &args(&["-x"])).unwrap();
        assert_eq!(invocation.program, Path::new("/usr/bin/true"));
        assert_eq!(invocation.args, args(&["-x"]));
        assert!(invocation.extra_env.is_empty());
    }

    #[test]
    fn test_resolve_divert_suffix() {
        let mut descriptor = descriptor();
        descriptor.config.divert_suffix = "unsafe".to_string();
        let invocation = resolve(&descriptor, "/usr/bin/app", &[]).unwrap();
        assert_eq!(invocation.program, Path::new("/usr/bin/app.unsafe"));
    }

    #[test]
    fn test_resolve_seccomp_whitelist() {
        let mut descriptor = descriptor();
        descriptor.profile.seccomp.mode = SeccompMode::Whitelist;
        descriptor.config.divert_suffix = "real".to_string();
        let invocation =
            resolve(&descriptor, "/usr/bin/app", &args(&["--flag", "file"]))
                .unwrap();
        assert_eq!(
            invocation.program,
            Path::new("/usr/local/bin/sandbox-seccomp")
        );
        assert_eq!(
            invocation.args,
            args(&["-w", "/usr/bin/app.real", "--flag", "file"])
        );
        assert_eq!(
            invocation.extra_env,
            vec![("SANDBOX_PROFILE".to_string(), "testing".to_string())]
        );
    }

    #[test]
    fn test_resolve_blacklist_mode_is_not_wrapped() {
        let mut descriptor = descriptor();
        descriptor.profile.seccomp.mode = SeccompMode::Blacklist;
        let invocation = resolve(&descriptor, "/bin/ls", &[]).unwrap();
        assert_eq!(invocation.program, Path::new("/bin/ls"));
    }

    #[test]
    fn test_resolve_without_any_path() {
        let mut descriptor = descriptor();
        descriptor.profile.path.clear();
        assert!(resolve(&descriptor, "", &[]).is_err());
    }

    #[test]
    fn test_launch_missing_program_registers_nothing() {
        let (launcher, registry) = launcher();
        let err = launcher
            .launch("/sandbox-init/no/such/program", "", &[])
            .unwrap_err();
        assert!(format!("{:#}", err).contains("/sandbox-init/no/such/program"));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_root_shell_refused_by_default() {
        let (launcher, registry) = launcher();
        for (uid, gid) in [(0, 0), (0, 1000), (1000, 0)] {
            let peer = PeerCredentials {
                pid: 1,
                uid: Uid::from_raw(uid),
                gid: Gid::from_raw(gid),
            };
            let err = launcher.launch_shell("xterm", &peer).unwrap_err();
            assert!(err.to_string().contains("allow_root_shell"));
        }
        assert_eq!(registry.len(), 0);
    }

    fn is_cloexec(fd: &OwnedFd) -> bool {
        let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFD).unwrap();
        FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC)
    }

    #[test]
    fn test_pty_ends_are_close_on_exec() {
        let (master, slave) = open_pty().unwrap();
        assert!(is_cloexec(&master));
        assert!(is_cloexec(&slave));
        assert_eq!(unsafe { libc::isatty(slave.as_raw_fd()) }, 1);
    }

    #[test]
    fn test_spawn_during_pty_allocation_inherits_no_pty() {
        let done = Arc::new(AtomicBool::new(false));
        let allocator = {
            let done = done.clone();
            thread::spawn(move || {
                while !done.load(Ordering::SeqCst) {
                    let _pair = open_pty().unwrap();
                }
            })
        };

        for _ in 0..300 {
            let output = Command::new("/bin/sh")
                .args(["-c", "ls -l /proc/$$/fd"])
                .output()
                .unwrap();
            let listing = String::from_utf8_lossy(&output.stdout);
            assert!(
                !listing.contains("ptmx") && !listing.contains("/dev/pts/"),
                "child inherited a pty: {}",
                listing
            );
        }

        done.store(true, Ordering::SeqCst);
        allocator.join().unwrap();
    }
}
