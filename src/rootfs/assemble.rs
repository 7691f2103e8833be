use crate::config::{BlacklistItem, SandboxDescriptor, WhitelistItem};
use anyhow::{Context, Result};
use log::{debug, info};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BindFlags {
    pub read_only: bool,
    pub can_create: bool,
}

impl From<&WhitelistItem> for BindFlags {
    fn from(item: &WhitelistItem) -> Self {
        Self {
            read_only: item.read_only,
            can_create: item.can_create,
        }
    }
}

/// The mechanics of building the sandbox root. `assemble` decides what gets
/// called and in which order; implementors decide how.
pub trait FilesystemOps {
    fn setup_rootfs(&mut self, full_dev: bool) -> Result<()>;
    fn bind_path(&mut self, path: &Path, flags: BindFlags) -> Result<()>;
    fn blacklist_path(&mut self, path: &Path) -> Result<()>;
    /// Creates (if needed) and returns the display server's runtime
    /// directory for `profile`, outside the new root.
    fn display_dir(&mut self, profile: &str) -> Result<std::path::PathBuf>;
    fn chroot(&mut self) -> Result<()>;
    fn mount_full_dev(&mut self) -> Result<()>;
    fn mount_shm(&mut self) -> Result<()>;
    fn mount_tmp(&mut self) -> Result<()>;
    fn mount_pts(&mut self) -> Result<()>;
    fn mount_proc(&mut self) -> Result<()>;
    fn mount_sys(&mut self) -> Result<()>;
}

pub struct AssemblyPlan<'a> {
    pub profile_name: &'a str,
    pub whitelist: &'a [WhitelistItem],
    pub extra_whitelist: &'a [WhitelistItem],
    pub blacklist: &'a [BlacklistItem],
    pub display: bool,
    pub full_dev: bool,
    pub sys_proc: bool,
}

impl<'a> AssemblyPlan<'a> {
    pub fn from_descriptor(
        descriptor: &'a SandboxDescriptor,
        extra_whitelist: &'a [WhitelistItem],
    ) -> Self {
        Self {
            profile_name: &descriptor.profile.name,
            whitelist: &descriptor.profile.whitelist,
            extra_whitelist,
            blacklist: &descriptor.profile.blacklist,
            display: descriptor.display_enabled(),
            full_dev: descriptor.config.use_full_dev,
            sys_proc: !descriptor.profile.no_sys_proc,
        }
    }
}

/*
 * Whitelist before blacklist so a blacklist entry can mask something a
 * whitelist entry brought in. Every bind refers to pre-chroot paths, and
 * proc/sys/pts need the new root, so the chroot sits exactly between the
 * two halves.
 */
pub fn assemble<F: FilesystemOps>(
    ops: &mut F,
    plan: &AssemblyPlan,
) -> Result<()> {
    ops.setup_rootfs(plan.full_dev)
        .context("failed to set up root filesystem")?;

    bind_whitelist(ops, plan.whitelist)?;
    bind_whitelist(ops, plan.extra_whitelist)?;
    apply_blacklist(ops, plan.blacklist)?;

    if plan.display {
        let dir = ops
            .display_dir(plan.profile_name)
            .context("failed to create display server directory")?;
        ops.bind_path(
            &dir,
            BindFlags {
                read_only: false,
                can_create: false,
            },
        )
        .context(format!("failed to bind {}", dir.display()))?;
    }

    ops.chroot().context("failed to chroot into sandbox root")?;

    let mut mounts: Vec<(&str, fn(&mut F) -> Result<()>)> = Vec::new();
    if plan.full_dev {
        mounts.push(("/dev", F::mount_full_dev));
    }
    mounts.push(("/dev/shm", F::mount_shm));
    mounts.push(("/tmp", F::mount_tmp));
    mounts.push(("/dev/pts", F::mount_pts));
    if plan.sys_proc {
        mounts.push(("/proc", F::mount_proc));
        mounts.push(("/sys", F::mount_sys));
    }

    for (name, mount) in mounts {
        debug!("Mounting {}", name);
        mount(ops).context(format!("failed to mount {}", name))?;
    }

    info!("Sandbox filesystem assembled");
    Ok(())
}

fn bind_whitelist<F: FilesystemOps>(
    ops: &mut F,
    items: &[WhitelistItem],
) -> Result<()> {
    for item in items.iter().filter(|item| !item.path.is_empty()) {
        ops.bind_path(Path::new(&item.path), BindFlags::from(item))
            .context(format!("failed to bind whitelist entry {}", item.path))?;
    }
    Ok(())
}

fn apply_blacklist<F: FilesystemOps>(
    ops: &mut F,
    items: &[BlacklistItem],
) -> Result<()> {
    for item in items.iter().filter(|item| !item.path.is_empty()) {
        ops.blacklist_path(Path::new(&item.path))
            .context(format!("failed to apply blacklist entry {}", item.path))?;
    }
    Ok(())
}
