use super::{BindFlags, FilesystemOps};
use crate::config::UserRecord;
use crate::display::work_dir;
use crate::util::{bind_mount, expand_user_path, mkdir, mount};
use anyhow::{Context, Result, anyhow};
use log::{debug, trace};
use nix::{
    mount::MsFlags,
    sys::stat::{Mode, SFlag, makedev, mknod},
    unistd::{Gid, Uid, chdir, chroot},
};
use std::{
    fs::{File, Permissions},
    os::unix::fs::{PermissionsExt, symlink},
    path::{Path, PathBuf},
};

const ROOT_DIRS: [&str; 6] = ["dev", "proc", "sys", "tmp", "run", "home"];

const DEVICE_NODES: [(&str, (u64, u64)); 6] = [
    ("null", (1, 3)),
    ("zero", (1, 5)),
    ("full", (1, 7)),
    ("random", (1, 8)),
    ("urandom", (1, 9)),
    ("tty", (5, 0)),
];

const DEVICE_LINKS: [(&str, &str); 5] = [
    ("/proc/self/fd", "fd"),
    ("/proc/self/fd/0", "stdin"),
    ("/proc/self/fd/1", "stdout"),
    ("/proc/self/fd/2", "stderr"),
    ("pts/ptmx", "ptmx"),
];

/// Builds the sandbox root as a tmpfs under `root` populated with bind
/// mounts, then chroots into it.
pub struct ChrootFilesystem {
    root: PathBuf,
    user: UserRecord,
    uid: Uid,
    gid: Gid,
}

impl ChrootFilesystem {
    pub fn new(root: PathBuf, user: UserRecord) -> Self {
        let uid = Uid::from_raw(user.uid);
        let gid = Gid::from_raw(user.gid);
        Self {
            root,
            user,
            uid,
            gid,
        }
    }

    /// Where a host path ends up inside the new root.
    fn target_for(&self, source: &Path) -> PathBuf {
        let relative = source.strip_prefix("/").unwrap_or(source);
        self.root.join(relative)
    }

    fn populate_dev(&self, dev: &Path) -> Result<()> {
        let mode = Mode::S_IRUSR
            | Mode::S_IWUSR
            | Mode::S_IRGRP
            | Mode::S_IWGRP
            | Mode::S_IROTH
            | Mode::S_IWOTH;

        for (name, (major, minor)) in DEVICE_NODES {
            let path = dev.join(name);
            mknod(&path, SFlag::S_IFCHR, mode, makedev(major, minor))
                .context(format!("failed to mknod {}", path.display()))?;
            // mknod honours the umask
            std::fs::set_permissions(&path, Permissions::from_mode(0o666))
                .context(format!("failed to chmod {}", path.display()))?;
        }

        for dir in ["pts", "shm"] {
            std::fs::create_dir_all(dev.join(dir))?;
        }

        link_dev(dev)
    }
}

/* devtmpfs is shared with the host, so existing entries are left alone */
fn link_dev(dev: &Path) -> Result<()> {
    for (src, name) in DEVICE_LINKS {
        let dst = dev.join(name);
        if dst.symlink_metadata().is_ok() {
            continue;
        }
        symlink(src, &dst).context(format!(
            "failed to symlink {} {}",
            src,
            dst.display()
        ))?;
    }
    Ok(())
}

impl FilesystemOps for ChrootFilesystem {
    fn setup_rootfs(&mut self, full_dev: bool) -> Result<()> {
        let null: Option<&str> = None;

        /* Keep our mounts from propagating back to the parent namespace */
        mount(null, "/", null, MsFlags::MS_REC | MsFlags::MS_PRIVATE, null)
            .context("failed to mount / with MS_REC | MS_PRIVATE")?;

        std::fs::create_dir_all(&self.root).context(format!(
            "failed to create root directory {}",
            self.root.display()
        ))?;
        mount(
            Some("tmpfs"),
            &self.root,
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some("mode=755"),
        )?;

        for dir in ROOT_DIRS {
            std::fs::create_dir_all(self.root.join(dir))?;
        }

        if !full_dev {
            self.populate_dev(&self.root.join("dev"))?;
        }

        trace!("Root filesystem prepared at {}", self.root.display());
        Ok(())
    }

    fn bind_path(&mut self, path: &Path, flags: BindFlags) -> Result<()> {
        let source = expand_user_path(&path.to_string_lossy(), &self.user);

        if !source.exists() {
            if !flags.can_create {
                debug!("Skipping bind of missing path {}", source.display());
                return Ok(());
            }
            mkdir(&source, self.uid, self.gid)?;
        }

        let target = self.target_for(&source);
        if source.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if !target.exists() {
                File::create(&target).context(format!(
                    "failed to create mount point {}",
                    target.display()
                ))?;
            }
        }

        debug!(
            "Binding {} ({})",
            source.display(),
            if flags.read_only { "ro" } else { "rw" }
        );
        bind_mount(&source, &target, flags.read_only)
    }

    fn blacklist_path(&mut self, path: &Path) -> Result<()> {
        let source = expand_user_path(&path.to_string_lossy(), &self.user);
        let target = self.target_for(&source);

        let metadata = match target.symlink_metadata() {
            Ok(metadata) => metadata,
            Err(_) => {
                trace!("Blacklisted path {} not in sandbox", source.display());
                return Ok(());
            }
        };

        debug!("Blacklisting {}", source.display());
        if metadata.is_dir() {
            mount(
                Some("tmpfs"),
                &target,
                Some("tmpfs"),
                MsFlags::MS_RDONLY
                    | MsFlags::MS_NOSUID
                    | MsFlags::MS_NODEV
                    | MsFlags::MS_NOEXEC,
                Some("mode=755"),
            )
        } else {
            bind_mount("/dev/null", &target, true)
        }
    }

    fn display_dir(&mut self, profile: &str) -> Result<PathBuf> {
        if profile.is_empty() || profile.contains('/') {
            return Err(anyhow!("Invalid profile name for display directory"));
        }
        let dir = work_dir(&self.user.home_dir, profile);
        mkdir(&dir, self.uid, self.gid)?;
        Ok(dir)
    }

    fn chroot(&mut self) -> Result<()> {
        chdir(&self.root)
            .context(format!("failed to chdir to {}", self.root.display()))?;
        chroot(".").context("failed to chroot to .")?;
        chdir("/").context("failed to chdir to /")?;
        Ok(())
    }

    fn mount_full_dev(&mut self) -> Result<()> {
        let null: Option<&str> = None;
        mount(
            Some("devtmpfs"),
            "/dev",
            Some("devtmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
            null,
        )?;
        for dir in ["/dev/pts", "/dev/shm"] {
            std::fs::create_dir_all(dir)?;
        }
        link_dev(Path::new("/dev"))
    }

    fn mount_shm(&mut self) -> Result<()> {
        std::fs::create_dir_all("/dev/shm")?;
        mount(
            Some("shm"),
            "/dev/shm",
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
            Some("mode=1777"),
        )
    }

    fn mount_tmp(&mut self) -> Result<()> {
        mount(
            Some("tmpfs"),
            "/tmp",
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some("mode=1777"),
        )
    }

    fn mount_pts(&mut self) -> Result<()> {
        // devpts: https://www.kernel.org/doc/Documentation/filesystems/devpts.txt
        std::fs::create_dir_all("/dev/pts")?;
        mount(
            Some("devpts"),
            "/dev/pts",
            Some("devpts"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
            Some("newinstance,mode=620,ptmxmode=0666"),
        )
    }

    fn mount_proc(&mut self) -> Result<()> {
        let null: Option<&str> = None;
        mount(
            Some("proc"),
            "/proc",
            Some("proc"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            null,
        )
    }

    fn mount_sys(&mut self) -> Result<()> {
        let null: Option<&str> = None;
        mount(
            Some("sysfs"),
            "/sys",
            Some("sysfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_RDONLY,
            null,
        )
    }
}
