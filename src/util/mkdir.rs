use anyhow::{Context, Result, anyhow};
use nix::{
    sys::stat::SFlag,
    unistd::{Gid, Uid, chown},
};
use std::path::Path;

/* Makes the directory, and any missing parents, owned by uid/gid. Only the
 * components we create are chowned; anything that already existed is left
 * alone. Will throw an error if the final path already exists but is not a
 * directory, or is a directory owned by someone else.
 */
pub fn mkdir(path: &Path, uid: Uid, gid: Gid) -> Result<()> {
    if path.exists() {
        let metadata = nix::sys::stat::lstat(path)?;
        if metadata.st_mode & SFlag::S_IFMT.bits() != SFlag::S_IFDIR.bits() {
            return Err(anyhow!(
                "Directory {} already exists but is not a directory",
                path.display()
            ));
        }

        if metadata.st_uid != uid.as_raw() || metadata.st_gid != gid.as_raw() {
            return Err(anyhow!(
                "Directory {} already exists with different owner or group",
                path.display()
            ));
        }
        return Ok(());
    }

    let mut missing = Vec::new();
    let mut current = Some(path);
    while let Some(candidate) = current {
        if candidate.exists() {
            break;
        }
        missing.push(candidate);
        current = candidate.parent();
    }

    for dir in missing.into_iter().rev() {
        std::fs::create_dir(dir).with_context(|| {
            format!("Failed to create directory {}", dir.display())
        })?;
        chown(dir, Some(uid), Some(gid)).with_context(|| {
            format!("Failed to chown directory {}", dir.display())
        })?;
    }

    Ok(())
}
