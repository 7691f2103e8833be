use crate::types::SpawnCredentials;
use nix::unistd::{setgid, setgroups, setuid};

/*
 * Runs in the child between fork and exec, so it must stay allocation free.
 * Order matters: groups and gid can only be changed while we are still
 * root, uid goes last.
 */
pub fn drop_privileges(creds: &SpawnCredentials) -> nix::Result<()> {
    setgroups(&creds.groups)?;
    setgid(creds.gid)?;
    setuid(creds.uid)?;
    Ok(())
}
