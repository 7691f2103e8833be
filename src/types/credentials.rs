use crate::config::SandboxDescriptor;
use nix::unistd::{Gid, Uid};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Identity of the process on the far end of a control connection, as
/// reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    pub pid: i32,
    pub uid: Uid,
    pub gid: Gid,
}

impl PeerCredentials {
    /// Either id being 0 is enough to be treated as root.
    pub fn is_root_equivalent(&self) -> bool {
        self.uid.is_root() || self.gid.as_raw() == 0
    }
}

/// What a spawned process is for. Decides the supplementary groups it gets.
#[derive(Debug, Clone, Copy)]
pub enum SpawnRole<'a> {
    Application,
    Display { audio: bool },
    DisplayControl,
    Shell(&'a PeerCredentials),
}

/// The exact uid/gid/groups applied to a child between fork and exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnCredentials {
    pub uid: Uid,
    pub gid: Gid,
    pub groups: Vec<Gid>,
}

/// The unprivileged identity every sandboxed process runs as.
#[derive(Debug, Clone)]
pub struct CredentialContext {
    pub uid: Uid,
    pub gid: Gid,
    pub groups: BTreeMap<String, Gid>,
    pub home: PathBuf,
}

impl CredentialContext {
    pub fn from_descriptor(descriptor: &SandboxDescriptor) -> Self {
        Self {
            uid: Uid::from_raw(descriptor.uid),
            gid: Gid::from_raw(descriptor.gid),
            groups: descriptor
                .gids
                .iter()
                .map(|(name, gid)| (name.clone(), Gid::from_raw(*gid)))
                .collect(),
            home: descriptor.user.home_dir.clone(),
        }
    }

    pub fn spawn_credentials(&self, role: SpawnRole) -> SpawnCredentials {
        let mut groups = vec![self.gid];
        let (uid, gid) = match role {
            SpawnRole::Application => {
                groups.extend(self.groups.values().copied());
                (self.uid, self.gid)
            }
            SpawnRole::Display { audio } => {
                groups.extend(self.groups.get("video").copied());
                if audio {
                    groups.extend(self.groups.get("audio").copied());
                }
                (self.uid, self.gid)
            }
            SpawnRole::DisplayControl => (self.uid, self.gid),
            SpawnRole::Shell(peer) => {
                if !peer.is_root_equivalent() {
                    groups.extend(self.groups.values().copied());
                }
                (peer.uid, peer.gid)
            }
        };

        let mut seen = Vec::with_capacity(groups.len());
        groups.retain(|gid| {
            if seen.contains(gid) {
                false
            } else {
                seen.push(*gid);
                true
            }
        });

        SpawnCredentials { uid, gid, groups }
    }
}
