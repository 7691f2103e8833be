use super::impls::deserialize_from_str;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

fn default_true() -> bool {
    true
}

/* The three enums below decode through their FromStr impls so that the
 * aliases accepted there ("empty", "") hold for descriptors too. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Network {
    #[default]
    None,
    Host,
    Bridge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeccompMode {
    #[default]
    Disabled,
    Whitelist,
    Blacklist,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioMode {
    #[default]
    None,
    Speaker,
    Full,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WhitelistItem {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default = "default_true")]
    pub can_create: bool,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BlacklistItem {
    #[serde(default)]
    pub path: String,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct XServerConf {
    pub enabled: bool,
    #[serde(deserialize_with = "deserialize_from_str")]
    pub audio_mode: AudioMode,
    pub enable_notifications: bool,
    pub disable_clipboard: bool,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct NetworkingConf {
    #[serde(deserialize_with = "deserialize_from_str")]
    pub nettype: Network,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct SeccompConf {
    #[serde(deserialize_with = "deserialize_from_str")]
    pub mode: SeccompMode,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub whitelist: Vec<WhitelistItem>,
    #[serde(default)]
    pub blacklist: Vec<BlacklistItem>,
    #[serde(default)]
    pub xserver: XServerConf,
    #[serde(default)]
    pub networking: NetworkingConf,
    #[serde(default)]
    pub seccomp: SeccompConf,
    #[serde(default)]
    pub no_sys_proc: bool,
}

/// Daemon-side settings forwarded alongside the profile.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DaemonConfig {
    pub shell_path: PathBuf,
    pub divert_suffix: String,
    pub allow_root_shell: bool,
    pub use_full_dev: bool,
    pub log_display: bool,
    pub prefix_path: PathBuf,
    pub root_dir: PathBuf,
    pub xpra_path: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            shell_path: PathBuf::from("/bin/bash"),
            divert_suffix: String::new(),
            allow_root_shell: false,
            use_full_dev: false,
            log_display: false,
            prefix_path: PathBuf::from("/usr/local"),
            root_dir: PathBuf::from("/srv/sandbox/rootfs"),
            xpra_path: PathBuf::from("/usr/bin/xpra"),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct UserRecord {
    pub username: String,
    pub uid: u32,
    pub gid: u32,
    #[serde(default)]
    pub home_dir: PathBuf,
    /// Login shell from the passwd entry. Shells are started from
    /// `DaemonConfig::shell_path`; this is decoded but not acted on.
    #[allow(dead_code)]
    #[serde(default)]
    pub shell: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SandboxNetwork {
    pub interface: String,
    pub ip: Option<Ipv4Addr>,
    pub prefix_len: u8,
    pub gateway: Option<Ipv4Addr>,
}

impl Default for SandboxNetwork {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
            ip: None,
            prefix_len: 24,
            gateway: None,
        }
    }
}

/// Everything the launcher hands us on stdin. Read once, never mutated.
#[derive(Deserialize, Debug, Clone)]
pub struct SandboxDescriptor {
    pub profile: Profile,
    #[serde(default)]
    pub config: DaemonConfig,
    pub sockaddr: PathBuf,
    #[serde(default)]
    pub launch_env: Vec<String>,
    pub uid: u32,
    pub gid: u32,
    #[serde(default)]
    pub gids: BTreeMap<String, u32>,
    pub user: UserRecord,
    #[serde(default)]
    pub network: SandboxNetwork,
    #[serde(default)]
    pub display: u32,
}
