use super::structs::{AudioMode, Network, SandboxDescriptor, SeccompMode};

use serde::Deserialize;
use std::{
    fmt::{self, Display},
    str::FromStr,
};

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "" | "none" | "empty" => Ok(Network::None),
            "host" => Ok(Network::Host),
            "bridge" => Ok(Network::Bridge),
            _ => Err(format!("Invalid network type: {}", s)),
        }
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::None => write!(f, "none"),
            Network::Host => write!(f, "host"),
            Network::Bridge => write!(f, "bridge"),
        }
    }
}

impl FromStr for SeccompMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "" | "disabled" => Ok(SeccompMode::Disabled),
            "whitelist" => Ok(SeccompMode::Whitelist),
            "blacklist" => Ok(SeccompMode::Blacklist),
            _ => Err(format!("Invalid seccomp mode: {}", s)),
        }
    }
}

impl Display for SeccompMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeccompMode::Disabled => write!(f, "disabled"),
            SeccompMode::Whitelist => write!(f, "whitelist"),
            SeccompMode::Blacklist => write!(f, "blacklist"),
        }
    }
}

impl FromStr for AudioMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "" | "none" => Ok(AudioMode::None),
            "speaker" => Ok(AudioMode::Speaker),
            "full" => Ok(AudioMode::Full),
            _ => Err(format!("Invalid audio mode: {}", s)),
        }
    }
}

impl Display for AudioMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioMode::None => write!(f, "none"),
            AudioMode::Speaker => write!(f, "speaker"),
            AudioMode::Full => write!(f, "full"),
        }
    }
}

impl SandboxDescriptor {
    pub fn display_enabled(&self) -> bool {
        self.profile.xserver.enabled
    }

    pub fn audio_enabled(&self) -> bool {
        self.profile.xserver.audio_mode != AudioMode::None
    }

    pub fn host_network(&self) -> bool {
        self.profile.networking.nettype == Network::Host
    }
}

/// Decodes a string field with the type's FromStr impl, so descriptors
/// accept exactly what the parser accepts.
pub(crate) fn deserialize_from_str<'de, D, T>(
    deserializer: D,
) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let s = String::deserialize(deserializer)?;
    T::from_str(&s).map_err(serde::de::Error::custom)
}

pub(crate) fn parse_log_level(s: &str) -> Result<log::LevelFilter, String> {
    s.parse::<log::LevelFilter>().map_err(|e| e.to_string())
}
