use super::SandboxDescriptor;
use anyhow::{Context, Result, anyhow};
use std::io::Read;

/// Decodes the sandbox descriptor. Exactly one JSON document is expected;
/// anything trailing it is ignored, as the launcher may keep stdin open.
pub fn decode_descriptor<R: Read>(reader: R) -> Result<SandboxDescriptor> {
    let mut stream = serde_json::Deserializer::from_reader(reader)
        .into_iter::<SandboxDescriptor>();
    match stream.next() {
        Some(descriptor) => {
            descriptor.context("unable to decode sandbox descriptor")
        }
        None => Err(anyhow!("unable to decode sandbox descriptor: no input")),
    }
}

/// The target identity must be unprivileged and must agree with the user
/// record it was resolved from.
pub fn validate_identity(descriptor: &SandboxDescriptor) -> Result<()> {
    if descriptor.uid == 0 {
        return Err(anyhow!(
            "invalid uid passed to init: refusing to run the sandbox as root"
        ));
    }
    if descriptor.user.uid != descriptor.uid {
        return Err(anyhow!(
            "invalid uid or user passed to init: \
             uid {} does not match user {} (uid {})",
            descriptor.uid,
            descriptor.user.username,
            descriptor.user.uid
        ));
    }
    Ok(())
}
