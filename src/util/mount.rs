use anyhow::{Context, Result};
use nix::mount::MsFlags;
use std::ffi::{CString, OsStr};

fn c_string<S: AsRef<OsStr>>(value: &S) -> Result<CString> {
    let value = value.as_ref();
    CString::new(value.to_string_lossy().as_bytes())
        .context(format!("invalid mount argument {}", value.to_string_lossy()))
}

/// mount(2) with every argument rendered into the error on failure.
pub fn mount<S1, S2, S3, S4>(
    source: Option<S1>,
    target: S2,
    fstype: Option<S3>,
    flags: MsFlags,
    data: Option<S4>,
) -> Result<()>
where
    S1: AsRef<OsStr>,
    S2: AsRef<OsStr>,
    S3: AsRef<OsStr>,
    S4: AsRef<OsStr>,
{
    let source = source.as_ref().map(c_string).transpose()?;
    let target = c_string(&target)?;
    let fstype = fstype.as_ref().map(c_string).transpose()?;
    let data = data.as_ref().map(c_string).transpose()?;

    nix::mount::mount(
        source.as_deref(),
        target.as_c_str(),
        fstype.as_deref(),
        flags,
        data.as_deref(),
    )
    .with_context(|| {
        let show = |value: &Option<CString>| {
            value
                .as_ref()
                .map(|v| v.to_string_lossy().to_string())
                .unwrap_or_default()
        };
        format!(
            "failed to mount {} on {} [type={}, flags={:#x}, data={}]",
            show(&source),
            target.to_string_lossy(),
            show(&fstype),
            flags.bits(),
            show(&data),
        )
    })
}

/// Bind `source` onto `target`, then remount it read-only when asked.
/// A bind mount ignores MS_RDONLY on the first call, hence the remount.
pub fn bind_mount<S1, S2>(source: S1, target: S2, read_only: bool) -> Result<()>
where
    S1: AsRef<OsStr>,
    S2: AsRef<OsStr>,
{
    let null: Option<&str> = None;
    mount(
        Some(&source),
        &target,
        null,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        null,
    )?;

    if read_only {
        mount(
            Some("none"),
            &target,
            null,
            MsFlags::MS_BIND
                | MsFlags::MS_REMOUNT
                | MsFlags::MS_RDONLY
                | MsFlags::MS_NOSUID,
            null,
        )
        .context(format!(
            "failed to remount {} read-only",
            target.as_ref().to_string_lossy()
        ))?;
    }
    Ok(())
}
