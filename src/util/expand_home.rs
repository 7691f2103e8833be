use crate::config::UserRecord;
use std::path::PathBuf;

/// Expands `~`, `${HOME}` and `${USER}` in a profile path against the
/// sandbox user, never against our own environment.
pub fn expand_user_path(path: &str, user: &UserRecord) -> PathBuf {
    let home = user.home_dir.to_string_lossy();
    let expanded = if path == "~" {
        home.to_string()
    } else if let Some(rest) = path.strip_prefix("~/") {
        format!("{}/{}", home.trim_end_matches('/'), rest)
    } else {
        path.to_string()
    };

    PathBuf::from(
        expanded
            .replace("${HOME}", &home)
            .replace("${USER}", &user.username),
    )
}
