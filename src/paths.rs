use std::path::{Path, PathBuf};

/// Returns the user's home directory using common environment variables.
pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("VULCAN_HOME")
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME")
                .or_else(|| std::env::var_os("USERPROFILE"))
                .map(PathBuf::from)
        })
}

/// Returns the data directory holding the database, reports and logs.
pub fn data_dir() -> PathBuf {
    if let Some(mut dir) = home_dir() {
        dir.push(".vulcan-sentinel");
        dir
    } else {
        PathBuf::from(".vulcan-sentinel")
    }
}

pub fn reports_dir(base: &Path) -> PathBuf {
    base.join("reports")
}

pub fn logs_dir(base: &Path) -> PathBuf {
    base.join("logs")
}
