use std::path::PathBuf;

/// Data directory for the default database and log files.
/// `DEEPTHINK_HOME` overrides; otherwise `~/.deepthink`.
pub fn data_dir() -> PathBuf {
    if let Some(home) = std::env::var_os("DEEPTHINK_HOME") {
        return PathBuf::from(home);
    }
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".deepthink")
}
