//! Utility functions for directory management and system integration
//!
//! # Directory Structure
//!
//! - Data: per-application support directory (`proxy.pac`, `preferences.json`)
//! - State: runtime state (audit log, tracing log, configuration lock file)
//!
//! On macOS both resolve under `~/Library/Application Support/com.hush.hush`.

use directories::ProjectDirs;
use std::path::{Path, PathBuf};

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "hush", "hush")
}

pub fn get_data_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.data_dir().to_path_buf())
}

/// State directory, falling back to the data directory on platforms
/// without a dedicated one (macOS, Windows).
pub fn get_state_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| {
        pd.state_dir()
            .map_or_else(|| pd.data_dir().to_path_buf(), Path::to_path_buf)
    })
}

pub fn ensure_dirs() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        let mut builder = DirBuilder::new();
        builder.mode(0o700); // User read/write/execute only
        builder.recursive(true);

        if let Some(dir) = get_data_dir() {
            builder.create(dir)?;
        }
        if let Some(dir) = get_state_dir() {
            builder.create(dir)?;
        }
    }

    #[cfg(not(unix))]
    {
        if let Some(dir) = get_data_dir() {
            std::fs::create_dir_all(dir)?;
        }
        if let Some(dir) = get_state_dir() {
            std::fs::create_dir_all(dir)?;
        }
    }

    Ok(())
}

/// Renders an absolute path as a `file://` URL, percent-encoding every byte
/// outside the RFC 3986 unreserved set (and `/`).
pub fn file_url(path: &Path) -> String {
    use std::fmt::Write;

    let raw = path.to_string_lossy();
    let mut url = String::with_capacity(raw.len() + 16);
    url.push_str("file://");
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' => {
                url.push(byte as char);
            }
            _ => {
                let _ = write!(url, "%{byte:02X}");
            }
        }
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_url_encodes_spaces() {
        let url = file_url(Path::new(
            "/Users/me/Library/Application Support/com.hush.hush/proxy.pac",
        ));
        assert_eq!(
            url,
            "file:///Users/me/Library/Application%20Support/com.hush.hush/proxy.pac"
        );
    }

    #[test]
    fn test_file_url_encodes_non_ascii() {
        let url = file_url(Path::new("/tmp/é.pac"));
        assert_eq!(url, "file:///tmp/%C3%A9.pac");
    }

    #[test]
    fn test_state_dir_resolves() {
        // Both directories come from the same project and are always paired
        assert_eq!(get_data_dir().is_some(), get_state_dir().is_some());
    }
}
