//! Platform-specific paths for the Tabkeeper host.

use serde_json::{json, Value};
use std::path::{Path, PathBuf};

/// Native messaging host name registered with the browser.
pub const NATIVE_HOST_NAME: &str = "com.tabkeeper.host";

/// Get the platform-specific data directory
///
/// Returns:
/// - Windows: %LOCALAPPDATA%\Tabkeeper
/// - macOS: ~/Library/Application Support/Tabkeeper
/// - Linux/Other: ~/.local/share/Tabkeeper
pub fn get_data_dir() -> PathBuf {
    let base = dirs::data_local_dir()
        .or_else(dirs::data_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".data")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join("Tabkeeper")
}

/// Get the platform-specific config directory
pub fn get_config_dir() -> PathBuf {
    let base = dirs::config_dir()
        .or_else(dirs::data_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join("Tabkeeper")
}

pub fn get_default_config_path() -> PathBuf {
    get_config_dir().join("config.toml")
}

/// Local store database inside `data_dir`.
pub fn store_path(data_dir: &Path) -> PathBuf {
    data_dir.join("tabkeeper.db")
}

/// Ensure a directory exists, creating it if necessary
pub fn ensure_dir(dir: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    Ok(dir.to_path_buf())
}

/// Get Chrome's native messaging hosts directory
///
/// Returns different paths based on platform:
/// - Windows: %LOCALAPPDATA%\Google\Chrome\User Data\Default\Native Messaging Hosts
/// - macOS: ~/Library/Application Support/Google/Chrome/NativeMessagingHosts
/// - Linux: ~/.config/google-chrome/NativeMessagingHosts
pub fn get_chrome_native_messaging_dir() -> Option<PathBuf> {
    if cfg!(target_os = "windows") {
        std::env::var("LOCALAPPDATA").ok().map(|p| {
            PathBuf::from(p)
                .join("Google")
                .join("Chrome")
                .join("User Data")
                .join("Default")
                .join("Native Messaging Hosts")
        })
    } else if cfg!(target_os = "macos") {
        dirs::home_dir().map(|h| {
            h.join("Library")
                .join("Application Support")
                .join("Google")
                .join("Chrome")
                .join("NativeMessagingHosts")
        })
    } else {
        dirs::home_dir().map(|h| {
            h.join(".config")
                .join("google-chrome")
                .join("NativeMessagingHosts")
        })
    }
}

/// Manifest that registers the host binary for the given extension origins.
pub fn native_messaging_manifest(host_binary: &Path, allowed_origins: &[String]) -> Value {
    json!({
        "name": NATIVE_HOST_NAME,
        "description": "Tabkeeper sync host",
        "path": host_binary.to_string_lossy(),
        "type": "stdio",
        "allowed_origins": allowed_origins,
    })
}

/// Get the binary name for the current platform
pub fn get_binary_name(base: &str) -> String {
    if cfg!(target_os = "windows") {
        format!("{}.exe", base)
    } else {
        base.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_data_dir() {
        assert!(get_data_dir().to_string_lossy().ends_with("Tabkeeper"));
    }

    #[test]
    fn test_default_config_path() {
        let path = get_default_config_path();
        assert!(path.ends_with("Tabkeeper/config.toml") || path.ends_with("Tabkeeper\\config.toml"));
    }

    #[test]
    fn test_store_path() {
        let path = store_path(Path::new("/tmp/tk"));
        assert_eq!(path, PathBuf::from("/tmp/tk/tabkeeper.db"));
    }

    #[test]
    fn test_manifest_shape() {
        let manifest = native_messaging_manifest(
            Path::new("/opt/tabkeeper/tabkeeper-host"),
            &["chrome-extension://abcdef/".to_string()],
        );
        assert_eq!(manifest["name"], NATIVE_HOST_NAME);
        assert_eq!(manifest["type"], "stdio");
        assert_eq!(manifest["allowed_origins"][0], "chrome-extension://abcdef/");
    }

    #[test]
    fn test_get_binary_name() {
        let host_name = get_binary_name("tabkeeper-host");
        if cfg!(target_os = "windows") {
            assert!(host_name.ends_with(".exe"));
        } else {
            assert_eq!(host_name, "tabkeeper-host");
        }
    }
}
