//! Read-only access to the Windows Registry.
//!
//! Tool discovery looks up install locations written by installers
//! (7-Zip, Visual Studio). On other platforms every lookup misses.

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RegistryHive {
    CurrentUser,
    LocalMachine,
}

impl RegistryHive {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CurrentUser => "HKCU",
            Self::LocalMachine => "HKLM",
        }
    }
}

/// Read a string value, treating missing keys and empty strings alike.
#[cfg(windows)]
pub fn read_string(hive: RegistryHive, key: &str, value: &str) -> Option<String> {
    use windows_registry::{CURRENT_USER, LOCAL_MACHINE};

    let root = match hive {
        RegistryHive::CurrentUser => CURRENT_USER,
        RegistryHive::LocalMachine => LOCAL_MACHINE,
    };
    let opened = root.open(key).ok()?;
    let text = opened.get_string(value).ok()?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        log::trace!("{}\\{key} {value} is empty", hive.as_str());
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(not(windows))]
pub fn read_string(hive: RegistryHive, key: &str, value: &str) -> Option<String> {
    log::trace!(
        "registry lookup {}\\{key} {value} skipped: not running on Windows",
        hive.as_str()
    );
    None
}
