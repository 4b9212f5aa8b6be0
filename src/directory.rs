//! Static user directory lookups
//!
//! The directory is a JSON file maintained outside the gateway, mapping
//! each user to the provisioning metadata their workspace is created with.
//! It is re-read on every lookup so roster changes take effect on the next
//! provisioning attempt without a restart.

use crate::error::GatewayError;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Provisioning metadata for one user.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Numeric owner id the workspace runs as
    pub uid: u32,
    /// Group id for the shared volume
    pub gid: u32,
    /// Cohort tag passed through to the workspace environment
    pub district: String,
}

/// Read-only view over the directory file.
pub struct Directory {
    path: PathBuf,
}

impl Directory {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Look up one user, re-reading the file.
    pub fn lookup(&self, user: &str) -> Result<DirectoryEntry, GatewayError> {
        let raw = std::fs::read_to_string(&self.path).map_err(|e| {
            GatewayError::Directory(format!(
                "cannot read directory file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        let entries: HashMap<String, DirectoryEntry> = serde_json::from_str(&raw).map_err(|e| {
            GatewayError::Directory(format!(
                "cannot parse directory file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        entries
            .get(user)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownUser(user.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_directory(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn lookup_known_user() {
        let file = write_directory(
            r#"{"alice": {"uid": 1201, "gid": 5000, "district": "sunlab"}}"#,
        );
        let directory = Directory::new(file.path());

        let entry = directory.lookup("alice").unwrap();
        assert_eq!(
            entry,
            DirectoryEntry {
                uid: 1201,
                gid: 5000,
                district: "sunlab".to_string()
            }
        );
    }

    #[test]
    fn lookup_unknown_user() {
        let file = write_directory(r#"{"alice": {"uid": 1, "gid": 2, "district": "a"}}"#);
        let directory = Directory::new(file.path());

        assert!(matches!(
            directory.lookup("mallory"),
            Err(GatewayError::UnknownUser(user)) if user == "mallory"
        ));
    }

    #[test]
    fn unreadable_file_is_a_directory_error() {
        let directory = Directory::new("/nonexistent/directory.json");

        assert!(matches!(
            directory.lookup("alice"),
            Err(GatewayError::Directory(_))
        ));
    }

    #[test]
    fn malformed_json_is_a_directory_error() {
        let file = write_directory("not json");
        let directory = Directory::new(file.path());

        assert!(matches!(
            directory.lookup("alice"),
            Err(GatewayError::Directory(_))
        ));
    }

    #[test]
    fn changes_are_picked_up_per_lookup() {
        let mut file = write_directory(r#"{"alice": {"uid": 1, "gid": 2, "district": "a"}}"#);
        let directory = Directory::new(file.path());

        assert!(directory.lookup("bob").is_err());

        // Rewrite the roster in place; the next lookup must see it.
        file.as_file_mut().set_len(0).unwrap();
        use std::io::Seek;
        file.as_file_mut().rewind().unwrap();
        file.write_all(br#"{"bob": {"uid": 3, "gid": 4, "district": "b"}}"#)
            .unwrap();
        file.flush().unwrap();

        assert_eq!(directory.lookup("bob").unwrap().uid, 3);
    }
}
