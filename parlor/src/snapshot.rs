//! JSON snapshot of the group state.
//!
//! Loaded once at startup and written once during graceful shutdown. Both
//! directions are best-effort: a missing or corrupt snapshot starts the
//! group manager empty with a logged warning, and a failed save is logged
//! without aborting shutdown.

use crate::groups::GroupMap;
use ember::logging::{self, Logger};
use serde::{Deserialize, Serialize};
use serde_json::ser::PrettyFormatter;
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_PATH: &str = "groups_data.json";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("cannot write snapshot: {0}")]
    Io(#[from] io::Error),
    #[error("cannot serialize snapshot: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Deserialize)]
struct SnapshotFile {
    groups: GroupMap,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    groups: &'a GroupMap,
}

/// Load the group snapshot. Never fails: problems degrade to an empty map.
pub fn load(path: &Path, log: &Logger) -> GroupMap {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            logging::warn!(log, "no group snapshot found, starting empty";
                           "path" => %path.display());
            return GroupMap::new();
        }
        Err(err) => {
            logging::warn!(log, "cannot read group snapshot, starting empty";
                           "path" => %path.display(), "error" => %err);
            return GroupMap::new();
        }
    };

    match serde_json::from_str::<SnapshotFile>(&raw) {
        Ok(file) => {
            logging::info!(log, "group snapshot loaded";
                           "path" => %path.display(), "groups" => file.groups.len());
            file.groups
        }
        Err(err) => {
            logging::warn!(log, "group snapshot is corrupt, starting empty";
                           "path" => %path.display(), "error" => %err);
            GroupMap::new()
        }
    }
}

/// Write the group snapshot, pretty-printed with 4-space indentation.
pub fn save(path: &Path, groups: &GroupMap, log: &Logger) -> Result<(), SnapshotError> {
    let mut out = Vec::new();
    let formatter = PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    SnapshotRef { groups }.serialize(&mut serializer)?;
    out.push(b'\n');

    fs::write(path, out)?;
    logging::info!(log, "group snapshot saved";
                   "path" => %path.display(), "groups" => groups.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::groups::Group;
    use crate::testutil::test_logger;
    use hashbrown::HashSet;

    fn sample_groups() -> GroupMap {
        let mut members = HashSet::new();
        members.insert("alice".to_string());
        members.insert("bob".to_string());
        let mut banned = HashSet::new();
        banned.insert("mallory".to_string());

        let mut groups = GroupMap::new();
        groups.insert(
            "club".to_string(),
            Group {
                name: "Club".to_string(),
                owner: "alice".to_string(),
                members,
                password_hash: "$argon2id$v=19$m=65536,t=3,p=1$c2FsdA$aGFzaA".to_string(),
                banned,
            },
        );
        groups
    }

    #[test]
    fn test_save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("groups_data.json");
        let groups = sample_groups();

        save(&path, &groups, &test_logger()).unwrap();
        let loaded = load(&path, &test_logger());

        assert_eq!(loaded, groups);
    }

    #[test]
    fn test_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();

        let loaded = load(&dir.path().join("absent.json"), &test_logger());

        assert!(loaded.is_empty());
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("groups_data.json");
        fs::write(&path, "{ not json").unwrap();

        let loaded = load(&path, &test_logger());

        assert!(loaded.is_empty());
    }

    #[test]
    fn test_optional_fields_default_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("groups_data.json");
        fs::write(
            &path,
            r#"{"groups": {"club": {"name": "Club", "owner": "alice", "members": ["alice"]}}}"#,
        )
        .unwrap();

        let loaded = load(&path, &test_logger());

        let group = &loaded["club"];
        assert_eq!(group.password_hash, "");
        assert!(group.banned.is_empty());
    }

    #[test]
    fn test_snapshot_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("groups_data.json");

        save(&path, &sample_groups(), &test_logger()).unwrap();
        let raw = fs::read_to_string(&path).unwrap();

        assert!(raw.starts_with("{\n    \"groups\""), "expected 4-space indent: {}", raw);
        assert!(raw.contains("\"password_hash\""));
        assert!(raw.contains("\"banned\""));
    }
}
