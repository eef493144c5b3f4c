#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::io::Read as _;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::task::model::now_rfc3339;

/// Directories never descended into. Hidden entries are skipped separately.
const SKIP_DIRS: &[&str] = &["node_modules", "__pycache__", "venv", "target"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileChange {
    pub path: String,
    pub kind: ChangeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_hash: Option<String>,
}

/// Content-hash snapshots of a directory tree. `start` records the before
/// state; `stop` walks again and diffs. Changes outside the root are
/// invisible by design.
#[derive(Debug)]
pub struct FileTracker {
    root: PathBuf,
    before: BTreeMap<String, String>,
}

impl FileTracker {
    pub fn start(root: &Path) -> anyhow::Result<Self> {
        let root = root
            .canonicalize()
            .with_context(|| format!("failed to resolve {}", root.display()))?;
        let before = snapshot(&root)?;
        Ok(Self { root, before })
    }

    pub fn stop(self) -> anyhow::Result<Vec<FileChange>> {
        let after = snapshot(&self.root)?;
        let mut changes = Vec::new();

        for (path, after_hash) in &after {
            match self.before.get(path) {
                None => changes.push(FileChange {
                    path: path.clone(),
                    kind: ChangeKind::Created,
                    before_hash: None,
                    after_hash: Some(after_hash.clone()),
                }),
                Some(before_hash) if before_hash != after_hash => changes.push(FileChange {
                    path: path.clone(),
                    kind: ChangeKind::Modified,
                    before_hash: Some(before_hash.clone()),
                    after_hash: Some(after_hash.clone()),
                }),
                Some(_) => {}
            }
        }
        for (path, before_hash) in &self.before {
            if !after.contains_key(path) {
                changes.push(FileChange {
                    path: path.clone(),
                    kind: ChangeKind::Deleted,
                    before_hash: Some(before_hash.clone()),
                    after_hash: None,
                });
            }
        }
        Ok(changes)
    }
}

/// Walk `root` and hash every regular file that survives the skip rules.
/// Keys are root-relative paths. Unreadable entries are skipped.
fn snapshot(root: &Path) -> anyhow::Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            if meta.is_dir() {
                if !SKIP_DIRS.contains(&name) {
                    stack.push(path);
                }
                continue;
            }
            if !meta.is_file() {
                continue;
            }
            let Ok(hash) = hash_file(&path) else { continue };
            let rel = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .to_string();
            out.insert(rel, hash);
        }
    }
    Ok(out)
}

fn hash_file(path: &Path) -> anyhow::Result<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Serialize)]
struct FilesArtifact<'a> {
    task_id: &'a str,
    timestamp: String,
    changes: &'a [FileChange],
}

/// Persist the per-task file-change artifact (`output/<id>_files.json`).
pub fn save_changes(path: &Path, task_id: &str, changes: &[FileChange]) -> anyhow::Result<()> {
    let artifact = FilesArtifact {
        task_id,
        timestamp: now_rfc3339(),
        changes,
    };
    let data = serde_json::to_vec_pretty(&artifact)?;
    std::fs::write(path, data).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_changes_yields_empty_diff() {
        let td = tempfile::tempdir().expect("tempdir");
        std::fs::write(td.path().join("a.txt"), "alpha").unwrap();

        let tracker = FileTracker::start(td.path()).unwrap();
        let changes = tracker.stop().unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn created_modified_deleted_are_reported() {
        let td = tempfile::tempdir().expect("tempdir");
        std::fs::write(td.path().join("keep.txt"), "same").unwrap();
        std::fs::write(td.path().join("edit.txt"), "v1").unwrap();
        std::fs::write(td.path().join("gone.txt"), "bye").unwrap();

        let tracker = FileTracker::start(td.path()).unwrap();
        std::fs::write(td.path().join("new.txt"), "hello").unwrap();
        std::fs::write(td.path().join("edit.txt"), "v2").unwrap();
        std::fs::remove_file(td.path().join("gone.txt")).unwrap();
        let changes = tracker.stop().unwrap();

        let find = |p: &str| changes.iter().find(|c| c.path == p);
        assert_eq!(find("new.txt").unwrap().kind, ChangeKind::Created);
        assert_eq!(find("edit.txt").unwrap().kind, ChangeKind::Modified);
        assert_eq!(find("gone.txt").unwrap().kind, ChangeKind::Deleted);
        assert!(find("keep.txt").is_none());
        assert_eq!(changes.len(), 3);
    }

    #[test]
    fn rewrite_with_identical_bytes_is_not_a_change() {
        let td = tempfile::tempdir().expect("tempdir");
        std::fs::write(td.path().join("a.txt"), "stable").unwrap();

        let tracker = FileTracker::start(td.path()).unwrap();
        // Touch the file without changing content.
        std::fs::write(td.path().join("a.txt"), "stable").unwrap();
        let changes = tracker.stop().unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn hidden_and_dependency_dirs_are_invisible() {
        let td = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(td.path().join("node_modules")).unwrap();
        std::fs::create_dir(td.path().join(".git")).unwrap();

        let tracker = FileTracker::start(td.path()).unwrap();
        std::fs::write(td.path().join("node_modules/dep.js"), "x").unwrap();
        std::fs::write(td.path().join(".git/HEAD"), "ref").unwrap();
        std::fs::write(td.path().join(".hidden"), "x").unwrap();
        std::fs::write(td.path().join("visible.txt"), "x").unwrap();
        let changes = tracker.stop().unwrap();

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "visible.txt");
    }

    #[test]
    fn nested_paths_are_root_relative() {
        let td = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(td.path().join("sub/dir")).unwrap();

        let tracker = FileTracker::start(td.path()).unwrap();
        std::fs::write(td.path().join("sub/dir/deep.md"), "content").unwrap();
        let changes = tracker.stop().unwrap();

        assert_eq!(changes.len(), 1);
        assert_eq!(
            PathBuf::from(&changes[0].path),
            PathBuf::from("sub").join("dir").join("deep.md")
        );
    }

    #[test]
    fn artifact_is_written_as_json() {
        let td = tempfile::tempdir().expect("tempdir");
        let changes = vec![FileChange {
            path: "haiku.md".to_owned(),
            kind: ChangeKind::Created,
            before_hash: None,
            after_hash: Some("abc".to_owned()),
        }];
        let path = td.path().join("task_00ab12cd_files.json");
        save_changes(&path, "task_00ab12cd", &changes).unwrap();

        let data: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(data["task_id"], "task_00ab12cd");
        assert_eq!(data["changes"][0]["kind"], "created");
    }
}
