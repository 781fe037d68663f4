// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Filesystem-change detection for tool executions.
//!
//! Tool handlers snapshot the working directory before running a command
//! and diff afterwards; each changed file becomes a `context.update` event
//! so every participant sees what the tool actually did.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use walkdir::WalkDir;

/// Directory names never worth tracking: VCS metadata, dependency caches,
/// build outputs, virtualenvs.
const IGNORED_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    "target",
    "__pycache__",
    ".venv",
    "venv",
    "dist",
    "build",
    ".next",
    ".cache",
];

/// File names skipped outright: environment files and OS metadata.
fn is_ignored_file(name: &str) -> bool {
    name.starts_with(".env") || name == ".DS_Store" || name == "Thumbs.db"
}

/// Changed files above this size are not inlined into context events.
const MAX_INLINE_BYTES: u64 = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    mtime: Option<SystemTime>,
    size: u64,
}

/// Point-in-time record of `{ path → (mtime, size) }` under a directory.
#[derive(Debug, Clone)]
pub struct DirSnapshot {
    root: PathBuf,
    entries: HashMap<PathBuf, FileStamp>,
}

impl DirSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
}

#[derive(Debug, Clone)]
pub struct FileChange {
    pub path: PathBuf,
    pub relative_path: String,
    pub content: String,
    pub kind: ChangeKind,
}

fn walk(dir: &Path, max_depth: usize) -> impl Iterator<Item = walkdir::DirEntry> {
    WalkDir::new(dir)
        .max_depth(max_depth)
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            if e.file_type().is_dir() {
                !IGNORED_DIRS.contains(&name.as_ref())
            } else {
                !is_ignored_file(&name)
            }
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
}

/// Record `(mtime, size)` for every tracked file under `dir`.
pub fn snapshot(dir: &Path, max_depth: usize) -> DirSnapshot {
    let mut entries = HashMap::new();
    for entry in walk(dir, max_depth) {
        if let Ok(meta) = entry.metadata() {
            entries.insert(
                entry.path().to_path_buf(),
                FileStamp {
                    mtime: meta.modified().ok(),
                    size: meta.len(),
                },
            );
        }
    }
    DirSnapshot {
        root: dir.to_path_buf(),
        entries,
    }
}

/// Re-walk `dir` and report files that are new or whose mtime/size changed
/// since `before`.  Unreadable and binary files are skipped; deletions are
/// not reported (there is no content to show).
pub fn diff(before: &DirSnapshot, dir: &Path, max_depth: usize) -> Vec<FileChange> {
    let mut changes = Vec::new();
    for entry in walk(dir, max_depth) {
        let path = entry.path().to_path_buf();
        let Ok(meta) = entry.metadata() else { continue };
        let now = FileStamp {
            mtime: meta.modified().ok(),
            size: meta.len(),
        };

        let kind = match before.entries.get(&path) {
            Some(old) if *old == now => continue,
            Some(_) => ChangeKind::Modified,
            None => ChangeKind::Created,
        };

        if meta.len() > MAX_INLINE_BYTES {
            continue;
        }
        // Text only: binary content has no useful inline representation.
        let Ok(bytes) = std::fs::read(&path) else { continue };
        let Ok(content) = String::from_utf8(bytes) else { continue };

        let relative_path = path
            .strip_prefix(&before.root)
            .unwrap_or(&path)
            .to_string_lossy()
            .into_owned();
        changes.push(FileChange {
            path,
            relative_path,
            content,
            kind,
        });
    }
    changes.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    changes
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn unchanged_directory_diffs_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let snap = snapshot(dir.path(), 5);
        assert_eq!(snap.len(), 1);
        assert!(diff(&snap, dir.path(), 5).is_empty());
    }

    #[test]
    fn created_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let snap = snapshot(dir.path(), 5);
        fs::write(dir.path().join("new.txt"), "fresh").unwrap();
        let changes = diff(&snap, dir.path(), 5);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Created);
        assert_eq!(changes[0].relative_path, "new.txt");
        assert_eq!(changes[0].content, "fresh");
    }

    #[test]
    fn modified_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, "one").unwrap();
        let snap = snapshot(dir.path(), 5);
        // Same length, different mtime would race on coarse clocks; change
        // the size so the diff is deterministic.
        fs::write(&path, "one two").unwrap();
        let changes = diff(&snap, dir.path(), 5);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Modified);
        assert_eq!(changes[0].content, "one two");
    }

    #[test]
    fn ignored_directories_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("node_modules")).unwrap();
        fs::write(dir.path().join("node_modules/pkg.json"), "{}").unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/HEAD"), "ref").unwrap();
        let snap = snapshot(dir.path(), 5);
        assert!(snap.is_empty());
    }

    #[test]
    fn env_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".env"), "SECRET=1").unwrap();
        fs::write(dir.path().join(".env.local"), "SECRET=2").unwrap();
        let snap = snapshot(dir.path(), 5);
        assert!(snap.is_empty());
        fs::write(dir.path().join(".env.production"), "SECRET=3").unwrap();
        assert!(diff(&snap, dir.path(), 5).is_empty());
    }

    #[test]
    fn binary_files_are_skipped_in_diff() {
        let dir = tempfile::tempdir().unwrap();
        let snap = snapshot(dir.path(), 5);
        fs::write(dir.path().join("blob.bin"), [0u8, 159, 146, 150]).unwrap();
        assert!(diff(&snap, dir.path(), 5).is_empty());
    }

    #[test]
    fn max_depth_bounds_the_walk() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b/c")).unwrap();
        fs::write(dir.path().join("a/b/c/deep.txt"), "deep").unwrap();
        let shallow = snapshot(dir.path(), 2);
        assert!(shallow.is_empty());
        let deep = snapshot(dir.path(), 5);
        assert_eq!(deep.len(), 1);
    }

    #[test]
    fn nested_change_reports_relative_path() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        let snap = snapshot(dir.path(), 5);
        fs::write(dir.path().join("src/lib.rs"), "pub fn f() {}").unwrap();
        let changes = diff(&snap, dir.path(), 5);
        assert_eq!(changes.len(), 1);
        assert_eq!(
            changes[0].relative_path,
            format!("src{}lib.rs", std::path::MAIN_SEPARATOR)
        );
    }
}
