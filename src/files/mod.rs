//! Sandboxed access to files inside a server directory.
//!
//! Every operation resolves a caller-supplied relative path against the
//! server directory and refuses anything that would land outside of it.
//! Both the base directory and the target are canonicalized before a
//! component-wise containment check, so neither `..` segments, absolute
//! paths, symlinks, nor sibling directories sharing a name prefix
//! (`foo` vs `foo-evil`) can escape the sandbox.

use std::ffi::OsString;
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;

/// Returned instead of raw bytes when a read target is classified binary.
pub const BINARY_PLACEHOLDER: &str = "Binary file - cannot display content";

/// Number of leading bytes inspected by the binary classifier.
const BINARY_SAMPLE_SIZE: usize = 1024;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Directory,
    File,
}

struct Resolved {
    /// Canonicalized server directory.
    root: PathBuf,
    /// Canonicalized target; its suffix below the deepest existing ancestor
    /// is lexically normalized and contains no `..` segments.
    target: PathBuf,
}

/// Resolve `relative` against `base`, returning `None` when the result would
/// escape `base` (or `base` itself does not exist).
fn resolve_sandboxed(base: &Path, relative: &str) -> Option<Resolved> {
    let rel = Path::new(relative);
    if rel.is_absolute() {
        tracing::warn!("Rejected absolute path '{}'", relative);
        return None;
    }

    // Lexical normalization; popping above the base is an escape.
    let mut parts: Vec<OsString> = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_os_string()),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    tracing::warn!("Rejected path escaping server directory: '{}'", relative);
                    return None;
                }
            }
            _ => return None,
        }
    }

    let root = base.canonicalize().ok()?;
    let mut joined = root.clone();
    for part in &parts {
        joined.push(part);
    }

    // Canonicalize the deepest existing ancestor so symlinks cannot smuggle
    // the target outside, then re-append the not-yet-existing suffix.
    let mut existing = joined.clone();
    let mut suffix: Vec<OsString> = Vec::new();
    while !existing.exists() {
        suffix.push(existing.file_name()?.to_os_string());
        existing = existing.parent()?.to_path_buf();
    }
    let mut target = existing.canonicalize().ok()?;
    for part in suffix.iter().rev() {
        target.push(part);
    }

    if !target.starts_with(&root) {
        tracing::warn!(
            "Rejected path resolving outside server directory: '{}'",
            relative
        );
        return None;
    }
    Some(Resolved { root, target })
}

/// List the target of `relative` inside `base`. A file target yields a
/// single-entry listing; a directory yields its non-dotfile children with
/// directories sorted before files, then lexicographically by name.
/// Unresolvable or missing targets yield an empty listing.
pub fn list_files(base: &Path, relative: &str) -> Vec<FileEntry> {
    let resolved = match resolve_sandboxed(base, relative) {
        Some(resolved) => resolved,
        None => return Vec::new(),
    };

    if !resolved.target.exists() {
        return Vec::new();
    }
    if resolved.target.is_file() {
        return vec![entry_for(&resolved.target, &resolved.root)];
    }

    let entries = match fs::read_dir(&resolved.target) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::error!("Failed to list {}: {}", resolved.target.display(), e);
            return Vec::new();
        }
    };

    let mut files: Vec<FileEntry> = entries
        .flatten()
        .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
        .map(|e| entry_for(&e.path(), &resolved.root))
        .collect();
    files.sort_by(|a, b| {
        (a.kind == EntryKind::File, a.name.as_str()).cmp(&(b.kind == EntryKind::File, b.name.as_str()))
    });
    files
}

/// Read a file inside the sandbox. Returns an empty string for unresolvable,
/// missing, or unreadable targets, and [`BINARY_PLACEHOLDER`] for binary
/// targets. Invalid UTF-8 sequences are replaced rather than failing.
pub fn read_file(base: &Path, relative: &str) -> String {
    let resolved = match resolve_sandboxed(base, relative) {
        Some(resolved) => resolved,
        None => return String::new(),
    };
    if !resolved.target.is_file() {
        return String::new();
    }
    if is_binary_file(&resolved.target) {
        return BINARY_PLACEHOLDER.to_string();
    }
    match fs::read(&resolved.target) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            tracing::error!("Failed to read {}: {}", resolved.target.display(), e);
            String::new()
        }
    }
}

/// Write a file inside the sandbox, creating intermediate directories as
/// needed. Refuses binary targets and anything outside the sandbox.
pub fn write_file(base: &Path, relative: &str, content: &str) -> bool {
    let resolved = match resolve_sandboxed(base, relative) {
        Some(resolved) => resolved,
        None => return false,
    };
    if resolved.target.exists() && is_binary_file(&resolved.target) {
        tracing::warn!(
            "Refused write to binary file {}",
            resolved.target.display()
        );
        return false;
    }
    if let Some(parent) = resolved.target.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            tracing::error!("Failed to create {}: {}", parent.display(), e);
            return false;
        }
    }
    match fs::write(&resolved.target, content) {
        Ok(()) => true,
        Err(e) => {
            tracing::error!("Failed to write {}: {}", resolved.target.display(), e);
            false
        }
    }
}

/// Classify a byte sample as binary: any NUL byte, or more than 30% control
/// characters outside {tab, newline, carriage return}. Empty samples are
/// never binary.
pub fn is_binary(sample: &[u8]) -> bool {
    if sample.is_empty() {
        return false;
    }
    if sample.contains(&0) {
        return true;
    }
    let control = sample
        .iter()
        .filter(|&&b| b < 32 && !matches!(b, b'\t' | b'\n' | b'\r'))
        .count();
    control as f64 / sample.len() as f64 > 0.3
}

fn is_binary_file(path: &Path) -> bool {
    let mut file = match fs::File::open(path) {
        Ok(file) => file,
        Err(_) => return false,
    };
    let mut sample = [0u8; BINARY_SAMPLE_SIZE];
    let read = file.read(&mut sample).unwrap_or(0);
    is_binary(&sample[..read])
}

fn entry_for(path: &Path, root: &Path) -> FileEntry {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let relative = path
        .strip_prefix(root)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| name.clone());
    if path.is_dir() {
        FileEntry {
            name,
            path: relative,
            kind: EntryKind::Directory,
            size: 0,
        }
    } else {
        FileEntry {
            name,
            path: relative,
            kind: EntryKind::File,
            size: fs::metadata(path).map(|m| m.len()).unwrap_or(0),
        }
    }
}
