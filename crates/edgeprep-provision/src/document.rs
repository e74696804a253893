//! Transactional text documents.
//!
//! Global configuration files (boot config, mount table) are edited through a
//! [`Document`]: the whole file is read, transformed in memory, and written
//! back by renaming a sibling temporary file over the original. Before the
//! first write to a given path in a run, a timestamped copy is taken through
//! the run's [`BackupLedger`].
//!
//! Managed regions inside a foreign file are delimited by a pair of marker
//! comments; [`strip_block`] and [`append_block`] implement the
//! remove-then-append cycle that keeps repeated edits byte-identical.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use edgeprep_types::ProvisionError;
use tracing::info;

// ─────────────────────────────────────────────────────────────────────────────
// Backups
// ─────────────────────────────────────────────────────────────────────────────

/// Records which paths have already been backed up during this run.
#[derive(Debug)]
pub struct BackupLedger {
    stamp: String,
    taken: HashMap<PathBuf, PathBuf>,
}

impl Default for BackupLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl BackupLedger {
    pub fn new() -> Self {
        Self {
            stamp: Local::now().format("%Y%m%dT%H%M%S").to_string(),
            taken: HashMap::new(),
        }
    }

    /// Copy `path` aside unless that already happened this run. Returns the
    /// backup location.
    pub fn ensure_backup(&mut self, path: &Path) -> Result<PathBuf, ProvisionError> {
        if let Some(existing) = self.taken.get(path) {
            return Ok(existing.clone());
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());
        let mut backup = path.with_file_name(format!("{file_name}.edgeprep-{}.bak", self.stamp));
        let mut n = 1;
        while backup.exists() {
            backup = path.with_file_name(format!("{file_name}.edgeprep-{}-{n}.bak", self.stamp));
            n += 1;
        }
        fs::copy(path, &backup).map_err(|e| ProvisionError::config_write(path, e))?;
        info!(path = %path.display(), backup = %backup.display(), "backup taken");
        self.taken.insert(path.to_path_buf(), backup.clone());
        Ok(backup)
    }

    /// Backup taken for `path` this run, if any.
    pub fn backup_of(&self, path: &Path) -> Option<&PathBuf> {
        self.taken.get(path)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Document
// ─────────────────────────────────────────────────────────────────────────────

/// A whole-file text document loaded for a read-modify-write cycle.
#[derive(Debug, Clone)]
pub struct Document {
    path: PathBuf,
    content: String,
}

impl Document {
    /// Load an existing document.
    ///
    /// # Errors
    ///
    /// [`ProvisionError::ConfigWrite`] if the file does not exist or cannot
    /// be read; a document that cannot be read cannot be safely rewritten.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ProvisionError> {
        let path = path.into();
        if !path.is_file() {
            return Err(ProvisionError::config_write(&path, "file does not exist"));
        }
        let content =
            fs::read_to_string(&path).map_err(|e| ProvisionError::config_write(&path, e))?;
        Ok(Self { path, content })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Replace the document with `new_content`.
    ///
    /// Does nothing (and takes no backup) when the content is unchanged.
    /// Returns whether the file was written.
    pub fn commit(
        &mut self,
        new_content: String,
        backups: &mut BackupLedger,
    ) -> Result<bool, ProvisionError> {
        if new_content == self.content {
            return Ok(false);
        }
        backups.ensure_backup(&self.path)?;
        write_atomic(&self.path, new_content.as_bytes())
            .map_err(|e| ProvisionError::config_write(&self.path, e))?;
        self.content = new_content;
        Ok(true)
    }
}

/// Write `bytes` to a sibling temporary file, then rename it over `path`.
/// Permissions of an existing file are carried over.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.edgeprep-tmp"));
    fs::write(&tmp, bytes)?;
    if let Ok(meta) = fs::metadata(path) {
        fs::set_permissions(&tmp, meta.permissions())?;
    }
    fs::rename(&tmp, path).inspect_err(|_| {
        let _ = fs::remove_file(&tmp);
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Managed blocks
// ─────────────────────────────────────────────────────────────────────────────

/// Split `content` into the lines outside the `begin`/`end` block and the
/// lines inside it (markers excluded). A begin marker without a matching end
/// marker is dropped on its own.
pub fn strip_block<'a>(content: &'a str, begin: &str, end: &str) -> (Vec<&'a str>, Vec<&'a str>) {
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.iter().position(|l| l.trim() == begin);
    let stop = start.and_then(|s| {
        lines[s + 1..]
            .iter()
            .position(|l| l.trim() == end)
            .map(|p| s + 1 + p)
    });
    match (start, stop) {
        (Some(s), Some(e)) => {
            let outside = lines[..s].iter().chain(&lines[e + 1..]).copied().collect();
            (outside, lines[s + 1..e].to_vec())
        }
        (Some(s), None) => {
            let outside = lines[..s].iter().chain(&lines[s + 1..]).copied().collect();
            (outside, Vec::new())
        }
        _ => (lines, Vec::new()),
    }
}

/// Join `outside` (trailing blank lines trimmed) and a fresh block built from
/// `body`, separated by one blank line and terminated by a newline.
pub fn append_block(outside: &[&str], begin: &str, end: &str, body: &[String]) -> String {
    let keep = outside
        .iter()
        .rposition(|l| !l.trim().is_empty())
        .map_or(0, |i| i + 1);
    let mut out = String::new();
    for line in &outside[..keep] {
        out.push_str(line);
        out.push('\n');
    }
    if keep > 0 {
        out.push('\n');
    }
    out.push_str(begin);
    out.push('\n');
    for line in body {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str(end);
    out.push('\n');
    out
}
