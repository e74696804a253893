//! [`TmpfsProvisioner`] – RAM-backed overlays with a free-memory reservation.
//!
//! Every overlay reserves its full `size` limit against physical RAM. A mount
//! is refused, never shrunk, when
//!
//! ```text
//! committed + Σ reserved + size  >  (1 − reserve_fraction) × MemTotal
//! ```
//!
//! where `committed = MemTotal − MemAvailable` at the time of the call.
//! Mounts are persisted as managed `tmpfs` lines in `/etc/fstab`.
//!
//! Callers that run large, disk-heavy jobs under an overlay path (package
//! upgrades, image downloads) must unmount the overlay around that job
//! themselves; the provisioner does not watch for it.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use edgeprep_types::{HostRoot, OverlayMount, ProvisionError};
use tracing::{error, info, warn};

use crate::document::{BackupLedger, Document, append_block, strip_block};
use crate::host::CommandRunner;
use crate::meminfo::MemoryInfo;

/// Fraction of physical RAM kept free of overlay reservations.
pub const DEFAULT_RESERVE_FRACTION: f64 = 0.25;

const FSTAB: &str = "/etc/fstab";
const BLOCK_BEGIN: &str = "# BEGIN edgeprep tmpfs";
const BLOCK_END: &str = "# END edgeprep tmpfs";

/// Parse a tmpfs `size=` value (`64m`, `1g`, `512k` or raw bytes).
pub fn parse_size(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let (digits, unit) = match raw.char_indices().last()? {
        (i, c) if c.is_ascii_alphabetic() => (&raw[..i], c.to_ascii_lowercase()),
        _ => (raw, 'b'),
    };
    let n: u64 = digits.parse().ok()?;
    let factor = match unit {
        'b' => 1,
        'k' => 1024,
        'm' => 1024 * 1024,
        'g' => 1024 * 1024 * 1024,
        _ => return None,
    };
    n.checked_mul(factor)
}

fn fstab_line(mount: &OverlayMount) -> String {
    format!("tmpfs {} tmpfs {} 0 0", mount.path.display(), mount.options())
}

/// `(mount point, size)` from a managed fstab line.
fn parse_fstab_line(line: &str) -> Option<(PathBuf, u64)> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 4 || fields[2] != "tmpfs" {
        return None;
    }
    let size = fields[3]
        .split(',')
        .find_map(|opt| opt.strip_prefix("size="))
        .and_then(parse_size)?;
    Some((PathBuf::from(fields[1]), size))
}

pub struct TmpfsProvisioner {
    root: HostRoot,
    runner: Arc<dyn CommandRunner>,
    reserve_fraction: f64,
    overlays: BTreeMap<PathBuf, u64>,
    backups: BackupLedger,
}

impl TmpfsProvisioner {
    /// Create a provisioner, picking up overlays already persisted in the
    /// mount table as committed reservations.
    pub fn new(root: HostRoot, runner: Arc<dyn CommandRunner>, reserve_fraction: f64) -> Self {
        let fstab = root.path(FSTAB);
        let overlays = fs::read_to_string(&fstab)
            .map(|content| {
                let (_, managed) = strip_block(&content, BLOCK_BEGIN, BLOCK_END);
                managed.into_iter().filter_map(parse_fstab_line).collect()
            })
            .unwrap_or_default();
        Self {
            root,
            runner,
            reserve_fraction,
            overlays,
            backups: BackupLedger::new(),
        }
    }

    /// Committed overlays, ordered by path.
    pub fn overlays(&self) -> Vec<OverlayMount> {
        self.overlays
            .iter()
            .map(|(path, size)| OverlayMount::new(path.clone(), *size))
            .collect()
    }

    /// Sum of all committed overlay limits.
    pub fn total_reserved(&self) -> u64 {
        self.overlays.values().sum()
    }

    fn is_mounted(&self, path: &Path) -> bool {
        let target = self.root.path(path);
        fs::read_to_string(self.root.path("/proc/mounts"))
            .map(|raw| {
                raw.lines().any(|l| {
                    let mut fields = l.split_whitespace().skip(1);
                    fields.next().map(Path::new) == Some(target.as_path())
                        && fields.next() == Some("tmpfs")
                })
            })
            .unwrap_or(false)
    }

    /// Mount (or resize) a tmpfs overlay at `path` and persist it.
    ///
    /// # Errors
    ///
    /// [`ProvisionError::InsufficientMemory`] if the reservation would eat
    /// into the reserved free fraction; nothing is mounted and the committed
    /// total is unchanged.
    pub fn mount_overlay(
        &mut self,
        path: impl AsRef<Path>,
        size_limit: u64,
    ) -> Result<OverlayMount, ProvisionError> {
        let path = path.as_ref();
        let mount = OverlayMount::new(path, size_limit);

        let mem = MemoryInfo::read(&self.root)?;
        let budget = (mem.total_bytes as f64 * (1.0 - self.reserve_fraction)) as u64;
        // A remount replaces the path's previous reservation.
        let others: u64 = self
            .overlays
            .iter()
            .filter(|(p, _)| p.as_path() != path)
            .map(|(_, s)| s)
            .sum();
        let needed = mem.committed() + others + size_limit;
        if needed > budget {
            return Err(ProvisionError::InsufficientMemory {
                requested: size_limit,
                limit: budget.saturating_sub(mem.committed() + others),
                detail: format!(
                    "{} bytes committed + {others} reserved by overlays; {:.0}% of RAM must stay free",
                    mem.committed(),
                    self.reserve_fraction * 100.0
                ),
            });
        }

        let target = self.root.path(path);
        let target_str = target.display().to_string();
        if self.is_mounted(path) {
            let opts = format!("remount,{}", mount.options());
            self.runner.run("mount", &["-o", &opts, &target_str])?;
        } else {
            fs::create_dir_all(&target).map_err(|e| ProvisionError::io(&target, e))?;
            self.runner
                .run("mount", &["-t", "tmpfs", "-o", &mount.options(), "tmpfs", &target_str])?;
        }
        let previous = self.overlays.insert(path.to_path_buf(), size_limit);

        if let Err(e) = self.persist() {
            error!(path = %path.display(), error = %e, "cannot record overlay in fstab; undoing mount");
            let undone = match previous {
                Some(size) => {
                    self.overlays.insert(path.to_path_buf(), size);
                    let opts = format!("remount,{}", OverlayMount::new(path, size).options());
                    self.runner.run("mount", &["-o", &opts, &target_str])
                }
                None => {
                    self.overlays.remove(path);
                    self.runner.run("umount", &[&target_str])
                }
            };
            if let Err(undo) = undone {
                warn!(path = %path.display(), error = %undo, "overlay left mounted but unrecorded");
            }
            return Err(e);
        }

        info!(
            path = %path.display(),
            size_limit,
            total_reserved = self.total_reserved(),
            "overlay mounted"
        );
        Ok(mount)
    }

    /// Unmount `path`, release its reservation and drop it from the mount
    /// table. Returns `false` if `path` was not a committed overlay.
    pub fn unmount_overlay(&mut self, path: impl AsRef<Path>) -> Result<bool, ProvisionError> {
        let path = path.as_ref();
        if !self.overlays.contains_key(path) {
            warn!(path = %path.display(), "not a managed overlay");
            return Ok(false);
        }
        if self.is_mounted(path) {
            let target = self.root.path(path).display().to_string();
            self.runner.run("umount", &[&target])?;
        }
        self.overlays.remove(path);
        self.persist()?;
        info!(path = %path.display(), total_reserved = self.total_reserved(), "overlay removed");
        Ok(true)
    }

    fn persist(&mut self) -> Result<(), ProvisionError> {
        let mut doc = Document::open(self.root.path(FSTAB))?;
        let (outside, _) = strip_block(doc.content(), BLOCK_BEGIN, BLOCK_END);
        // Foreign entries for a managed mount point would shadow ours.
        let kept: Vec<&str> = outside
            .into_iter()
            .filter(|line| {
                line.trim_start().starts_with('#')
                    || line
                        .split_whitespace()
                        .nth(1)
                        .is_none_or(|mp| !self.overlays.contains_key(Path::new(mp)))
            })
            .collect();
        let body: Vec<String> = self.overlays().iter().map(fstab_line).collect();
        let rendered = append_block(&kept, BLOCK_BEGIN, BLOCK_END, &body);
        doc.commit(rendered, &mut self.backups)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::RecordingRunner;

    const MIB: u64 = 1024 * 1024;
    const FSTAB_BASE: &str = "proc /proc proc defaults 0 0\nPARTUUID=1234-02 / ext4 defaults,noatime 0 1\n";

    fn host(total_mb: u64, available_mb: u64) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("proc")).unwrap();
        fs::create_dir_all(dir.path().join("etc")).unwrap();
        fs::write(
            dir.path().join("proc/meminfo"),
            format!(
                "MemTotal: {} kB\nMemAvailable: {} kB\n",
                total_mb * 1024,
                available_mb * 1024
            ),
        )
        .unwrap();
        fs::write(dir.path().join("proc/mounts"), "").unwrap();
        fs::write(dir.path().join("etc/fstab"), FSTAB_BASE).unwrap();
        dir
    }

    fn provisioner(root: &Path) -> (TmpfsProvisioner, Arc<RecordingRunner>) {
        let runner = Arc::new(RecordingRunner::new());
        let tmpfs = TmpfsProvisioner::new(HostRoot::new(root), runner.clone(), DEFAULT_RESERVE_FRACTION);
        (tmpfs, runner)
    }

    #[test]
    fn second_overlay_exceeding_budget_is_refused() {
        // 416 MB total, 200 MB already committed.
        let dir = host(416, 216);
        let (mut tmpfs, runner) = provisioner(dir.path());

        tmpfs.mount_overlay("/tmp", 64 * MIB).unwrap();
        let err = tmpfs.mount_overlay("/data-tmp", 300 * MIB).unwrap_err();

        assert!(matches!(err, ProvisionError::InsufficientMemory { requested, .. } if requested == 300 * MIB));
        assert_eq!(tmpfs.total_reserved(), 64 * MIB);
        assert_eq!(tmpfs.overlays(), vec![OverlayMount::new("/tmp", 64 * MIB)]);
        assert_eq!(runner.calls_starting_with("mount").len(), 1);
        let fstab = fs::read_to_string(dir.path().join("etc/fstab")).unwrap();
        assert!(fstab.contains("tmpfs /tmp tmpfs noatime,nosuid,size=64m 0 0\n"));
        assert!(!fstab.contains("/data-tmp"));
    }

    #[test]
    fn remount_replaces_reservation() {
        let dir = host(1024, 768);
        let (mut tmpfs, runner) = provisioner(dir.path());
        tmpfs.mount_overlay("/tmp", 64 * MIB).unwrap();
        let target = dir.path().join("tmp");
        fs::write(
            dir.path().join("proc/mounts"),
            format!("tmpfs {} tmpfs rw,nosuid,noatime,size=65536k 0 0\n", target.display()),
        )
        .unwrap();

        tmpfs.mount_overlay("/tmp", 128 * MIB).unwrap();
        assert_eq!(tmpfs.total_reserved(), 128 * MIB);
        assert_eq!(runner.calls_starting_with("mount -o remount").len(), 1);
        let fstab = fs::read_to_string(dir.path().join("etc/fstab")).unwrap();
        assert_eq!(fstab.matches(" /tmp ").count(), 1);
        assert!(fstab.contains("size=128m"));
    }

    #[test]
    fn persisted_overlays_count_on_next_run() {
        let dir = host(416, 216);
        {
            let (mut tmpfs, _) = provisioner(dir.path());
            tmpfs.mount_overlay("/tmp", 64 * MIB).unwrap();
        }
        let (mut tmpfs, _) = provisioner(dir.path());
        assert_eq!(tmpfs.total_reserved(), 64 * MIB);
        assert!(tmpfs.mount_overlay("/var/log", 64 * MIB).is_err());
    }

    #[test]
    fn unmount_releases_reservation_and_fstab_line() {
        let dir = host(1024, 768);
        let (mut tmpfs, _) = provisioner(dir.path());
        tmpfs.mount_overlay("/tmp", 64 * MIB).unwrap();
        tmpfs.mount_overlay("/var/log", 32 * MIB).unwrap();

        assert!(tmpfs.unmount_overlay("/tmp").unwrap());
        assert!(!tmpfs.unmount_overlay("/tmp").unwrap());
        assert_eq!(tmpfs.total_reserved(), 32 * MIB);
        let fstab = fs::read_to_string(dir.path().join("etc/fstab")).unwrap();
        assert!(!fstab.contains(" /tmp "));
        assert!(fstab.starts_with(FSTAB_BASE));
    }

    #[test]
    fn foreign_entry_for_managed_mount_point_is_replaced() {
        let dir = host(1024, 768);
        fs::write(
            dir.path().join("etc/fstab"),
            format!("{FSTAB_BASE}tmpfs /tmp tmpfs defaults,size=16m 0 0\n"),
        )
        .unwrap();
        let (mut tmpfs, _) = provisioner(dir.path());
        tmpfs.mount_overlay("/tmp", 64 * MIB).unwrap();
        let fstab = fs::read_to_string(dir.path().join("etc/fstab")).unwrap();
        assert!(!fstab.contains("size=16m"));
        assert_eq!(fstab.matches(" /tmp ").count(), 1);
    }

    #[test]
    fn unrecorded_mount_is_undone() {
        let dir = host(1024, 768);
        fs::remove_file(dir.path().join("etc/fstab")).unwrap();
        let (mut tmpfs, runner) = provisioner(dir.path());

        let err = tmpfs.mount_overlay("/tmp", 64 * MIB).unwrap_err();
        assert!(matches!(err, ProvisionError::ConfigWrite { .. }));
        let target = dir.path().join("tmp").display().to_string();
        assert_eq!(runner.calls_starting_with("umount"), vec![format!("umount {target}")]);
        assert_eq!(tmpfs.total_reserved(), 0);
        assert!(tmpfs.overlays().is_empty());
    }

    #[test]
    fn size_values_parse() {
        assert_eq!(parse_size("64m"), Some(64 * MIB));
        assert_eq!(parse_size("1G"), Some(1024 * MIB));
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size("10%"), None);
    }
}
