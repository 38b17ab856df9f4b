//! Periodic vault backups.
//!
//! Layout under the backups root:
//!
//! ```text
//! backups/<vaultId>/hourly/<YYYY-MM-DDTHH-MM-SS>/…
//! backups/<vaultId>/daily/<YYYY-MM-DD>/…
//! ```
//!
//! Directory names sort chronologically, so retention keeps the
//! lexicographically newest 24 hourly and 7 daily snapshots. A restore first
//! takes a `pre-restore-<now>` hourly safety snapshot of the live directory,
//! then replaces it with the chosen backup. The caller evicts the in-memory
//! doc afterwards so the next join reloads from disk.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;

/// Hourly snapshots kept per vault after pruning.
const HOURLY_RETENTION: usize = 24;
/// Daily snapshots kept per vault after pruning.
const DAILY_RETENTION: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    Hourly,
    Daily,
}

impl SnapshotKind {
    pub fn dir_name(&self) -> &'static str {
        match self {
            SnapshotKind::Hourly => "hourly",
            SnapshotKind::Daily => "daily",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hourly" => Some(SnapshotKind::Hourly),
            "daily" => Some(SnapshotKind::Daily),
            _ => None,
        }
    }
}

/// One existing snapshot on disk.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotInfo {
    pub vault_id: String,
    pub kind: SnapshotKind,
    pub timestamp: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("unknown vault: {0}")]
    UnknownVault(String),
    #[error("unknown snapshot: {0}")]
    UnknownSnapshot(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Copies vault directories into timestamped snapshots and back.
#[derive(Debug, Clone)]
pub struct BackupScheduler {
    vaults_dir: PathBuf,
    backups_dir: PathBuf,
}

impl BackupScheduler {
    pub fn new(vaults_dir: impl Into<PathBuf>, backups_dir: impl Into<PathBuf>) -> Self {
        Self {
            vaults_dir: vaults_dir.into(),
            backups_dir: backups_dir.into(),
        }
    }

    /// ISO-8601 UTC with colons replaced and sub-second precision dropped.
    fn hourly_stamp(now: DateTime<Utc>) -> String {
        now.format("%Y-%m-%dT%H-%M-%S").to_string()
    }

    fn daily_stamp(now: DateTime<Utc>) -> String {
        now.format("%Y-%m-%d").to_string()
    }

    fn kind_dir(&self, vault_id: &str, kind: SnapshotKind) -> PathBuf {
        self.backups_dir.join(vault_id).join(kind.dir_name())
    }

    /// One scheduler tick: snapshot every vault, then prune.
    ///
    /// Per vault: always take an hourly snapshot (replacing one with the same
    /// stamp); take a daily snapshot only when none exists for today.
    pub fn run_once(&self) -> Result<(), BackupError> {
        let now = Utc::now();
        for vault_id in self.live_vaults()? {
            if let Err(e) = self.snapshot_tick(&vault_id, now) {
                warn!(vault = %vault_id, error = %e, "backup tick failed");
            }
        }
        Ok(())
    }

    fn snapshot_tick(&self, vault_id: &str, now: DateTime<Utc>) -> Result<(), BackupError> {
        self.create_snapshot(vault_id, SnapshotKind::Hourly, &Self::hourly_stamp(now))?;

        let daily = self
            .kind_dir(vault_id, SnapshotKind::Daily)
            .join(Self::daily_stamp(now));
        if !daily.exists() {
            self.create_snapshot(vault_id, SnapshotKind::Daily, &Self::daily_stamp(now))?;
        }

        self.prune(vault_id)?;
        Ok(())
    }

    /// Take a snapshot with an explicit stamp. Existing daily snapshots are
    /// left intact by the tick; an existing hourly directory is replaced.
    pub fn create_snapshot(
        &self,
        vault_id: &str,
        kind: SnapshotKind,
        stamp: &str,
    ) -> Result<SnapshotInfo, BackupError> {
        let live = self.vaults_dir.join(vault_id);
        if !live.is_dir() {
            return Err(BackupError::UnknownVault(vault_id.to_string()));
        }

        let target = self.kind_dir(vault_id, kind).join(stamp);
        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        copy_dir_recursive(&live, &target)?;

        let info = SnapshotInfo {
            vault_id: vault_id.to_string(),
            kind,
            timestamp: stamp.to_string(),
            size_bytes: dir_size(&target)?,
            path: target,
        };
        info!(
            vault = vault_id,
            kind = kind.dir_name(),
            stamp,
            bytes = info.size_bytes,
            "created snapshot"
        );
        Ok(info)
    }

    /// On-demand snapshot, equivalent to a single hourly creation.
    pub fn manual_snapshot(&self, vault_id: &str) -> Result<SnapshotInfo, BackupError> {
        self.create_snapshot(vault_id, SnapshotKind::Hourly, &Self::hourly_stamp(Utc::now()))
    }

    /// Delete everything but the newest snapshots per kind.
    pub fn prune(&self, vault_id: &str) -> Result<(), BackupError> {
        self.prune_kind(vault_id, SnapshotKind::Hourly, HOURLY_RETENTION)?;
        self.prune_kind(vault_id, SnapshotKind::Daily, DAILY_RETENTION)?;
        Ok(())
    }

    fn prune_kind(
        &self,
        vault_id: &str,
        kind: SnapshotKind,
        keep: usize,
    ) -> Result<(), BackupError> {
        let mut stamps = self.snapshot_stamps(vault_id, kind)?;
        stamps.sort();
        stamps.reverse();
        for stamp in stamps.into_iter().skip(keep) {
            let path = self.kind_dir(vault_id, kind).join(&stamp);
            fs::remove_dir_all(&path)?;
            info!(vault = vault_id, kind = kind.dir_name(), stamp, "pruned snapshot");
        }
        Ok(())
    }

    /// All snapshots of a vault, newest first within each kind.
    pub fn list_snapshots(&self, vault_id: &str) -> Result<Vec<SnapshotInfo>, BackupError> {
        let mut snapshots = Vec::new();
        for kind in [SnapshotKind::Hourly, SnapshotKind::Daily] {
            let mut stamps = self.snapshot_stamps(vault_id, kind)?;
            stamps.sort();
            stamps.reverse();
            for stamp in stamps {
                let path = self.kind_dir(vault_id, kind).join(&stamp);
                snapshots.push(SnapshotInfo {
                    vault_id: vault_id.to_string(),
                    kind,
                    timestamp: stamp,
                    size_bytes: dir_size(&path)?,
                    path,
                });
            }
        }
        Ok(snapshots)
    }

    /// Replace the live vault directory with a chosen snapshot.
    ///
    /// The live directory (when present) is first copied into a
    /// `pre-restore-<now>` hourly snapshot, then removed and replaced.
    pub fn restore(
        &self,
        vault_id: &str,
        kind: SnapshotKind,
        stamp: &str,
    ) -> Result<(), BackupError> {
        let source = self.kind_dir(vault_id, kind).join(stamp);
        if !source.is_dir() {
            return Err(BackupError::UnknownSnapshot(format!(
                "{}/{}/{}",
                vault_id,
                kind.dir_name(),
                stamp
            )));
        }

        let live = self.vaults_dir.join(vault_id);
        if live.is_dir() {
            let safety = format!("pre-restore-{}", Self::hourly_stamp(Utc::now()));
            self.create_snapshot(vault_id, SnapshotKind::Hourly, &safety)?;
            fs::remove_dir_all(&live)?;
        }
        copy_dir_recursive(&source, &live)?;
        info!(vault = vault_id, kind = kind.dir_name(), stamp, "restored snapshot");
        Ok(())
    }

    fn live_vaults(&self) -> Result<Vec<String>, BackupError> {
        if !self.vaults_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.vaults_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn snapshot_stamps(
        &self,
        vault_id: &str,
        kind: SnapshotKind,
    ) -> Result<Vec<String>, BackupError> {
        let dir = self.kind_dir(vault_id, kind);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut stamps = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    stamps.push(name.to_string());
                }
            }
        }
        Ok(stamps)
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<(), std::io::Error> {
    for entry in WalkDir::new(src) {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields paths under its root");
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn dir_size(path: &Path) -> Result<u64, std::io::Error> {
    let mut total = 0;
    for entry in WalkDir::new(path) {
        let entry = entry?;
        if entry.file_type().is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, BackupScheduler) {
        let tmp = tempfile::tempdir().unwrap();
        let vaults = tmp.path().join("vaults");
        fs::create_dir_all(vaults.join("v4")).unwrap();
        fs::write(vaults.join("v4/x.md"), "1").unwrap();
        fs::write(vaults.join("v4/_state.ydoc"), [0u8; 4]).unwrap();
        let scheduler = BackupScheduler::new(vaults, tmp.path().join("backups"));
        (tmp, scheduler)
    }

    #[test]
    fn test_stamp_formats_sort_chronologically() {
        let early = DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let late = DateTime::parse_from_rfc3339("2026-01-02T13:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(BackupScheduler::hourly_stamp(early), "2026-01-02T03-04-05");
        assert_eq!(BackupScheduler::daily_stamp(early), "2026-01-02");
        assert!(BackupScheduler::hourly_stamp(early) < BackupScheduler::hourly_stamp(late));
    }

    #[test]
    fn test_tick_creates_hourly_and_daily() {
        let (tmp, scheduler) = setup();
        scheduler.run_once().unwrap();

        let snapshots = scheduler.list_snapshots("v4").unwrap();
        let hourly = snapshots
            .iter()
            .filter(|s| s.kind == SnapshotKind::Hourly)
            .count();
        let daily = snapshots
            .iter()
            .filter(|s| s.kind == SnapshotKind::Daily)
            .count();
        assert_eq!(hourly, 1);
        assert_eq!(daily, 1);

        // Snapshot content mirrors the live directory, snapshot file included.
        let first = &snapshots[0];
        assert_eq!(
            fs::read_to_string(first.path.join("x.md")).unwrap(),
            "1"
        );
        assert!(first.path.join("_state.ydoc").exists());
        drop(tmp);
    }

    #[test]
    fn test_daily_is_idempotent_per_day() {
        let (_tmp, scheduler) = setup();
        let now = Utc::now();
        scheduler.snapshot_tick("v4", now).unwrap();

        // Change the live file, run another tick the same day.
        fs::write(
            scheduler.vaults_dir.join("v4/x.md"),
            "changed",
        )
        .unwrap();
        scheduler.snapshot_tick("v4", now).unwrap();

        let daily = scheduler
            .kind_dir("v4", SnapshotKind::Daily)
            .join(BackupScheduler::daily_stamp(now));
        // Existing daily left intact: still holds the original content.
        assert_eq!(fs::read_to_string(daily.join("x.md")).unwrap(), "1");
    }

    #[test]
    fn test_retention_counts() {
        let (_tmp, scheduler) = setup();
        for hour in 0..30 {
            let stamp = format!("2026-07-01T{:02}-00-00", hour % 24);
            let stamp = if hour < 24 {
                stamp
            } else {
                format!("2026-07-02T{:02}-00-00", hour - 24)
            };
            scheduler
                .create_snapshot("v4", SnapshotKind::Hourly, &stamp)
                .unwrap();
        }
        for day in 1..=10 {
            scheduler
                .create_snapshot("v4", SnapshotKind::Daily, &format!("2026-07-{:02}", day))
                .unwrap();
        }

        scheduler.prune("v4").unwrap();

        let snapshots = scheduler.list_snapshots("v4").unwrap();
        let hourly: Vec<_> = snapshots
            .iter()
            .filter(|s| s.kind == SnapshotKind::Hourly)
            .collect();
        let daily: Vec<_> = snapshots
            .iter()
            .filter(|s| s.kind == SnapshotKind::Daily)
            .collect();
        assert_eq!(hourly.len(), HOURLY_RETENTION);
        assert_eq!(daily.len(), DAILY_RETENTION);
        // Newest survive.
        assert_eq!(daily[0].timestamp, "2026-07-10");
        assert_eq!(daily.last().unwrap().timestamp, "2026-07-04");
    }

    #[test]
    fn test_restore_with_safety_snapshot() {
        let (_tmp, scheduler) = setup();
        let snapshot = scheduler.manual_snapshot("v4").unwrap();

        // Overwrite the live file, then restore.
        fs::write(scheduler.vaults_dir.join("v4/x.md"), "2").unwrap();
        scheduler
            .restore("v4", SnapshotKind::Hourly, &snapshot.timestamp)
            .unwrap();

        assert_eq!(
            fs::read_to_string(scheduler.vaults_dir.join("v4/x.md")).unwrap(),
            "1"
        );

        // A pre-restore snapshot holds the overwritten state.
        let pre: Vec<_> = scheduler
            .list_snapshots("v4")
            .unwrap()
            .into_iter()
            .filter(|s| s.timestamp.starts_with("pre-restore-"))
            .collect();
        assert_eq!(pre.len(), 1);
        assert_eq!(fs::read_to_string(pre[0].path.join("x.md")).unwrap(), "2");
    }

    #[test]
    fn test_restore_unknown_snapshot() {
        let (_tmp, scheduler) = setup();
        assert!(matches!(
            scheduler.restore("v4", SnapshotKind::Hourly, "2020-01-01T00-00-00"),
            Err(BackupError::UnknownSnapshot(_))
        ));
    }

    #[test]
    fn test_snapshot_unknown_vault() {
        let (_tmp, scheduler) = setup();
        assert!(matches!(
            scheduler.manual_snapshot("nope"),
            Err(BackupError::UnknownVault(_))
        ));
    }
}
