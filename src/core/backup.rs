/// World backups and restores
///
/// A backup pauses world saving through the server console, flushes, archives the
/// instance data directory as a gzipped tarball and resumes saving. Saving is resumed
/// on every path out of `create_backup`, including archive failures.
///
/// Archives are first written as `<name>.tar.gz.partial` and renamed once complete, so a
/// half-written archive is never listed. Restores take a `pre_restore_*` snapshot of the
/// live data before replacing it; the snapshot is left in place if the restore fails.
/// A snapshot never overwrites an earlier one.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::ffi::OsString;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::core::console::ConsoleTarget;
use crate::utils::{
    absolute, is_safe_file_name, timestamp_slug, AppConfig, BACKUP_EXTENSION, CMD_SAVE_FLUSH, CMD_SAVE_OFF,
    CMD_SAVE_ON, SAFETY_BACKUP_PREFIX,
};

#[derive(Debug, Clone, PartialEq)]
pub struct BackupArtifact {
    /// File name without the archive extension
    pub name: String,
    /// Absolute location of the archive
    pub path: PathBuf,
    pub size: u64,
    /// Gzip compressed tarball
    pub compressed: bool,
    pub created_at: DateTime<Utc>,
}

pub struct BackupManager {
    servers_dir: PathBuf,
    backups_dir: PathBuf,
    flush_delay: Duration,
}

impl BackupManager {
    /// Relative directories are resolved against the current directory
    pub fn new(servers_dir: &Path, backups_dir: &Path, flush_delay: Duration) -> Result<Self> {
        Ok(Self {
            servers_dir: absolute(servers_dir)?,
            backups_dir: absolute(backups_dir)?,
            flush_delay,
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Self::new(&config.servers_dir(), &config.backups_dir(), config.flush_delay())
    }

    pub fn data_dir(&self, instance_id: &str) -> PathBuf {
        self.servers_dir.join(instance_id).join("data")
    }

    pub fn backup_dir(&self, instance_id: &str) -> PathBuf {
        self.backups_dir.join(instance_id)
    }

    /// Archive the live world of a running server. `label` names the archive,
    /// otherwise `<name>_<timestamp>` is used.
    pub async fn create_backup(
        &self,
        instance_id: &str,
        name: &str,
        console: &ConsoleTarget,
        label: Option<&str>,
    ) -> Option<PathBuf> {
        let paused = console
            .session(|c| {
                Box::pin(async move {
                    c.send_command(CMD_SAVE_OFF).await.is_some()
                        && c.send_command(CMD_SAVE_FLUSH).await.is_some()
                })
            })
            .await
            .unwrap_or(false);

        if !paused {
            warn!(instance = instance_id, "could not pause saving, archiving anyway");
        }

        // No acknowledgement for the flush, give it time to land on disk
        tokio::time::sleep(self.flush_delay).await;

        let result = match archive_name(label, name, Utc::now()) {
            Ok(archive) => {
                let target = self.backup_dir(instance_id).join(archive);
                archive_dir(self.data_dir(instance_id), target).await
            }
            Err(e) => Err(e),
        };

        if console.execute(CMD_SAVE_ON).await.is_none() {
            error!(instance = instance_id, "failed to resume saving after backup");
        }

        match result {
            Ok(path) => {
                info!(instance = instance_id, path = %path.display(), "backup created");
                Some(path)
            }
            Err(e) => {
                error!(instance = instance_id, "Backup failed: {:#}", e);
                None
            }
        }
    }

    /// Replace the data directory with the contents of `archive`. The server must be
    /// stopped; that is the caller's responsibility.
    pub async fn restore_backup(&self, instance_id: &str, archive: &Path) -> bool {
        match self.try_restore(instance_id, archive).await {
            Ok(()) => {
                info!(instance = instance_id, archive = %archive.display(), "backup restored");
                true
            }
            Err(e) => {
                error!(instance = instance_id, "Restore failed: {:#}", e);
                false
            }
        }
    }

    async fn try_restore(&self, instance_id: &str, archive: &Path) -> Result<()> {
        if !archive.is_file() {
            bail!("archive {} does not exist", archive.display());
        }

        let data_dir = self.data_dir(instance_id);
        if !data_dir.is_dir() {
            bail!("data directory {} does not exist", data_dir.display());
        }
        // Clearing the data directory would delete the archive before it is read
        if archive.canonicalize()?.starts_with(data_dir.canonicalize()?) {
            bail!("archive {} lies inside the data directory", archive.display());
        }

        let snapshot = snapshot_path(&self.backup_dir(instance_id), Utc::now());
        let snapshot = archive_dir(data_dir.clone(), snapshot)
            .await
            .context("safety snapshot failed, live data left untouched")?;
        info!(instance = instance_id, snapshot = %snapshot.display(), "safety snapshot taken");

        let archive = archive.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            clear_dir(&data_dir)?;
            unpack_archive(&archive, &data_dir)
        })
        .await
        .context("restore task panicked")?
        .with_context(|| format!("data replaced only partially, snapshot kept at {}", snapshot.display()))
    }

    pub async fn delete_backup(&self, path: &Path) -> bool {
        if !path.to_string_lossy().ends_with(BACKUP_EXTENSION) {
            warn!(path = %path.display(), "refusing to delete a non-archive file");
            return false;
        }

        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                info!(path = %path.display(), "backup deleted");
                true
            }
            Err(e) => {
                error!(path = %path.display(), "Failed to delete backup: {}", e);
                false
            }
        }
    }

    /// Finished archives of one instance, newest first
    pub async fn list_backups(&self, instance_id: &str) -> Vec<BackupArtifact> {
        let dir = self.backup_dir(instance_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut artifacts = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let file_name = entry.file_name().to_string_lossy().to_string();
            let Some(name) = file_name.strip_suffix(BACKUP_EXTENSION) else {
                continue;
            };

            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }

            let created = metadata.created().or_else(|_| metadata.modified());
            artifacts.push(BackupArtifact {
                name: name.to_string(),
                path: entry.path(),
                size: metadata.len(),
                compressed: true,
                created_at: created.map(DateTime::<Utc>::from).unwrap_or_default(),
            });
        }

        artifacts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.name.cmp(&a.name)));
        artifacts
    }
}

/// Archive file name for a backup
fn archive_name(label: Option<&str>, name: &str, at: DateTime<Utc>) -> Result<String> {
    let stem = match label.map(str::trim).filter(|l| !l.is_empty()) {
        Some(label) => label.to_string(),
        None => format!("{}_{}", slug(name), timestamp_slug(at)),
    };

    if !is_safe_file_name(&stem) {
        bail!("invalid backup label: {:?}", stem);
    }
    Ok(format!("{}{}", stem, BACKUP_EXTENSION))
}

/// First free `pre_restore_<timestamp>[_N].tar.gz` in `dir`
fn snapshot_path(dir: &Path, at: DateTime<Utc>) -> PathBuf {
    let stem = format!("{}_{}", SAFETY_BACKUP_PREFIX, timestamp_slug(at));
    let mut path = dir.join(format!("{}{}", stem, BACKUP_EXTENSION));
    let mut n = 1;
    while path.exists() || partial_path(&path).exists() {
        path = dir.join(format!("{}_{}{}", stem, n, BACKUP_EXTENSION));
        n += 1;
    }
    path
}

fn slug(name: &str) -> String {
    let slug: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    if slug.is_empty() {
        "backup".to_string()
    } else {
        slug
    }
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = OsString::from(target.as_os_str());
    name.push(".partial");
    PathBuf::from(name)
}

/// Archive the contents of `source` (rooted at `.`) into `target`
async fn archive_dir(source: PathBuf, target: PathBuf) -> Result<PathBuf> {
    tokio::task::spawn_blocking(move || -> Result<PathBuf> {
        write_archive(&source, &target)?;
        Ok(target)
    })
    .await
    .context("archive task panicked")?
}

fn write_archive(source: &Path, target: &Path) -> Result<()> {
    if !source.is_dir() {
        bail!("data directory {} does not exist", source.display());
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let partial = partial_path(target);
    let written = (|| -> Result<()> {
        let file = File::create(&partial)
            .with_context(|| format!("Failed to create {}", partial.display()))?;
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        builder.follow_symlinks(false);
        builder
            .append_dir_all(".", source)
            .with_context(|| format!("Failed to archive {}", source.display()))?;
        let file = builder.into_inner()?.finish()?;
        file.sync_all()?;
        Ok(())
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&partial);
        return Err(e);
    }

    fs::rename(&partial, target)
        .with_context(|| format!("Failed to move archive into place at {}", target.display()))
}

/// Remove everything inside `dir`, keeping the directory itself (it is bind mounted)
fn clear_dir(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        }
        .with_context(|| format!("Failed to remove {}", path.display()))?;
    }
    Ok(())
}

fn unpack_archive(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive).with_context(|| format!("Failed to open {}", archive.display()))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive.set_preserve_permissions(true);
    archive
        .unpack(dest)
        .with_context(|| format!("Failed to extract into {}", dest.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::console::test_support::{self, FakeConsole};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn manager(root: &TempDir) -> BackupManager {
        BackupManager::new(
            &root.path().join("servers"),
            &root.path().join("backups"),
            Duration::ZERO,
        )
        .unwrap()
    }

    async fn console() -> FakeConsole {
        test_support::spawn("secret", |command| match command {
            "save-off" => "Automatic saving is now disabled".to_string(),
            "save-all flush" => "Saved the game".to_string(),
            "save-on" => "Automatic saving is now enabled".to_string(),
            _ => String::new(),
        })
        .await
    }

    fn seed_world(dir: &Path) {
        fs::create_dir_all(dir.join("world/region")).unwrap();
        fs::write(dir.join("server.properties"), "motd=hello\n").unwrap();
        fs::write(dir.join("world/level.dat"), [0u8, 1, 2, 3, 255]).unwrap();
        fs::write(dir.join("world/region/r.0.0.mca"), vec![7u8; 4096]).unwrap();
        fs::create_dir_all(dir.join("logs")).unwrap();
    }

    fn read_tree(root: &Path) -> BTreeMap<PathBuf, Option<Vec<u8>>> {
        fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Option<Vec<u8>>>) {
            for entry in fs::read_dir(dir).unwrap() {
                let path = entry.unwrap().path();
                let rel = path.strip_prefix(root).unwrap().to_path_buf();
                if path.is_dir() {
                    out.insert(rel, None);
                    walk(root, &path, out);
                } else {
                    out.insert(rel, Some(fs::read(&path).unwrap()));
                }
            }
        }
        let mut out = BTreeMap::new();
        walk(root, root, &mut out);
        out
    }

    #[tokio::test]
    async fn test_backup_then_restore_reproduces_tree() {
        let root = TempDir::new().unwrap();
        let backups = manager(&root);
        let data = backups.data_dir("srv");
        seed_world(&data);
        let original = read_tree(&data);

        let console = console().await;
        let archive = backups
            .create_backup("srv", "Survival World", &console.target("secret"), None)
            .await
            .expect("backup should succeed");

        assert!(archive.starts_with(backups.backup_dir("srv")));
        let file_name = archive.file_name().unwrap().to_string_lossy().to_string();
        assert!(file_name.starts_with("Survival_World_"));
        assert!(file_name.ends_with(".tar.gz"));
        assert!(!partial_path(&archive).exists());

        fs::write(data.join("server.properties"), "motd=changed\n").unwrap();
        fs::write(data.join("stray.txt"), "new file").unwrap();
        fs::remove_file(data.join("world/level.dat")).unwrap();

        assert!(backups.restore_backup("srv", &archive).await);
        assert_eq!(read_tree(&data), original);

        let listed = backups.list_backups("srv").await;
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().any(|b| b.name.starts_with("pre_restore_")));
    }

    #[tokio::test]
    async fn test_save_commands_in_order() {
        let root = TempDir::new().unwrap();
        let backups = manager(&root);
        seed_world(&backups.data_dir("srv"));

        let console = console().await;
        let archive = backups
            .create_backup("srv", "world", &console.target("secret"), Some("nightly"))
            .await
            .unwrap();

        assert_eq!(archive, backups.backup_dir("srv").join("nightly.tar.gz"));
        assert_eq!(console.commands(), vec!["save-off", "save-all flush", "save-on"]);
    }

    #[tokio::test]
    async fn test_saving_resumed_when_archival_fails() {
        let root = TempDir::new().unwrap();
        let backups = manager(&root);

        let console = console().await;
        let result = backups
            .create_backup("missing", "world", &console.target("secret"), None)
            .await;

        assert!(result.is_none());
        assert_eq!(console.commands(), vec!["save-off", "save-all flush", "save-on"]);
        assert!(backups.list_backups("missing").await.is_empty());
    }

    #[tokio::test]
    async fn test_unsafe_label_rejected_and_saving_resumed() {
        let root = TempDir::new().unwrap();
        let backups = manager(&root);
        seed_world(&backups.data_dir("srv"));

        let console = console().await;
        let result = backups
            .create_backup("srv", "world", &console.target("secret"), Some("../escape"))
            .await;

        assert!(result.is_none());
        assert_eq!(console.commands().last().map(String::as_str), Some("save-on"));
    }

    #[tokio::test]
    async fn test_restore_missing_archive_keeps_data() {
        let root = TempDir::new().unwrap();
        let backups = manager(&root);
        let data = backups.data_dir("srv");
        seed_world(&data);
        let original = read_tree(&data);

        let missing = backups.backup_dir("srv").join("nope.tar.gz");
        assert!(!backups.restore_backup("srv", &missing).await);
        assert_eq!(read_tree(&data), original);
        assert!(backups.list_backups("srv").await.is_empty());
    }

    #[tokio::test]
    async fn test_list_ignores_partial_and_foreign_files() {
        let root = TempDir::new().unwrap();
        let backups = manager(&root);
        seed_world(&backups.data_dir("srv"));
        let console = console().await;
        let target = console.target("secret");

        let first = backups.create_backup("srv", "w", &target, Some("first")).await.unwrap();
        std::thread::sleep(Duration::from_millis(20));
        backups.create_backup("srv", "w", &target, Some("second")).await.unwrap();

        let dir = backups.backup_dir("srv");
        fs::write(dir.join("third.tar.gz.partial"), b"half").unwrap();
        fs::write(dir.join("notes.txt"), b"hi").unwrap();

        let names: Vec<String> = backups.list_backups("srv").await.into_iter().map(|b| b.name).collect();
        assert_eq!(names, vec!["second", "first"]);

        assert!(backups.delete_backup(&first).await);
        assert!(!backups.delete_backup(&first).await);
        assert!(!backups.delete_backup(&dir.join("notes.txt")).await);
        assert_eq!(backups.list_backups("srv").await.len(), 1);
    }

    #[tokio::test]
    async fn test_relative_root_yields_absolute_paths() {
        let root = TempDir::new_in(".").unwrap();
        let relative = PathBuf::from(root.path().file_name().unwrap());
        let backups =
            BackupManager::new(&relative.join("servers"), &relative.join("backups"), Duration::ZERO)
                .unwrap();
        seed_world(&backups.data_dir("srv"));

        let console = console().await;
        let archive = backups
            .create_backup("srv", "world", &console.target("secret"), None)
            .await
            .unwrap();
        assert!(archive.is_absolute());

        let listed = backups.list_backups("srv").await;
        assert_eq!(listed.len(), 1);
        assert!(listed[0].path.is_absolute());
        assert!(listed[0].compressed);
        assert_eq!(listed[0].size, fs::metadata(&archive).unwrap().len());
    }

    #[tokio::test]
    async fn test_back_to_back_restores_keep_every_snapshot() {
        let root = TempDir::new().unwrap();
        let backups = manager(&root);
        seed_world(&backups.data_dir("srv"));

        let console = console().await;
        let archive = backups
            .create_backup("srv", "world", &console.target("secret"), Some("base"))
            .await
            .unwrap();

        assert!(backups.restore_backup("srv", &archive).await);
        assert!(backups.restore_backup("srv", &archive).await);

        let snapshots = backups
            .list_backups("srv")
            .await
            .into_iter()
            .filter(|b| b.name.starts_with("pre_restore_"))
            .count();
        assert_eq!(snapshots, 2);
    }

    #[test]
    fn test_snapshot_path_skips_taken_names() {
        let root = TempDir::new().unwrap();
        let at = DateTime::parse_from_rfc3339("2024-03-05T07:08:09Z")
            .unwrap()
            .with_timezone(&Utc);

        let first = snapshot_path(root.path(), at);
        assert_eq!(first, root.path().join("pre_restore_20240305_070809.tar.gz"));
        fs::write(&first, b"x").unwrap();

        let second = snapshot_path(root.path(), at);
        assert_eq!(second, root.path().join("pre_restore_20240305_070809_1.tar.gz"));
    }

    #[tokio::test]
    async fn test_archive_inside_data_dir_rejected() {
        let root = TempDir::new().unwrap();
        let backups = manager(&root);
        let data = backups.data_dir("srv");
        seed_world(&data);

        let console = console().await;
        let archive = backups
            .create_backup("srv", "world", &console.target("secret"), Some("inside"))
            .await
            .unwrap();
        let misplaced = data.join("inside.tar.gz");
        fs::copy(&archive, &misplaced).unwrap();
        let before = read_tree(&data);

        assert!(!backups.restore_backup("srv", &misplaced).await);
        assert_eq!(read_tree(&data), before);
    }

    #[test]
    fn test_archive_names() {
        let at = DateTime::parse_from_rfc3339("2024-03-05T07:08:09Z")
            .unwrap()
            .with_timezone(&Utc);

        assert_eq!(archive_name(None, "my world", at).unwrap(), "my_world_20240305_070809.tar.gz");
        assert_eq!(archive_name(Some("weekly"), "x", at).unwrap(), "weekly.tar.gz");
        assert_eq!(archive_name(Some("  "), "x", at).unwrap(), "x_20240305_070809.tar.gz");
        assert!(archive_name(Some("a/b"), "x", at).is_err());
    }
}
