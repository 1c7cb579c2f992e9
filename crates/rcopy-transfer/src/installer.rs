//! Receiver-side file installation.
//!
//! Incoming bytes go to a shadow file in the staging directory, named
//! `rcopy_<basename>_<timestamp>.tmp`. Only after the data loop completes is
//! it linked to its final path, so readers never observe a partial file.
//! Installing never replaces an existing file.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Local};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::TransferError;

const SHADOW_PREFIX: &str = "rcopy_";

/// Give up on finding a free shadow name after this many suffixes.
const MAX_NAME_ATTEMPTS: u32 = 10_000;

/// Maps wire names to final paths on the receiving side.
pub trait Destination: Send + Sync {
    /// Final path for a received file. `InvalidName` rejects the file.
    fn resolve(&self, relative_name: &str) -> Result<PathBuf, TransferError>;

    /// Directory that holds shadow files while data arrives.
    fn staging_dir(&self) -> &Path;
}

/// Creates shadow files in one staging directory.
pub struct FileInstaller {
    staging_dir: PathBuf,
    #[cfg(test)]
    write_limit: Option<u64>,
}

impl FileInstaller {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            #[cfg(test)]
            write_limit: None,
        }
    }

    /// Shadow files from this installer fail any write past `bytes`.
    #[cfg(test)]
    pub(crate) fn fail_writes_after(&mut self, bytes: u64) {
        self.write_limit = Some(bytes);
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Open a fresh shadow file that will later be promoted to `final_path`.
    pub async fn begin(&self, final_path: PathBuf) -> Result<ShadowFile, TransferError> {
        fs::create_dir_all(&self.staging_dir).await?;
        let prefix = shadow_prefix(&final_path, Local::now());
        let (temp_path, file) = open_unique(&self.staging_dir, &prefix).await?;
        debug!("shadow file = '{}'", temp_path.display());
        Ok(ShadowFile {
            temp_path,
            final_path,
            file: Some(file),
            written: 0,
            keep: false,
            #[cfg(test)]
            write_limit: self.write_limit,
        })
    }
}

/// `rcopy_<basename>_<yyyy-MMdd_HHMMSS-micros>`, without extension.
pub fn shadow_prefix(final_path: &Path, now: DateTime<Local>) -> String {
    let base = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".into());
    format!("{}{}_{}", SHADOW_PREFIX, base, now.format("%Y-%m%d_%H%M%S-%6f"))
}

/// Create `<prefix>.tmp`, or `<prefix>.<n>.tmp` for the first free `n`.
/// Create-new semantics: an existing file is never opened or truncated.
pub(crate) async fn open_unique(dir: &Path, prefix: &str) -> Result<(PathBuf, File), TransferError> {
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let name = if attempt == 0 {
            format!("{}.tmp", prefix)
        } else {
            format!("{}.{}.tmp", prefix, attempt)
        };
        let candidate = dir.join(name);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(file) => return Ok((candidate, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free shadow name for '{}'", prefix),
    )
    .into())
}

/// Staging file for one incoming file.
///
/// Dropped without `promote`, the temp file is deleted. After a completed
/// data phase the bytes are kept even if the install fails.
pub struct ShadowFile {
    temp_path: PathBuf,
    final_path: PathBuf,
    file: Option<File>,
    written: u64,
    keep: bool,
    #[cfg(test)]
    write_limit: Option<u64>,
}

impl ShadowFile {
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("shadow file already closed"))?;
        #[cfg(test)]
        if self
            .write_limit
            .is_some_and(|limit| self.written + data.len() as u64 > limit)
        {
            return Err(io::Error::new(io::ErrorKind::StorageFull, "write limit reached"));
        }
        file.write_all(data).await?;
        self.written += data.len() as u64;
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }

    /// Move into place and apply `mtime` (unix seconds, 0 = leave as is).
    ///
    /// Fails with `InstallConflict` if the final path already exists; the
    /// shadow file is then left where it is.
    pub async fn promote(mut self, mtime: i64) -> Result<PathBuf, TransferError> {
        self.close().await?;
        self.keep = true;

        if let Some(parent) = self.final_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        match install_no_replace(&self.temp_path, &self.final_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(TransferError::InstallConflict {
                    target: self.final_path.clone(),
                    shadow: self.temp_path.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        if mtime != 0 {
            if let Err(e) = set_mtime(&self.final_path, mtime).await {
                warn!("Cannot set mtime on '{}': {}", self.final_path.display(), e);
            }
        } else {
            debug!("Skip zero mtime for '{}'", self.final_path.display());
        }
        Ok(self.final_path.clone())
    }

    /// Close and delete the shadow file.
    pub async fn abandon(mut self) {
        let _ = self.close().await;
        self.keep = true;
        if let Err(e) = fs::remove_file(&self.temp_path).await {
            warn!("Cannot remove shadow file '{}': {}", self.temp_path.display(), e);
        }
    }
}

impl Drop for ShadowFile {
    fn drop(&mut self) {
        if !self.keep {
            self.file.take();
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

/// Link `temp` at `target`, then drop the temp name. The link fails with
/// `AlreadyExists` instead of replacing, so two connections installing the
/// same name cannot clobber each other.
async fn install_no_replace(temp: &Path, target: &Path) -> io::Result<()> {
    match fs::hard_link(temp, target).await {
        Ok(()) => {
            if let Err(e) = fs::remove_file(temp).await {
                warn!("Cannot remove shadow file '{}': {}", temp.display(), e);
            }
            Ok(())
        }
        // No hard links on this filesystem: checked rename.
        Err(e) if e.kind() == io::ErrorKind::Unsupported => {
            if fs::try_exists(target).await? {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("'{}' exists", target.display()),
                ));
            }
            fs::rename(temp, target).await
        }
        Err(e) => Err(e),
    }
}

fn unix_time(secs: i64) -> Option<SystemTime> {
    if secs >= 0 {
        UNIX_EPOCH.checked_add(Duration::from_secs(secs as u64))
    } else {
        UNIX_EPOCH.checked_sub(Duration::from_secs(secs.unsigned_abs()))
    }
}

async fn set_mtime(path: &Path, secs: i64) -> io::Result<()> {
    let when = unix_time(secs)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("mtime {} out of range", secs)))?;
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::OpenOptions::new().write(true).open(&path)?;
        file.set_modified(when)
    })
    .await
    .map_err(io::Error::other)?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shadow_name_collision_picks_next_suffix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("rcopy_a.bin_x.tmp"), b"first").unwrap();
        std::fs::write(dir.path().join("rcopy_a.bin_x.1.tmp"), b"second").unwrap();

        let (path, _file) = open_unique(dir.path(), "rcopy_a.bin_x").await.unwrap();
        assert_eq!(path, dir.path().join("rcopy_a.bin_x.2.tmp"));
        assert_eq!(std::fs::read(dir.path().join("rcopy_a.bin_x.tmp")).unwrap(), b"first");
        assert_eq!(std::fs::read(dir.path().join("rcopy_a.bin_x.1.tmp")).unwrap(), b"second");
    }

    #[test]
    fn test_shadow_prefix_uses_base_name() {
        let now = Local::now();
        let prefix = shadow_prefix(Path::new("out/sub/report.pdf"), now);
        assert!(prefix.starts_with("rcopy_report.pdf_"));
        assert!(!prefix.contains('/'));
    }

    #[tokio::test]
    async fn test_promote_creates_dirs_and_sets_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let installer = FileInstaller::new(dir.path());
        let target = dir.path().join("a/b/c.txt");

        let mut shadow = installer.begin(target.clone()).await.unwrap();
        let temp = shadow.temp_path().to_path_buf();
        assert!(temp.starts_with(dir.path()));
        shadow.write_chunk(b"hello ").await.unwrap();
        shadow.write_chunk(b"world").await.unwrap();
        assert_eq!(shadow.written(), 11);

        let installed = shadow.promote(1_600_000_000).await.unwrap();
        assert_eq!(installed, target);
        assert!(!temp.exists());
        assert_eq!(std::fs::read(&target).unwrap(), b"hello world");
        let modified = std::fs::metadata(&target).unwrap().modified().unwrap();
        assert_eq!(
            modified.duration_since(UNIX_EPOCH).unwrap().as_secs(),
            1_600_000_000
        );
    }

    #[tokio::test]
    async fn test_promote_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let installer = FileInstaller::new(dir.path());
        let target = dir.path().join("exists.txt");
        std::fs::write(&target, b"original").unwrap();

        let mut shadow = installer.begin(target.clone()).await.unwrap();
        shadow.write_chunk(b"incoming").await.unwrap();
        let temp = shadow.temp_path().to_path_buf();

        match shadow.promote(0).await {
            Err(TransferError::InstallConflict { target: t, shadow: s }) => {
                assert_eq!(t, target);
                assert_eq!(s, temp);
            }
            other => panic!("expected install conflict, got {:?}", other),
        }
        assert_eq!(std::fs::read(&target).unwrap(), b"original");
        assert_eq!(std::fs::read(&temp).unwrap(), b"incoming");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_promotes_install_exactly_one() {
        let dir = tempfile::tempdir().unwrap();
        let installer = FileInstaller::new(dir.path());

        for round in 0..100 {
            let target = dir.path().join(format!("same-{}.bin", round));
            let mut first = installer.begin(target.clone()).await.unwrap();
            first.write_chunk(b"AAAA").await.unwrap();
            let mut second = installer.begin(target.clone()).await.unwrap();
            second.write_chunk(b"BBBB").await.unwrap();

            let a = tokio::spawn(first.promote(0));
            let b = tokio::spawn(second.promote(0));
            let results = [a.await.unwrap(), b.await.unwrap()];

            let installed: Vec<_> = results.iter().filter(|r| r.is_ok()).collect();
            assert_eq!(installed.len(), 1, "round {}", round);
            let kept = results
                .iter()
                .find_map(|r| match r {
                    Err(TransferError::InstallConflict { shadow, .. }) => Some(shadow.clone()),
                    _ => None,
                })
                .unwrap_or_else(|| panic!("round {}: no install conflict", round));

            // the loser's bytes stay in its shadow, the winner's at the target
            let at_target = std::fs::read(&target).unwrap();
            let in_shadow = std::fs::read(&kept).unwrap();
            assert_ne!(at_target, in_shadow);
            assert!(at_target == b"AAAA" || at_target == b"BBBB");
            std::fs::remove_file(&kept).unwrap();
        }
    }

    #[tokio::test]
    async fn test_promote_leaves_no_shadow_behind() {
        let dir = tempfile::tempdir().unwrap();
        let installer = FileInstaller::new(dir.path());
        let mut shadow = installer.begin(dir.path().join("only.txt")).await.unwrap();
        shadow.write_chunk(b"x").await.unwrap();
        shadow.promote(0).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["only.txt"]);
    }

    #[tokio::test]
    async fn test_abandon_and_drop_remove_shadow() {
        let dir = tempfile::tempdir().unwrap();
        let installer = FileInstaller::new(dir.path());

        let shadow = installer.begin(dir.path().join("x")).await.unwrap();
        let temp = shadow.temp_path().to_path_buf();
        assert!(temp.exists());
        shadow.abandon().await;
        assert!(!temp.exists());

        let mut shadow = installer.begin(dir.path().join("y")).await.unwrap();
        shadow.write_chunk(b"partial").await.unwrap();
        let temp = shadow.temp_path().to_path_buf();
        drop(shadow);
        assert!(!temp.exists());
    }
}
