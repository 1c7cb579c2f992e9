//! Maps announced file names to paths under the output directory.

use std::path::{Component, Path, PathBuf};

use rcopy_transfer::{Destination, TransferError};

use crate::allow::ConfigError;

/// Output root plus the `--keep-dir` policy.
///
/// With `keep_dir` the sender's relative directories are recreated under the
/// root; without it every file lands directly in the root under its base
/// name. Shadow files are staged in the root either way, so the final link
/// never crosses a filesystem.
#[derive(Debug, Clone)]
pub struct OutputTree {
    root: PathBuf,
    keep_dir: bool,
}

impl OutputTree {
    /// `root` must already exist and be a directory.
    pub fn new(root: impl Into<PathBuf>, keep_dir: bool) -> Result<Self, ConfigError> {
        let root = root.into();
        let shown = root.display().to_string();
        let meta = std::fs::metadata(&root).map_err(|_| ConfigError::MissingOutDir(shown.clone()))?;
        if !meta.is_dir() {
            return Err(ConfigError::NotADirectory(shown));
        }
        Ok(Self { root, keep_dir })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn keep_dir(&self) -> bool {
        self.keep_dir
    }
}

fn invalid(name: &str, reason: &str) -> TransferError {
    TransferError::InvalidName(format!("'{}': {}", name, reason))
}

impl Destination for OutputTree {
    fn resolve(&self, relative_name: &str) -> Result<PathBuf, TransferError> {
        // Senders on any platform: accept both separators.
        let normalized = relative_name.replace('\\', "/");
        if normalized.contains('\0') {
            return Err(invalid(relative_name, "contains NUL"));
        }

        let segments: Vec<&str> = normalized
            .split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .collect();
        let Some(base) = segments.last().copied() else {
            return Err(invalid(relative_name, "no file name"));
        };

        if !self.keep_dir {
            if base == ".." {
                return Err(invalid(relative_name, "no file name"));
            }
            return Ok(self.root.join(base));
        }

        if normalized.starts_with('/') {
            return Err(invalid(relative_name, "absolute path"));
        }
        let mut path = self.root.clone();
        for segment in segments {
            if segment == ".." {
                return Err(invalid(relative_name, "parent directory reference"));
            }
            // drive prefixes such as `C:`
            if segment.contains(':') {
                return Err(invalid(relative_name, "drive or stream prefix"));
            }
            let mut components = Path::new(segment).components();
            match (components.next(), components.next()) {
                (Some(Component::Normal(_)), None) => path.push(segment),
                _ => return Err(invalid(relative_name, "not a plain path segment")),
            }
        }
        Ok(path)
    }

    fn staging_dir(&self) -> &Path {
        &self.root
    }
}
