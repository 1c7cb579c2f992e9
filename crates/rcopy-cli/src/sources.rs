//! Turning command-line paths into transfer items.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use rcopy_transfer::TransferItem;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

/// Paths listed one per line. Blank lines and `#` comments are skipped.
pub fn parse_list(text: &str) -> Vec<PathBuf> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(PathBuf::from)
        .collect()
}

/// Read a `--files-from` list; `-` reads stdin.
pub async fn read_list(path: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let text = if path == Path::new("-") {
        let mut text = String::new();
        tokio::io::stdin()
            .read_to_string(&mut text)
            .await
            .context("cannot read file list from stdin")?;
        text
    } else {
        tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("cannot read file list '{}'", path.display()))?
    };
    Ok(parse_list(&text))
}

/// Name announced to the receiver.
///
/// A relative path without `..` keeps its directories, joined with `/`.
/// Anything else is sent under its file name alone.
pub fn wire_name(path: &Path) -> Option<String> {
    let mut segments = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => segments.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned());
            }
        }
    }
    if segments.is_empty() {
        None
    } else {
        Some(segments.join("/"))
    }
}

/// Stat every path and build the send list. Missing paths, directories and
/// duplicates are skipped with a warning.
pub async fn collect(paths: Vec<PathBuf>) -> Vec<TransferItem> {
    let mut seen = HashSet::new();
    let mut items = Vec::new();
    for path in paths {
        let key = tokio::fs::canonicalize(&path)
            .await
            .unwrap_or_else(|_| path.clone());
        if !seen.insert(key) {
            debug!("Skip duplicate '{}'", path.display());
            continue;
        }
        let Some(name) = wire_name(&path) else {
            warn!("Skip '{}': no file name", path.display());
            continue;
        };
        match TransferItem::from_path(&path, name).await {
            Ok(item) => items.push(item),
            Err(e) => warn!("Skip '{}': {}", path.display(), e),
        }
    }
    items
}
