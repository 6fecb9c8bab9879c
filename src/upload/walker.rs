//! Mirror a local file or directory tree onto the server.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::coordinator::{upload_file, UploadOptions};
use crate::error::UploadError;
use crate::webdav::{Connector, DavClient};

/// Totals for one run over a local path
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TreeReport {
    pub files: u64,
    pub directories: u64,
    pub bytes: u64,
    pub skipped: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    Dir { relative: PathBuf },
    File { path: PathBuf, relative: PathBuf },
}

/// `relative` as a `/`-separated string, whatever the local separator is
pub fn slash_path(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Join a local relative path onto a remote root using `/` separators
pub fn remote_join(root: &str, relative: &Path) -> String {
    format!("{}/{}", root.trim_end_matches('/'), slash_path(relative))
}

/// Directories are also tested with a trailing `/`, so `^\.git/` skips `.git` itself.
fn is_excluded(exclude: Option<&Regex>, relative: &str, is_dir: bool) -> bool {
    match exclude {
        Some(re) => re.is_match(relative) || (is_dir && re.is_match(&format!("{relative}/"))),
        None => false,
    }
}

/// List what to upload under `root`, parents before children, sorted by name.
/// Excluded directories are not descended into.
fn plan_tree(root: &Path, exclude: Option<&Regex>) -> Result<(Vec<Entry>, u64), UploadError> {
    let mut skipped = 0;
    let mut entries = Vec::new();

    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            let excluded = is_excluded(exclude, &slash_path(relative), entry.file_type().is_dir());
            if excluded {
                debug!(path = %relative.display(), "excluded");
                skipped += 1;
            }
            !excluded
        });

    for entry in walker {
        let entry = entry.map_err(|source| UploadError::Walk {
            root: root.to_path_buf(),
            source,
        })?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_path_buf();
        let file_type = entry.file_type();

        if file_type.is_dir() {
            entries.push(Entry::Dir { relative });
        } else if file_type.is_file() {
            entries.push(Entry::File {
                path: entry.into_path(),
                relative,
            });
        } else {
            warn!(path = %entry.path().display(), "skipping entry that is neither file nor directory");
        }
    }

    Ok((entries, skipped))
}

/// Upload `local` (a file or a directory) below `remote_root`.
///
/// A single file lands at `remote_root/<file name>`. For a directory every
/// sub-directory is created remotely before its contents, and the first
/// failure stops the walk.
pub async fn upload_tree<C: Connector>(
    connector: &Arc<C>,
    local: &Path,
    remote_root: &str,
    options: &UploadOptions,
) -> Result<TreeReport, UploadError> {
    let started = Instant::now();
    let metadata = tokio::fs::metadata(local)
        .await
        .map_err(|source| UploadError::Open {
            path: local.to_path_buf(),
            source,
        })?;

    let mut report = TreeReport::default();

    if !metadata.is_dir() {
        let name = local.file_name().map(Path::new).ok_or_else(|| UploadError::Open {
            path: local.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name"),
        })?;
        let remote = remote_join(remote_root, name);
        let file = upload_file(connector, local, &remote, options).await?;
        report.files = 1;
        report.bytes = file.bytes;
        report.elapsed = started.elapsed();
        return Ok(report);
    }

    let root = local.to_path_buf();
    let exclude = options.exclude.clone();
    let (entries, skipped) =
        tokio::task::spawn_blocking(move || plan_tree(&root, exclude.as_ref())).await??;
    report.skipped = skipped;

    for entry in entries {
        match entry {
            Entry::Dir { relative } => {
                let remote = remote_join(remote_root, &relative);
                let created = match connector.client() {
                    Ok(client) => client.mkdir(&remote).await,
                    Err(e) => Err(e),
                };
                created.map_err(|source| UploadError::Mkdir {
                    path: remote.clone(),
                    source,
                })?;
                debug!(remote, "collection ready");
                report.directories += 1;
            }
            Entry::File { path, relative } => {
                let remote = remote_join(remote_root, &relative);
                let file = upload_file(connector, &path, &remote, options).await?;
                report.files += 1;
                report.bytes += file.bytes;
            }
        }
    }

    report.elapsed = started.elapsed();
    info!(
        files = report.files,
        directories = report.directories,
        skipped = report.skipped,
        bytes = report.bytes,
        "tree uploaded"
    );
    Ok(report)
}
