//! Layout of the mounted object storage and the copy-based move used to
//! publish finished downloads into it.
//!
//! ```text
//! <mount>/<content_id>/<content_id>.json                          metadata cache
//! <mount>/<content_id>/<kind>/<discriminator>/<content_id>.<ext>  artifacts
//! ```

use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;

use crate::config::StorageConfig;
use crate::format_token::FormatToken;

#[derive(Debug, Clone)]
pub struct Storage {
    mount: PathBuf,
    url_prefix: String,
}

impl Storage {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            mount: config.mount.clone(),
            url_prefix: config.url_prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn info_cache_path(&self, content_id: &str) -> PathBuf {
        self.mount
            .join(content_id)
            .join(format!("{content_id}.json"))
    }

    /// Relative artifact path, `/` separated. Also the dedup key material for
    /// task ids and the suffix of the public URL.
    pub fn artifact_key(content_id: &str, token: &FormatToken) -> String {
        format!(
            "{content_id}/{}/{}/{content_id}.{}",
            token.kind().as_str(),
            path_segment(&token.discriminator()),
            path_segment(token.extension()),
        )
    }

    pub fn artifact_path(&self, key: &str) -> PathBuf {
        key.split('/')
            .fold(self.mount.clone(), |path, segment| path.join(segment))
    }

    pub fn public_url(&self, key: &str) -> String {
        format!("{}/{key}", self.url_prefix)
    }
}

/// Replaces anything outside `[A-Za-z0-9._-]` so upstream values can never
/// introduce extra path components.
pub fn path_segment(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        format!("_{cleaned}")
    } else {
        cleaned
    }
}

/// Moves `source` to `destination` across filesystems.
///
/// The payload is copied into a temp file next to the destination, flushed
/// to stable storage and renamed into place, so readers of the mount never
/// see a partial artifact. The source is removed only after the rename.
pub fn relocate(source: &Path, destination: &Path) -> Result<()> {
    let parent = destination
        .parent()
        .with_context(|| format!("{} has no parent directory", destination.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;

    let mut input =
        File::open(source).with_context(|| format!("opening {}", source.display()))?;
    let mut staged = NamedTempFile::new_in(parent)
        .with_context(|| format!("staging file in {}", parent.display()))?;
    io::copy(&mut input, staged.as_file_mut())
        .with_context(|| format!("copying {} to {}", source.display(), parent.display()))?;
    staged
        .as_file()
        .sync_all()
        .with_context(|| format!("syncing staged copy of {}", source.display()))?;

    if let Ok(metadata) = input.metadata()
        && let Err(err) = fs::set_permissions(staged.path(), metadata.permissions())
    {
        tracing::debug!(path = %destination.display(), "could not preserve permissions: {err}");
    }

    staged
        .persist(destination)
        .map_err(|err| err.error)
        .with_context(|| format!("renaming into {}", destination.display()))?;
    fs::remove_file(source).with_context(|| format!("removing {}", source.display()))?;
    Ok(())
}

/// Writes `contents` atomically via a sibling temp file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    let mut staged = NamedTempFile::new_in(parent)?;
    io::Write::write_all(staged.as_file_mut(), contents)
        .with_context(|| format!("writing {}", path.display()))?;
    staged
        .persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}
