//! Local file storage for uploaded version files.
//!
//! Files are addressed by a path relative to the configured root. Unpublished uploads live
//! under `temp/{user}/{YYYY}/{MM}/{DD}/{file_id}/{name}`, published ones under
//! `projects/{project}/{folder}/{file_id}/{name}`.

use std::io::Read;
use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Datelike, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

const TEMP_DIR: &str = "temp";
const PROJECTS_DIR: &str = "projects";
/// File systems cap a path component at 255 bytes; stay well below.
const MAX_FILE_NAME_BYTES: usize = 200;
const MAX_EXTENSION_BYTES: usize = 32;
const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a stored relative path onto the filesystem. Absolute paths and `..` are refused.
    pub fn resolve(&self, relative: &str) -> anyhow::Result<PathBuf> {
        let rel = Path::new(relative);
        if relative.is_empty() || relative.contains('\0') {
            anyhow::bail!("invalid storage path: {:?}", relative);
        }
        for component in rel.components() {
            match component {
                Component::Normal(_) => {}
                _ => anyhow::bail!("invalid storage path: {:?}", relative),
            }
        }
        Ok(self.root.join(rel))
    }

    pub fn draft_path(user_id: Uuid, file_id: Uuid, name: &str, now: DateTime<Utc>) -> String {
        format!(
            "{}/{}/{:04}/{:02}/{:02}/{}/{}",
            TEMP_DIR,
            user_id,
            now.year(),
            now.month(),
            now.day(),
            file_id,
            sanitize_file_name(name)
        )
    }

    pub fn published_path(project_id: Uuid, folder_id: Uuid, file_id: Uuid, name: &str) -> String {
        format!("{}/{}/{}/{}/{}", PROJECTS_DIR, project_id, folder_id, file_id, sanitize_file_name(name))
    }

    pub fn is_draft_path(relative: &str) -> bool {
        relative.starts_with(&format!("{}/", TEMP_DIR))
    }

    /// Creates (truncating) the file at `relative`, including missing parent directories.
    pub async fn create(&self, relative: &str) -> anyhow::Result<tokio::fs::File> {
        let path = self.resolve(relative)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
        tokio::fs::File::create(&path).await.with_context(|| format!("creating {}", path.display()))
    }

    pub async fn open(&self, relative: &str) -> anyhow::Result<tokio::fs::File> {
        let path = self.resolve(relative)?;
        tokio::fs::File::open(&path).await.with_context(|| format!("opening {}", path.display()))
    }

    pub async fn metadata(&self, relative: &str) -> anyhow::Result<std::fs::Metadata> {
        let path = self.resolve(relative)?;
        tokio::fs::metadata(&path).await.with_context(|| format!("stat {}", path.display()))
    }

    /// Moves a stored file. Falls back to copy + remove when a rename is not possible.
    pub async fn relocate(&self, from: &str, to: &str) -> anyhow::Result<()> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if tokio::fs::rename(&src, &dst).await.is_err() {
            tokio::fs::copy(&src, &dst)
                .await
                .with_context(|| format!("copying {} to {}", src.display(), dst.display()))?;
            tokio::fs::remove_file(&src).await?;
        }
        Ok(())
    }

    /// Removes a stored file; a file that is already gone is not an error.
    pub async fn remove(&self, relative: &str) -> anyhow::Result<()> {
        let path = self.resolve(relative)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }

    /// Streams the file through SHA-256 on the blocking pool and returns the hex digest.
    pub async fn checksum_sha256(&self, relative: &str) -> anyhow::Result<String> {
        let path = self.resolve(relative)?;
        tokio::task::spawn_blocking(move || -> anyhow::Result<String> {
            let mut file = std::fs::File::open(&path).with_context(|| format!("opening {}", path.display()))?;
            let mut hasher = Sha256::new();
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(hex::encode(hasher.finalize()))
        })
        .await?
    }

    /// Deletes empty directories below `temp/`. Returns how many were removed.
    pub async fn prune_empty_temp_dirs(&self) -> anyhow::Result<usize> {
        let base = self.root.join(TEMP_DIR);
        tokio::task::spawn_blocking(move || {
            if !base.is_dir() {
                return 0;
            }
            let mut removed = 0;
            for entry in walkdir::WalkDir::new(&base).min_depth(1).contents_first(true) {
                let Ok(entry) = entry else { continue };
                if entry.file_type().is_dir() && std::fs::remove_dir(entry.path()).is_ok() {
                    removed += 1;
                }
            }
            removed
        })
        .await
        .map_err(Into::into)
    }
}

/// Reduces an uploaded file name to a safe single path component.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| if matches!(c, '<' | '>' | ':' | '"' | '|' | '?' | '*') { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').trim();
    if cleaned.is_empty() {
        return "file".to_string();
    }
    if cleaned.len() <= MAX_FILE_NAME_BYTES {
        return cleaned.to_string();
    }
    // keep a sane extension when shortening
    match split_extension(cleaned) {
        (stem, Some(ext)) if ext.len() <= MAX_EXTENSION_BYTES => {
            let stem = truncate_bytes(stem, MAX_FILE_NAME_BYTES - ext.len() - 1);
            format!("{}.{}", stem, ext)
        }
        _ => truncate_bytes(cleaned, MAX_FILE_NAME_BYTES).to_string(),
    }
}

/// Longest prefix of `s` within `max` bytes that ends on a char boundary.
fn truncate_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Splits `name.ext` into `("name", Some("ext"))`. Dot files have no extension.
pub fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(idx) if idx > 0 && idx + 1 < name.len() => (&name[..idx], Some(&name[idx + 1..])),
        _ => (name, None),
    }
}
