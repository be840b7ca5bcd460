//! Temp-file management for transient media.
//!
//! Every media file the service touches lives under one configured temp
//! root. Names are generated (32-hex token plus a sanitized extension), so
//! caller-supplied names never reach the filesystem; paths are still
//! re-checked against the root on every delete to defend against symlink
//! and traversal tricks. On POSIX the root is 0700 and files are 0600.

use log::{debug, warn};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::config::MediaConfig;
use crate::error::WhisperdError;
use crate::Result;

/// FFmpeg-supported media extensions plus subtitle outputs.
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    ".3g2", ".3gp", ".aac", ".ac3", ".aiff", ".alac", ".amr", ".ape", ".asf", ".avi", ".avs",
    ".cavs", ".dirac", ".dts", ".dv", ".eac3", ".f4v", ".flac", ".flv", ".g722", ".g723_1",
    ".g726", ".g729", ".gsm", ".h261", ".h263", ".h264", ".hevc", ".lpcm", ".m4a", ".m4v",
    ".mkv", ".mlp", ".mmf", ".mov", ".mp2", ".mp3", ".mp4", ".mpc", ".mpeg", ".mpg", ".oga",
    ".ogg", ".ogv", ".opus", ".rm", ".rmvb", ".sbc", ".spx", ".tak", ".thd", ".tta", ".vc1",
    ".vob", ".wav", ".wma", ".wmv", ".wv", ".webm", ".srt", ".vtt",
];

/// Whether a file name carries an allowed media extension.
pub fn is_allowed_extension(name: &str) -> bool {
    match name.rfind('.') {
        Some(index) => {
            let ext = name[index..].to_ascii_lowercase();
            ALLOWED_EXTENSIONS.contains(&ext.as_str())
        }
        None => false,
    }
}

/// Maximum number of concurrent deletions in a batch sweep.
const DELETE_BATCH_SIZE: usize = 5;

/// Owner of the temp root directory.
pub struct TempFiles {
    root: PathBuf,
    max_file_size: u64,
}

impl TempFiles {
    /// Create (if needed) and lock down the temp root.
    pub fn new(config: &MediaConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.temp_dir)?;
        let root = std::fs::canonicalize(&config.temp_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o700))?;
        }
        debug!("temp root set to {}", root.display());
        Ok(Self {
            root,
            max_file_size: config.max_file_size_bytes,
        })
    }

    /// The canonical temp root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Configured media size cap in bytes.
    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Generate a safe, unique file name from the original.
    ///
    /// The extension is reduced to word characters and dots, lowercased and
    /// capped at 10 characters; the stem is replaced by a random 32-hex
    /// token.
    pub fn generate_safe_name(original_name: &str) -> String {
        let ext: String = match original_name.rfind('.') {
            Some(index) => original_name[index..]
                .chars()
                .filter(|c| c.is_ascii_alphanumeric() || *c == '.' || *c == '_')
                .take(10)
                .collect::<String>()
                .to_ascii_lowercase(),
            None => String::new(),
        };
        format!("{}{}", Uuid::new_v4().simple(), ext)
    }

    /// Reserve a path under the root for a new file.
    ///
    /// # Errors
    ///
    /// Rejects names that would escape the root or land on a symlink.
    pub fn allocate(&self, original_name: &str) -> Result<PathBuf> {
        let safe_name = Self::generate_safe_name(original_name);
        let path = self.root.join(&safe_name);
        if path.parent() != Some(self.root.as_path()) {
            return Err(WhisperdError::UnsafePath(path));
        }
        if path.symlink_metadata().is_ok() {
            // A 32-hex collision means something is planting files.
            return Err(WhisperdError::UnsafePath(path));
        }
        Ok(path)
    }

    /// Save a byte buffer under the root and return its path.
    ///
    /// # Errors
    ///
    /// Fails when the buffer exceeds the size cap or the extension is not
    /// an allowed media type; nothing is left on disk in either case.
    pub async fn save_bytes(&self, bytes: &[u8], original_name: &str) -> Result<PathBuf> {
        if bytes.len() as u64 > self.max_file_size {
            return Err(WhisperdError::invalid_submission(format!(
                "file size exceeds the limit: {} > {}",
                bytes.len(),
                self.max_file_size
            )));
        }
        if !is_allowed_extension(original_name) {
            return Err(WhisperdError::UnsupportedFileType(
                original_name.to_string(),
            ));
        }

        let path = self.allocate(original_name)?;
        tokio::fs::write(&path, bytes).await?;
        self.restrict_permissions(&path).await?;
        debug!("saved {} byte(s) to {}", bytes.len(), path.display());
        Ok(path)
    }

    /// Apply owner-only permissions to a file under the root.
    pub async fn restrict_permissions(&self, path: &Path) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        #[cfg(not(unix))]
        {
            let _ = path;
        }
        Ok(())
    }

    /// Verify that an existing path resolves inside the temp root and is a
    /// regular file (not a symlink).
    pub fn ensure_within_root(&self, path: &Path) -> Result<PathBuf> {
        let metadata = path
            .symlink_metadata()
            .map_err(|_| WhisperdError::FileNotFound(path.to_string_lossy().to_string()))?;
        if metadata.file_type().is_symlink() {
            return Err(WhisperdError::UnsafePath(path.to_path_buf()));
        }
        let real = std::fs::canonicalize(path)?;
        if !real.starts_with(&self.root) {
            return Err(WhisperdError::UnsafePath(path.to_path_buf()));
        }
        Ok(real)
    }

    /// Delete a single temp file.
    ///
    /// Idempotent: a missing file logs a warning and is not an error.
    /// Paths outside the root and symlinks are refused with a warning.
    pub async fn delete(&self, path: &Path) {
        let real = match self.ensure_within_root(path) {
            Ok(real) => real,
            Err(WhisperdError::FileNotFound(_)) => {
                warn!("temp file already gone: {}", path.display());
                return;
            }
            Err(_) => {
                warn!(
                    "refusing to delete path outside the temp root: {}",
                    path.display()
                );
                return;
            }
        };
        match tokio::fs::remove_file(&real).await {
            Ok(()) => debug!("deleted temp file {}", real.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("temp file already gone: {}", real.display());
            }
            Err(e) => warn!("failed to delete {}: {}", real.display(), e),
        }
    }

    /// Delete many temp files with bounded concurrency.
    pub async fn delete_batch(&self, paths: &[PathBuf]) {
        use futures::stream::{self, StreamExt};
        stream::iter(paths)
            .for_each_concurrent(DELETE_BATCH_SIZE, |path| self.delete(path))
            .await;
    }

    /// Remove every file directly under the temp root.
    pub async fn cleanup_all(&self) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                paths.push(entry.path());
            }
        }
        debug!("sweeping {} temp file(s)", paths.len());
        self.delete_batch(&paths).await;
        Ok(())
    }
}
