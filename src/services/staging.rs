use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use std::io;
use std::path::{Path, PathBuf};

use crate::config::WorkerConfig;
use crate::error::{PipelineError, StartupError};
use crate::models::Variant;
use crate::utils::validation::validate_object_key;

/// Bytes escaped when an object key is flattened into one file name. `%` is
/// escaped too, so distinct keys never share a name.
const FILE_NAME_ESCAPES: &AsciiSet = &CONTROLS.add(b'/').add(b'\\').add(b'%');

/// Longest file name common filesystems accept, in bytes.
const MAX_FILE_NAME_LEN: usize = 255;

/// Local scratch directories for images that are being processed.
#[derive(Debug, Clone)]
pub struct StagingArea {
    source_dir: PathBuf,
    resized_dir: PathBuf,
    thumbs_dir: PathBuf,
}

impl StagingArea {
    pub fn new(
        source_dir: impl Into<PathBuf>,
        resized_dir: impl Into<PathBuf>,
        thumbs_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source_dir: source_dir.into(),
            resized_dir: resized_dir.into(),
            thumbs_dir: thumbs_dir.into(),
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(
            config.source_dir.clone(),
            config.resized_dir.clone(),
            config.thumbs_dir.clone(),
        )
    }

    /// Creates the staging directories if they are missing. Safe to call on every start.
    pub async fn ensure_directories(&self) -> Result<(), StartupError> {
        for dir in [&self.source_dir, &self.resized_dir, &self.thumbs_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| StartupError::StagingDirectory {
                    path: dir.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    pub fn dir_for(&self, variant: Variant) -> &Path {
        match variant {
            Variant::Source => &self.source_dir,
            Variant::Resized => &self.resized_dir,
            Variant::Thumbnail => &self.thumbs_dir,
        }
    }

    /// Every key maps to its own file directly inside the variant's directory.
    pub fn path_for(&self, object_key: &str, variant: Variant) -> PathBuf {
        self.dir_for(variant).join(staged_file_name(object_key))
    }

    /// Removes every staged file for `object_key`. Files that are already gone are fine.
    pub async fn cleanup(&self, object_key: &str) -> io::Result<()> {
        let mut first_error = None;
        for variant in [Variant::Source, Variant::Resized, Variant::Thumbnail] {
            let path = self.path_for(object_key, variant);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!("Failed to remove staged file {}: {}", path.display(), e);
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Reserves the staging paths for `object_key`.
    ///
    /// The returned guard removes all three files when [`StagedFileSet::cleanup`]
    /// is awaited, or synchronously on drop if processing never got that far.
    pub fn stage(&self, object_key: &str) -> Result<StagedFileSet, PipelineError> {
        validate_object_key(object_key)?;

        if staged_file_name(object_key).len() > MAX_FILE_NAME_LEN {
            return Err(PipelineError::InvalidKey {
                key: object_key.to_string(),
                reason: "key is too long to stage",
            });
        }

        Ok(StagedFileSet {
            area: self.clone(),
            object_key: object_key.to_string(),
            armed: true,
        })
    }
}

/// `2024/summer/a.jpg` becomes `2024%2Fsummer%2Fa.jpg`.
fn staged_file_name(object_key: &str) -> String {
    utf8_percent_encode(object_key, FILE_NAME_ESCAPES).to_string()
}

/// The source, resized and thumbnail paths of one object key.
#[derive(Debug)]
pub struct StagedFileSet {
    area: StagingArea,
    object_key: String,
    armed: bool,
}

impl StagedFileSet {
    pub fn path(&self, variant: Variant) -> PathBuf {
        self.area.path_for(&self.object_key, variant)
    }

    pub fn source(&self) -> PathBuf {
        self.path(Variant::Source)
    }

    pub async fn cleanup(mut self) -> io::Result<()> {
        self.armed = false;
        self.area.cleanup(&self.object_key).await
    }
}

impl Drop for StagedFileSet {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for variant in [Variant::Source, Variant::Resized, Variant::Thumbnail] {
            let path = self.path(variant);
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!("Failed to remove staged file {}: {}", path.display(), e);
                }
            }
        }
    }
}
