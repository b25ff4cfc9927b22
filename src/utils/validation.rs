use std::path::{Component, Path};

use crate::error::PipelineError;

/// Longest object key S3 accepts, in bytes.
pub const MAX_OBJECT_KEY_LEN: usize = 1024;

/// Rejects object keys that name nothing, or that would escape a directory
/// if anything joined them onto a path.
pub fn validate_object_key(key: &str) -> Result<(), PipelineError> {
    let invalid = |reason| {
        Err(PipelineError::InvalidKey {
            key: key.to_string(),
            reason,
        })
    };

    if key.is_empty() {
        return invalid("key is empty");
    }

    if key.len() > MAX_OBJECT_KEY_LEN {
        return invalid("key is longer than 1024 bytes");
    }

    if key.chars().any(|c| c == '\0') {
        return invalid("key contains a NUL byte");
    }

    if key.ends_with('/') {
        return invalid("key names a folder");
    }

    for component in Path::new(key).components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => {
                tracing::warn!("Path traversal attempt detected: {}", key);
                return invalid("key contains a parent directory component");
            }
            Component::RootDir | Component::Prefix(_) => return invalid("key is absolute"),
        }
    }

    if !Path::new(key)
        .components()
        .any(|c| matches!(c, Component::Normal(_)))
    {
        return invalid("key names no file");
    }

    Ok(())
}
