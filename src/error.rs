use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::config::ConfigError;
use crate::models::Variant;

/// Object store download/upload failure.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("download of s3://{bucket}/{key} failed: {reason}")]
    Download {
        bucket: String,
        key: String,
        reason: String,
    },

    #[error("upload to s3://{bucket}/{key} failed: {reason}")]
    Upload {
        bucket: String,
        key: String,
        reason: String,
    },

    #[error("local file {path} unavailable during transfer: {source}")]
    LocalFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The source could not be opened or parsed as an image.
#[derive(Error, Debug)]
#[error("cannot decode {path}: {reason}")]
pub struct DecodeError {
    pub path: PathBuf,
    pub reason: String,
}

/// A derived image could not be written.
#[derive(Error, Debug)]
#[error("cannot write {variant} image {path}: {reason}")]
pub struct EncodeError {
    pub variant: Variant,
    pub path: PathBuf,
    pub reason: String,
}

/// Everything that can go wrong while processing one queue message.
///
/// Every variant results in the message being released back to the queue.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("invalid object key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("staging path {path} unavailable: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("transform task failed: {0}")]
    Task(String),
}

impl PipelineError {
    /// Stable label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::MalformedMessage(_) => "malformed_message",
            PipelineError::InvalidKey { .. } => "invalid_key",
            PipelineError::Staging { .. } => "staging",
            PipelineError::Transfer(_) => "transfer",
            PipelineError::Decode(_) => "decode",
            PipelineError::Encode(_) => "encode",
            PipelineError::Task(_) => "task",
        }
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("cannot resolve queue {name}: {reason}")]
    Resolve { name: String, reason: String },

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("delete failed: {0}")]
    Delete(String),

    #[error("visibility change failed: {0}")]
    Release(String),

    #[error("unknown or expired lease {0}")]
    UnknownLease(String),
}

/// Conditions that stop the worker before it enters its loop.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("cannot create staging directory {path}: {source}")]
    StagingDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("work queue unreachable: {0}")]
    Queue(#[from] QueueError),
}
