use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::PipelineError;

/// Opaque receipt the queue hands out with every delivery.
///
/// A handle is only valid for the delivery it came with; once the message is
/// redelivered the queue issues a new one.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct LeaseHandle(String);

impl LeaseHandle {
    pub fn new(receipt: impl Into<String>) -> Self {
        Self(receipt.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LeaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A raw delivery from the work queue.
#[derive(Debug)]
pub struct QueueMessage {
    pub message_id: Option<String>,
    pub lease: LeaseHandle,
    pub body: String,
}

/// One unit of work: an uploaded image waiting to be resized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub object_key: String,
    pub message_id: Option<String>,
}

impl WorkItem {
    pub fn from_message(message: &QueueMessage) -> Result<Self, PipelineError> {
        let event: S3EventNotification = serde_json::from_str(&message.body)
            .map_err(|e| PipelineError::MalformedMessage(e.to_string()))?;

        let raw_key = event
            .records
            .first()
            .map(|record| record.s3.object.key.as_str())
            .ok_or_else(|| PipelineError::MalformedMessage("event has no records".to_string()))?;

        Ok(Self {
            object_key: decode_object_key(raw_key)?,
            message_id: message.message_id.clone(),
        })
    }
}

/// Object keys in S3 event notifications are form-encoded: spaces arrive as `+`.
pub fn decode_object_key(raw: &str) -> Result<String, PipelineError> {
    let unplussed = raw.replace('+', " ");
    percent_decode_str(&unplussed)
        .decode_utf8()
        .map(|key| key.into_owned())
        .map_err(|e| PipelineError::MalformedMessage(format!("object key is not UTF-8: {}", e)))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct S3EventNotification {
    #[serde(rename = "Records", default)]
    pub records: Vec<S3EventRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct S3EventRecord {
    pub s3: S3Entity,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct S3Entity {
    pub object: S3Object,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct S3Object {
    pub key: String,
}

impl S3EventNotification {
    /// Builds the minimal notification body for a single key.
    pub fn for_key(key: &str) -> Self {
        Self {
            records: vec![S3EventRecord {
                s3: S3Entity {
                    object: S3Object {
                        key: key.to_string(),
                    },
                },
            }],
        }
    }
}

/// The images staged locally for one object key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    Source,
    Resized,
    Thumbnail,
}

impl Variant {
    /// Prefix the variant is published under in the output bucket.
    pub fn output_prefix(self) -> Option<&'static str> {
        match self {
            Variant::Source => None,
            Variant::Resized => Some("resized/"),
            Variant::Thumbnail => Some("thumbs/"),
        }
    }

    pub fn destination_key(self, object_key: &str) -> Option<String> {
        self.output_prefix()
            .map(|prefix| format!("{}{}", prefix, object_key))
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Variant::Source => "source",
            Variant::Resized => "resized",
            Variant::Thumbnail => "thumbnail",
        };
        f.write_str(name)
    }
}
