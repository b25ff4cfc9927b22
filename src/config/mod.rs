use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Upper bound the queue accepts for a single receive call.
pub const MAX_BATCH_SIZE: u32 = 10;

/// Longest long-poll the queue accepts, in seconds.
pub const MAX_WAIT_TIME_SECS: u64 = 20;

/// Shortest long-poll taken from the environment. Zero would spin on an empty queue.
pub const MIN_WAIT_TIME_SECS: u64 = 1;

/// Longest lease the queue accepts (12 hours), in seconds.
pub const MAX_VISIBILITY_TIMEOUT_SECS: u64 = 43_200;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {name}")]
    Invalid { name: &'static str, value: String },
}

/// What to do with a message whose resized or thumbnail encode failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeFailurePolicy {
    /// Put the message back on the queue for another attempt.
    Release,
    /// Upload whatever was produced and delete the message.
    Acknowledge,
}

impl FromStr for EncodeFailurePolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "release" | "retry" => Ok(Self::Release),
            "acknowledge" | "ack" | "ignore" => Ok(Self::Acknowledge),
            _ => Err(()),
        }
    }
}

/// Worker configuration, resolved once at startup
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Bucket the uploaded originals are read from (`s3InputBucket`)
    pub input_bucket: String,

    /// Bucket the derived images are written to (`s3OutputBucket`)
    pub output_bucket: String,

    /// Name of the work queue (`SQSBatchQueue`)
    pub queue_name: String,

    /// Region used by both the object store and the queue clients (`AWSRegion`)
    pub region: String,

    /// Optional S3/SQS compatible endpoint, e.g. MinIO or LocalStack
    pub endpoint_url: Option<String>,

    /// Directory downloaded originals are staged in (default: ".")
    pub source_dir: PathBuf,

    /// Directory resized images are staged in (default: "/images/resized")
    pub resized_dir: PathBuf,

    /// Directory thumbnails are staged in (default: "/images/thumbs")
    pub thumbs_dir: PathBuf,

    /// Messages requested per receive call, 1..=10 (default: 10)
    pub batch_size: u32,

    /// How long a received message stays hidden from other consumers, at most 12h (default: 120s)
    pub visibility_timeout: Duration,

    /// Long-poll duration for an empty queue, 1..=20s (default: 20s)
    pub wait_time: Duration,

    /// Items of one batch processed at the same time (default: 1)
    pub max_concurrency: usize,

    /// Encode failure handling (default: release)
    pub encode_failure_policy: EncodeFailurePolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            input_bucket: String::new(),
            output_bucket: String::new(),
            queue_name: String::new(),
            region: "us-east-1".to_string(),
            endpoint_url: None,
            source_dir: PathBuf::from("."),
            resized_dir: PathBuf::from("/images/resized"),
            thumbs_dir: PathBuf::from("/images/thumbs"),
            batch_size: MAX_BATCH_SIZE,
            visibility_timeout: Duration::from_secs(120),
            wait_time: Duration::from_secs(MAX_WAIT_TIME_SECS),
            max_concurrency: 1,
            encode_failure_policy: EncodeFailurePolicy::Release,
        }
    }
}

impl WorkerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let default = Self::default();

        let required = |name: &'static str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(name))
        };

        let batch_size = parse_or(&lookup, "BATCH_SIZE", default.batch_size)?
            .clamp(1, MAX_BATCH_SIZE);

        let wait_secs = parse_or(&lookup, "WAIT_TIME_SECS", default.wait_time.as_secs())?
            .clamp(MIN_WAIT_TIME_SECS, MAX_WAIT_TIME_SECS);

        let visibility_secs = parse_or(
            &lookup,
            "VISIBILITY_TIMEOUT_SECS",
            default.visibility_timeout.as_secs(),
        )?
        .min(MAX_VISIBILITY_TIMEOUT_SECS);

        let max_concurrency = parse_or(&lookup, "MAX_CONCURRENCY", default.max_concurrency)?
            .clamp(1, batch_size as usize);

        let encode_failure_policy = match lookup("ENCODE_FAILURE_POLICY") {
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                name: "ENCODE_FAILURE_POLICY",
                value,
            })?,
            None => default.encode_failure_policy,
        };

        Ok(Self {
            input_bucket: required("s3InputBucket")?,
            output_bucket: required("s3OutputBucket")?,
            queue_name: required("SQSBatchQueue")?,
            region: required("AWSRegion")?,
            endpoint_url: lookup("AWS_ENDPOINT_URL").filter(|v| !v.is_empty()),
            source_dir: lookup("SOURCE_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.source_dir),
            resized_dir: lookup("RESIZED_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.resized_dir),
            thumbs_dir: lookup("THUMBS_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.thumbs_dir),
            batch_size,
            visibility_timeout: Duration::from_secs(visibility_secs),
            wait_time: Duration::from_secs(wait_secs),
            max_concurrency,
            encode_failure_policy,
        })
    }
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    const REQUIRED: &[(&str, &str)] = &[
        ("s3InputBucket", "uploads"),
        ("s3OutputBucket", "derived"),
        ("SQSBatchQueue", "image-batch"),
        ("AWSRegion", "eu-west-1"),
    ];

    #[test]
    fn test_default_config() {
        let config = WorkerConfig::default();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.visibility_timeout, Duration::from_secs(120));
        assert_eq!(config.wait_time, Duration::from_secs(20));
        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.encode_failure_policy, EncodeFailurePolicy::Release);
        assert_eq!(config.resized_dir, PathBuf::from("/images/resized"));
        assert_eq!(config.thumbs_dir, PathBuf::from("/images/thumbs"));
    }

    #[test]
    fn test_required_values() {
        let config = WorkerConfig::from_lookup(lookup_from(REQUIRED)).unwrap();
        assert_eq!(config.input_bucket, "uploads");
        assert_eq!(config.output_bucket, "derived");
        assert_eq!(config.queue_name, "image-batch");
        assert_eq!(config.region, "eu-west-1");
        assert!(config.endpoint_url.is_none());
    }

    #[test]
    fn test_missing_queue_is_an_error() {
        let vars: Vec<_> = REQUIRED
            .iter()
            .copied()
            .filter(|(k, _)| *k != "SQSBatchQueue")
            .collect();
        let err = WorkerConfig::from_lookup(lookup_from(&vars)).unwrap_err();
        assert_eq!(err, ConfigError::Missing("SQSBatchQueue"));
    }

    #[test]
    fn test_out_of_range_values_are_clamped() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([
            ("BATCH_SIZE", "50"),
            ("WAIT_TIME_SECS", "60"),
            ("MAX_CONCURRENCY", "32"),
            ("VISIBILITY_TIMEOUT_SECS", "5000000000"),
        ]);
        let config = WorkerConfig::from_lookup(lookup_from(&vars)).unwrap();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.wait_time, Duration::from_secs(20));
        assert_eq!(config.max_concurrency, 10);
        assert_eq!(config.visibility_timeout, Duration::from_secs(43_200));
    }

    #[test]
    fn test_zero_wait_time_still_long_polls() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("WAIT_TIME_SECS", "0"));
        let config = WorkerConfig::from_lookup(lookup_from(&vars)).unwrap();
        assert_eq!(config.wait_time, Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("BATCH_SIZE", "ten"));
        let err = WorkerConfig::from_lookup(lookup_from(&vars)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "BATCH_SIZE", .. }));
    }

    #[test]
    fn test_encode_failure_policy() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("ENCODE_FAILURE_POLICY", "Acknowledge"));
        let config = WorkerConfig::from_lookup(lookup_from(&vars)).unwrap();
        assert_eq!(config.encode_failure_policy, EncodeFailurePolicy::Acknowledge);

        let mut vars = REQUIRED.to_vec();
        vars.push(("ENCODE_FAILURE_POLICY", "sometimes"));
        assert!(WorkerConfig::from_lookup(lookup_from(&vars)).is_err());
    }
}
