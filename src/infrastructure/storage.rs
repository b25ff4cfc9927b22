use crate::config::WorkerConfig;
use crate::services::storage::S3ObjectStore;
use aws_config::SdkConfig;
use std::sync::Arc;
use tracing::info;

pub fn setup_storage(aws_config: &SdkConfig, config: &WorkerConfig) -> Arc<S3ObjectStore> {
    info!(
        "☁️  S3 Storage: input bucket '{}', output bucket '{}'",
        config.input_bucket, config.output_bucket
    );

    // MinIO and LocalStack only serve path-style requests.
    let s3_config = aws_sdk_s3::config::Builder::from(aws_config)
        .force_path_style(config.endpoint_url.is_some())
        .build();

    let s3_client = aws_sdk_s3::Client::from_conf(s3_config);
    Arc::new(S3ObjectStore::new(s3_client))
}
