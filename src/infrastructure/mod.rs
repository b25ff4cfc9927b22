pub mod queue;
pub mod storage;

use crate::config::WorkerConfig;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use tracing::info;

/// Shared AWS configuration for the object store and queue clients.
pub async fn load_aws_config(config: &WorkerConfig) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(config.region.clone()));

    if let Some(endpoint_url) = &config.endpoint_url {
        info!("🔌 Custom AWS endpoint: {}", endpoint_url);
        loader = loader.endpoint_url(endpoint_url);
    }

    loader.load().await
}
