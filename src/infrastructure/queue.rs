use crate::config::WorkerConfig;
use crate::error::StartupError;
use crate::services::queue::SqsWorkQueue;
use aws_config::SdkConfig;
use std::sync::Arc;
use tracing::info;

/// Connects to the work queue. Failing to resolve the queue is fatal.
pub async fn setup_queue(
    aws_config: &SdkConfig,
    config: &WorkerConfig,
) -> Result<Arc<SqsWorkQueue>, StartupError> {
    let client = aws_sdk_sqs::Client::new(aws_config);
    let queue = SqsWorkQueue::connect(client, &config.queue_name).await?;

    info!("📬 Work queue '{}' at {}", config.queue_name, queue.queue_url());
    Ok(Arc::new(queue))
}
