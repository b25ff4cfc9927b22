use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio::time::{Duration, sleep};

use crate::WorkerContext;
use crate::config::EncodeFailurePolicy;
use crate::error::{PipelineError, QueueError};
use crate::models::{QueueMessage, Variant, WorkItem};
use crate::services::queue::ReceiveOptions;
use crate::services::staging::StagedFileSet;
use crate::services::transformer::{ImageTransformer, TransformReport};

/// Pause after a failed receive before polling again.
const RECEIVE_RETRY_DELAY: Duration = Duration::from_secs(5);

/// How a message's lease was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Acknowledged,
    Released,
    /// The queue rejected the delete or release. The lease runs out on its own.
    Unsettled,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub received: usize,
    pub acknowledged: usize,
    pub released: usize,
    pub unsettled: usize,
}

/// Polls the work queue and turns every uploaded image into its resized and
/// thumbnail variants.
pub struct ImageWorker {
    ctx: WorkerContext,
    transformer: ImageTransformer,
    receive_options: ReceiveOptions,
    shutdown: watch::Receiver<bool>,
}

impl ImageWorker {
    pub fn new(ctx: WorkerContext, shutdown: watch::Receiver<bool>) -> Self {
        let receive_options = ReceiveOptions::from_config(&ctx.config);
        Self {
            ctx,
            transformer: ImageTransformer::default(),
            receive_options,
            shutdown,
        }
    }

    pub fn with_transformer(mut self, transformer: ImageTransformer) -> Self {
        self.transformer = transformer;
        self
    }

    /// Runs until the shutdown signal fires or its sender is dropped. In-flight
    /// items are finished and settled before this returns.
    pub async fn run(mut self) {
        tracing::info!(
            "🚀 Image worker started (batch size {}, concurrency {})",
            self.receive_options.max_messages(),
            self.concurrency()
        );

        loop {
            if self.shutdown_requested() {
                break;
            }

            let received = tokio::select! {
                _ = self.shutdown.changed() => break,
                received = self.ctx.queue.receive_batch(&self.receive_options) => received,
            };

            match received {
                Ok(messages) if messages.is_empty() => continue,
                Ok(messages) => {
                    let summary = self.process_batch(messages).await;
                    tracing::info!(
                        received = summary.received,
                        acknowledged = summary.acknowledged,
                        released = summary.released,
                        unsettled = summary.unsettled,
                        "✅ Batch completed"
                    );
                }
                Err(e) => {
                    tracing::error!("Failed to receive messages from queue: {}", e);
                    tokio::select! {
                        _ = self.shutdown.changed() => break,
                        _ = sleep(RECEIVE_RETRY_DELAY) => {}
                    }
                }
            }
        }

        tracing::info!("🛑 Image worker shutting down");
    }

    /// One receive followed by processing of whatever arrived.
    pub async fn run_cycle(&self) -> Result<BatchSummary, QueueError> {
        let messages = self.ctx.queue.receive_batch(&self.receive_options).await?;
        Ok(self.process_batch(messages).await)
    }

    /// Processes every message independently and resolves each lease exactly once.
    pub async fn process_batch(&self, messages: Vec<QueueMessage>) -> BatchSummary {
        let received = messages.len();
        let outcomes: Vec<MessageOutcome> = stream::iter(messages)
            .map(|message| self.handle_message(message))
            .buffer_unordered(self.concurrency())
            .collect()
            .await;

        let count = |outcome: MessageOutcome| outcomes.iter().filter(|o| **o == outcome).count();

        BatchSummary {
            received,
            acknowledged: count(MessageOutcome::Acknowledged),
            released: count(MessageOutcome::Released),
            unsettled: count(MessageOutcome::Unsettled),
        }
    }

    fn concurrency(&self) -> usize {
        self.ctx
            .config
            .max_concurrency
            .clamp(1, self.receive_options.max_messages() as usize)
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn handle_message(&self, message: QueueMessage) -> MessageOutcome {
        if self.shutdown_requested() {
            tracing::info!(
                message_id = message.message_id.as_deref().unwrap_or("-"),
                "Shutdown in progress, returning message to the queue"
            );
            return self.settle(message, Err(None)).await;
        }

        let result = self.process_message(&message).await;
        self.settle(message, result.map_err(Some)).await
    }

    /// Resolves the lease: delete on success, make visible again otherwise.
    /// Consumes the message so its lease cannot be resolved twice.
    async fn settle(
        &self,
        message: QueueMessage,
        result: Result<WorkItem, Option<PipelineError>>,
    ) -> MessageOutcome {
        let message_id = message.message_id.as_deref().unwrap_or("-");

        match result {
            Ok(item) => {
                if let Err(e) = self.ctx.queue.acknowledge(&message.lease).await {
                    // The message reappears once its lease expires and is processed again.
                    tracing::error!(
                        message_id,
                        object_key = %item.object_key,
                        "Failed to delete message after processing: {}",
                        e
                    );
                    return MessageOutcome::Unsettled;
                }
                tracing::info!(message_id, object_key = %item.object_key, "Image processed");
                MessageOutcome::Acknowledged
            }
            Err(error) => {
                if let Some(error) = &error {
                    tracing::warn!(
                        message_id,
                        kind = error.kind(),
                        "Processing failed, releasing message: {}",
                        error
                    );
                }
                if let Err(e) = self.ctx.queue.release(&message.lease).await {
                    tracing::error!(message_id, "Failed to release message: {}", e);
                    return MessageOutcome::Unsettled;
                }
                MessageOutcome::Released
            }
        }
    }

    async fn process_message(&self, message: &QueueMessage) -> Result<WorkItem, PipelineError> {
        let item = WorkItem::from_message(message)?;
        let staged = self.ctx.staging.stage(&item.object_key)?;

        let result = self.process_staged(&item, &staged).await;

        // Staged files go away whatever the outcome.
        if let Err(e) = staged.cleanup().await {
            tracing::warn!(object_key = %item.object_key, "Staging cleanup incomplete: {}", e);
        }

        result.map(|_| item)
    }

    async fn process_staged(
        &self,
        item: &WorkItem,
        staged: &StagedFileSet,
    ) -> Result<(), PipelineError> {
        let config = &self.ctx.config;
        let key = &item.object_key;

        self.ctx
            .store
            .download(&config.input_bucket, key, &staged.source())
            .await?;

        let report = self.transform(staged).await?;

        let variants = if report.is_complete() {
            report.written()
        } else {
            match config.encode_failure_policy {
                EncodeFailurePolicy::Acknowledge => {
                    tracing::warn!(object_key = %key, "Publishing partial output after encode failure");
                    report.written()
                }
                EncodeFailurePolicy::Release => {
                    if let Some(e) = report.first_error() {
                        return Err(e.into());
                    }
                    Vec::new()
                }
            }
        };

        for variant in variants {
            let Some(destination) = variant.destination_key(key) else {
                continue;
            };
            self.ctx
                .store
                .upload(&config.output_bucket, &staged.path(variant), &destination)
                .await?;
        }

        Ok(())
    }

    async fn transform(&self, staged: &StagedFileSet) -> Result<TransformReport, PipelineError> {
        let transformer = self.transformer;
        let (source, resized, thumbnail) = (
            staged.source(),
            staged.path(Variant::Resized),
            staged.path(Variant::Thumbnail),
        );

        tokio::task::spawn_blocking(move || transformer.transform(&source, &resized, &thumbnail))
            .await
            .map_err(|e| PipelineError::Task(e.to_string()))?
            .map_err(PipelineError::from)
    }
}
