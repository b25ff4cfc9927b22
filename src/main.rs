use dotenvy::dotenv;
use rust_image_worker::WorkerContext;
use rust_image_worker::config::WorkerConfig;
use rust_image_worker::error::StartupError;
use rust_image_worker::infrastructure::{self, queue, storage};
use rust_image_worker::services::worker::ImageWorker;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    // Initialize tracing with EnvFilter
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rust_image_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🚀 Starting Rust Image Worker...");

    let config = WorkerConfig::from_env().map_err(StartupError::from)?;
    info!(
        "⚙️  Worker Config: Queue={}, Region={}, Batch={}, Concurrency={}, Encode failures={:?}",
        config.queue_name,
        config.region,
        config.batch_size,
        config.max_concurrency,
        config.encode_failure_policy
    );

    // Setup Infrastructure
    let aws_config = infrastructure::load_aws_config(&config).await;
    let store = storage::setup_storage(&aws_config, &config);
    let queue = queue::setup_queue(&aws_config, &config).await?;

    let ctx = WorkerContext::new(config, store, queue);
    ctx.staging.ensure_directories().await?;
    info!("📂 Staging directories ready");

    // Setup Shutdown Channel
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let worker = ImageWorker::new(ctx, shutdown_rx);
    let mut handle = tokio::spawn(worker.run());

    tokio::select! {
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(true);
            handle.await?;
        }
        result = &mut handle => {
            result?;
        }
    }

    info!("🛑 Worker shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("⌨️  Ctrl+C received, finishing in-flight images...");
        },
        _ = terminate => {
            info!("💤 SIGTERM received, finishing in-flight images...");
        },
    }
}
