use anyhow::Result;
use birthday_core::bootstrap::bootstrap;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let (_kernel, supervisor) = bootstrap().await?;

    tracing::info!("birthday reminder pipeline starting");
    supervisor.run_until_shutdown().await
}
