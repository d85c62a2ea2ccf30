use anyhow::Result;
use tollbooth::Application;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("Starting tollbooth");

    let app = Application::new().await?;
    app.run().await?;

    Ok(())
}
