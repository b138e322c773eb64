use runner::{init_tracing, load_config, Services};
use tracing::{error, info};

async fn run() -> anyhow::Result<()> {
    let config = load_config()?;
    let services = Services::connect(config).await?;
    let snapshot = services.crossmap_with_cross_encoder().await?;
    info!(snapshot = %snapshot.display(), "crossmap run complete");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    run().await.inspect_err(|e| {
        error!(error = %e, "crossmap failed");
    })
}
