use ingestion_pipeline::IndexRunMode;
use runner::{init_tracing, run_index};
use tracing::error;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    run_index(IndexRunMode::Update).await.inspect_err(|e| {
        error!(error = %e, "update-index failed");
    })
}
