//! vox-agent binary entrypoint

use vox_agent::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // WARN by default; RUST_LOG=info for session lifecycle, debug for
    // per-frame detail.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    cli::run().await
}
