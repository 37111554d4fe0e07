use anyhow::Context;
use clap::Parser;
use relay_core::EngineConfig;
use relay_orchestrator::Engine;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "relay-engine")]
#[command(about = "Headless agent execution engine")]
struct Cli {
    #[command(flatten)]
    config: EngineConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(cli.config.log_filter.clone())
        .with_target(false)
        .init();

    let addr = cli
        .config
        .bind_addr()
        .parse()
        .context("invalid backend host/port")?;

    info!(%addr, "starting relay-engine");
    let engine = Engine::new(cli.config);
    relay_server::serve(addr, engine).await
}
