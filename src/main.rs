use anyhow::Result;
use spacegate::{config::Config, server};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();

    // One-shot sweep from the CLI, same code path as the HTTP trigger
    if args.len() >= 2 && args[1] == "sweep" {
        let config = Config::load()?;
        let state = server::http::AppState::from_config(config)?;

        let window = chrono::Duration::seconds(state.config.sweep.expiry_window_secs);
        let summary =
            spacegate::sweep::run_sweep(state.store.as_ref(), &state.exchangers, window).await?;

        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    info!("Spacegate v{}", spacegate::VERSION);

    let config = Config::load()?;
    info!("Configuration loaded");
    info!("  HTTP: {}", config.server.bind);

    server::run(config).await?;

    Ok(())
}
