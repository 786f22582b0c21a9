/// Eventhook daemon
///
/// Runs the distribution engine and the admin server until Ctrl-C.

use anyhow::Context;
use eventhook::{config::LoggingConfig, server, AppContext, EngineConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::from_env().context("failed to load configuration")?;

    init_tracing(&config.logging);
    print_banner();

    let ctx = AppContext::new(config)
        .await
        .context("failed to initialise application context")?;

    let engine = ctx
        .start_engine()
        .await
        .context("failed to start distribution engine")?;

    server::serve(ctx, shutdown_signal())
        .await
        .context("admin server failed")?;

    engine.shutdown().await;
    info!("Eventhook stopped");

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.filter_directives()));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.is_json() {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

fn print_banner() {
    println!(
        r#"
                          __  __                __  
  ___ _   _____  ____  / /_/ /_  ____  ____  / /__
 / _ \ | / / _ \/ __ \/ __/ __ \/ __ \/ __ \/ //_/
/  __/ |/ /  __/ / / / /_/ / / / /_/ / /_/ / ,<   
\___/|___/\___/_/ /_/\__/_/ /_/\____/\____/_/|_|  

        Ordered event distribution engine v{}
        "#,
        env!("CARGO_PKG_VERSION")
    );
}
