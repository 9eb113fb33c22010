use clap::Parser;
use panel_core::config::{Cli, PanelConfig};
use panel_core::{http, Panel};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = PanelConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    let panel = Panel::new(config);
    panel.spawn_health_checker();

    let addr: std::net::SocketAddr = panel.config.listen_addr.parse()?;
    tracing::info!(%addr, "panel-core listening");

    let app = http::router(panel.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
