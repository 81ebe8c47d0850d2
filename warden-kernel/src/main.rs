//! Warden controller: loads the fleet configuration, starts the background
//! sweeps and serves the REST API.

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use warden_kernel::config::{config_path, load_config};
use warden_kernel::engine::{shell_control, Warden};
use warden_kernel::http::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warden_kernel=info")))
        .init();

    let path = config_path();
    let config = load_config(&path)
        .await
        .with_context(|| format!("loading {}", path.display()))?;
    info!("configuration loaded from {} ({} nodes)", path.display(), config.nodes.len());

    let control = shell_control(&config);
    let listen = config.listen.clone();
    let warden = Warden::build(config, control).await.context("starting engine")?;

    let _loops = warden.supervisor().spawn();

    let api_key = std::env::var("WARDEN_API_KEY").ok();
    let app = build_router(AppState::new(warden, api_key));

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    info!("listening on http://{}", listen);
    axum::serve(listener, app).await.context("HTTP server")?;
    Ok(())
}
