use anyhow::{Context, Result};
use target_analyzer::api::{router, AppState};
use target_analyzer::config::Settings;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("target_analyzer=debug,tower_http=info")),
        )
        .init();

    let settings = Settings::load();
    let state = AppState::from_settings(&settings);
    info!("{}", state.analyzer.api_key_status().message);

    let app = router(state);
    let address = settings.server.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;
    info!("target analyzer listening on http://{address}");

    axum::serve(listener, app).await?;
    Ok(())
}
