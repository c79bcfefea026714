//! Playground editor example
//!
//! Opens (or creates) a template on the configured service, starts the live
//! preview channel and serves the editor on http://127.0.0.1:3000.
//!
//! Environment:
//! - `PLAYGROUND_API_URL`, `PLAYGROUND_SOCKET_URL`, ... (see `PlaygroundConfig::from_env`)
//! - `PLAYGROUND_TOKEN`: session token, or `PLAYGROUND_PROVIDER_TOKEN` to log in
//! - `PLAYGROUND_TEMPLATE`: template id; a new template is created when unset
//! - `PLAYGROUND_ADDR`: listen address
//!
//! Run with: cargo run --example playground

use std::sync::Arc;

use iot_playground::{
    HostConfig, HttpGateway, LiveChannel, Playground, PlaygroundConfig, SceneUpdate, Session, start_server,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = PlaygroundConfig::from_env()?;

    let session = match std::env::var("PLAYGROUND_TOKEN") {
        Ok(token) => Session::new(token),
        Err(_) => {
            let provider_token = std::env::var("PLAYGROUND_PROVIDER_TOKEN")?;
            HttpGateway::login(&config, &provider_token).await?
        }
    };
    let gateway = Arc::new(HttpGateway::new(&config, session.clone())?);

    let playground = match std::env::var("PLAYGROUND_TEMPLATE") {
        Ok(template_id) => Playground::open(&config, gateway, template_id).await?,
        Err(_) => Playground::create(&config, gateway, "Untitled template").await?,
    };
    info!(
        template_id = playground.template_id(),
        widgets = playground.instances().len(),
        "template opened"
    );

    // Log value changes coming back from devices
    let mut updates = playground.subscribe();
    tokio::spawn(async move {
        while let Ok(update) = updates.recv().await {
            if let SceneUpdate::ValueChanged { instance_id, value, origin } = update {
                info!(%instance_id, ?value, ?origin, "value changed");
            }
        }
    });

    let live = LiveChannel::spawn(&config, session, playground.clone());
    let mut live_state = live.state();
    tokio::spawn(async move {
        while live_state.changed().await.is_ok() {
            info!(state = ?*live_state.borrow_and_update(), "live channel");
        }
    });

    let addr = std::env::var("PLAYGROUND_ADDR").unwrap_or_else(|_| "127.0.0.1:3000".to_string());
    let host = HostConfig::from_config(&config, playground);

    tokio::select! {
        res = start_server(host, &addr) => res?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    live.shutdown().await;
    Ok(())
}
