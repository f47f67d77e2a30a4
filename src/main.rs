use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voicemesh::{
    config::Config,
    discovery::DiscoveryReporter,
    room_manager::RoomManager,
    server,
    signaling::session::SessionContext,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voicemesh=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("failed to load configuration")?;
    tracing::debug!("config: {:?}", config);

    let rooms = RoomManager::new();
    let cancel = CancellationToken::new();

    let keyframes = rooms.spawn_keyframe_loop(config.media.keyframe_interval, cancel.clone());
    let discovery = config
        .discovery
        .clone()
        .map(|discovery| DiscoveryReporter::new(discovery, rooms.clone()).spawn(cancel.clone()));

    let app = server::router(SessionContext::new(&config, rooms));
    let listener = tokio::net::TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_address))?;
    tracing::info!("listening on {}", config.server.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server failed")?;

    cancel.cancel();
    keyframes.await?;
    if let Some(discovery) = discovery {
        discovery.await?;
    }
    tracing::info!("server has stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {}", err);
    }
}
