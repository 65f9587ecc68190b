//! relaycam: shared camera with live broadcast

use std::sync::Arc;

use color_eyre::Result;
use flume::bounded;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use relaycam::actor::{DisplayActor, HostActor};
use relaycam::camera::{self, CameraBroker, SurfaceId};
use relaycam::events::Command;
use relaycam::streaming::{self, HttpTokenClient, SessionManager};
use relaycam::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("relaycam=debug")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("relaycam launching...");

    relaycam::CONFIG.store(Arc::new(Config::load()?));
    let config = relaycam::CONFIG.load_full();

    // Backends are resolved once, here
    let backend = camera::probe_backend(&config.camera);
    let transport = streaming::probe_transport(&config.streaming);
    let tokens = Arc::new(HttpTokenClient::new(&config.token)?);

    let (events_tx, events_rx) = bounded(config.pipeline.event_channel_capacity);
    let (commands_tx, commands_rx) = bounded(config.pipeline.command_channel_capacity);

    let (broker, grant) = CameraBroker::new(backend, config.pipeline.drop_log_interval);
    let session = SessionManager::new(
        config.streaming.clone(),
        transport,
        tokens,
        config.token.total_timeout(),
        config.pipeline.drop_log_interval,
        events_tx.clone(),
    );
    let host = HostActor::new(
        Arc::new(broker),
        grant,
        session,
        config.camera.clone(),
        events_tx,
    );

    let host_handle = tokio::spawn(host.run(commands_rx));
    let display_handle = tokio::spawn(DisplayActor::new().run(events_rx));

    commands_tx
        .send_async(Command::InitializeCamera { low_power: false })
        .await?;
    commands_tx
        .send_async(Command::StartPreview {
            surface: SurfaceId(0),
        })
        .await?;

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");

    commands_tx.send_async(Command::Shutdown).await?;
    if let Err(e) = host_handle.await {
        error!("Host actor panicked: {}", e);
    }

    // The session manager holds an event sender until the host is gone
    match display_handle.await {
        Ok(state) => info!(?state, "Final display state"),
        Err(e) => error!("Display actor panicked: {}", e),
    }

    info!("relaycam shutting down");
    Ok(())
}
