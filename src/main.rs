use shelly_meter_emulation::http_server::{self, AppState};
use shelly_meter_emulation::{Config, ReadingsCoordinator, ShellyDevice, UdpServer, UdpServerSettings};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting Shelly Pro 3EM emulator");
    let config = Config::load()?;

    // Upstream meter and Home Assistant offset feed the live readings
    let coordinator = ReadingsCoordinator::start(&config.input)?;
    let device = Arc::new(ShellyDevice::new(&config, coordinator.readings()));
    tracing::info!(
        clients = device.registry().len(),
        fw = %config.fw,
        "device ready"
    );

    let shutdown = CancellationToken::new();

    let udp_server = UdpServer::bind(
        &config.udp_bind_address(),
        Arc::clone(&device),
        UdpServerSettings {
            throttling_interval: config.throttling_interval(),
            idle_timeout: config.udp_idle_timeout(),
            outbound_queue_size: config.outbound_queue_size,
            max_sessions: config.udp_max_sessions,
        },
        shutdown.child_token(),
    )
    .await?;
    let udp_task = tokio::spawn(udp_server.run());

    let listener = TcpListener::bind(config.http_bind_address()).await?;
    let state = AppState {
        device,
        throttling_interval: config.throttling_interval(),
        outbound_queue_size: config.outbound_queue_size,
        shutdown: shutdown.clone(),
    };

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("shutdown requested");
                    shutdown.cancel();
                }
                Err(e) => tracing::error!(error = %e, "failed to listen for ctrl-c"),
            }
        });
    }

    let served = http_server::serve(listener, state).await;
    shutdown.cancel();

    match udp_task.await {
        Ok(Err(e)) => tracing::error!(error = %e, "udp server failed"),
        Err(e) => tracing::error!(error = %e, "udp server task panicked"),
        Ok(Ok(())) => {}
    }
    drop(coordinator);

    served
}
