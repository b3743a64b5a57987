use anyhow::Context;
use tokio_util::sync::CancellationToken;
use torwatch::{server, telemetry, SidecarConfig};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing(&SidecarConfig::log_level_from_env())?;
    let config = SidecarConfig::from_env();
    config.validate().context("invalid configuration")?;

    info!(
        version = torwatch::VERSION,
        commit = torwatch::COMMIT,
        control = %config.control.address,
        port = config.http_port,
        "starting torwatch"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    server::run(&config, shutdown).await?;

    info!("server stopped");
    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "cannot listen for SIGTERM, only SIGINT stops the server");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutting down server");
    shutdown.cancel();
}
