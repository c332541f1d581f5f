use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tokio::sync::Notify;

use ctf_realtime::config::Settings;
use ctf_realtime::telemetry::{init_tracing, LogFormat};
use ctf_realtime::websocket::WsTransport;
use ctf_realtime::{ChannelMultiplexer, SharedToken};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    init_tracing(LogFormat::from_env())?;

    // Load configuration
    let settings = Settings::new()?;
    tracing::info!(base_url = %settings.realtime.base_url, "Configuration loaded");

    let token = Arc::new(SharedToken::new(settings.auth.token.clone()));
    let multiplexer = ChannelMultiplexer::builder(settings.realtime.clone())
        .anonymous_policy(settings.auth.anonymous_contests)
        .transport(Arc::new(WsTransport::new()))
        .credentials(token.clone())
        .on_close(|channel, code| {
            tracing::info!(channel = %channel, close_code = ?code, "Channel closed by server");
        })
        .build()?;

    // Log every event
    let _all = multiplexer.on_any(|envelope| {
        tracing::info!(
            event = %envelope.name,
            seq = ?envelope.seq,
            contest = ?envelope.contest,
            "Event received"
        );
        Ok(())
    });

    // Session revoked by the platform
    let logout = Arc::new(Notify::new());
    let logout_signal = logout.clone();
    let logout_token = token.clone();
    let _logout = multiplexer.on("force_logout", move |envelope| {
        tracing::warn!(reason = ?envelope.get("reason"), "Session revoked");
        logout_token.clear();
        logout_signal.notify_one();
        Ok(())
    });

    multiplexer.start_notify();
    for slug in &settings.client.contests {
        multiplexer.join_contest(slug);
    }
    tracing::info!(contests = settings.client.contests.len(), "Channels started");

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = logout.notified() => {
            tracing::info!("Stopping after forced logout");
        }
    }

    multiplexer.stop_all();
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, shutting down");
        }
    }
}
