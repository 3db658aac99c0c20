//! Process-level wiring: the listener, the shared pool, and graceful
//! shutdown ordering.

use std::sync::Arc;

use color_eyre::eyre::Context;
use color_eyre::Result;
use tokio::net::TcpListener;
use tracing::{info, instrument, warn};

use crate::auth::StaticTokenVerifier;
use crate::config::Config;
use crate::pool::Pool;
use crate::session::{run_session, SessionCtx};

/// Runs the analysis server until a shutdown signal arrives. Binding or
/// engine-configuration failures surface here and exit the process nonzero.
#[instrument(skip(config))]
pub async fn run(config: Config) -> Result<()> {
    let verifier = Arc::new(StaticTokenVerifier::new(&config.auth));
    let pool = Arc::new(Pool::new(config.engine.clone(), config.pool.clone()));

    let ctx = Arc::new(SessionCtx {
        pool: pool.clone(),
        verifier,
        min_client_version: config.server.min_client_version,
        download_url: config.server.download_url.clone(),
        hash_mb: config.engine.hash_mb,
    });

    let listener = TcpListener::bind(("0.0.0.0", config.server.port))
        .await
        .wrap_err_with(|| format!("while binding port {}", config.server.port))?;
    info!(port = config.server.port, "Analysis server listening");

    if let Some(metrics_port) = config.server.metrics_port {
        info!(metrics_port, "Metrics port recorded for the external exporter");
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let ctx = ctx.clone();
                    let _session = tokio::spawn(async move {
                        if let Err(err) = run_session(stream, ctx, peer.to_string()).await {
                            warn!(%err, %peer, "Session ended with error");
                        }
                    });
                }
                Err(err) => warn!(%err, "Accept failed"),
            },
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!(%err, "Signal listener failed, shutting down");
                }
                info!("Shutdown signal received");
                break;
            }
        }
    }

    pool.shutdown().await;
    info!("Server stopped");
    Ok(())
}
