use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::audit::{AuditLog, JsonlAuditLog, NullAuditLog};
use crate::config::ServerConfig;
use crate::engine::{FfmpegEngine, TransformEngine};
use crate::metrics::{start_metrics_server, MetricsCollector};
use crate::session::{ServerContext, Session};

/// Build the production context: ffmpeg engine, optional audit file.
pub async fn build_context(config: ServerConfig) -> anyhow::Result<ServerContext> {
    let engine: Arc<dyn TransformEngine> =
        Arc::new(FfmpegEngine::new(config.ffmpeg_path.clone(), config.gif_fps));
    let audit: Arc<dyn AuditLog> = match &config.audit_log {
        Some(path) => Arc::new(
            JsonlAuditLog::open(path)
                .await
                .with_context(|| format!("opening audit log {:?}", path))?,
        ),
        None => Arc::new(NullAuditLog),
    };

    Ok(ServerContext {
        config,
        engine,
        audit,
        metrics: Arc::new(MetricsCollector::new()),
    })
}

pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&config.listen_address)
        .await
        .with_context(|| format!("binding {}", config.listen_address))?;
    info!("Server listening on {}", config.listen_address);

    let ctx = Arc::new(build_context(config).await?);

    if let Some(metrics_addr) = ctx.config.metrics_address.clone() {
        let metrics = Arc::clone(&ctx.metrics);
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(&metrics_addr, metrics).await {
                error!("Metrics server failed: {}", e);
            }
        });
    }

    serve(listener, ctx).await
}

/// Accept loop; every connection gets its own task and owns its session.
pub async fn serve(listener: TcpListener, ctx: Arc<ServerContext>) -> anyhow::Result<()> {
    let work_dir: PathBuf = ctx.config.work_dir.clone();
    tokio::fs::create_dir_all(&work_dir)
        .await
        .with_context(|| format!("creating work directory {:?}", work_dir))?;

    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                info!("New connection from {}", peer);
                ctx.metrics.connection_opened();

                let ctx_clone = Arc::clone(&ctx);
                tokio::spawn(async move {
                    let metrics = Arc::clone(&ctx_clone.metrics);
                    let session = Session::new(socket, peer, ctx_clone);
                    if let Err(e) = session.run().await {
                        error!("Session error for {}: {:#}", peer, e);
                    } else {
                        info!("Session completed for {}", peer);
                    }
                    metrics.connection_closed();
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
