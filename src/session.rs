use anyhow::{anyhow, Context};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::audit::{unix_now, AuditLog, SessionRecord};
use crate::config::ServerConfig;
use crate::engine::TransformEngine;
use crate::metrics::MetricsCollector;
use crate::protocol::handshake::{accept_handshake, ServerKeypair};
use crate::protocol::message::{recv_packet, send_packet};
use crate::protocol::{
    PlainChannel, ProtocolError, Request, Response, SecureChannel, Transport, ACK_OK,
};
use crate::transfer::{discard_body, receive_body, send_body};

/// Collaborators shared by every session, built once at startup.
pub struct ServerContext {
    pub config: ServerConfig,
    pub engine: Arc<dyn TransformEngine>,
    pub audit: Arc<dyn AuditLog>,
    pub metrics: Arc<MetricsCollector>,
}

/// Per-request bookkeeping that decides how a failure can still be reported
#[derive(Debug, Default)]
struct Exchange {
    record_id: Option<u64>,
    response_started: bool,
}

/// One accepted connection: handshake, one request, one response.
pub struct Session {
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
    id: String,
}

impl Session {
    pub fn new(stream: TcpStream, peer: SocketAddr, ctx: Arc<ServerContext>) -> Self {
        Self {
            stream,
            peer,
            ctx,
            id: format!("{:016x}", rand::random::<u64>()),
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let work_dir = self.ctx.config.work_dir.join(&self.id);
        tokio::fs::create_dir_all(&work_dir)
            .await
            .with_context(|| format!("creating session directory {:?}", work_dir))?;

        let result = self.serve(&work_dir).await;

        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            warn!("Could not clean up {:?}: {}", work_dir, e);
        }
        result
    }

    async fn serve(self, work_dir: &Path) -> anyhow::Result<()> {
        let Session { mut stream, peer, ctx, id } = self;
        let options = ctx.config.channel_options();

        // Before the handshake completes there is no channel to report errors on
        let mut transport: Box<dyn Transport> = if ctx.config.encryption {
            let keypair = ServerKeypair::generate_blocking(ctx.config.rsa_bits).await?;
            let handshake = accept_handshake(&mut stream, &keypair);
            let session_key = match options.io_timeout {
                Some(limit) => tokio::time::timeout(limit, handshake)
                    .await
                    .map_err(|_| ProtocolError::Timeout(limit))?,
                None => handshake.await,
            }
            .with_context(|| format!("handshake with {} failed", peer))?;
            Box::new(SecureChannel::new(stream, &session_key, options))
        } else {
            Box::new(PlainChannel::new(stream, options))
        };
        info!("Session {} established with {}", id, peer);

        let mut exchange = Exchange::default();
        let outcome = handle_request(&ctx, &mut transport, peer, work_dir, &mut exchange).await;

        match &outcome {
            Ok(()) => ctx.metrics.job_completed(),
            Err(e) => {
                ctx.metrics.job_failed();
                error!("Session {} failed: {:#}", id, e);
                if exchange.response_started {
                    debug!("Response already in flight, closing without error report");
                } else {
                    let failure = Response::failure(e.to_string());
                    if let Err(send_err) = send_response(&mut *transport, &failure).await {
                        warn!("Could not deliver error response to {}: {}", peer, send_err);
                    }
                }
            }
        }

        if let Some(record_id) = exchange.record_id {
            if let Err(e) = ctx.audit.log_end(record_id, unix_now()).await {
                warn!("Audit log_end failed: {}", e);
            }
        }
        outcome
    }
}

async fn send_response<T: Transport + ?Sized>(
    transport: &mut T,
    response: &Response,
) -> Result<(), ProtocolError> {
    let (header, body) = response.to_packet()?;
    send_packet(transport, &header, &body).await
}

async fn handle_request<T: Transport + ?Sized>(
    ctx: &ServerContext,
    transport: &mut T,
    peer: SocketAddr,
    work_dir: &Path,
    exchange: &mut Exchange,
) -> anyhow::Result<()> {
    let (header, body) = recv_packet(transport).await?;
    let request = match Request::from_packet(&header, &body) {
        Ok(request) => request,
        Err(e) => {
            // Keep the stream aligned so the error response is read as such
            let drained = discard_body(transport, header.file_size).await?;
            debug!("Discarded {} body bytes of rejected request", drained);
            return Err(e.into());
        }
    };

    let file_name = request.metadata.file_name.clone();
    info!(
        "Request from {}: {} on {:?} ({} bytes, media type {:?})",
        peer, request.metadata.operation, file_name, request.file_size, request.media_type
    );

    let record = SessionRecord {
        start_time: unix_now(),
        client_ip: peer.ip().to_string(),
        operation: request.metadata.operation.code(),
        file_name: file_name.clone(),
        file_size: request.file_size,
        media_type: request.media_type.clone(),
    };
    match ctx.audit.log_start(record).await {
        Ok(id) => exchange.record_id = Some(id),
        Err(e) => warn!("Audit log_start failed: {}", e),
    }

    let input_path = work_dir.join(&file_name);
    let received = receive_body(transport, &input_path, request.file_size, None).await?;
    ctx.metrics.record_received(received);
    if received < request.file_size {
        return Err(ProtocolError::ConnectionClosed.into());
    }

    transport.send(&[ACK_OK]).await?;
    debug!("Acknowledged upload of {} bytes", received);

    let output = ctx
        .engine
        .transform(&input_path, &file_name, &request.metadata.operation)
        .await?;

    let sent = send_result(ctx, transport, &output, exchange).await?;
    ctx.metrics.record_sent(sent);
    info!("Sent {:?} ({} bytes) to {}", output, sent, peer);
    Ok(())
}

async fn send_result<T: Transport + ?Sized>(
    ctx: &ServerContext,
    transport: &mut T,
    output: &Path,
    exchange: &mut Exchange,
) -> anyhow::Result<u64> {
    let file_size = tokio::fs::metadata(output)
        .await
        .with_context(|| format!("reading result {:?}", output))?
        .len();
    let file_name = output
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("result path {:?} has no usable file name", output))?
        .to_string();
    let media_type = output
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e))
        .unwrap_or_default();

    let response = Response::Success {
        file_name,
        media_type,
        file_size,
    };
    let (header, body) = response.to_packet()?;

    exchange.response_started = true;
    send_packet(transport, &header, &body).await?;
    let sent = send_body(output, transport, file_size, ctx.config.chunk_size, None).await?;
    Ok(sent)
}
