use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::protocol::handshake::initiate_handshake;
use crate::protocol::message::{recv_packet_within, send_packet, validate_file_name};
use crate::protocol::{
    Operation, PacketHeader, PlainChannel, ProtocolError, Request, RequestMetadata, Response,
    SecureChannel, Transport, ACK_OK,
};
use crate::transfer::{receive_body, send_body, Progress};

/// Client side driver: one connection per upload.
pub struct MediaClient {
    config: ClientConfig,
}

impl MediaClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connect and run the key exchange, yielding the session transport.
    pub async fn connect(&self) -> Result<Box<dyn Transport>, ProtocolError> {
        let addr = &self.config.server_address;
        let connect = TcpStream::connect(addr);
        let mut stream = match self.config.connect_timeout() {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| ProtocolError::Timeout(limit))??,
            None => connect.await?,
        };
        debug!("Connected to {}", addr);

        let options = self.config.channel_options();
        if !self.config.encryption {
            return Ok(Box::new(PlainChannel::new(stream, options)));
        }

        let handshake = initiate_handshake(&mut stream);
        let session_key = match options.io_timeout {
            Some(limit) => tokio::time::timeout(limit, handshake)
                .await
                .map_err(|_| ProtocolError::Timeout(limit))??,
            None => handshake.await?,
        };
        debug!("Session key established with {}", addr);
        Ok(Box::new(SecureChannel::new(stream, &session_key, options)))
    }

    /// Upload `file_path` for `operation` and save the result into the
    /// download directory. Returns the path of the saved result.
    pub async fn upload_and_process(
        &self,
        file_path: &Path,
        operation: Operation,
        progress: Option<Progress<'_>>,
    ) -> Result<PathBuf, ProtocolError> {
        let mut transport = self.connect().await?;
        let chunk_size = self.config.chunk_size;
        upload(&mut transport, file_path, operation, chunk_size, progress).await?;

        let download_dir = &self.config.download_dir;
        let response_timeout = self.config.response_timeout();
        receive_file(&mut transport, download_dir, response_timeout, None).await
    }
}

/// Send request header, metadata and body, then wait for the acknowledgement.
pub async fn upload<T: Transport + ?Sized>(
    transport: &mut T,
    file_path: &Path,
    operation: Operation,
    chunk_size: usize,
    progress: Option<Progress<'_>>,
) -> Result<(), ProtocolError> {
    let file_name = file_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            ProtocolError::InvalidMetadata(format!("no usable file name in {:?}", file_path))
        })?;
    let file_name = validate_file_name(file_name)?;
    let media_type = file_path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e))
        .unwrap_or_default();
    let file_size = tokio::fs::metadata(file_path).await?.len();

    let request = Request {
        metadata: RequestMetadata::new(file_name, operation),
        media_type,
        file_size,
    };
    let (header, body) = request.to_packet()?;
    info!(
        "Uploading {:?} ({} bytes) for {}",
        file_path, file_size, request.metadata.operation
    );

    send_packet(transport, &header, &body).await?;
    send_body(file_path, transport, file_size, chunk_size, progress).await?;

    let ack = transport.recv_message().await?;
    if ack == [ACK_OK] {
        debug!("Upload acknowledged");
        return Ok(());
    }
    Err(rejection(transport, ack).await)
}

/// The server answers a request it refused with an error response in
/// place of the ack; surface its message when that is what arrived.
async fn rejection<T: Transport + ?Sized>(transport: &mut T, ack: Vec<u8>) -> ProtocolError {
    let Ok(header) = PacketHeader::decode(&ack) else {
        return ProtocolError::UploadRejected(ack);
    };
    let Ok(body) = transport.recv_message().await else {
        return ProtocolError::UploadRejected(ack);
    };
    match Response::from_packet(&header, &body) {
        Ok(Response::Failure { message }) => ProtocolError::Application(message),
        _ => ProtocolError::UploadRejected(ack),
    }
}

/// Read the response packet and, on success, stream the result body into
/// `download_dir`. A body cut short by the server closing the connection
/// leaves a truncated file behind and is only logged.
///
/// The server transforms the file before it answers, so the wait for the
/// response header is bounded by `response_timeout` rather than the
/// channel's I/O timeout. `None` waits as long as the server keeps the
/// connection open.
pub async fn receive_file<T: Transport + ?Sized>(
    transport: &mut T,
    download_dir: &Path,
    response_timeout: Option<Duration>,
    progress: Option<Progress<'_>>,
) -> Result<PathBuf, ProtocolError> {
    let (header, body) = recv_packet_within(transport, response_timeout).await?;
    let (file_name, file_size) = match Response::from_packet(&header, &body)? {
        Response::Failure { message } => return Err(ProtocolError::Application(message)),
        Response::Success { file_name, file_size, .. } => (file_name, file_size),
    };

    tokio::fs::create_dir_all(download_dir).await?;
    let dest = download_dir.join(&file_name);
    let received = receive_body(transport, &dest, file_size, progress).await?;
    if received < file_size {
        warn!("Result {:?} is truncated: {} of {} bytes", dest, received, file_size);
    } else {
        info!("Saved result to {:?} ({} bytes)", dest, received);
    }
    Ok(dest)
}
