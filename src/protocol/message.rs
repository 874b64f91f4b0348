//! Request/response packet layout.
//!
//! Every packet is two channel messages: the 8-byte [`PacketHeader`], then
//! `json ‖ media_type`. A file body, if any, follows as separate messages
//! whose lengths sum to the header's `file_size`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::trace;

use crate::protocol::channel::Transport;
use crate::protocol::constants::DEFAULT_BITRATE;
use crate::protocol::error::ProtocolError;
use crate::protocol::header::PacketHeader;

/// Longest error message carried in a response, in bytes
const MAX_ERROR_MESSAGE: usize = 4096;

/// Media operation with its parameters, validated at decode time.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Re-encode at the given video bitrate, e.g. `1M`
    Compress { bitrate: String },
    /// Scale to `width`, height follows the source aspect ratio
    Resize { width: u32, height: u32 },
    /// Set the display aspect ratio
    AspectRatio { width: u32, height: u32 },
    /// Audio track to mp3
    ExtractAudio,
    /// GIF clip; `fps` falls back to the server default when absent
    Gif { start_time: f64, duration: f64, fps: Option<u32> },
}

impl Operation {
    pub fn code(&self) -> i64 {
        match self {
            Operation::Compress { .. } => 1,
            Operation::Resize { .. } => 2,
            Operation::AspectRatio { .. } => 3,
            Operation::ExtractAudio => 4,
            Operation::Gif { .. } => 5,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::Compress { .. } => "compress",
            Operation::Resize { .. } => "resize",
            Operation::AspectRatio { .. } => "aspect-ratio",
            Operation::ExtractAudio => "extract-audio",
            Operation::Gif { .. } => "gif",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Compress { bitrate } => write!(f, "compress(bitrate={})", bitrate),
            Operation::Resize { width, height } => write!(f, "resize({}:{})", width, height),
            Operation::AspectRatio { width, height } => {
                write!(f, "aspect-ratio({}/{})", width, height)
            }
            Operation::ExtractAudio => write!(f, "extract-audio"),
            Operation::Gif { start_time, duration, .. } => {
                write!(f, "gif(start={}, duration={})", start_time, duration)
            }
        }
    }
}

/// Flat JSON object as it travels on the wire
#[derive(Debug, Serialize, Deserialize)]
struct WireRequest {
    file_name: String,
    operation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bitrate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    aspect_ratio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fps: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestMetadata {
    pub file_name: String,
    pub operation: Operation,
}

impl RequestMetadata {
    pub fn new(file_name: impl Into<String>, operation: Operation) -> Self {
        Self {
            file_name: file_name.into(),
            operation,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut wire = WireRequest {
            file_name: self.file_name.clone(),
            operation: self.operation.code(),
            bitrate: None,
            resolution: None,
            aspect_ratio: None,
            start_time: None,
            duration: None,
            fps: None,
        };
        match &self.operation {
            Operation::Compress { bitrate } => wire.bitrate = Some(bitrate.clone()),
            Operation::Resize { width, height } => {
                wire.resolution = Some(format!("{}:{}", width, height))
            }
            Operation::AspectRatio { width, height } => {
                wire.aspect_ratio = Some(format!("{}/{}", width, height))
            }
            Operation::ExtractAudio => {}
            Operation::Gif { start_time, duration, fps } => {
                wire.start_time = Some(*start_time);
                wire.duration = Some(*duration);
                wire.fps = *fps;
            }
        }
        Ok(serde_json::to_vec(&wire)?)
    }

    pub fn from_json(json: &[u8]) -> Result<Self, ProtocolError> {
        let wire: WireRequest = serde_json::from_slice(json)?;
        let file_name = validate_file_name(&wire.file_name)?;

        let operation = match wire.operation {
            1 => Operation::Compress {
                bitrate: wire.bitrate.unwrap_or_else(|| DEFAULT_BITRATE.to_string()),
            },
            2 => {
                let resolution = required(wire.resolution, "resolution")?;
                let (width, height) = parse_pair(&resolution, ':', "resolution")?;
                Operation::Resize { width, height }
            }
            3 => {
                let ratio = required(wire.aspect_ratio, "aspect_ratio")?;
                let (width, height) = parse_pair(&ratio, '/', "aspect_ratio")?;
                Operation::AspectRatio { width, height }
            }
            4 => Operation::ExtractAudio,
            5 => {
                let start_time = required(wire.start_time, "start_time")?;
                let duration = required(wire.duration, "duration")?;
                if !start_time.is_finite() || start_time < 0.0 {
                    return Err(ProtocolError::InvalidMetadata(format!(
                        "invalid start_time {}",
                        start_time
                    )));
                }
                if !duration.is_finite() || duration <= 0.0 {
                    return Err(ProtocolError::InvalidMetadata(format!(
                        "invalid duration {}",
                        duration
                    )));
                }
                if wire.fps == Some(0) {
                    return Err(ProtocolError::InvalidMetadata("fps must be positive".to_string()));
                }
                Operation::Gif { start_time, duration, fps: wire.fps }
            }
            other => return Err(ProtocolError::InvalidOperation(other)),
        };

        Ok(Self { file_name, operation })
    }
}

fn required<T>(value: Option<T>, field: &str) -> Result<T, ProtocolError> {
    value.ok_or_else(|| ProtocolError::InvalidMetadata(format!("missing field `{}`", field)))
}

fn parse_pair(value: &str, sep: char, field: &str) -> Result<(u32, u32), ProtocolError> {
    let invalid = || ProtocolError::InvalidMetadata(format!("invalid {} `{}`", field, value));
    let (a, b) = value.split_once(sep).ok_or_else(invalid)?;
    let a: u32 = a.trim().parse().map_err(|_| invalid())?;
    let b: u32 = b.trim().parse().map_err(|_| invalid())?;
    if a == 0 || b == 0 {
        return Err(invalid());
    }
    Ok((a, b))
}

/// Names are used as paths on the receiving side, so only a bare file name
/// is accepted.
pub fn validate_file_name(name: &str) -> Result<String, ProtocolError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if bad {
        return Err(ProtocolError::InvalidMetadata(format!("unsafe file name `{}`", name)));
    }
    Ok(name.to_string())
}

/// Upload request: metadata plus the media type (file extension, with dot)
/// and the size of the body that follows.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub metadata: RequestMetadata,
    pub media_type: String,
    pub file_size: u64,
}

impl Request {
    pub fn to_packet(&self) -> Result<(PacketHeader, Vec<u8>), ProtocolError> {
        let mut body = self.metadata.to_json()?;
        let header = PacketHeader::new(body.len(), self.media_type.len(), self.file_size)?;
        body.extend_from_slice(self.media_type.as_bytes());
        Ok((header, body))
    }

    pub fn from_packet(header: &PacketHeader, body: &[u8]) -> Result<Self, ProtocolError> {
        let (json, media) = header.split_body(body)?;
        let metadata = RequestMetadata::from_json(json)?;
        let media_type = std::str::from_utf8(media)
            .map_err(|_| ProtocolError::InvalidMetadata("media type is not UTF-8".to_string()))?
            .to_string();
        Ok(Self {
            metadata,
            media_type,
            file_size: header.file_size,
        })
    }
}

/// Response JSON object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    pub error: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Result file follows as the body
    Success {
        file_name: String,
        media_type: String,
        file_size: u64,
    },
    /// No body follows
    Failure { message: String },
}

impl Response {
    pub fn failure(message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.len() > MAX_ERROR_MESSAGE {
            let mut cut = MAX_ERROR_MESSAGE;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        Response::Failure { message }
    }

    pub fn to_packet(&self) -> Result<(PacketHeader, Vec<u8>), ProtocolError> {
        let (metadata, media_type, file_size) = match self {
            Response::Success { file_name, media_type, file_size } => (
                ResponseMetadata {
                    file_name: Some(file_name.clone()),
                    error: false,
                    error_message: None,
                },
                media_type.as_str(),
                *file_size,
            ),
            Response::Failure { message } => (
                ResponseMetadata {
                    file_name: None,
                    error: true,
                    error_message: Some(message.clone()),
                },
                "",
                0,
            ),
        };
        let mut body = serde_json::to_vec(&metadata)?;
        let header = PacketHeader::new(body.len(), media_type.len(), file_size)?;
        body.extend_from_slice(media_type.as_bytes());
        Ok((header, body))
    }

    pub fn from_packet(header: &PacketHeader, body: &[u8]) -> Result<Self, ProtocolError> {
        let (json, media) = header.split_body(body)?;
        let metadata: ResponseMetadata = serde_json::from_slice(json)?;

        if metadata.error {
            let message = metadata
                .error_message
                .unwrap_or_else(|| "server reported an unspecified error".to_string());
            return Ok(Response::Failure { message });
        }

        let file_name = metadata.file_name.ok_or_else(|| {
            ProtocolError::InvalidMetadata("response without file_name".to_string())
        })?;
        let media_type = std::str::from_utf8(media)
            .map_err(|_| ProtocolError::InvalidMetadata("media type is not UTF-8".to_string()))?
            .to_string();
        Ok(Response::Success {
            file_name: validate_file_name(&file_name)?,
            media_type,
            file_size: header.file_size,
        })
    }
}

/// Send header and body as two consecutive messages.
pub async fn send_packet<T: Transport + ?Sized>(
    transport: &mut T,
    header: &PacketHeader,
    body: &[u8],
) -> Result<(), ProtocolError> {
    trace!("Sending packet header {:?}", header);
    transport.send(&header.encode()).await?;
    transport.send(body).await
}

/// Receive a header message and the body message it describes.
pub async fn recv_packet<T: Transport + ?Sized>(
    transport: &mut T,
) -> Result<(PacketHeader, Vec<u8>), ProtocolError> {
    let deadline = transport.io_timeout();
    recv_packet_within(transport, deadline).await
}

/// Like [`recv_packet`], but the wait for the header message is bounded by
/// `header_deadline` instead of the I/O timeout. The body message that
/// follows is read under the normal I/O timeout.
pub async fn recv_packet_within<T: Transport + ?Sized>(
    transport: &mut T,
    header_deadline: Option<Duration>,
) -> Result<(PacketHeader, Vec<u8>), ProtocolError> {
    let header = transport
        .recv_within(header_deadline)
        .await?
        .ok_or(ProtocolError::ConnectionClosed)?;
    let header = PacketHeader::decode(&header)?;
    let body = transport.recv_message().await?;
    if body.len() != header.body_len() {
        return Err(ProtocolError::InvalidHeader(format!(
            "body is {} bytes, header declares {}",
            body.len(),
            header.body_len()
        )));
    }
    trace!("Received packet header {:?}", header);
    Ok((header, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(value: serde_json::Value) -> Result<RequestMetadata, ProtocolError> {
        RequestMetadata::from_json(value.to_string().as_bytes())
    }

    #[test]
    fn test_request_json_matches_wire_format() {
        let meta = RequestMetadata::new("clip.mp4", Operation::Resize { width: 1280, height: 720 });
        let value: serde_json::Value = serde_json::from_slice(&meta.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"file_name": "clip.mp4", "operation": 2, "resolution": "1280:720"})
        );

        let operation = Operation::Gif { start_time: 1.5, duration: 3.0, fps: None };
        let gif = RequestMetadata::new("clip.mp4", operation);
        let value: serde_json::Value = serde_json::from_slice(&gif.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"file_name": "clip.mp4", "operation": 5, "start_time": 1.5, "duration": 3.0})
        );
    }

    #[test]
    fn test_decode_each_operation() {
        assert_eq!(
            decode(json!({"file_name": "a.mp4", "operation": 1})).unwrap().operation,
            Operation::Compress { bitrate: "1M".to_string() }
        );
        assert_eq!(
            decode(json!({"file_name": "a.mp4", "operation": 1, "bitrate": "500k"}))
                .unwrap()
                .operation,
            Operation::Compress { bitrate: "500k".to_string() }
        );
        assert_eq!(
            decode(json!({"file_name": "a.mp4", "operation": 3, "aspect_ratio": "16/9"}))
                .unwrap()
                .operation,
            Operation::AspectRatio { width: 16, height: 9 }
        );
        assert_eq!(
            decode(json!({"file_name": "a.mp4", "operation": 4})).unwrap().operation,
            Operation::ExtractAudio
        );
        assert_eq!(
            decode(json!({
                "file_name": "a.mp4",
                "operation": 5,
                "start_time": 0,
                "duration": 2,
                "fps": 15
            }))
            .unwrap()
            .operation,
            Operation::Gif { start_time: 0.0, duration: 2.0, fps: Some(15) }
        );
    }

    #[test]
    fn test_unknown_operation() {
        let err = decode(json!({"file_name": "a.mp4", "operation": 9})).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidOperation(9)));
    }

    #[test]
    fn test_invalid_parameters() {
        let cases = [
            json!({"file_name": "a.mp4", "operation": 2}),
            json!({"file_name": "a.mp4", "operation": 2, "resolution": "1280x720"}),
            json!({"file_name": "a.mp4", "operation": 2, "resolution": "0:720"}),
            json!({"file_name": "a.mp4", "operation": 3, "aspect_ratio": "16:9"}),
            json!({"file_name": "a.mp4", "operation": 5, "start_time": -1, "duration": 2}),
            json!({"file_name": "a.mp4", "operation": 5, "start_time": 0, "duration": 0}),
            json!({"file_name": "../etc/passwd", "operation": 4}),
            json!({"file_name": "", "operation": 4}),
            json!({"operation": 4}),
        ];
        for case in cases {
            assert!(
                matches!(decode(case.clone()), Err(ProtocolError::InvalidMetadata(_))),
                "accepted {}",
                case
            );
        }
    }

    #[test]
    fn test_request_packet_layout() {
        let request = Request {
            metadata: RequestMetadata::new("a.mp4", Operation::ExtractAudio),
            media_type: ".mp4".to_string(),
            file_size: 5000,
        };
        let (header, body) = request.to_packet().unwrap();
        assert_eq!(header.media_type_length, 4);
        assert_eq!(header.file_size, 5000);
        assert!(body.ends_with(b".mp4"));
        assert_eq!(Request::from_packet(&header, &body).unwrap(), request);
    }

    #[test]
    fn test_error_response_layout() {
        let (header, body) = Response::failure("disk full").to_packet().unwrap();
        assert_eq!(header.media_type_length, 0);
        assert_eq!(header.file_size, 0);
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value, json!({"error": true, "error_message": "disk full"}));
        assert_eq!(
            Response::from_packet(&header, &body).unwrap(),
            Response::Failure { message: "disk full".to_string() }
        );
    }

    #[test]
    fn test_success_response_layout() {
        let response = Response::Success {
            file_name: "converted_to_audio_a.mp3".to_string(),
            media_type: ".mp3".to_string(),
            file_size: 1234,
        };
        let (header, body) = response.to_packet().unwrap();
        let (json_part, _) = header.split_body(&body).unwrap();
        let value: serde_json::Value = serde_json::from_slice(json_part).unwrap();
        assert_eq!(
            value,
            json!({"file_name": "converted_to_audio_a.mp3", "error": false, "error_message": null})
        );
        assert_eq!(Response::from_packet(&header, &body).unwrap(), response);
    }

    #[test]
    fn test_response_with_unsafe_name_rejected() {
        let body = br#"{"file_name": "../../.bashrc", "error": false, "error_message": null}"#;
        let header = PacketHeader::new(body.len(), 0, 10).unwrap();
        assert!(Response::from_packet(&header, body).is_err());
    }

    #[test]
    fn test_long_error_message_truncated() {
        let long = "é".repeat(5000);
        match Response::failure(long) {
            Response::Failure { message } => assert!(message.len() <= MAX_ERROR_MESSAGE),
            other => panic!("unexpected {:?}", other),
        }
    }
}
