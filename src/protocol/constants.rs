//! Protocol constants for mediaconv network communication

/// Default server port
pub const DEFAULT_PORT: u16 = 9001;

/// Length prefix widths
pub const HANDSHAKE_PREFIX_LEN: usize = 2;
pub const CHANNEL_PREFIX_LEN: usize = 4;

/// Session key material
pub const SESSION_KEY_LEN: usize = 16;
pub const SESSION_IV_LEN: usize = 16;
pub const DEFAULT_RSA_BITS: usize = 2048;

/// Application header: json_length(2) + media_type_length(1) + file_size(5)
pub const HEADER_LEN: usize = 8;
pub const MAX_JSON_LEN: usize = u16::MAX as usize;
pub const MAX_MEDIA_TYPE_LEN: usize = u8::MAX as usize;
pub const MAX_FILE_SIZE: u64 = (1 << 40) - 1;

/// Upload acknowledgement payload
pub const ACK_OK: u8 = 0x00;

/// Hard safety limits
pub const MAX_HANDSHAKE_FRAME: usize = u16::MAX as usize;
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB

/// Body chunking
pub const CHUNK_SIZE: usize = 1400;

/// GIF defaults
pub const DEFAULT_GIF_FPS: u32 = 10;
pub const DEFAULT_BITRATE: &str = "1M";
