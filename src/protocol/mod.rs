pub mod channel;
pub mod cipher;
pub mod constants;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod header;
pub mod message;

pub use channel::{ChannelOptions, PlainChannel, SecureChannel, Transport};
pub use cipher::{CipherStream, SessionKey};
pub use constants::*;
pub use error::ProtocolError;
pub use header::PacketHeader;
pub use message::{Operation, Request, RequestMetadata, Response, ResponseMetadata};
