//! AES-128 in CFB mode with 128-bit segments.
//!
//! One [`CipherStream`] lives for the whole session. Its encryptor and
//! decryptor carry the CFB feedback register across calls, so the keystream
//! advances monotonically over every message sent or received. Building a
//! fresh cipher per message with the same key and IV would restart the
//! keystream at the same point and reuse it for every message.

use aes::Aes128;
use cfb_mode::cipher::KeyIvInit;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;

use crate::protocol::constants::{SESSION_IV_LEN, SESSION_KEY_LEN};
use crate::protocol::error::ProtocolError;

pub type Encryptor = cfb_mode::BufEncryptor<Aes128>;
pub type Decryptor = cfb_mode::BufDecryptor<Aes128>;

/// Symmetric key material negotiated during the handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey {
    key: [u8; SESSION_KEY_LEN],
    iv: [u8; SESSION_IV_LEN],
}

impl SessionKey {
    pub const WIRE_SIZE: usize = SESSION_KEY_LEN + SESSION_IV_LEN;

    pub fn new(key: [u8; SESSION_KEY_LEN], iv: [u8; SESSION_IV_LEN]) -> Self {
        Self { key, iv }
    }

    /// Random key and IV from the OS generator
    pub fn generate() -> Self {
        let mut key = [0u8; SESSION_KEY_LEN];
        let mut iv = [0u8; SESSION_IV_LEN];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut iv);
        Self { key, iv }
    }

    /// Parse `key ‖ iv`. Anything other than exactly 32 bytes is rejected.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() != Self::WIRE_SIZE {
            return Err(ProtocolError::Crypto(format!(
                "session key blob must be {} bytes, got {}",
                Self::WIRE_SIZE,
                buf.len()
            )));
        }
        let mut key = [0u8; SESSION_KEY_LEN];
        let mut iv = [0u8; SESSION_IV_LEN];
        key.copy_from_slice(&buf[..SESSION_KEY_LEN]);
        iv.copy_from_slice(&buf[SESSION_KEY_LEN..]);
        Ok(Self { key, iv })
    }

    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[..SESSION_KEY_LEN].copy_from_slice(&self.key);
        buf[SESSION_KEY_LEN..].copy_from_slice(&self.iv);
        buf
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

/// Stateful session cipher, one direction each for sending and receiving.
pub struct CipherStream {
    encryptor: Encryptor,
    decryptor: Decryptor,
}

impl CipherStream {
    pub fn new(session_key: &SessionKey) -> Self {
        Self {
            encryptor: Encryptor::new(&session_key.key.into(), &session_key.iv.into()),
            decryptor: Decryptor::new(&session_key.key.into(), &session_key.iv.into()),
        }
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let mut buf = plaintext.to_vec();
        self.encryptor.encrypt(&mut buf);
        buf
    }

    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Vec<u8> {
        let mut buf = ciphertext.to_vec();
        self.decryptor.decrypt(&mut buf);
        buf
    }
}

impl fmt::Debug for CipherStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherStream").finish_non_exhaustive()
    }
}
