use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, trace};

use crate::protocol::cipher::SessionKey;
use crate::protocol::constants::MAX_HANDSHAKE_FRAME;
use crate::protocol::error::ProtocolError;
use crate::protocol::frame::{read_frame, write_frame, PrefixWidth};

/// Server side progress through the key exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    PubkeySent,
    KeyReceived,
    Established,
}

/// Ephemeral RSA keypair, generated once per accepted connection.
pub struct ServerKeypair {
    private_key: RsaPrivateKey,
    public_pem: String,
}

impl ServerKeypair {
    pub fn generate(bits: usize) -> Result<Self, ProtocolError> {
        let private_key = RsaPrivateKey::new(&mut OsRng, bits)?;
        let public_pem = private_key
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| ProtocolError::Crypto(e.to_string()))?;
        Ok(Self { private_key, public_pem })
    }

    /// Key generation is CPU bound, keep it off the async workers
    pub async fn generate_blocking(bits: usize) -> Result<Self, ProtocolError> {
        tokio::task::spawn_blocking(move || Self::generate(bits))
            .await
            .map_err(|e| ProtocolError::Crypto(format!("key generation task failed: {}", e)))?
    }

    /// SPKI PEM encoding sent to the client
    pub fn public_key_bytes(&self) -> &[u8] {
        self.public_pem.as_bytes()
    }

    /// Short SHA-256 fingerprint of the exported public key, for logs
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.public_pem.as_bytes());
        hex::encode(&digest[..8])
    }

    pub fn decrypt_session_key(&self, ciphertext: &[u8]) -> Result<SessionKey, ProtocolError> {
        let blob = self.private_key.decrypt(Oaep::new::<Sha1>(), ciphertext)?;
        SessionKey::from_bytes(&blob)
    }
}

/// Accept PEM (the normal export) or raw DER public keys.
pub fn load_public_key(bytes: &[u8]) -> Result<RsaPublicKey, ProtocolError> {
    let parsed = if bytes.starts_with(b"-----BEGIN") {
        let pem = std::str::from_utf8(bytes)
            .map_err(|_| ProtocolError::Crypto("public key PEM is not UTF-8".to_string()))?;
        RsaPublicKey::from_public_key_pem(pem)
    } else {
        RsaPublicKey::from_public_key_der(bytes)
    };
    parsed.map_err(|e| ProtocolError::Crypto(format!("bad server public key: {}", e)))
}

pub fn encrypt_session_key(
    public_key: &RsaPublicKey,
    session_key: &SessionKey,
) -> Result<Vec<u8>, ProtocolError> {
    Ok(public_key.encrypt(&mut OsRng, Oaep::new::<Sha1>(), &session_key.to_bytes())?)
}

async fn read_handshake_frame<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> Result<Vec<u8>, ProtocolError> {
    match read_frame(stream, PrefixWidth::U16, MAX_HANDSHAKE_FRAME).await? {
        Some(frame) if !frame.is_empty() => Ok(frame),
        _ => Err(ProtocolError::ConnectionClosed),
    }
}

/// Server half of the key exchange: send our public key, receive the
/// client's OAEP-wrapped session key.
pub struct ServerHandshake<'a> {
    keypair: &'a ServerKeypair,
    visited: Vec<HandshakeState>,
}

impl<'a> ServerHandshake<'a> {
    pub fn new(keypair: &'a ServerKeypair) -> Self {
        Self {
            keypair,
            visited: vec![HandshakeState::Init],
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.visited
            .last()
            .copied()
            .unwrap_or(HandshakeState::Init)
    }

    /// Every state entered so far, starting with `Init`
    pub fn visited(&self) -> &[HandshakeState] {
        &self.visited
    }

    fn advance(&mut self, next: HandshakeState) {
        debug!("Handshake {:?} -> {:?}", self.state(), next);
        self.visited.push(next);
    }

    /// Drive the exchange to `Established`. On failure the handshake stays
    /// in the last state it reached.
    pub async fn run<S>(&mut self, stream: &mut S) -> Result<SessionKey, ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        debug!(
            "Sending public key ({} bytes, fingerprint {})",
            self.keypair.public_key_bytes().len(),
            self.keypair.fingerprint()
        );
        write_frame(stream, PrefixWidth::U16, self.keypair.public_key_bytes()).await?;
        self.advance(HandshakeState::PubkeySent);

        let wrapped = read_handshake_frame(stream).await.map_err(|e| {
            error!("No session key from client in state {:?}: {}", self.state(), e);
            e
        })?;
        trace!("Received wrapped session key ({} bytes)", wrapped.len());

        let session_key = self.keypair.decrypt_session_key(&wrapped)?;
        self.advance(HandshakeState::KeyReceived);

        self.advance(HandshakeState::Established);
        Ok(session_key)
    }
}

pub async fn accept_handshake<S>(
    stream: &mut S,
    keypair: &ServerKeypair,
) -> Result<SessionKey, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut handshake = ServerHandshake::new(keypair);
    handshake.run(stream).await
}

/// Client half: trust the server key on first use, generate and send a
/// fresh session key. There is no peer authentication.
pub async fn initiate_handshake<S>(stream: &mut S) -> Result<SessionKey, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let public_bytes = read_handshake_frame(stream).await?;
    debug!("Received server public key ({} bytes)", public_bytes.len());
    let public_key = load_public_key(&public_bytes)?;

    let session_key = SessionKey::generate();
    let wrapped = encrypt_session_key(&public_key, &session_key)?;
    write_frame(stream, PrefixWidth::U16, &wrapped).await?;
    debug!("Sent wrapped session key ({} bytes)", wrapped.len());

    Ok(session_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::DEFAULT_RSA_BITS;
    use proptest::prelude::*;
    use std::sync::OnceLock;

    fn shared_keypair() -> &'static ServerKeypair {
        static KEYPAIR: OnceLock<ServerKeypair> = OnceLock::new();
        KEYPAIR.get_or_init(|| ServerKeypair::generate(DEFAULT_RSA_BITS).unwrap())
    }

    proptest! {
        // Each case pays for a full-size key generation
        #![proptest_config(ProptestConfig::with_cases(4))]

        #[test]
        fn prop_session_key_survives_oaep(blob in proptest::collection::vec(any::<u8>(), 32)) {
            let keypair = ServerKeypair::generate(DEFAULT_RSA_BITS).unwrap();
            let public = load_public_key(keypair.public_key_bytes()).unwrap();
            let key = SessionKey::from_bytes(&blob).unwrap();

            let wrapped = encrypt_session_key(&public, &key).unwrap();
            prop_assert_eq!(keypair.decrypt_session_key(&wrapped).unwrap(), key);
        }
    }

    #[test]
    fn test_public_key_is_spki_pem() {
        let pem = std::str::from_utf8(shared_keypair().public_key_bytes()).unwrap();
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));
        assert_eq!(shared_keypair().fingerprint().len(), 16);
    }

    #[test]
    fn test_tampered_wrapped_key_fails() {
        let keypair = shared_keypair();
        let public = load_public_key(keypair.public_key_bytes()).unwrap();
        let mut wrapped = encrypt_session_key(&public, &SessionKey::generate()).unwrap();
        wrapped[10] ^= 0x01;
        let err = keypair.decrypt_session_key(&wrapped).unwrap_err();
        assert!(matches!(err, ProtocolError::Crypto(_)));
    }

    #[test]
    fn test_garbage_public_key_rejected() {
        let pem_err = load_public_key(b"-----BEGIN nonsense");
        assert!(matches!(pem_err, Err(ProtocolError::Crypto(_))));
        assert!(matches!(load_public_key(&[1, 2, 3]), Err(ProtocolError::Crypto(_))));
    }

    #[tokio::test]
    async fn test_handshake_over_duplex() {
        let keypair = ServerKeypair::generate_blocking(DEFAULT_RSA_BITS).await.unwrap();
        let (mut client_io, mut server_io) = tokio::io::duplex(4096);

        let client = tokio::spawn(async move { initiate_handshake(&mut client_io).await });
        let mut handshake = ServerHandshake::new(&keypair);
        assert_eq!(handshake.state(), HandshakeState::Init);
        let server_key = handshake.run(&mut server_io).await.unwrap();
        let client_key = client.await.unwrap().unwrap();

        assert_eq!(server_key, client_key);
        assert_eq!(
            handshake.visited(),
            &[
                HandshakeState::Init,
                HandshakeState::PubkeySent,
                HandshakeState::KeyReceived,
                HandshakeState::Established,
            ]
        );
        assert_eq!(handshake.state(), HandshakeState::Established);
    }

    #[tokio::test]
    async fn test_bad_wrapped_key_stops_after_pubkey_sent() {
        let keypair = shared_keypair();
        let (mut client_io, mut server_io) = tokio::io::duplex(4096);

        let client = tokio::spawn(async move {
            read_handshake_frame(&mut client_io).await.unwrap();
            write_frame(&mut client_io, PrefixWidth::U16, &[0xAB; 256]).await.unwrap();
            client_io
        });
        let mut handshake = ServerHandshake::new(keypair);
        let err = handshake.run(&mut server_io).await.unwrap_err();
        let _client_io = client.await.unwrap();

        assert!(matches!(err, ProtocolError::Crypto(_)));
        assert_eq!(handshake.state(), HandshakeState::PubkeySent);
        assert_eq!(
            handshake.visited(),
            &[HandshakeState::Init, HandshakeState::PubkeySent]
        );
    }

    #[tokio::test]
    async fn test_client_hangup_during_handshake() {
        let keypair = shared_keypair();
        let (client_io, mut server_io) = tokio::io::duplex(4096);
        drop(client_io);

        let err = accept_handshake(&mut server_io, keypair).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Io(_) | ProtocolError::ConnectionClosed));
    }
}
