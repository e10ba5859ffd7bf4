//! Secure control channel.
//!
//! - Ephemeral X25519 exchange; the session key comes from
//!   HKDF-SHA256(shared_secret) salted with the installation's client key,
//!   so only a holder of the client key can complete the channel.
//! - Frames after the handshake are XChaCha20-Poly1305 with a random
//!   24-byte nonce per frame, length-prefixed (u32 BE).
//! - Before the server is initialized there is no client key yet; both
//!   sides fall back to an unsalted bootstrap handshake, accepted only for
//!   `init_server`.

use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{KeyInit, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::crypto::KEY_LEN;

const PUBKEY_LEN: usize = 32;
const NONCE_LEN: usize = 32;
const FRAME_NONCE_LEN: usize = 24;
const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

/// Channel credential. `Bootstrap` is only honored by an uninitialized
/// server.
#[derive(Clone)]
pub enum ChannelAuth {
    ClientKey([u8; KEY_LEN]),
    Bootstrap,
}

impl ChannelAuth {
    fn salt(&self) -> Option<&[u8]> {
        match self {
            ChannelAuth::ClientKey(key) => Some(key.as_slice()),
            ChannelAuth::Bootstrap => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("authentication failed: client key mismatch")]
    AuthFailed,
    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// Minimal length-prefixed frame helpers (u32 BE length).
async fn write_lp<T: AsyncWrite + Unpin + Send>(
    transport: &mut T,
    data: &[u8],
) -> std::io::Result<()> {
    transport.write_all(&(data.len() as u32).to_be_bytes()).await?;
    transport.write_all(data).await?;
    transport.flush().await?;
    Ok(())
}

async fn read_lp<T: AsyncRead + Unpin + Send>(transport: &mut T) -> std::io::Result<Vec<u8>> {
    let mut lenb = [0u8; 4];
    transport.read_exact(&mut lenb).await?;
    let len = u32::from_be_bytes(lenb) as usize;

    // Sanity check to prevent memory exhaustion
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame too large",
        ));
    }

    let mut buf = vec![0u8; len];
    transport.read_exact(&mut buf).await?;
    Ok(buf)
}

/// An established channel: one AEAD, shared by exactly one
/// request/response exchange.
pub struct SecureChannel {
    aead: XChaCha20Poly1305,
}

impl SecureChannel {
    /// Client side of the handshake.
    pub async fn connect<T>(auth: &ChannelAuth, transport: &mut T) -> Result<Self, ChannelError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);

        let mut nonce_mine = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_mine);

        let mut hello = Vec::with_capacity(PUBKEY_LEN + NONCE_LEN);
        hello.extend_from_slice(public.as_bytes());
        hello.extend_from_slice(&nonce_mine);
        write_lp(transport, &hello).await?;

        let reply = read_lp(transport).await?;
        let (peer_public, nonce_peer) = split_hello(&reply)?;

        let shared = secret.diffie_hellman(&peer_public);
        Self::derive(auth, shared.as_bytes(), &nonce_mine, &nonce_peer)
    }

    /// Server side of the handshake (symmetrical).
    pub async fn accept<T>(auth: &ChannelAuth, transport: &mut T) -> Result<Self, ChannelError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let hello = read_lp(transport).await?;
        let (peer_public, nonce_peer) = split_hello(&hello)?;

        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);

        let mut nonce_mine = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_mine);

        let mut reply = Vec::with_capacity(PUBKEY_LEN + NONCE_LEN);
        reply.extend_from_slice(public.as_bytes());
        reply.extend_from_slice(&nonce_mine);
        write_lp(transport, &reply).await?;

        let shared = secret.diffie_hellman(&peer_public);
        // Initiator nonce first so both sides derive the same key.
        Self::derive(auth, shared.as_bytes(), &nonce_peer, &nonce_mine)
    }

    fn derive(
        auth: &ChannelAuth,
        shared: &[u8],
        nonce_initiator: &[u8; NONCE_LEN],
        nonce_responder: &[u8; NONCE_LEN],
    ) -> Result<Self, ChannelError> {
        let info = [&nonce_initiator[..], &nonce_responder[..]].concat();
        let hk = Hkdf::<Sha256>::new(auth.salt(), shared);
        let mut okm = [0u8; 32];
        hk.expand(&info, &mut okm)
            .map_err(|_| ChannelError::Handshake("HKDF expand failed".into()))?;
        Ok(Self {
            aead: XChaCha20Poly1305::new(&okm.into()),
        })
    }

    /// Send one encrypted frame: `nonce || ciphertext`, length-prefixed.
    pub async fn send_frame<T: AsyncWrite + Unpin + Send>(
        &self,
        transport: &mut T,
        plaintext: &[u8],
    ) -> Result<(), ChannelError> {
        let mut nonce_bytes = [0u8; FRAME_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from(nonce_bytes);

        let mut buf = plaintext.to_vec();
        self.aead
            .encrypt_in_place(&nonce, b"", &mut buf)
            .map_err(|_| ChannelError::Handshake("aead encrypt failed".into()))?;

        let mut frame = Vec::with_capacity(FRAME_NONCE_LEN + buf.len());
        frame.extend_from_slice(&nonce_bytes);
        frame.extend_from_slice(&buf);
        write_lp(transport, &frame).await?;
        Ok(())
    }

    /// Read one encrypted frame. A decrypt failure means the peer derived a
    /// different session key, i.e. the client key did not match.
    pub async fn recv_frame<T: AsyncRead + Unpin + Send>(
        &self,
        transport: &mut T,
    ) -> Result<Vec<u8>, ChannelError> {
        let frame = read_lp(transport).await?;
        if frame.len() < FRAME_NONCE_LEN {
            return Err(ChannelError::Handshake("frame too small".into()));
        }

        let nonce_bytes: [u8; FRAME_NONCE_LEN] = frame[..FRAME_NONCE_LEN].try_into().unwrap();
        let nonce = XNonce::from(nonce_bytes);
        let mut buf = frame[FRAME_NONCE_LEN..].to_vec();

        self.aead
            .decrypt_in_place(&nonce, b"", &mut buf)
            .map_err(|_| ChannelError::AuthFailed)?;
        Ok(buf)
    }
}

fn split_hello(buf: &[u8]) -> Result<(PublicKey, [u8; NONCE_LEN]), ChannelError> {
    if buf.len() < PUBKEY_LEN + NONCE_LEN {
        return Err(ChannelError::Handshake("peer hello too short".into()));
    }
    let public_bytes: [u8; PUBKEY_LEN] = buf[..PUBKEY_LEN].try_into().unwrap();
    let nonce: [u8; NONCE_LEN] = buf[PUBKEY_LEN..PUBKEY_LEN + NONCE_LEN].try_into().unwrap();
    Ok((PublicKey::from(public_bytes), nonce))
}
