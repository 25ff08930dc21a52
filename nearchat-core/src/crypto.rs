//! Per-peer sessions and authenticated encryption (ChaCha20-Poly1305) for chat payloads and files.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::identity::{derive_session_key, Identity, PeerId, PublicKey};

pub const NONCE_LEN: usize = 12;
pub const FILE_KEY_LEN: usize = 32;
/// nonce || one-time key || original size (u32 LE)
pub const FILE_HEADER_LEN: usize = NONCE_LEN + FILE_KEY_LEN + 4;

#[cfg(feature = "compression")]
const ZSTD_LEVEL: i32 = 3;

/// Sealed chat payload as it travels inside a `sealed` frame. Both fields are base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub nonce: String,
    pub ciphertext: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("no session with peer {0}")]
    NoSession(PeerId),
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("malformed ciphertext")]
    Malformed,
    #[error("file exceeds 4 GiB")]
    FileTooLarge,
    #[error("file size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u32, actual: usize },
    #[error("compressed file body did not decompress")]
    Decompress,
}

/// Sealed file blob. `compressed` travels in `file-start` so the receiver knows to inflate.
#[derive(Debug)]
pub struct SealedFile {
    pub blob: Vec<u8>,
    pub compressed: bool,
}

/// Whether file payloads are compressed before sealing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Zstd,
    Passthrough,
}

impl Compression {
    /// What this build can do: zstd with the `compression` feature, pass-through otherwise.
    pub fn available() -> Self {
        if cfg!(feature = "compression") {
            Compression::Zstd
        } else {
            Compression::Passthrough
        }
    }
}

struct Session {
    peer_public: PublicKey,
    key: [u8; 32],
}

/// Owns the local identity and one symmetric session per peer.
pub struct CryptoEngine {
    identity: Identity,
    sessions: HashMap<PeerId, Session>,
}

impl CryptoEngine {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            sessions: HashMap::new(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.identity.id()
    }

    pub fn public_key(&self) -> &PublicKey {
        self.identity.public_key()
    }

    /// Derive and store the session key for `peer`. Re-deriving with the same public key is a
    /// no-op so in-flight operations keep their key; a new public key replaces the session.
    /// Returns true when the session was created or replaced.
    pub fn derive_shared_secret(&mut self, peer: PeerId, peer_public: &PublicKey) -> bool {
        if let Some(existing) = self.sessions.get(&peer) {
            if existing.peer_public == *peer_public {
                return false;
            }
        }
        let shared = self.identity.keypair().shared_secret(peer_public);
        self.sessions.insert(
            peer,
            Session {
                peer_public: peer_public.clone(),
                key: derive_session_key(&shared),
            },
        );
        debug!(%peer, "session key derived");
        true
    }

    pub fn has_session(&self, peer: &PeerId) -> bool {
        self.sessions.contains_key(peer)
    }

    /// Drop the session for a peer (link closed).
    pub fn invalidate(&mut self, peer: &PeerId) {
        if self.sessions.remove(peer).is_some() {
            debug!(%peer, "session invalidated");
        }
    }

    pub fn encrypt_message(&self, peer: &PeerId, plaintext: &[u8]) -> Result<Envelope, CryptoError> {
        let session = self.sessions.get(peer).ok_or(CryptoError::NoSession(*peer))?;
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = seal(&session.key, &nonce, plaintext)?;
        Ok(Envelope {
            nonce: B64.encode(nonce),
            ciphertext: B64.encode(ciphertext),
        })
    }

    pub fn decrypt_message(&self, peer: &PeerId, envelope: &Envelope) -> Result<Vec<u8>, CryptoError> {
        let session = self.sessions.get(peer).ok_or(CryptoError::NoSession(*peer))?;
        let nonce: [u8; NONCE_LEN] = B64
            .decode(&envelope.nonce)
            .map_err(|_| CryptoError::Malformed)?
            .try_into()
            .map_err(|_| CryptoError::Malformed)?;
        let ciphertext = B64
            .decode(&envelope.ciphertext)
            .map_err(|_| CryptoError::Malformed)?;
        open(&session.key, &nonce, &ciphertext)
    }

    /// Compress (when available), then seal under a one-time key carried in the blob header.
    pub fn encrypt_file(&self, bytes: &[u8]) -> Result<SealedFile, CryptoError> {
        seal_file(bytes, Compression::available())
    }

    pub fn decrypt_file(&self, blob: &[u8], compressed: bool) -> Result<Vec<u8>, CryptoError> {
        open_file(blob, compressed)
    }
}

fn seal(key: &[u8; 32], nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Encrypt)?;
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::Encrypt)
}

fn open(key: &[u8; 32], nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Decrypt)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

#[cfg(feature = "compression")]
fn compress(bytes: &[u8]) -> Option<Vec<u8>> {
    zstd::encode_all(bytes, ZSTD_LEVEL).ok()
}

#[cfg(not(feature = "compression"))]
fn compress(_bytes: &[u8]) -> Option<Vec<u8>> {
    None
}

#[cfg(feature = "compression")]
fn decompress(bytes: &[u8]) -> Option<Vec<u8>> {
    zstd::decode_all(bytes).ok()
}

#[cfg(not(feature = "compression"))]
fn decompress(_bytes: &[u8]) -> Option<Vec<u8>> {
    None
}

/// Seal a file. A compressed body is only used when it is actually smaller; any compression
/// failure silently falls back to the raw bytes.
pub fn seal_file(bytes: &[u8], compression: Compression) -> Result<SealedFile, CryptoError> {
    let original_size = u32::try_from(bytes.len()).map_err(|_| CryptoError::FileTooLarge)?;
    let compressed = match compression {
        Compression::Zstd => compress(bytes).filter(|c| c.len() < bytes.len()),
        Compression::Passthrough => None,
    };
    let body = compressed.as_deref().unwrap_or(bytes);

    let mut key = [0u8; FILE_KEY_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut key);
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = seal(&key, &nonce, body)?;

    let mut out = Vec::with_capacity(FILE_HEADER_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&key);
    out.extend_from_slice(&original_size.to_le_bytes());
    out.extend_from_slice(&ciphertext);
    Ok(SealedFile {
        blob: out,
        compressed: compressed.is_some(),
    })
}

/// Parse the header positionally, open, then inflate when the sender flagged compression.
/// The result must match the recorded size.
pub fn open_file(blob: &[u8], compressed: bool) -> Result<Vec<u8>, CryptoError> {
    if blob.len() < FILE_HEADER_LEN {
        return Err(CryptoError::Malformed);
    }
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&blob[..NONCE_LEN]);
    let mut key = [0u8; FILE_KEY_LEN];
    key.copy_from_slice(&blob[NONCE_LEN..NONCE_LEN + FILE_KEY_LEN]);
    let size_at = NONCE_LEN + FILE_KEY_LEN;
    let original_size = u32::from_le_bytes([
        blob[size_at],
        blob[size_at + 1],
        blob[size_at + 2],
        blob[size_at + 3],
    ]);

    let mut body = open(&key, &nonce, &blob[FILE_HEADER_LEN..])?;
    if compressed {
        body = decompress(&body).ok_or(CryptoError::Decompress)?;
    }
    if body.len() == original_size as usize {
        return Ok(body);
    }
    Err(CryptoError::SizeMismatch {
        expected: original_size,
        actual: body.len(),
    })
}
