//! Per-segment key negotiation and record stream encryption.
//!
//! Each encrypted segment gets a fresh secp256r1 ephemeral key pair. The
//! segment key is the leading 16 bytes of the ECDH shared secret's X
//! coordinate (big-endian); records are encrypted with AES-128-CBC and a
//! PKCS#7 pad closes the stream at segment end. The ephemeral public key is
//! published in the segment header so a reader holding the user's secret key
//! can recompute the same segment key.
//!
//! The scheme is confidentiality-only; it does not authenticate.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};

use crate::error::{Error, Result};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

pub(crate) const BLOCK_LEN: usize = 16;
pub(crate) const PUBLIC_KEY_LEN: usize = 33;

/// A generated secp256r1 key pair, base64-encoded for configuration and
/// tooling. The public half goes into `Config::key_str` on devices; the
/// secret half stays with whoever parses the logs.
#[derive(Clone, Debug)]
pub struct KeyPair {
    pub secret: String,
    pub public: String,
}

impl KeyPair {
    pub fn generate() -> KeyPair {
        let secret = SecretKey::random(&mut rand::rngs::OsRng);
        let public = secret.public_key();
        KeyPair {
            secret: base64::encode(secret.to_bytes()),
            public: base64::encode(public.to_encoded_point(true).as_bytes()),
        }
    }
}

pub(crate) fn parse_public_key(s: &str) -> Result<PublicKey> {
    let bytes =
        base64::decode(s.trim()).map_err(|e| Error::InvalidKey(format!("bad base64: {e}")))?;
    if bytes.len() != PUBLIC_KEY_LEN {
        return Err(Error::InvalidKey(format!(
            "expected a {PUBLIC_KEY_LEN}-byte compressed point, got {} bytes",
            bytes.len()
        )));
    }
    PublicKey::from_sec1_bytes(&bytes)
        .map_err(|_| Error::InvalidKey("not a point on secp256r1".to_string()))
}

pub(crate) fn parse_secret_key(s: &str) -> Result<SecretKey> {
    let bytes =
        base64::decode(s.trim()).map_err(|e| Error::InvalidKey(format!("bad base64: {e}")))?;
    SecretKey::from_slice(&bytes)
        .map_err(|_| Error::InvalidKey("not a valid secp256r1 scalar".to_string()))
}

/// The 16-byte AES key both sides derive from the ECDH shared secret.
fn derive_key(secret: &SecretKey, peer: &PublicKey) -> [u8; BLOCK_LEN] {
    let shared = diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
    let x = shared.raw_secret_bytes();
    let mut key = [0u8; BLOCK_LEN];
    key.copy_from_slice(&x[..BLOCK_LEN]);
    key
}

// The key is unique per segment, so a fixed IV does not repeat under a key.
const IV: [u8; BLOCK_LEN] = [0u8; BLOCK_LEN];

/// Write-side cipher state for one segment stream. `Plain` is the identity
/// passthrough used when no public key is configured.
pub(crate) enum CipherSession {
    Plain,
    Encrypted(EncryptStream),
}

impl CipherSession {
    /// Begins a session, returning it together with the ephemeral public key
    /// that must be published in the segment header (`None` when plain).
    pub fn begin(user_public: Option<&PublicKey>) -> (CipherSession, Option<[u8; PUBLIC_KEY_LEN]>) {
        match user_public {
            None => (CipherSession::Plain, None),
            Some(user_public) => {
                let eph_secret = SecretKey::random(&mut rand::rngs::OsRng);
                let eph_public = eph_secret.public_key().to_encoded_point(true);
                let mut published = [0u8; PUBLIC_KEY_LEN];
                published.copy_from_slice(eph_public.as_bytes());

                let key = derive_key(&eph_secret, user_public);
                let stream = EncryptStream {
                    cipher: Aes128CbcEnc::new(&key.into(), &IV.into()),
                    pending: Vec::with_capacity(BLOCK_LEN),
                };
                (CipherSession::Encrypted(stream), Some(published))
            }
        }
    }

    pub fn write(&mut self, input: &[u8], out: &mut Vec<u8>) {
        match self {
            CipherSession::Plain => out.extend_from_slice(input),
            CipherSession::Encrypted(stream) => stream.write(input, out),
        }
    }

    /// Closes the stream. The encrypted arm emits the PKCS#7 pad block.
    pub fn end(self, out: &mut Vec<u8>) {
        match self {
            CipherSession::Plain => (),
            CipherSession::Encrypted(stream) => stream.end(out),
        }
    }
}

pub(crate) struct EncryptStream {
    cipher: Aes128CbcEnc,
    // Tail bytes short of a block boundary, carried to the next write.
    pending: Vec<u8>,
}

impl EncryptStream {
    fn write(&mut self, input: &[u8], out: &mut Vec<u8>) {
        self.pending.extend_from_slice(input);
        let full = self.pending.len() - self.pending.len() % BLOCK_LEN;
        for chunk in self.pending[..full].chunks_exact(BLOCK_LEN) {
            let mut block = GenericArray::clone_from_slice(chunk);
            self.cipher.encrypt_block_mut(&mut block);
            out.extend_from_slice(&block);
        }
        self.pending.drain(..full);
    }

    fn end(mut self, out: &mut Vec<u8>) {
        let pad = (BLOCK_LEN - self.pending.len()) as u8;
        self.pending.resize(BLOCK_LEN, pad);
        let mut block = GenericArray::clone_from_slice(&self.pending);
        self.cipher.encrypt_block_mut(&mut block);
        out.extend_from_slice(&block);
    }
}

/// Read-side cipher state. The parser feeds whole ciphertext blocks and
/// applies the padding rules itself, because only the decompressor knows
/// where the stream's plaintext actually ends.
pub(crate) struct DecryptStream {
    cipher: Aes128CbcDec,
}

impl DecryptStream {
    pub fn begin(user_secret: &SecretKey, eph_public: &[u8]) -> Result<DecryptStream> {
        let eph_public = PublicKey::from_sec1_bytes(eph_public)
            .map_err(|_| Error::InvalidKey("segment key is not a point on secp256r1".to_string()))?;
        let key = derive_key(user_secret, &eph_public);
        Ok(DecryptStream {
            cipher: Aes128CbcDec::new(&key.into(), &IV.into()),
        })
    }

    pub fn decrypt_block(&mut self, block: &[u8], out: &mut Vec<u8>) {
        debug_assert_eq!(block.len(), BLOCK_LEN);
        let mut block = GenericArray::clone_from_slice(block);
        self.cipher.decrypt_block_mut(&mut block);
        out.extend_from_slice(&block);
    }
}

/// Validates a PKCS#7 pad: a run of `n` bytes each holding the value `n`.
pub(crate) fn check_padding(padding: &[u8]) -> Result<()> {
    let n = padding.len();
    if n == 0 || n > BLOCK_LEN || padding.iter().any(|b| *b as usize != n) {
        return Err(Error::Decrypt("bad PKCS#7 padding".to_string()));
    }
    Ok(())
}
